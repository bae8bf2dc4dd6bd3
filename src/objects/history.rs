use crate::{
    error::{Error, Result},
    objects::Point,
};

/// Whether a history row records a received output or a spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PointKind {
    /// Funds received by the address.
    Output = 0,
    /// Funds spent from the address.
    Spend = 1,
}

impl TryFrom<u8> for PointKind {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(PointKind::Output),
            1 => Ok(PointKind::Spend),
            other => Err(Error::InvalidFormat(format!("point kind {other}"))),
        }
    }
}

/// Interpretation of [`History::value_or_previous_checksum`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryValue {
    /// Satoshi value of a received output.
    Value(u64),
    /// Checksum of the output point a spend consumed.
    PreviousChecksum(u64),
}

/// One row of an address history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct History {
    point: Point,
    kind: PointKind,
    height: u32,
    tx_position: u32,
    value_or_previous_checksum: u64,
}

impl History {
    /// Row for an output paying the address.
    pub fn output(point: Point, height: u32, tx_position: u32, value: u64) -> Self {
        Self {
            point,
            kind: PointKind::Output,
            height,
            tx_position,
            value_or_previous_checksum: value,
        }
    }

    /// Row for an input spending one of the address's outputs.
    pub fn spend(point: Point, height: u32, tx_position: u32, previous: &Point) -> Self {
        Self {
            point,
            kind: PointKind::Spend,
            height,
            tx_position,
            value_or_previous_checksum: previous.checksum(),
        }
    }

    pub(crate) fn from_parts(
        point: Point,
        kind: PointKind,
        height: u32,
        tx_position: u32,
        value_or_previous_checksum: u64,
    ) -> Self {
        Self {
            point,
            kind,
            height,
            tx_position,
            value_or_previous_checksum,
        }
    }

    /// The output point (for outputs) or input point (for spends).
    pub fn point(&self) -> &Point {
        &self.point
    }

    /// Row kind.
    pub fn point_kind(&self) -> PointKind {
        self.kind
    }

    /// Height of the confirming block.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Position of the transaction within its block.
    pub fn tx_position(&self) -> u32 {
        self.tx_position
    }

    /// Raw field; its meaning depends on [`History::point_kind`].
    pub fn value_or_previous_checksum(&self) -> u64 {
        self.value_or_previous_checksum
    }

    /// The raw field interpreted according to the row kind.
    pub fn amount(&self) -> HistoryValue {
        match self.kind {
            PointKind::Output => HistoryValue::Value(self.value_or_previous_checksum),
            PointKind::Spend => HistoryValue::PreviousChecksum(self.value_or_previous_checksum),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{hashes::Hash, Txid};

    #[test]
    fn kind_tag_selects_interpretation() {
        let funded = Point::new(Txid::from_byte_array([4u8; 32]), 1);
        let out = History::output(funded, 10, 2, 50_000);
        assert_eq!(out.point_kind(), PointKind::Output);
        assert_eq!(out.amount(), HistoryValue::Value(50_000));

        let spending = Point::new(Txid::from_byte_array([5u8; 32]), 0);
        let spend = History::spend(spending, 12, 1, &funded);
        assert_eq!(spend.point_kind(), PointKind::Spend);
        assert_eq!(
            spend.amount(),
            HistoryValue::PreviousChecksum(funded.checksum())
        );
        assert_eq!(spend.value_or_previous_checksum(), funded.checksum());
    }

    #[test]
    fn kind_from_wire_tag() {
        assert_eq!(PointKind::try_from(0).unwrap(), PointKind::Output);
        assert_eq!(PointKind::try_from(1).unwrap(), PointKind::Spend);
        assert!(PointKind::try_from(2).is_err());
    }
}

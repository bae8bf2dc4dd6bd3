use std::fmt;

use bitcoin::{hashes::Hash, OutPoint, Txid};

/// A `(transaction hash, index)` pair.
///
/// The null point (all-zero hash, index `u32::MAX`) is what a coinbase input
/// references; it is the [`Default`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Point {
    hash: Txid,
    index: u32,
}

/// A point naming a transaction output.
pub type OutputPoint = Point;

impl Point {
    /// Point at `index` of transaction `hash`.
    pub fn new(hash: Txid, index: u32) -> Self {
        Self { hash, index }
    }

    /// The null point.
    pub fn null() -> Self {
        Self {
            hash: Txid::all_zeros(),
            index: u32::MAX,
        }
    }

    /// Transaction hash.
    pub fn hash(&self) -> Txid {
        self.hash
    }

    /// Position within the transaction.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// False only for the null point.
    pub fn is_valid(&self) -> bool {
        !self.is_null()
    }

    /// True for the null point.
    pub fn is_null(&self) -> bool {
        self.index == u32::MAX && self.hash == Txid::all_zeros()
    }

    /// Client-side correlation key for history rows of one address.
    ///
    /// 49 bits come from the hash at byte offset 12, 15 bits from the index.
    /// Collisions only cause miscorrelation; this is not a protocol checksum.
    pub fn checksum(&self) -> u64 {
        const MASK: u64 = 0xffff_ffff_ffff_8000;
        let bytes = self.hash.to_byte_array();
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[12..20]);
        let tx = u64::from_le_bytes(word);
        (tx & MASK) | (u64::from(self.index) & !MASK)
    }
}

impl Default for Point {
    fn default() -> Self {
        Self::null()
    }
}

impl From<OutPoint> for Point {
    fn from(p: OutPoint) -> Self {
        Self::new(p.txid, p.vout)
    }
}

impl From<Point> for OutPoint {
    fn from(p: Point) -> Self {
        OutPoint {
            txid: p.hash,
            vout: p.index,
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_point() {
        let p = OutputPoint::default();
        assert!(p.is_null());
        assert!(!p.is_valid());
        assert!(Point::new(Txid::all_zeros(), 0).is_valid());
    }

    #[test]
    fn checksum_mixes_hash_and_index() {
        let mut bytes = [0u8; 32];
        bytes[12..20].copy_from_slice(&0x0123_4567_89ab_cdefu64.to_le_bytes());
        let p = Point::new(Txid::from_byte_array(bytes), 3);
        assert_eq!(p.checksum(), 0x0123_4567_89ab_8003);

        // Only the low 15 index bits participate.
        let q = Point::new(Txid::from_byte_array(bytes), 0x8003);
        assert_eq!(q.checksum(), p.checksum());
    }
}

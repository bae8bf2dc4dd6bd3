//! Bit-length prefix filters used to select stealth rows.
use std::{fmt, str::FromStr};

use crate::error::{Error, Result};

/// An ordered bit sequence with an explicit length, most-significant bit first.
///
/// The length need not be a multiple of eight; unused trailing bits of the last
/// block are always zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BinaryFilter {
    blocks: Vec<u8>,
    size: usize,
}

impl BinaryFilter {
    /// Build a filter of `size` bits from byte blocks.
    ///
    /// Fails with [`Error::InvalidFormat`] when `blocks` holds fewer than
    /// `size` bits. Extra blocks and bits past `size` are discarded.
    pub fn from_blocks(size: usize, blocks: &[u8]) -> Result<Self> {
        let needed = size.div_ceil(8);
        if blocks.len() < needed {
            return Err(Error::InvalidFormat(format!(
                "{size} bits need {needed} blocks, got {}",
                blocks.len()
            )));
        }
        let mut blocks = blocks[..needed].to_vec();
        if let (Some(last), tail) = (blocks.last_mut(), size % 8) {
            if tail != 0 {
                *last &= 0xffu8 << (8 - tail);
            }
        }
        Ok(Self { blocks, size })
    }

    /// Number of bits.
    pub fn len(&self) -> usize {
        self.size
    }

    /// True when the filter has no bits.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Backing bytes, `ceil(len / 8)` of them.
    pub fn blocks(&self) -> &[u8] {
        &self.blocks
    }

    /// Bit at `index`, or `None` past the end.
    pub fn bit(&self, index: usize) -> Option<bool> {
        (index < self.size).then(|| bit_of(&self.blocks, index))
    }

    /// Text form: `'0'`/`'1'` characters, most-significant bit first.
    pub fn encoded(&self) -> String {
        (0..self.size)
            .map(|i| if bit_of(&self.blocks, i) { '1' } else { '0' })
            .collect()
    }

    /// True when every bit of the filter matches the leading bits of `field`.
    pub fn is_prefix_of(&self, field: &[u8]) -> bool {
        if self.size > field.len() * 8 {
            return false;
        }
        let whole = self.size / 8;
        if self.blocks[..whole] != field[..whole] {
            return false;
        }
        (whole * 8..self.size).all(|i| bit_of(&self.blocks, i) == bit_of(field, i))
    }
}

fn bit_of(bytes: &[u8], index: usize) -> bool {
    bytes[index / 8] & (0x80 >> (index % 8)) != 0
}

impl FromStr for BinaryFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut blocks = vec![0u8; s.len().div_ceil(8)];
        for (i, c) in s.chars().enumerate() {
            match c {
                '1' => blocks[i / 8] |= 0x80 >> (i % 8),
                '0' => {}
                other => {
                    return Err(Error::InvalidFormat(format!(
                        "binary filter character {other:?} at {i}"
                    )))
                }
            }
        }
        Ok(Self {
            blocks,
            size: s.len(),
        })
    }
}

impl fmt::Display for BinaryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded())
    }
}

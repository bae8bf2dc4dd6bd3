//! Text form of 32-byte hashes.
//!
//! Hashes are stored little-endian and displayed byte-reversed: stored bytes
//! `[b0..b31]` render as the hex of `[b31..b0]`. This matches the `Display`
//! of [`bitcoin::BlockHash`] and [`bitcoin::Txid`], so both helpers and the
//! bitcoin types agree at every boundary.
use crate::error::{Error, Result};

/// Length of a hash in bytes.
pub const HASH_SIZE: usize = 32;

/// Render stored hash bytes as 64 lowercase hex characters, byte-reversed.
pub fn encode_hash(hash: &[u8; HASH_SIZE]) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Parse display-order hex into stored hash bytes.
pub fn decode_hash(text: &str) -> Result<[u8; HASH_SIZE]> {
    if text.len() != HASH_SIZE * 2 {
        return Err(Error::InvalidHash(format!(
            "expected {} hex characters, got {}",
            HASH_SIZE * 2,
            text.len()
        )));
    }
    let mut out = [0u8; HASH_SIZE];
    hex::decode_to_slice(text, &mut out).map_err(|e| Error::InvalidHash(e.to_string()))?;
    out.reverse();
    Ok(out)
}

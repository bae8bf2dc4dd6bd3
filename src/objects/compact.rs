use bitcoin::{bip152::HeaderAndShortIds, consensus, hashes::Hash};

use crate::{
    error::{Error, Result},
    objects::{Attached, Block, Header, Transaction},
};

/// A BIP152 compact block: header, short transaction ids and the prefilled
/// transactions (always including the coinbase).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactBlock {
    header: Header<Attached>,
    body: Option<HeaderAndShortIds>,
}

impl CompactBlock {
    /// Build from a full block using protocol `version` (1 or 2) and `nonce`
    /// for the short-id keys.
    pub fn from_block(block: &Block, nonce: u64, version: u32) -> Result<Self> {
        let body = HeaderAndShortIds::from_block(&block.to_bitcoin(), nonce, version, &[])
            .map_err(|e| Error::InvalidFormat(format!("compact block: {e:?}")))?;
        Ok(Self {
            header: block.header().clone(),
            body: Some(body),
        })
    }

    /// Deterministic short-id nonce for a block, derived from its hash.
    pub(crate) fn nonce_for(block: &Block) -> u64 {
        let bytes = block.hash().to_byte_array();
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[..8]);
        u64::from_le_bytes(word)
    }

    /// Header of the block, carrying its fetch height.
    pub fn header(&self) -> &Header<Attached> {
        &self.header
    }

    /// Height at fetch time.
    pub fn height(&self) -> Option<u32> {
        self.header.height()
    }

    /// Carries at least one transaction.
    pub fn is_valid(&self) -> bool {
        self.transaction_count() > 0
    }

    /// Short ids plus prefilled transactions.
    pub fn transaction_count(&self) -> usize {
        self.body
            .as_ref()
            .map_or(0, |b| b.short_ids.len() + b.prefilled_txs.len())
    }

    /// The `n`th prefilled transaction.
    pub fn transaction_nth(&self, n: usize) -> Result<Transaction> {
        let prefilled = self.body.as_ref().map_or(&[][..], |b| &b.prefilled_txs[..]);
        prefilled
            .get(n)
            .map(|p| Transaction::from(p.tx.clone()))
            .ok_or(Error::IndexOutOfRange {
                index: n,
                count: prefilled.len(),
            })
    }

    /// Short-id nonce, `0` after a reset.
    pub fn nonce(&self) -> u64 {
        self.body.as_ref().map_or(0, |b| b.nonce)
    }

    /// Wire size of the `cmpctblock` payload; `0` for versions other than 1
    /// and 2 or after a reset.
    pub fn serialized_size(&self, version: u32) -> usize {
        match (&self.body, version) {
            (Some(body), 1 | 2) => consensus::encode::serialize(body).len(),
            _ => 0,
        }
    }

    /// Drop the body, keeping the header.
    pub fn reset(&mut self) {
        self.body = None;
    }
}

use bitcoin::{consensus, merkle_tree::PartialMerkleTree, Txid};

use crate::{
    error::{Error, Result},
    objects::{Attached, Block, Header},
};

/// A header plus a partial merkle tree over the block's transaction ids.
///
/// The chain builds it with every transaction matched, so the tree carries
/// the full hash list. After [`MerkleBlock::reset`] only the header remains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlock {
    header: Header<Attached>,
    tree: Option<PartialMerkleTree>,
}

impl MerkleBlock {
    /// Build from a full block, matching every transaction.
    pub fn from_block(block: &Block) -> Self {
        let txids: Vec<Txid> = block.transactions().iter().map(|tx| tx.hash()).collect();
        let tree = (!txids.is_empty())
            .then(|| PartialMerkleTree::from_txids(&txids, &vec![true; txids.len()]));
        Self {
            header: block.header().clone(),
            tree,
        }
    }

    /// Header of the block, carrying its fetch height.
    pub fn header(&self) -> &Header<Attached> {
        &self.header
    }

    /// Height at fetch time.
    pub fn height(&self) -> Option<u32> {
        self.header.height()
    }

    /// Carries at least one transaction hash.
    pub fn is_valid(&self) -> bool {
        self.hash_count() > 0
    }

    /// Number of hashes in the partial tree.
    pub fn hash_count(&self) -> usize {
        self.tree.as_ref().map_or(0, |t| t.hashes().len())
    }

    /// Number of transactions in the full block.
    pub fn total_transaction_count(&self) -> u32 {
        self.tree.as_ref().map_or(0, PartialMerkleTree::num_transactions)
    }

    /// Wire size of the `merkleblock` message payload. Every protocol
    /// version since BIP37 shares one layout, so `version` only gates the
    /// message's existence.
    pub fn serialized_size(&self, version: u32) -> usize {
        const BIP37_VERSION: u32 = 70_001;
        if version < BIP37_VERSION {
            return 0;
        }
        let tree = self
            .tree
            .as_ref()
            .map_or(0, |t| consensus::encode::serialize(t).len());
        self.header.to_bytes().len() + tree
    }

    /// Drop the tree, keeping the header.
    pub fn reset(&mut self) {
        self.tree = None;
    }

    /// Verify the tree against the header merkle root and return the matched
    /// transaction ids in block order.
    pub fn extract_matches(&self) -> Result<Vec<Txid>> {
        let tree = self
            .tree
            .as_ref()
            .ok_or_else(|| Error::InvalidFormat("merkle block has no tree".into()))?;
        let mut matches = Vec::new();
        let mut indexes = Vec::new();
        let root = tree
            .extract_matches(&mut matches, &mut indexes)
            .map_err(|e| Error::InvalidFormat(e.to_string()))?;
        if root != self.header.merkle() {
            return Err(Error::InvalidFormat("merkle root mismatch".into()));
        }
        Ok(matches)
    }
}

use std::collections::HashSet;

use bitcoin::{consensus, hash_types::TxMerkleNode, hashes::Hash, script::Builder, BlockHash};

use crate::{
    error::{Error, Result},
    list::ListView,
    objects::{Attached, Detached, Header, Transaction},
};

/// Blocks between subsidy halvings.
pub const SUBSIDY_INTERVAL: u32 = 210_000;

/// Subsidy of the first interval, in satoshis.
pub const INITIAL_SUBSIDY: u64 = 50 * 100_000_000;

/// Block subsidy at `height`.
pub fn subsidy(height: u32) -> u64 {
    let halvings = height / SUBSIDY_INTERVAL;
    if halvings >= 64 {
        0
    } else {
        INITIAL_SUBSIDY >> halvings
    }
}

/// A full block: one attached header and its transactions.
///
/// The height is attached at fetch time as a snapshot and is `None` for
/// client-built blocks. The block hash is always computed from the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    header: Header<Attached>,
    transactions: Vec<Transaction>,
}

impl Block {
    /// Assemble a block; the header becomes attached and read-only.
    pub fn new(header: Header<Detached>, transactions: Vec<Transaction>) -> Self {
        Self {
            header: header.attach(None),
            transactions,
        }
    }

    /// Decode consensus bytes.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let block: bitcoin::Block = consensus::encode::deserialize(raw)?;
        Ok(block.into())
    }

    /// Consensus bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        consensus::encode::serialize(&self.to_bitcoin())
    }

    /// Convert into the bitcoin crate's block.
    pub fn to_bitcoin(&self) -> bitcoin::Block {
        bitcoin::Block {
            header: *self.header.as_bitcoin(),
            txdata: self
                .transactions
                .iter()
                .map(Transaction::to_bitcoin)
                .collect(),
        }
    }

    pub(crate) fn at_height(mut self, height: u32) -> Self {
        self.header = self.header.with_height(Some(height));
        self
    }

    /// Height at fetch time.
    pub fn height(&self) -> Option<u32> {
        self.header.height()
    }

    /// The block's header, sharing the block's lifetime.
    pub fn header(&self) -> &Header<Attached> {
        &self.header
    }

    /// Block hash.
    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    /// Number of transactions.
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Lazy view over the transactions.
    pub fn transactions(&self) -> ListView<'_, Transaction> {
        ListView::new(&self.transactions)
    }

    /// Transaction at position `n`.
    pub fn transaction_nth(&self, n: usize) -> Result<&Transaction> {
        self.transactions.get(n).ok_or(Error::IndexOutOfRange {
            index: n,
            count: self.transactions.len(),
        })
    }

    /// Wire size of the block.
    pub fn serialized_size(&self) -> usize {
        self.to_bytes().len()
    }

    /// Sum of non-coinbase fees, saturating.
    pub fn fees(&self) -> u64 {
        self.transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .fold(0u64, |n, tx| n.saturating_add(tx.fees()))
    }

    /// Value claimed by the coinbase outputs.
    pub fn claim(&self) -> u64 {
        self.transactions
            .first()
            .map_or(0, Transaction::total_output_value)
    }

    /// Fees plus the subsidy at `height`.
    pub fn reward(&self, height: u32) -> u64 {
        self.fees().saturating_add(subsidy(height))
    }

    /// Merkle root of the transaction ids; all-zero for an empty block.
    pub fn generate_merkle_root(&self) -> TxMerkleNode {
        self.to_bitcoin()
            .compute_merkle_root()
            .unwrap_or_else(TxMerkleNode::all_zeros)
    }

    /// Has at least one transaction.
    pub fn is_valid(&self) -> bool {
        !self.transactions.is_empty()
    }

    /// Sigops with BIP16 active, saturating.
    pub fn signature_operations(&self) -> usize {
        self.signature_operations_bip16_active(true)
    }

    /// Sigops over every transaction, saturating.
    pub fn signature_operations_bip16_active(&self, bip16_active: bool) -> usize {
        super::saturating_count(
            self.transactions
                .iter()
                .map(|tx| tx.signature_operations_bip16_active(bip16_active)),
        )
    }

    /// Input count over all transactions, optionally skipping the coinbase.
    pub fn total_inputs(&self, with_coinbase: bool) -> usize {
        let skip = usize::from(!with_coinbase);
        self.transactions
            .iter()
            .skip(skip)
            .map(|tx| tx.inputs().count())
            .sum()
    }

    /// A coinbase appears after the first position.
    pub fn is_extra_coinbases(&self) -> bool {
        self.transactions.iter().skip(1).any(Transaction::is_coinbase)
    }

    /// Every transaction is final at `height` and the header time.
    pub fn is_final(&self, height: u32) -> bool {
        let time = self.header.timestamp();
        self.transactions.iter().all(|tx| tx.is_final(height, time))
    }

    /// No two transactions share a hash.
    pub fn is_distinct_transaction_set(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.transactions.len());
        self.transactions.iter().all(|tx| seen.insert(tx.hash()))
    }

    /// The coinbase claims no more than fees plus subsidy.
    pub fn is_valid_coinbase_claim(&self, height: u32) -> bool {
        self.claim() <= self.reward(height)
    }

    /// The coinbase script starts with the serialized height (BIP34).
    pub fn is_valid_coinbase_script(&self, height: u32) -> bool {
        let Some(coinbase) = self.transactions.first().filter(|tx| tx.is_coinbase()) else {
            return false;
        };
        let expected = Builder::new().push_int(i64::from(height)).into_script();
        coinbase.inputs()[0]
            .script()
            .as_bytes()
            .starts_with(expected.as_bytes())
    }

    /// Two inputs inside the block spend the same output.
    pub fn is_internal_double_spend(&self) -> bool {
        let mut spent = HashSet::new();
        self.transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .flat_map(|tx| tx.inputs().iter())
            .any(|input| !spent.insert(*input.previous_output()))
    }

    /// The header's merkle root matches the transactions.
    pub fn is_valid_merkle_root(&self) -> bool {
        self.generate_merkle_root() == self.header.merkle()
    }
}

impl From<bitcoin::Block> for Block {
    fn from(block: bitcoin::Block) -> Self {
        Self {
            header: Header::from_chain(block.header, None),
            transactions: block.txdata.into_iter().map(Transaction::from).collect(),
        }
    }
}

//! The backing chain store: block and transaction indexes plus the
//! notification streams the query engine relays to subscribers.
use async_trait::async_trait;
use bitcoin::{block::Header as BtcHeader, BlockHash, Txid};
use tokio::sync::mpsc;

use crate::{
    error::Result,
    objects::{Block, History, OutputPoint, Point, Script, StealthRecord, Transaction},
};

/// Something the store observed that subscribers care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// The main chain changed above `fork_height`.
    Reorganize {
        /// Height of the last block both branches share.
        fork_height: u32,
        /// Newly connected blocks, ascending.
        incoming: Vec<Block>,
        /// Disconnected blocks, ascending. Empty for a plain extension.
        replaced: Vec<Block>,
    },
    /// A transaction entered the mempool.
    Transaction(Transaction),
}

/// Where a store writes its [`ChainEvent`]s, in the order they happen.
pub type EventSink = mpsc::UnboundedSender<ChainEvent>;

/// A stored transaction and where it sits in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    /// The transaction.
    pub transaction: Transaction,
    /// `(height, index in block)`, or `None` while only in the mempool.
    pub position: Option<(u32, u32)>,
}

/// The input that spends some output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spender {
    /// Spending transaction and input index.
    pub point: Point,
    /// Height of the spending transaction, `None` while only in the mempool.
    pub height: Option<u32>,
}

/// Storage and consensus collaborator behind the query engine.
///
/// Lookups return `Ok(None)` for unknown keys; the engine turns that into
/// [`crate::Error::NotFound`]. Backend failures are
/// [`crate::Error::EngineInternal`].
#[async_trait]
pub trait ChainStore: Send + Sync {
    /// Create the store if needed and connect `genesis` when it is empty.
    async fn initialize(&self, genesis: &Block) -> Result<()>;

    /// Take the store for this process and start writing events to `events`.
    /// Fails with [`crate::Error::StoreLocked`] while someone else holds it.
    async fn open(&self, events: EventSink) -> Result<()>;

    /// Release the store. Closing a closed store is a no-op.
    async fn close(&self) -> Result<()>;

    /// Height of the main-chain tip, `None` for an empty chain.
    async fn top_height(&self) -> Result<Option<u32>>;

    /// Main-chain block at `height`.
    async fn block_at(&self, height: u32) -> Result<Option<Block>>;

    /// Main-chain block and its height.
    async fn block_by_hash(&self, hash: BlockHash) -> Result<Option<(u32, Block)>>;

    /// Height of a main-chain block.
    async fn block_height(&self, hash: BlockHash) -> Result<Option<u32>> {
        Ok(self.block_by_hash(hash).await?.map(|(height, _)| height))
    }

    /// Main-chain header at `height`.
    async fn header_at(&self, height: u32) -> Result<Option<BtcHeader>> {
        Ok(self.block_at(height).await?.map(|b| *b.header().as_bitcoin()))
    }

    /// Main-chain header and its height.
    async fn header_by_hash(&self, hash: BlockHash) -> Result<Option<(u32, BtcHeader)>> {
        Ok(self
            .block_by_hash(hash)
            .await?
            .map(|(height, b)| (height, *b.header().as_bitcoin())))
    }

    /// A confirmed or mempool transaction.
    async fn transaction(&self, txid: Txid) -> Result<Option<TxRecord>>;

    /// The input spending `outpoint`, confirmed or in the mempool.
    async fn spender(&self, outpoint: OutputPoint) -> Result<Option<Spender>>;

    /// Confirmed history rows paying to or spending from `script` at or
    /// above `from_height`, in no particular order.
    async fn history(&self, script: &Script, from_height: u32) -> Result<Vec<History>>;

    /// Confirmed stealth rows at or above `from_height`, in no particular
    /// order.
    async fn stealth(&self, from_height: u32) -> Result<Vec<StealthRecord>>;

    /// Connect a block on top of the main chain or one of its branches.
    /// Fails with [`crate::Error::NotFound`] when the parent is unknown.
    async fn push_block(&self, block: Block) -> Result<()>;

    /// Accept a transaction into the mempool.
    async fn push_transaction(&self, tx: Transaction) -> Result<()>;
}

#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteChainStore;

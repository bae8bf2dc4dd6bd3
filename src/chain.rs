//! The asynchronous query surface over a [`ChainStore`].
//!
//! Every `fetch_*` call returns a [`RequestId`] immediately and invokes its
//! handler exactly once, from an engine thread, with the result. Calls made
//! while the engine is not running are answered with
//! [`Error::EngineNotRunning`], also from an engine thread.
//!
//! Handlers must not call back into [`crate::Executor::stop`]; stopping waits
//! for the engine threads they run on.
use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard},
};

use bitcoin::{BlockHash, Txid};
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    address::PaymentAddress,
    binary::BinaryFilter,
    completion::{Inflight, RequestId},
    error::{Error, Result},
    list::{HistoryList, List, StealthList},
    objects::{
        Attached, Block, CompactBlock, Header, MerkleBlock, Output, OutputPoint, Point, Prevout,
        SpendState, Transaction,
    },
    store::{ChainEvent, ChainStore},
    subscription::{Feed, Reorganization, Subscription},
};

/// Shortest binary filter accepted by [`Chain::fetch_stealth`].
pub const MIN_STEALTH_FILTER_BITS: usize = 8;

/// Message of a transaction that passes [`Chain::validate_tx`].
pub const VALID: &str = "valid";

/// Where a confirmed transaction sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionPosition {
    /// Height of the confirming block.
    pub height: u32,
    /// Index within that block.
    pub index: u32,
}

struct Pump {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Shared {
    store: Arc<dyn ChainStore>,
    runtime: Handle,
    running: RwLock<bool>,
    inflight: Inflight,
    reorganize: Arc<Feed<Reorganization>>,
    transaction: Arc<Feed<Transaction>>,
    pump: Mutex<Option<Pump>>,
}

/// Handle to the query engine of one [`crate::Executor`].
///
/// Cheap to clone. It does not keep the engine running: once the executor
/// stops, every call fails with [`Error::EngineNotRunning`].
#[derive(Clone)]
pub struct Chain {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("running", &self.is_running())
            .field("pending_requests", &self.pending_requests())
            .finish()
    }
}

fn not_found(what: impl std::fmt::Display) -> Error {
    Error::NotFound(what.to_string())
}

impl Chain {
    pub(crate) fn new(store: Arc<dyn ChainStore>, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                runtime,
                running: RwLock::new(false),
                inflight: Inflight::default(),
                reorganize: Arc::new(Feed::new("reorganize")),
                transaction: Arc::new(Feed::new("transaction")),
                pump: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn ChainStore> {
        &self.shared.store
    }

    fn running(&self) -> RwLockReadGuard<'_, bool> {
        self.shared
            .running
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_running(&self, running: bool) {
        *self
            .shared
            .running
            .write()
            .unwrap_or_else(PoisonError::into_inner) = running;
    }

    /// Whether calls are being served.
    pub fn is_running(&self) -> bool {
        *self.running()
    }

    /// Requests dispatched but not yet answered.
    pub fn pending_requests(&self) -> usize {
        self.shared.inflight.len()
    }

    /// Open the store and start relaying its events.
    pub(crate) async fn start(&self) -> Result<()> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.shared.store.open(events_tx).await?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = self.shared.runtime.spawn(pump(
            events_rx,
            stop_rx,
            Arc::clone(&self.shared.reorganize),
            Arc::clone(&self.shared.transaction),
        ));
        *self.shared.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(Pump {
            stop: stop_tx,
            task,
        });
        self.set_running(true);
        Ok(())
    }

    /// Refuse new calls, deliver queued events, then end every subscription
    /// and parked request with [`Error::EngineNotRunning`]. Returns once
    /// those terminal deliveries have run on an engine thread.
    pub(crate) async fn stop(&self) -> Result<()> {
        self.set_running(false);

        let closed = self.shared.store.close().await;
        if let Err(err) = &closed {
            warn!(%err, "closing the chain store failed");
        }

        let pump = self
            .shared
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Pump { stop, task }) = pump {
            let _ = stop.send(());
            if let Err(err) = task.await {
                warn!(%err, "event pump ended abnormally");
            }
        }

        let shared = Arc::clone(&self.shared);
        let drained = self.shared.runtime.spawn(async move {
            let subscribers = shared.reorganize.len() + shared.transaction.len();
            shared.reorganize.close(Error::EngineNotRunning);
            shared.transaction.close(Error::EngineNotRunning);
            let aborted = shared.inflight.abort_all(Error::EngineNotRunning);
            (subscribers, aborted)
        });
        match drained.await {
            Ok((subscribers, aborted)) => info!(subscribers, aborted, "query engine stopped"),
            Err(err) => warn!(%err, "draining subscribers and requests failed"),
        }
        closed
    }

    /// Answer `handler` with [`Error::EngineNotRunning`] from an engine
    /// thread. If the runtime is already gone the dropped completer answers
    /// instead.
    fn refuse<T, H>(&self, op: &'static str, handler: H) -> RequestId
    where
        T: Send + 'static,
        H: FnOnce(Result<T>) + Send + 'static,
    {
        let completer = self.shared.inflight.register(handler);
        let id = completer.id();
        trace!(op, request = %id, "engine not running");
        self.shared
            .runtime
            .spawn(async move { completer.complete(Err(Error::EngineNotRunning)) });
        id
    }

    /// [`Chain::refuse`] for a subscription handler: it sees one
    /// [`Error::EngineNotRunning`].
    fn refuse_subscription<E, F>(&self, op: &'static str, mut handler: F)
    where
        F: FnMut(Result<Arc<E>>) -> bool + Send + 'static,
    {
        self.refuse(op, move |result: Result<()>| {
            if let Err(err) = result {
                handler(Err(err));
            }
        });
    }

    fn dispatch<T, H, F, Fut>(&self, op: &'static str, handler: H, work: F) -> RequestId
    where
        T: Send + 'static,
        H: FnOnce(Result<T>) + Send + 'static,
        F: FnOnce(Arc<dyn ChainStore>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let running = self.running();
        if !*running {
            drop(running);
            return self.refuse(op, handler);
        }
        let completer = self.shared.inflight.register(handler);
        let id = completer.id();
        trace!(op, request = %id, "dispatching");
        let work = work(Arc::clone(&self.shared.store));
        self.shared.runtime.spawn(async move {
            let result = work.await;
            if let Err(err) = &result {
                debug!(op, request = %id, %err, "request failed");
            }
            completer.complete(result);
        });
        id
    }

    /// Height of the chain tip.
    pub fn fetch_last_height<H>(&self, handler: H) -> RequestId
    where
        H: FnOnce(Result<u32>) + Send + 'static,
    {
        self.dispatch("fetch_last_height", handler, |store| async move {
            store
                .top_height()
                .await?
                .ok_or_else(|| not_found("chain tip (chain is empty)"))
        })
    }

    /// Height of the block with `hash`.
    pub fn fetch_block_height<H>(&self, hash: BlockHash, handler: H) -> RequestId
    where
        H: FnOnce(Result<u32>) + Send + 'static,
    {
        self.dispatch("fetch_block_height", handler, move |store| async move {
            store
                .block_height(hash)
                .await?
                .ok_or_else(|| not_found(format!("block {hash}")))
        })
    }

    /// Header at `height`.
    pub fn fetch_block_header_by_height<H>(&self, height: u32, handler: H) -> RequestId
    where
        H: FnOnce(Result<Header<Attached>>) + Send + 'static,
    {
        self.dispatch("fetch_block_header_by_height", handler, move |store| async move {
            let header = store
                .header_at(height)
                .await?
                .ok_or_else(|| not_found(format!("block at height {height}")))?;
            Ok(Header::from_chain(header, Some(height)))
        })
    }

    /// Header of the block with `hash`.
    pub fn fetch_block_header_by_hash<H>(&self, hash: BlockHash, handler: H) -> RequestId
    where
        H: FnOnce(Result<Header<Attached>>) + Send + 'static,
    {
        self.dispatch("fetch_block_header_by_hash", handler, move |store| async move {
            let (height, header) = store
                .header_by_hash(hash)
                .await?
                .ok_or_else(|| not_found(format!("block {hash}")))?;
            Ok(Header::from_chain(header, Some(height)))
        })
    }

    /// Block at `height`, with all its transactions.
    pub fn fetch_block_by_height<H>(&self, height: u32, handler: H) -> RequestId
    where
        H: FnOnce(Result<Block>) + Send + 'static,
    {
        self.dispatch("fetch_block_by_height", handler, move |store| async move {
            block_at(store.as_ref(), height).await
        })
    }

    /// Block with `hash`, with all its transactions.
    pub fn fetch_block_by_hash<H>(&self, hash: BlockHash, handler: H) -> RequestId
    where
        H: FnOnce(Result<Block>) + Send + 'static,
    {
        self.dispatch("fetch_block_by_hash", handler, move |store| async move {
            block_by_hash(store.as_ref(), hash).await
        })
    }

    /// Merkle block at `height`, every transaction matched.
    pub fn fetch_merkle_block_by_height<H>(&self, height: u32, handler: H) -> RequestId
    where
        H: FnOnce(Result<MerkleBlock>) + Send + 'static,
    {
        self.dispatch("fetch_merkle_block_by_height", handler, move |store| async move {
            Ok(MerkleBlock::from_block(&block_at(store.as_ref(), height).await?))
        })
    }

    /// Merkle block with `hash`, every transaction matched.
    pub fn fetch_merkle_block_by_hash<H>(&self, hash: BlockHash, handler: H) -> RequestId
    where
        H: FnOnce(Result<MerkleBlock>) + Send + 'static,
    {
        self.dispatch("fetch_merkle_block_by_hash", handler, move |store| async move {
            Ok(MerkleBlock::from_block(&block_by_hash(store.as_ref(), hash).await?))
        })
    }

    /// Compact block (BIP152 version 1) at `height`.
    pub fn fetch_compact_block_by_height<H>(&self, height: u32, handler: H) -> RequestId
    where
        H: FnOnce(Result<CompactBlock>) + Send + 'static,
    {
        self.dispatch("fetch_compact_block_by_height", handler, move |store| async move {
            compact(&block_at(store.as_ref(), height).await?)
        })
    }

    /// Compact block (BIP152 version 1) with `hash`.
    pub fn fetch_compact_block_by_hash<H>(&self, hash: BlockHash, handler: H) -> RequestId
    where
        H: FnOnce(Result<CompactBlock>) + Send + 'static,
    {
        self.dispatch("fetch_compact_block_by_hash", handler, move |store| async move {
            compact(&block_by_hash(store.as_ref(), hash).await?)
        })
    }

    /// A transaction with its previous outputs attached, and its position
    /// when confirmed. With `require_confirmed`, a mempool-only transaction
    /// fails with [`Error::Unconfirmed`].
    pub fn fetch_transaction<H>(&self, hash: Txid, require_confirmed: bool, handler: H) -> RequestId
    where
        H: FnOnce(Result<(Transaction, Option<TransactionPosition>)>) + Send + 'static,
    {
        self.dispatch("fetch_transaction", handler, move |store| async move {
            let (mut tx, position) = transaction(store.as_ref(), hash, require_confirmed).await?;
            attach_prevouts(store.as_ref(), &mut tx).await?;
            Ok((tx, position))
        })
    }

    /// Position of a transaction, `None` while only in the mempool.
    pub fn fetch_transaction_position<H>(
        &self,
        hash: Txid,
        require_confirmed: bool,
        handler: H,
    ) -> RequestId
    where
        H: FnOnce(Result<Option<TransactionPosition>>) + Send + 'static,
    {
        self.dispatch("fetch_transaction_position", handler, move |store| async move {
            let (_, position) = transaction(store.as_ref(), hash, require_confirmed).await?;
            Ok(position)
        })
    }

    /// Output `index` of transaction `hash`.
    pub fn fetch_output<H>(
        &self,
        hash: Txid,
        index: u32,
        require_confirmed: bool,
        handler: H,
    ) -> RequestId
    where
        H: FnOnce(Result<Output>) + Send + 'static,
    {
        self.dispatch("fetch_output", handler, move |store| async move {
            let (tx, _) = transaction(store.as_ref(), hash, require_confirmed).await?;
            tx.outputs()
                .nth(index as usize)
                .map(Output::clone)
                .map_err(|_| not_found(OutputPoint::new(hash, index)))
        })
    }

    /// The input point spending `outpoint`. Fails with [`Error::NotFound`]
    /// while the output is unspent.
    pub fn fetch_spend<H>(&self, outpoint: OutputPoint, handler: H) -> RequestId
    where
        H: FnOnce(Result<Point>) + Send + 'static,
    {
        self.dispatch("fetch_spend", handler, move |store| async move {
            store
                .spender(outpoint)
                .await?
                .map(|spender| spender.point)
                .ok_or_else(|| not_found(format!("spend of {outpoint}")))
        })
    }

    /// Confirmed history of `address` from `from_height` on, ordered by
    /// height and then position in block. `limit == 0` returns every row.
    pub fn fetch_history<H>(
        &self,
        address: &PaymentAddress,
        limit: u32,
        from_height: u32,
        handler: H,
    ) -> RequestId
    where
        H: FnOnce(Result<HistoryList>) + Send + 'static,
    {
        let script = address.script_pubkey();
        self.dispatch("fetch_history", handler, move |store| async move {
            let mut rows = store.history(&script, from_height).await?;
            rows.sort_by_key(|row| {
                (
                    row.height(),
                    row.tx_position(),
                    row.point_kind() as u8,
                    row.point().index(),
                )
            });
            if limit > 0 {
                rows.truncate(limit as usize);
            }
            Ok(List::from_engine(rows))
        })
    }

    /// Confirmed stealth rows from `from_height` on whose prefix starts with
    /// `filter`, ordered by height. Filters shorter than
    /// [`MIN_STEALTH_FILTER_BITS`] are answered with
    /// [`Error::InvalidFilter`].
    pub fn fetch_stealth<H>(&self, filter: &BinaryFilter, from_height: u32, handler: H) -> RequestId
    where
        H: FnOnce(Result<StealthList>) + Send + 'static,
    {
        let filter = filter.clone();
        self.dispatch("fetch_stealth", handler, move |store| async move {
            if filter.len() < MIN_STEALTH_FILTER_BITS {
                return Err(Error::InvalidFilter {
                    bits: filter.len(),
                    min: MIN_STEALTH_FILTER_BITS,
                });
            }
            let mut rows: Vec<_> = store
                .stealth(from_height)
                .await?
                .into_iter()
                .filter(|row| filter.is_prefix_of(&row.prefix))
                .collect();
            rows.sort_by_key(|row| row.height);
            Ok(List::from_engine(rows))
        })
    }

    /// Check `tx` against the current chain and mempool. Answers
    /// [`VALID`] or a description of the first rule it breaks.
    ///
    /// Advisory only: the chain may change before the transaction is
    /// submitted.
    pub fn validate_tx<H>(&self, tx: Transaction, handler: H) -> RequestId
    where
        H: FnOnce(Result<String>) + Send + 'static,
    {
        self.dispatch("validate_tx", handler, move |store| async move {
            let mut tx = tx;
            attach_prevouts(store.as_ref(), &mut tx).await?;
            let top = store
                .top_height()
                .await?
                .ok_or_else(|| not_found("chain tip (chain is empty)"))?;
            let tip_time = store
                .header_at(top)
                .await?
                .map_or(0, |header| header.time);
            Ok(check(&tx, top.saturating_add(1), tip_time)
                .unwrap_or(VALID)
                .to_owned())
        })
    }

    /// Submit a block to the store. Connecting it notifies reorganization
    /// subscribers.
    pub fn organize_block<H>(&self, block: Block, handler: H) -> RequestId
    where
        H: FnOnce(Result<()>) + Send + 'static,
    {
        self.dispatch("organize_block", handler, move |store| async move {
            store.push_block(block).await
        })
    }

    /// Submit a transaction to the mempool. Accepting it notifies
    /// transaction subscribers.
    pub fn organize_transaction<H>(&self, tx: Transaction, handler: H) -> RequestId
    where
        H: FnOnce(Result<()>) + Send + 'static,
    {
        self.dispatch("organize_transaction", handler, move |store| async move {
            store.push_transaction(tx).await
        })
    }

    /// Receive every reorganization until the handler returns `false`, the
    /// guard is dropped or the engine stops. Stopping delivers one final
    /// [`Error::EngineNotRunning`].
    pub fn subscribe_reorganize<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(Result<Arc<Reorganization>>) -> bool + Send + 'static,
    {
        let running = self.running();
        if !*running {
            drop(running);
            self.refuse_subscription::<Reorganization, _>("subscribe_reorganize", handler);
            return Subscription::inert();
        }
        self.shared.reorganize.subscribe(Box::new(handler))
    }

    /// Receive every transaction accepted into the mempool, under the same
    /// rules as [`Chain::subscribe_reorganize`].
    pub fn subscribe_transaction<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(Result<Arc<Transaction>>) -> bool + Send + 'static,
    {
        let running = self.running();
        if !*running {
            drop(running);
            self.refuse_subscription::<Transaction, _>("subscribe_transaction", handler);
            return Subscription::inert();
        }
        self.shared.transaction.subscribe(Box::new(handler))
    }
}

async fn pump(
    mut events: mpsc::UnboundedReceiver<ChainEvent>,
    mut stop: oneshot::Receiver<()>,
    reorganize: Arc<Feed<Reorganization>>,
    transaction: Arc<Feed<Transaction>>,
) {
    let relay = |event: ChainEvent| match event {
        ChainEvent::Reorganize {
            fork_height,
            incoming,
            replaced,
        } => reorganize.publish(Arc::new(Reorganization::new(
            fork_height,
            incoming,
            replaced,
        ))),
        ChainEvent::Transaction(tx) => transaction.publish(Arc::new(tx)),
    };
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => relay(event),
                None => break,
            },
            _ = &mut stop => {
                while let Ok(event) = events.try_recv() {
                    relay(event);
                }
                break;
            }
        }
    }
    debug!("event pump finished");
}

async fn block_at(store: &dyn ChainStore, height: u32) -> Result<Block> {
    store
        .block_at(height)
        .await?
        .map(|block| block.at_height(height))
        .ok_or_else(|| not_found(format!("block at height {height}")))
}

async fn block_by_hash(store: &dyn ChainStore, hash: BlockHash) -> Result<Block> {
    store
        .block_by_hash(hash)
        .await?
        .map(|(height, block)| block.at_height(height))
        .ok_or_else(|| not_found(format!("block {hash}")))
}

fn compact(block: &Block) -> Result<CompactBlock> {
    CompactBlock::from_block(block, CompactBlock::nonce_for(block), 1)
}

async fn transaction(
    store: &dyn ChainStore,
    hash: Txid,
    require_confirmed: bool,
) -> Result<(Transaction, Option<TransactionPosition>)> {
    let record = store
        .transaction(hash)
        .await?
        .ok_or_else(|| not_found(format!("transaction {hash}")))?;
    let position = record
        .position
        .map(|(height, index)| TransactionPosition { height, index });
    if require_confirmed && position.is_none() {
        return Err(Error::Unconfirmed(format!("transaction {hash}")));
    }
    Ok((record.transaction, position))
}

async fn prevout_of(
    store: &dyn ChainStore,
    spending: Txid,
    point: OutputPoint,
) -> Result<Option<Prevout>> {
    let Some(record) = store.transaction(point.hash()).await? else {
        return Ok(None);
    };
    let Ok(output) = record.transaction.outputs().nth(point.index() as usize) else {
        return Ok(None);
    };
    let spender = store
        .spender(point)
        .await?
        .filter(|s| s.point.hash() != spending)
        .map(|s| match s.height {
            Some(_) => SpendState::Confirmed,
            None => SpendState::Unconfirmed,
        });
    Ok(Some(Prevout {
        output: output.clone(),
        height: record.position.map(|(height, _)| height),
        coinbase: record.transaction.is_coinbase(),
        spender,
    }))
}

async fn attach_prevouts(store: &dyn ChainStore, tx: &mut Transaction) -> Result<()> {
    if tx.is_coinbase() {
        return Ok(());
    }
    let spending = tx.hash();
    let points: Vec<OutputPoint> = tx.inputs().iter().map(|i| *i.previous_output()).collect();
    for (index, point) in points.into_iter().enumerate() {
        let prevout = prevout_of(store, spending, point).await?;
        tx.set_prevout(index, prevout)?;
    }
    Ok(())
}

/// The first rule `tx` breaks when mined at `height` after a block stamped
/// `time`.
fn check(tx: &Transaction, height: u32, time: u32) -> Option<&'static str> {
    if tx.is_coinbase() {
        return Some("coinbase transactions are only valid inside a block");
    }
    if tx.inputs().is_empty() || tx.outputs().is_empty() {
        return Some("transaction has no inputs or no outputs");
    }
    if tx.is_null_non_coinbase() {
        return Some("input spends the null point");
    }
    if tx.is_missing_previous_outputs() {
        return Some("previous output not found");
    }
    if tx.is_immature(height) {
        return Some("spends an immature coinbase output");
    }
    if tx.is_double_spend(true) {
        return Some("previous output already spent");
    }
    if tx.is_overspent() {
        return Some("outputs exceed inputs");
    }
    if !tx.is_final(height, time) {
        return Some("transaction is not final");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{Input, Script};
    use bitcoin::hashes::Hash;

    fn spend(locktime: u32, sequence: u32) -> Transaction {
        Transaction::new(
            1,
            locktime,
            vec![Input::new(
                OutputPoint::new(Txid::from_byte_array([1; 32]), 0),
                Script::default(),
                sequence,
            )],
            vec![Output::new(10, Script::default())],
        )
    }

    fn with_prevout(mut tx: Transaction, prevout: Prevout) -> Transaction {
        tx.set_prevout(0, Some(prevout)).unwrap();
        tx
    }

    fn prevout(value: u64) -> Prevout {
        Prevout {
            output: Output::new(value, Script::default()),
            height: Some(1),
            coinbase: false,
            spender: None,
        }
    }

    #[test]
    fn rules_are_checked_in_order() {
        assert_eq!(check(&spend(0, u32::MAX), 10, 0), Some("previous output not found"));

        let overspent = with_prevout(spend(0, u32::MAX), prevout(5));
        assert_eq!(check(&overspent, 10, 0), Some("outputs exceed inputs"));

        let mut spent = prevout(50);
        spent.spender = Some(SpendState::Unconfirmed);
        let double = with_prevout(spend(0, u32::MAX), spent);
        assert_eq!(check(&double, 10, 0), Some("previous output already spent"));

        let mut young = prevout(50);
        young.coinbase = true;
        let immature = with_prevout(spend(0, u32::MAX), young);
        assert_eq!(check(&immature, 50, 0), Some("spends an immature coinbase output"));

        let locked = with_prevout(spend(20, 0), prevout(50));
        assert_eq!(check(&locked, 10, 0), Some("transaction is not final"));
        assert_eq!(check(&locked, 21, 0), None);
    }
}

#![allow(dead_code)]
//! Shared fixtures: an in-memory chain store and block/transaction builders.
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bitcoin::{
    hashes::Hash, hash_types::TxMerkleNode, BlockHash, PubkeyHash, ScriptBuf, Txid,
};
use nodeview::{
    completion,
    objects::{Block, Header, History, Input, Output, OutputPoint, Point, Script, StealthRecord},
    store::{ChainEvent, ChainStore, EventSink, Spender, TxRecord},
    Error, Executor, ExecutorConfig, Network, Result,
};

/// Regtest difficulty bits.
pub const REGTEST_BITS: u32 = 0x207f_ffff;

#[derive(Default)]
struct State {
    open: bool,
    sink: Option<EventSink>,
    blocks: Vec<Block>,
    mempool: Vec<nodeview::objects::Transaction>,
    history: Vec<(Script, History)>,
    stealth: Vec<StealthRecord>,
}

/// Minimal in-memory store. A pushed block is connected right above its
/// parent and whatever sat there is reported as replaced.
#[derive(Default)]
pub struct MemStore {
    state: Mutex<State>,
    tip_delay: Mutex<Option<Duration>>,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Index a history row under `script`.
    pub fn add_history(&self, script: Script, row: History) {
        self.state.lock().unwrap().history.push((script, row));
    }

    /// Index a stealth row.
    pub fn add_stealth(&self, record: StealthRecord) {
        self.state.lock().unwrap().stealth.push(record);
    }

    /// Make every tip lookup take at least `delay`.
    pub fn set_tip_delay(&self, delay: Duration) {
        *self.tip_delay.lock().unwrap() = Some(delay);
    }

    fn publish(state: &State, event: ChainEvent) {
        if let Some(sink) = &state.sink {
            let _ = sink.send(event);
        }
    }
}

#[async_trait]
impl ChainStore for MemStore {
    async fn initialize(&self, genesis: &Block) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.blocks.is_empty() {
            state.blocks.push(genesis.clone());
        }
        Ok(())
    }

    async fn open(&self, events: EventSink) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.open {
            return Err(Error::StoreLocked("memory store already open".into()));
        }
        state.open = true;
        state.sink = Some(events);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.open = false;
        state.sink = None;
        Ok(())
    }

    async fn top_height(&self) -> Result<Option<u32>> {
        let delay = *self.tip_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        Ok(state.blocks.len().checked_sub(1).map(|h| h as u32))
    }

    async fn block_at(&self, height: u32) -> Result<Option<Block>> {
        Ok(self.state.lock().unwrap().blocks.get(height as usize).cloned())
    }

    async fn block_by_hash(&self, hash: BlockHash) -> Result<Option<(u32, Block)>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .blocks
            .iter()
            .position(|b| b.hash() == hash)
            .map(|h| (h as u32, state.blocks[h].clone())))
    }

    async fn transaction(&self, txid: Txid) -> Result<Option<TxRecord>> {
        let state = self.state.lock().unwrap();
        for (height, block) in state.blocks.iter().enumerate() {
            if let Some(index) = block.transactions().iter().position(|tx| tx.hash() == txid) {
                return Ok(Some(TxRecord {
                    transaction: block.transactions()[index].clone(),
                    position: Some((height as u32, index as u32)),
                }));
            }
        }
        Ok(state
            .mempool
            .iter()
            .find(|tx| tx.hash() == txid)
            .map(|tx| TxRecord {
                transaction: tx.clone(),
                position: None,
            }))
    }

    async fn spender(&self, outpoint: OutputPoint) -> Result<Option<Spender>> {
        let state = self.state.lock().unwrap();
        let confirmed = state.blocks.iter().enumerate().flat_map(|(height, block)| {
            block
                .transactions()
                .iter()
                .map(move |tx| (Some(height as u32), tx.clone()))
                .collect::<Vec<_>>()
        });
        let pooled = state.mempool.iter().map(|tx| (None, tx.clone()));
        for (height, tx) in confirmed.chain(pooled) {
            if tx.is_coinbase() {
                continue;
            }
            if let Some(index) = tx
                .inputs()
                .iter()
                .position(|i| *i.previous_output() == outpoint)
            {
                return Ok(Some(Spender {
                    point: Point::new(tx.hash(), index as u32),
                    height,
                }));
            }
        }
        Ok(None)
    }

    async fn history(&self, script: &Script, from_height: u32) -> Result<Vec<History>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .history
            .iter()
            .filter(|(s, row)| s == script && row.height() >= from_height)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn stealth(&self, from_height: u32) -> Result<Vec<StealthRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .stealth
            .iter()
            .filter(|row| row.height >= from_height)
            .cloned()
            .collect())
    }

    async fn push_block(&self, block: Block) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let parent = block.header().previous_block_hash();
        let fork = state
            .blocks
            .iter()
            .position(|b| b.hash() == parent)
            .ok_or_else(|| Error::NotFound(format!("parent block {parent}")))?;
        let replaced = state.blocks.split_off(fork + 1);
        state.blocks.push(block.clone());
        Self::publish(
            &state,
            ChainEvent::Reorganize {
                fork_height: fork as u32,
                incoming: vec![block],
                replaced,
            },
        );
        Ok(())
    }

    async fn push_transaction(&self, tx: nodeview::objects::Transaction) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mempool.push(tx.clone());
        Self::publish(&state, ChainEvent::Transaction(tx));
        Ok(())
    }
}

/// A coinbase paying `value` to a key hash derived from `seed`.
pub fn coinbase(seed: u8, value: u64) -> nodeview::objects::Transaction {
    nodeview::objects::Transaction::new(
        1,
        0,
        vec![Input::new(
            OutputPoint::null(),
            Script::from_data(&[seed, seed], false),
            u32::MAX,
        )],
        vec![Output::new(value, p2pkh(seed))],
    )
}

/// A final one-in one-out spend.
pub fn spend(previous: OutputPoint, value: u64, seed: u8) -> nodeview::objects::Transaction {
    nodeview::objects::Transaction::new(
        1,
        0,
        vec![Input::new(previous, Script::default(), u32::MAX)],
        vec![Output::new(value, p2pkh(seed))],
    )
}

pub fn p2pkh(seed: u8) -> Script {
    Script::from(ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([seed; 20])))
}

/// A block on `parent` with a correct merkle root. `nonce` keeps siblings
/// apart.
pub fn block_on(
    parent: BlockHash,
    nonce: u32,
    transactions: Vec<nodeview::objects::Transaction>,
) -> Block {
    let time = 1_600_000_000 + nonce;
    let header = |merkle| Header::new(1, parent, merkle, time, REGTEST_BITS, nonce);
    let draft = Block::new(header(TxMerkleNode::all_zeros()), transactions.clone());
    Block::new(header(draft.generate_merkle_root()), transactions)
}

pub fn genesis() -> Block {
    Network::Regtest.genesis()
}

/// A running executor over `store`, bootstrapped with the regtest genesis.
pub fn running(store: &Arc<MemStore>) -> anyhow::Result<Executor> {
    let mut config = ExecutorConfig::for_directory("unused", Network::Regtest);
    config.runtime.worker_threads = Some(2);
    let executor = Executor::with_store(config, store.clone())?;
    executor.init_chain()?;
    executor.run()?;
    Ok(executor)
}

pub type Handler<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// Issue one request and block for its answer.
pub fn ask<T, R>(call: impl FnOnce(Handler<T>) -> R) -> Result<T>
where
    T: Send + 'static,
{
    let (handler, mut pending) = completion::channel();
    call(Box::new(handler));
    pending
        .wait_timeout(Duration::from_secs(10))
        .expect("request was never answered")
}

/// Poll `cond` until it holds or ten seconds pass.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

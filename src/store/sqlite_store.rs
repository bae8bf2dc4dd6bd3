//! Embedded SQLite chain store.
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bitcoin::{hashes::Hash, BlockHash, Txid};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    objects::{
        extract_stealth, Block, History, Output, OutputPoint, Point, PointKind, Script, Stealth,
        StealthRecord, Transaction,
    },
    store::{ChainEvent, ChainStore, EventSink, Spender, TxRecord},
};

/// Tables:
///   blocks(height PK, hash UNIQUE, raw)       main chain
///   branch(hash PK, parent, raw)              blocks off the main chain
///   txs(txid PK, height, position, raw)       confirmed transactions
///   mempool(txid PK, raw)
///   spends(prev_txid, prev_index, txid, input, height NULL in mempool)
///   history(script, kind, txid, idx, height, position, value)
///   stealth(prefix, eph, pkh, txid, height)
///   meta(key PK, value)
const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS blocks (
        height INTEGER PRIMARY KEY,
        hash   BLOB NOT NULL UNIQUE,
        raw    BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS branch (
        hash   BLOB PRIMARY KEY,
        parent BLOB NOT NULL,
        raw    BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS txs (
        txid     BLOB PRIMARY KEY,
        height   INTEGER NOT NULL,
        position INTEGER NOT NULL,
        raw      BLOB NOT NULL
    );
    CREATE INDEX IF NOT EXISTS txs_height ON txs(height);
    CREATE TABLE IF NOT EXISTS mempool (
        txid BLOB PRIMARY KEY,
        raw  BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS spends (
        prev_txid  BLOB NOT NULL,
        prev_index INTEGER NOT NULL,
        txid       BLOB NOT NULL,
        input      INTEGER NOT NULL,
        height     INTEGER,
        PRIMARY KEY (prev_txid, prev_index, txid)
    );
    CREATE INDEX IF NOT EXISTS spends_height ON spends(height);
    CREATE TABLE IF NOT EXISTS history (
        script   BLOB NOT NULL,
        kind     INTEGER NOT NULL,
        txid     BLOB NOT NULL,
        idx      INTEGER NOT NULL,
        height   INTEGER NOT NULL,
        position INTEGER NOT NULL,
        value    INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS history_script ON history(script);
    CREATE INDEX IF NOT EXISTS history_height ON history(height);
    CREATE TABLE IF NOT EXISTS stealth (
        prefix BLOB NOT NULL,
        eph    BLOB NOT NULL,
        pkh    BLOB NOT NULL,
        txid   BLOB NOT NULL,
        height INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS stealth_height ON stealth(height);
    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
"#;

/// A [`ChainStore`] in a single SQLite file.
///
/// [`ChainStore::open`] takes an exclusive lock on the file that is held
/// until [`ChainStore::close`], so a second process (or a second store on
/// the same file) fails with [`Error::StoreLocked`].
pub struct SqliteChainStore {
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
    events: Arc<Mutex<Option<EventSink>>>,
}

impl SqliteChainStore {
    /// A store backed by the file at `path`. Nothing is touched until
    /// [`ChainStore::initialize`] or [`ChainStore::open`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: Arc::new(Mutex::new(None)),
            events: Arc::new(Mutex::new(None)),
        }
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::ZERO)?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    fn sink(&self) -> Result<Option<EventSink>> {
        Ok(self.events.lock().map_err(|_| poisoned())?.clone())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| poisoned())?;
            let conn = guard.as_mut().ok_or(Error::EngineNotRunning)?;
            f(conn)
        })
        .await?
    }
}

fn poisoned() -> Error {
    Error::internal(1, "store connection lock poisoned")
}

fn hash32(bytes: Vec<u8>) -> Result<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| Error::internal(1, "stored hash is not 32 bytes"))
}

fn top_height(conn: &Connection) -> Result<Option<u32>> {
    Ok(conn.query_row("SELECT MAX(height) FROM blocks", [], |r| r.get(0))?)
}

fn main_height(conn: &Connection, hash: &BlockHash) -> Result<Option<u32>> {
    Ok(conn
        .query_row(
            "SELECT height FROM blocks WHERE hash = ?1",
            params![hash.as_byte_array().as_slice()],
            |r| r.get(0),
        )
        .optional()?)
}

fn block_at(conn: &Connection, height: u32) -> Result<Option<Block>> {
    let raw: Option<Vec<u8>> = conn
        .query_row(
            "SELECT raw FROM blocks WHERE height = ?1",
            params![height],
            |r| r.get(0),
        )
        .optional()?;
    raw.map(|raw| Block::from_bytes(&raw)).transpose()
}

fn confirmed_output(conn: &Connection, point: &OutputPoint) -> Result<Option<Output>> {
    let raw: Option<Vec<u8>> = conn
        .query_row(
            "SELECT raw FROM txs WHERE txid = ?1",
            params![point.hash().as_byte_array().as_slice()],
            |r| r.get(0),
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    let tx = Transaction::from_bytes(&raw)?;
    Ok(tx.outputs().nth(point.index() as usize).ok().cloned())
}

/// Index `block` as the main-chain block at `height`.
fn connect_block(db: &Connection, height: u32, block: &Block) -> Result<()> {
    db.execute(
        "INSERT INTO blocks(height, hash, raw) VALUES (?1, ?2, ?3)",
        params![height, block.hash().as_byte_array().as_slice(), block.to_bytes()],
    )?;
    db.execute(
        "DELETE FROM branch WHERE hash = ?1",
        params![block.hash().as_byte_array().as_slice()],
    )?;

    for (position, tx) in block.transactions().iter().enumerate() {
        let txid = tx.hash();
        let txid_bytes = txid.as_byte_array().as_slice();
        let position = position as u32;
        db.execute(
            "INSERT OR REPLACE INTO txs(txid, height, position, raw) VALUES (?1, ?2, ?3, ?4)",
            params![txid_bytes, height, position, tx.to_bytes()],
        )?;
        db.execute("DELETE FROM mempool WHERE txid = ?1", params![txid_bytes])?;
        db.execute(
            "DELETE FROM spends WHERE txid = ?1 AND height IS NULL",
            params![txid_bytes],
        )?;

        if !tx.is_coinbase() {
            for (index, input) in tx.inputs().iter().enumerate() {
                let prev = input.previous_output();
                db.execute(
                    "INSERT OR REPLACE INTO spends(prev_txid, prev_index, txid, input, height)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        prev.hash().as_byte_array().as_slice(),
                        prev.index(),
                        txid_bytes,
                        index as u32,
                        height
                    ],
                )?;
                if let Some(output) = confirmed_output(db, prev)? {
                    db.execute(
                        "INSERT INTO history(script, kind, txid, idx, height, position, value)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            output.script().as_bytes(),
                            PointKind::Spend as u8,
                            txid_bytes,
                            index as u32,
                            height,
                            position,
                            prev.checksum() as i64
                        ],
                    )?;
                }
            }
        }

        for (index, output) in tx.outputs().iter().enumerate() {
            db.execute(
                "INSERT INTO history(script, kind, txid, idx, height, position, value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    output.script().as_bytes(),
                    PointKind::Output as u8,
                    txid_bytes,
                    index as u32,
                    height,
                    position,
                    output.value() as i64
                ],
            )?;
        }

        for record in extract_stealth(tx, height) {
            let stealth = &record.stealth;
            db.execute(
                "INSERT INTO stealth(prefix, eph, pkh, txid, height) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.prefix.as_slice(),
                    stealth.ephemeral_public_key_hash().as_slice(),
                    stealth.public_key_hash().as_slice(),
                    txid_bytes,
                    height
                ],
            )?;
        }
    }
    Ok(())
}

/// Remove the main-chain block at `height` and park it on a branch.
fn disconnect_block(db: &Connection, height: u32) -> Result<Block> {
    let block = block_at(db, height)?
        .ok_or_else(|| Error::internal(1, format!("main chain has a gap at {height}")))?;
    for table in ["blocks", "txs", "spends", "history", "stealth"] {
        db.execute(
            &format!("DELETE FROM {table} WHERE height = ?1"),
            params![height],
        )?;
    }
    park_block(db, &block)?;
    Ok(block)
}

fn park_block(db: &Connection, block: &Block) -> Result<()> {
    db.execute(
        "INSERT OR IGNORE INTO branch(hash, parent, raw) VALUES (?1, ?2, ?3)",
        params![
            block.hash().as_byte_array().as_slice(),
            block
                .header()
                .previous_block_hash()
                .as_byte_array()
                .as_slice(),
            block.to_bytes()
        ],
    )?;
    Ok(())
}

/// Walk `block`'s ancestry back to the main chain. Returns the fork height
/// and the branch in ascending order, ending with `block`.
fn branch_of(db: &Connection, block: Block) -> Result<(u32, Vec<Block>)> {
    let mut cursor = block.header().previous_block_hash();
    let mut branch = vec![block];
    loop {
        if let Some(fork) = main_height(db, &cursor)? {
            branch.reverse();
            return Ok((fork, branch));
        }
        let parked: Option<Vec<u8>> = db
            .query_row(
                "SELECT raw FROM branch WHERE hash = ?1",
                params![cursor.as_byte_array().as_slice()],
                |r| r.get(0),
            )
            .optional()?;
        let Some(raw) = parked else {
            return Err(Error::NotFound(format!("parent block {cursor}")));
        };
        let parent = Block::from_bytes(&raw)?;
        cursor = parent.header().previous_block_hash();
        branch.push(parent);
    }
}

fn organize(conn: &mut Connection, block: Block) -> Result<Option<ChainEvent>> {
    let hash = block.hash();
    let db = conn.transaction()?;
    if main_height(&db, &hash)?.is_some() {
        debug!(%hash, "block already on the main chain");
        return Ok(None);
    }
    let Some(top) = top_height(&db)? else {
        return Err(Error::NotFound(format!(
            "parent block {} (chain is empty)",
            block.header().previous_block_hash()
        )));
    };

    let (fork, incoming) = branch_of(&db, block)?;
    let branch_top = fork.saturating_add(incoming.len() as u32);
    if branch_top <= top {
        if let Some(tip) = incoming.last() {
            park_block(&db, tip)?;
        }
        db.commit()?;
        debug!(%hash, fork, branch_top, top, "block parked on a shorter branch");
        return Ok(None);
    }

    let mut replaced = Vec::new();
    for height in fork + 1..=top {
        replaced.push(disconnect_block(&db, height)?);
    }
    for (offset, block) in incoming.iter().enumerate() {
        connect_block(&db, fork + 1 + offset as u32, block)?;
    }
    db.commit()?;

    if replaced.is_empty() {
        debug!(%hash, height = branch_top, "chain extended");
    } else {
        info!(
            fork,
            incoming = incoming.len(),
            replaced = replaced.len(),
            "chain reorganized"
        );
    }
    Ok(Some(ChainEvent::Reorganize {
        fork_height: fork,
        incoming,
        replaced,
    }))
}

fn publish(sink: &Option<EventSink>, event: ChainEvent) {
    if let Some(sink) = sink {
        if sink.send(event).is_err() {
            warn!("event receiver dropped; notification lost");
        }
    }
}

#[async_trait]
impl ChainStore for SqliteChainStore {
    async fn initialize(&self, genesis: &Block) -> Result<()> {
        let path = self.path.clone();
        let conn = Arc::clone(&self.conn);
        let genesis = genesis.clone();
        task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| poisoned())?;
            let mut fresh;
            let conn = match guard.as_mut() {
                Some(conn) => conn,
                None => {
                    fresh = Self::connect(&path)?;
                    &mut fresh
                }
            };
            match block_at(conn, 0)? {
                Some(existing) if existing.hash() == genesis.hash() => {
                    debug!(path = %path.display(), "store already initialized");
                    Ok(())
                }
                Some(existing) => Err(Error::InvalidFormat(format!(
                    "store holds genesis {}, expected {}",
                    existing.hash(),
                    genesis.hash()
                ))),
                None => {
                    let db = conn.transaction()?;
                    connect_block(&db, 0, &genesis)?;
                    db.commit()?;
                    info!(path = %path.display(), genesis = %genesis.hash(), "store initialized");
                    Ok(())
                }
            }
        })
        .await?
    }

    async fn open(&self, events: EventSink) -> Result<()> {
        let path = self.path.clone();
        let slot = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut guard = slot.lock().map_err(|_| poisoned())?;
            if guard.is_some() {
                return Err(Error::StoreLocked(format!(
                    "{} is already open",
                    path.display()
                )));
            }
            let conn = Self::connect(&path)?;
            conn.execute_batch("PRAGMA locking_mode = EXCLUSIVE;")?;
            // The first write takes the exclusive lock, which the connection
            // then keeps until it closes.
            conn.execute(
                "INSERT INTO meta(key, value) VALUES ('owner', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![std::process::id().to_string()],
            )
            .map_err(|e| match Error::from(e) {
                Error::StoreLocked(_) => {
                    warn!(path = %path.display(), "chain store is locked by another owner");
                    Error::StoreLocked(path.display().to_string())
                }
                other => other,
            })?;
            *guard = Some(conn);
            info!(path = %path.display(), "chain store opened");
            Ok(())
        })
        .await??;
        *self.events.lock().map_err(|_| poisoned())? = Some(events);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.events.lock().map_err(|_| poisoned())?.take();
        let slot = Arc::clone(&self.conn);
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let conn = slot.lock().map_err(|_| poisoned())?.take();
            if let Some(conn) = conn {
                conn.close().map_err(|(_, e)| Error::from(e))?;
                info!(path = %path.display(), "chain store closed");
            }
            Ok(())
        })
        .await?
    }

    async fn top_height(&self) -> Result<Option<u32>> {
        self.with_conn(|conn| top_height(conn)).await
    }

    async fn block_at(&self, height: u32) -> Result<Option<Block>> {
        self.with_conn(move |conn| block_at(conn, height)).await
    }

    async fn block_by_hash(&self, hash: BlockHash) -> Result<Option<(u32, Block)>> {
        self.with_conn(move |conn| {
            let row: Option<(u32, Vec<u8>)> = conn
                .query_row(
                    "SELECT height, raw FROM blocks WHERE hash = ?1",
                    params![hash.as_byte_array().as_slice()],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            row.map(|(height, raw)| Ok((height, Block::from_bytes(&raw)?)))
                .transpose()
        })
        .await
    }

    async fn block_height(&self, hash: BlockHash) -> Result<Option<u32>> {
        self.with_conn(move |conn| main_height(conn, &hash)).await
    }

    async fn transaction(&self, txid: Txid) -> Result<Option<TxRecord>> {
        self.with_conn(move |conn| {
            let key = txid.as_byte_array().as_slice();
            let confirmed: Option<(Vec<u8>, u32, u32)> = conn
                .query_row(
                    "SELECT raw, height, position FROM txs WHERE txid = ?1",
                    params![key],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?;
            if let Some((raw, height, position)) = confirmed {
                return Ok(Some(TxRecord {
                    transaction: Transaction::from_bytes(&raw)?,
                    position: Some((height, position)),
                }));
            }
            let pooled: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT raw FROM mempool WHERE txid = ?1",
                    params![key],
                    |r| r.get(0),
                )
                .optional()?;
            pooled
                .map(|raw| {
                    Ok(TxRecord {
                        transaction: Transaction::from_bytes(&raw)?,
                        position: None,
                    })
                })
                .transpose()
        })
        .await
    }

    async fn spender(&self, outpoint: OutputPoint) -> Result<Option<Spender>> {
        self.with_conn(move |conn| {
            let row: Option<(Vec<u8>, u32, Option<u32>)> = conn
                .query_row(
                    "SELECT txid, input, height FROM spends
                     WHERE prev_txid = ?1 AND prev_index = ?2
                     ORDER BY height IS NULL, height LIMIT 1",
                    params![outpoint.hash().as_byte_array().as_slice(), outpoint.index()],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?;
            row.map(|(txid, input, height)| {
                Ok(Spender {
                    point: Point::new(Txid::from_byte_array(hash32(txid)?), input),
                    height,
                })
            })
            .transpose()
        })
        .await
    }

    async fn history(&self, script: &Script, from_height: u32) -> Result<Vec<History>> {
        let script = script.as_bytes().to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT kind, txid, idx, height, position, value FROM history
                 WHERE script = ?1 AND height >= ?2",
            )?;
            let rows = stmt.query_map(params![script, from_height], |r| {
                Ok((
                    r.get::<_, u8>(0)?,
                    r.get::<_, Vec<u8>>(1)?,
                    r.get::<_, u32>(2)?,
                    r.get::<_, u32>(3)?,
                    r.get::<_, u32>(4)?,
                    r.get::<_, i64>(5)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (kind, txid, idx, height, position, value) = row?;
                let kind = PointKind::try_from(kind)?;
                let point = Point::new(Txid::from_byte_array(hash32(txid)?), idx);
                out.push(History::from_parts(
                    point,
                    kind,
                    height,
                    position,
                    value as u64,
                ));
            }
            Ok(out)
        })
        .await
    }

    async fn stealth(&self, from_height: u32) -> Result<Vec<StealthRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT prefix, eph, pkh, txid, height FROM stealth WHERE height >= ?1",
            )?;
            let rows = stmt.query_map(params![from_height], |r| {
                Ok((
                    r.get::<_, Vec<u8>>(0)?,
                    r.get::<_, Vec<u8>>(1)?,
                    r.get::<_, Vec<u8>>(2)?,
                    r.get::<_, Vec<u8>>(3)?,
                    r.get::<_, u32>(4)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (prefix, eph, pkh, txid, height) = row?;
                let malformed = || Error::internal(1, "malformed stealth row");
                out.push(StealthRecord {
                    prefix: prefix.try_into().map_err(|_| malformed())?,
                    height,
                    stealth: Stealth::new(
                        eph.try_into().map_err(|_| malformed())?,
                        Txid::from_byte_array(hash32(txid)?),
                        pkh.try_into().map_err(|_| malformed())?,
                    ),
                });
            }
            Ok(out)
        })
        .await
    }

    async fn push_block(&self, block: Block) -> Result<()> {
        let sink = self.sink()?;
        self.with_conn(move |conn| {
            if let Some(event) = organize(conn, block)? {
                publish(&sink, event);
            }
            Ok(())
        })
        .await
    }

    async fn push_transaction(&self, tx: Transaction) -> Result<()> {
        if tx.is_coinbase() {
            return Err(Error::InvalidFormat(
                "a coinbase cannot enter the mempool".into(),
            ));
        }
        let sink = self.sink()?;
        self.with_conn(move |conn| {
            let txid = tx.hash();
            let key = txid.as_byte_array().as_slice();
            let db = conn.transaction()?;
            let known: bool = db.query_row(
                "SELECT EXISTS(SELECT 1 FROM txs WHERE txid = ?1)
                     OR EXISTS(SELECT 1 FROM mempool WHERE txid = ?1)",
                params![key],
                |r| r.get(0),
            )?;
            if known {
                debug!(%txid, "transaction already known");
                return Ok(());
            }
            db.execute(
                "INSERT INTO mempool(txid, raw) VALUES (?1, ?2)",
                params![key, tx.to_bytes()],
            )?;
            for (index, input) in tx.inputs().iter().enumerate() {
                let prev = input.previous_output();
                db.execute(
                    "INSERT OR IGNORE INTO spends(prev_txid, prev_index, txid, input, height)
                     VALUES (?1, ?2, ?3, ?4, NULL)",
                    params![
                        prev.hash().as_byte_array().as_slice(),
                        prev.index(),
                        key,
                        index as u32
                    ],
                )?;
            }
            db.commit()?;
            debug!(%txid, "transaction accepted into the mempool");
            publish(&sink, ChainEvent::Transaction(tx));
            Ok(())
        })
        .await
    }
}

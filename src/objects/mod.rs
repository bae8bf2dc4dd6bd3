//! Typed chain objects: headers, blocks, transactions and their parts.
//!
//! Values handed out by the query engine are owned snapshots. Parts of a
//! parent (a block's header, a transaction's inputs) are borrowed from it and
//! live exactly as long as the parent does.

mod block;
mod compact;
mod header;
mod history;
mod merkle;
mod point;
mod script;
mod stealth;
mod transaction;

pub use block::{subsidy, Block, INITIAL_SUBSIDY, SUBSIDY_INTERVAL};
pub use compact::CompactBlock;
pub use header::{Attached, Detached, Header, HeaderState};
pub use history::{History, HistoryValue, PointKind};
pub use merkle::MerkleBlock;
pub use point::{OutputPoint, Point};
pub use script::{forks, script_from_hex, Script};
pub use stealth::{
    extract_stealth, stealth_prefix, Stealth, StealthRecord, EPHEMERAL_KEY_SIGN, PREFIX_SIZE,
};
/// Sum of counts, pinned at `usize::MAX` instead of wrapping.
pub(crate) fn saturating_count(counts: impl IntoIterator<Item = usize>) -> usize {
    counts.into_iter().fold(0, usize::saturating_add)
}

pub use transaction::{
    Input, Output, Prevout, SpendState, Transaction, COINBASE_MATURITY, LOCKTIME_THRESHOLD,
    NOT_FOUND_VALUE,
};

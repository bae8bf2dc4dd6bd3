#![forbid(unsafe_code)]
#![deny(missing_docs)]
//! nodeview: an asynchronous query and subscription layer over a local
//! Bitcoin full-node chain store.
//!
//! ## What you get
//! - [`Executor`]: owns the engine threads and the chain store; drives the
//!   `Constructed → Initialized → Running → Stopped` lifecycle.
//! - [`Chain`]: non-blocking `fetch_*` queries whose handler runs exactly
//!   once, plus reorganization and mempool subscriptions.
//! - Typed chain objects ([`objects`]), collections ([`list`]), payment
//!   addresses, binary filters and hash text helpers.
//!
//! ## What you may implement
//! - [`ChainStore`]: the storage collaborator. The SQLite store
//!   ([`SqliteChainStore`], feature `store-sqlite`, on by default) is used
//!   unless you bring your own through [`Executor::with_store`].
//!
//! ## Minimal usage
//! ```rust,ignore
//! use nodeview::prelude::*;
//!
//! fn main() -> nodeview::Result<()> {
//!     let executor = Executor::new("nodeview.toml")?;
//!     executor.init_chain()?;
//!     executor.run()?;
//!
//!     let chain = executor.chain();
//!     let (handler, height) = completion::channel();
//!     chain.fetch_last_height(handler);
//!     println!("tip at {}", height.wait()?);
//!
//!     let _reorgs = chain.subscribe_reorganize(|event| match event {
//!         Ok(reorg) => {
//!             println!("fork at {}", reorg.fork_height());
//!             true
//!         }
//!         Err(_) => false,
//!     });
//!
//!     executor.stop()
//! }
//! ```

/// Error taxonomy and numeric completion codes.
pub mod error;

/// Hash text form (byte-reversed hex).
pub mod hash;

/// Bit-string filters for stealth queries.
pub mod binary;

/// Base58Check payment addresses.
pub mod address;

pub mod objects;

pub mod list;

pub mod completion;

pub mod subscription;

/// Storage collaborator (trait and SQLite implementation).
pub mod store;

pub mod chain;

pub mod config;

pub mod shutdown;

pub mod executor;

// Public re-exports
pub use address::PaymentAddress;
pub use binary::BinaryFilter;
pub use chain::{Chain, TransactionPosition};
pub use completion::{Pending, RequestId};
pub use config::{ExecutorConfig, Network};
pub use error::{Error, ErrorKind, Result};
pub use executor::{Executor, ExecutorState};
pub use list::{BlockList, HistoryList, List, ListView, StealthList, TransactionList};
pub use shutdown::{ShutdownHandle, ShutdownReason};
pub use store::{ChainEvent, ChainStore, EventSink};
#[cfg(feature = "store-sqlite")]
pub use store::SqliteChainStore;
pub use subscription::{Reorganization, Subscription};

/// Convenience prelude for end users.
pub mod prelude {
    pub use crate::{
        completion, BinaryFilter, Chain, ChainStore, Error, ErrorKind, Executor, ExecutorConfig,
        PaymentAddress, Reorganization, Subscription,
    };
    pub use crate::objects::{Block, Header, Output, OutputPoint, Transaction};
}

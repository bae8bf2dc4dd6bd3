//! Process-wide handle to one running node.
//!
//! ```text
//! Constructed --init_chain--> Initialized
//!      |                          |
//!      +-----------run------------+--> Running --stop--> Stopped
//! ```
//!
//! Dropping a running executor stops it first.
//!
//! The blocking calls work from plain threads and from inside another tokio
//! runtime; in the latter case the wait happens on a helper thread.
use std::{
    fmt,
    future::Future,
    panic,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::Duration,
};

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    chain::Chain,
    config::{ExecutorConfig, LogConfig},
    error::{Error, Result},
    shutdown::{self, ShutdownHandle, ShutdownReason},
    store::ChainStore,
};

/// Lifecycle state of an [`Executor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Built, store untouched.
    Constructed,
    /// Store bootstrapped by [`Executor::init_chain`].
    Initialized,
    /// Serving queries.
    Running,
    /// Stopped for good.
    Stopped,
}

impl ExecutorState {
    fn name(self) -> &'static str {
        match self {
            ExecutorState::Constructed => "constructed",
            ExecutorState::Initialized => "initialized",
            ExecutorState::Running => "running",
            ExecutorState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn install_logging(log: &LogConfig) {
    if !log.enabled {
        return;
    }
    let (filter, invalid) = match EnvFilter::try_new(&log.filter) {
        Ok(filter) => (filter, None),
        Err(err) => (EnvFilter::new("info"), Some(err)),
    };
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        debug!("a tracing subscriber is already installed");
    }
    if let Some(err) = invalid {
        warn!(filter = %log.filter, %err, "invalid log filter, logging at info");
    }
}

/// Owner of the engine runtime and the chain store for its whole lifetime.
pub struct Executor {
    config: ExecutorConfig,
    runtime: Option<Runtime>,
    chain: Chain,
    state: Mutex<ExecutorState>,
    transitions: AtomicUsize,
    shutdown: ShutdownHandle,
}

impl Executor {
    /// Load the configuration at `config_path` and back the executor with
    /// the SQLite store it names.
    #[cfg(feature = "store-sqlite")]
    pub fn new(config_path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::with_config(ExecutorConfig::load(config_path)?)
    }

    /// Executor over the SQLite store in `config.store.directory`, which is
    /// created if missing.
    #[cfg(feature = "store-sqlite")]
    pub fn with_config(config: ExecutorConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.store.directory)?;
        let store = crate::store::SqliteChainStore::new(config.store.database());
        Self::with_store(config, Arc::new(store))
    }

    /// Executor over any [`ChainStore`].
    pub fn with_store(config: ExecutorConfig, store: Arc<dyn ChainStore>) -> Result<Self> {
        install_logging(&config.log);

        let mut builder = Builder::new_multi_thread();
        builder.enable_all().thread_name("nodeview-engine");
        if let Some(threads) = config.runtime.worker_threads {
            builder.worker_threads(threads.max(1));
        }
        let runtime = builder.build()?;

        info!(
            store = %config.store.directory.display(),
            network = ?config.network,
            "executor constructed"
        );
        let chain = Chain::new(store, runtime.handle().clone());
        Ok(Self {
            config,
            runtime: Some(runtime),
            chain,
            state: Mutex::new(ExecutorState::Constructed),
            transitions: AtomicUsize::new(0),
            shutdown: ShutdownHandle::default(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ExecutorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime.as_ref().ok_or(Error::EngineNotRunning)
    }

    /// Drive `future` to completion on the engine runtime.
    fn block_on<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + Send,
        F::Output: Send,
    {
        let runtime = self.runtime()?;
        if Handle::try_current().is_err() {
            return Ok(runtime.block_on(future));
        }
        // Runtime::block_on refuses to nest inside another runtime.
        let output = thread::scope(|scope| {
            scope
                .spawn(|| runtime.block_on(future))
                .join()
                .unwrap_or_else(|payload| panic::resume_unwind(payload))
        });
        Ok(output)
    }

    fn transition(&self, state: &mut ExecutorState, next: ExecutorState) {
        info!(from = %state, to = %next, "executor transition");
        *state = next;
        self.transitions.fetch_add(1, Ordering::SeqCst);
    }

    /// Current state.
    pub fn state(&self) -> ExecutorState {
        *self.lock()
    }

    /// Number of state transitions taken so far.
    pub fn transitions(&self) -> usize {
        self.transitions.load(Ordering::SeqCst)
    }

    /// Configuration in use.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// The query engine. Usable in any state; calls fail with
    /// [`Error::EngineNotRunning`] unless the executor is running.
    pub fn chain(&self) -> Chain {
        self.chain.clone()
    }

    /// Trigger that makes [`Executor::run_wait`] return.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Bootstrap the store with the configured network's genesis block.
    /// Only valid before the first run.
    pub fn init_chain(&self) -> Result<()> {
        let mut state = self.lock();
        if *state != ExecutorState::Constructed {
            return Err(Error::InvalidState {
                op: "init_chain",
                state: state.name(),
            });
        }
        let genesis = self.config.network.genesis();
        self.block_on(self.chain.store().initialize(&genesis))??;
        self.transition(&mut state, ExecutorState::Initialized);
        Ok(())
    }

    /// Open the store and start serving queries. Fails with
    /// [`Error::StoreLocked`] while another owner holds the store.
    pub fn run(&self) -> Result<()> {
        let mut state = self.lock();
        match *state {
            ExecutorState::Constructed | ExecutorState::Initialized => {}
            other => {
                return Err(Error::InvalidState {
                    op: "run",
                    state: other.name(),
                })
            }
        }
        if let Err(err) = self.block_on(self.chain.start())? {
            error!(%err, "executor failed to start");
            return Err(err);
        }
        self.transition(&mut state, ExecutorState::Running);
        Ok(())
    }

    /// [`Executor::run`], then block until ctrl+c, SIGTERM, a
    /// [`ShutdownHandle::request`] or [`Executor::stop`], and stop.
    pub fn run_wait(&self) -> Result<ShutdownReason> {
        self.run()?;
        let reason = self.block_on(shutdown::wait(&self.shutdown))?;
        self.stop()?;
        Ok(reason)
    }

    /// Stop serving. Every parked request and subscription receives
    /// [`Error::EngineNotRunning`]. Stopping a stopped executor succeeds
    /// without doing anything.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.lock();
        match *state {
            ExecutorState::Running => {}
            ExecutorState::Stopped => {
                debug!("executor already stopped");
                return Ok(());
            }
            other => {
                return Err(Error::InvalidState {
                    op: "stop",
                    state: other.name(),
                })
            }
        }
        let stopped = self.block_on(self.chain.stop())?;
        self.transition(&mut state, ExecutorState::Stopped);
        self.shutdown.request();
        stopped
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("state", &self.state())
            .field("transitions", &self.transitions())
            .field("config", &self.config)
            .finish()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if self.state() == ExecutorState::Running {
            if let Err(err) = self.stop() {
                warn!(%err, "stopping executor on drop failed");
            }
        }
        if let Some(runtime) = self.runtime.take() {
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(Duration::from_millis(self.config.shutdown_timeout_ms));
            }
        }
    }
}

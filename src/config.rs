//! Executor configuration.
//!
//! Loaded from a TOML or JSON file (format chosen by extension) and then
//! overlaid with `NODEVIEW_*` environment variables, nested keys separated by
//! `__` (for example `NODEVIEW_STORE__DIRECTORY`).
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Result;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "NODEVIEW";

/// File name of the SQLite database inside [`StoreConfig::directory`].
pub const STORE_FILE: &str = "chain.sqlite";

/// Bitcoin network the store follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Production network.
    #[default]
    Mainnet,
    /// Public test network.
    Testnet,
    /// Local regression-test network.
    Regtest,
}

impl Network {
    /// The bitcoin crate's network.
    pub fn to_bitcoin(self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }

    /// Genesis block connected by `init_chain`.
    pub fn genesis(self) -> crate::objects::Block {
        bitcoin::constants::genesis_block(self.to_bitcoin()).into()
    }
}

/// Where the chain store lives.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the store files; created on demand.
    pub directory: PathBuf,
}

impl StoreConfig {
    /// Path of the SQLite database.
    pub fn database(&self) -> PathBuf {
        self.directory.join(STORE_FILE)
    }
}

/// Engine dispatch threads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RuntimeConfig {
    /// Worker thread count; tokio's default (one per core) when unset.
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

/// Log output installed by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LogConfig {
    /// Install a `tracing` subscriber. Off by default so an embedding
    /// application keeps control of its own.
    #[serde(default)]
    pub enabled: bool,
    /// `EnvFilter` directive.
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            filter: default_filter(),
        }
    }
}

fn default_filter() -> String {
    "info".to_owned()
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

/// Everything an [`crate::Executor`] needs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExecutorConfig {
    /// Chain store location.
    pub store: StoreConfig,
    /// Network followed by the store.
    #[serde(default)]
    pub network: Network,
    /// Engine runtime.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Logging.
    #[serde(default)]
    pub log: LogConfig,
    /// How long dropping the executor waits for engine tasks to wind down.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl ExecutorConfig {
    /// Load from `path`, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(true))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Defaults for a store in `directory` on `network`.
    pub fn for_directory(directory: impl Into<PathBuf>, network: Network) -> Self {
        Self {
            store: StoreConfig {
                directory: directory.into(),
            },
            network,
            runtime: RuntimeConfig::default(),
            log: LogConfig::default(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_toml_with_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "network = \"regtest\"\n[store]\ndirectory = \"/var/lib/nodeview\"\n[runtime]\nworker_threads = 2"
        )
        .unwrap();

        let config = ExecutorConfig::load(file.path()).unwrap();
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(
            config.store.database(),
            PathBuf::from("/var/lib/nodeview/chain.sqlite")
        );
        assert_eq!(config.runtime.worker_threads, Some(2));
        assert!(!config.log.enabled);
        assert_eq!(config.log.filter, "info");
        assert_eq!(config.shutdown_timeout_ms, 5_000);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = ExecutorConfig::load("/nonexistent/nodeview.toml").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn genesis_follows_network() {
        assert_ne!(
            Network::Mainnet.genesis().hash(),
            Network::Regtest.genesis().hash()
        );
    }
}

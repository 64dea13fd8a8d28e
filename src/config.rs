use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::error::ConnectorError;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log: LogConfig,
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Only needed for the bitcoind client
    #[serde(default)]
    pub btc_rpc: Option<BtcRpcConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "connector.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConnectorConfig {
    pub currency: String,
    /// Confirmations after which a transaction counts as final
    pub required_confirmations: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub node_poll_interval_ms: u64,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn default_poll_interval_ms() -> u64 {
    5000
}

impl ConnectorConfig {
    pub fn new(currency: impl Into<String>, required_confirmations: u32) -> Self {
        Self {
            currency: currency.into(),
            required_confirmations,
            node_poll_interval_ms: default_poll_interval_ms(),
            scheduler: SchedulerConfig::default(),
        }
    }

    pub fn node_poll_interval(&self) -> Duration {
        Duration::from_millis(self.node_poll_interval_ms)
    }
}

/// Withdrawal delivery mode
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SchedulerConfig {
    #[default]
    Single,
    Batch {
        min_transactions: usize,
        max_wait_ms: u64,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    #[default]
    Memory,
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BtcRpcConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_rpc_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_rpc_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: &str) -> Result<Self, ConnectorError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConnectorError> {
        let config: AppConfig =
            serde_yaml::from_str(content).map_err(|e| ConnectorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConnectorError> {
        if let SchedulerConfig::Batch {
            min_transactions, ..
        } = self.connector.scheduler
            && min_transactions == 0
        {
            return Err(ConnectorError::Config(
                "scheduler.min_transactions must be at least 1".to_string(),
            ));
        }
        if self.connector.node_poll_interval_ms == 0 {
            return Err(ConnectorError::Config(
                "connector.node_poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Collector configuration, loaded from a single TOML file shared by the
/// daemon, the worker, and the CLI driver.

use std::path::Path;

use serde::Deserialize;

use crate::error::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub db: DbSection,
    pub ssh: SshSection,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub collection: CollectionSection,
    #[serde(default)]
    pub scan: ScanSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbSection {
    /// Path to the SQLite database file
    pub dsn: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshSection {
    pub user: String,
    pub private_key: String,
    #[serde(default = "default_ssh_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSection {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            user: None,
            password: None,
        }
    }
}

impl BrokerSection {
    /// Server URL in the form the NATS client expects.
    pub fn url(&self) -> String {
        format!("nats://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionSection {
    #[serde(default = "default_collection_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for CollectionSection {
    fn default() -> Self {
        Self {
            interval_seconds: default_collection_interval(),
            max_workers: default_max_workers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanSection {
    #[serde(default = "default_scan_interval")]
    pub interval_seconds: u64,
}

impl Default for ScanSection {
    fn default() -> Self {
        Self {
            interval_seconds: default_scan_interval(),
        }
    }
}

fn default_ssh_timeout() -> u64 { 10 }
fn default_ssh_port() -> u16 { crate::DEFAULT_SSH_PORT }
fn default_broker_host() -> String { "localhost".to_string() }
fn default_broker_port() -> u16 { crate::DEFAULT_BROKER_PORT }
fn default_collection_interval() -> u64 { crate::DEFAULT_COLLECTION_INTERVAL_SECS }
fn default_max_workers() -> usize { 5 }
fn default_scan_interval() -> u64 { crate::DEFAULT_SCAN_INTERVAL_SECS }

impl Config {
    /// Load and parse the configuration file. Missing file or malformed
    /// TOML is fatal at startup.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))
    }
}

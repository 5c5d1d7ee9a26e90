//! Gateway configuration. Every field has a default so an empty environment boots
//! a local instance; override with `VALUATION__SECTION__KEY`.

use std::path::PathBuf;
use std::time::Duration;

use model_registry::{FileLedgerOptions, PointerMode, RetryConfig};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub service_name: String,
    pub log_level: String,
    pub listen_addr: String,
    pub health_port: u16,
    pub registry: RegistrySection,
    pub reference: ReferenceSection,
    pub retry: RetrySection,
    pub cache: CacheSection,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            service_name: "inference-gateway".into(),
            log_level: "info".into(),
            listen_addr: "0.0.0.0:8080".into(),
            health_port: 9090,
            registry: RegistrySection::default(),
            reference: ReferenceSection::default(),
            retry: RetrySection::default(),
            cache: CacheSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// Holds the ledger file and the `models/` version directories.
    pub root: PathBuf,
    pub ledger_file: String,
    pub lock_timeout_ms: u64,
    pub stale_lock_secs: u64,
    pub pointer_mode: PointerMode,
    pub remote_base_url: Option<String>,
    pub remote_timeout_ms: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/registry"),
            ledger_file: "model_registry.json".into(),
            lock_timeout_ms: 5_000,
            stale_lock_secs: 30,
            pointer_mode: PointerMode::PointerFile,
            remote_base_url: None,
            remote_timeout_ms: 10_000,
        }
    }
}

impl RegistrySection {
    pub fn ledger_path(&self) -> PathBuf { self.root.join(&self.ledger_file) }
    pub fn models_root(&self) -> PathBuf { self.root.join("models") }
    pub fn remote_timeout(&self) -> Duration { Duration::from_millis(self.remote_timeout_ms) }

    pub fn ledger_options(&self) -> FileLedgerOptions {
        FileLedgerOptions {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            stale_lock_after: Duration::from_secs(self.stale_lock_secs),
            ..FileLedgerOptions::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReferenceSection {
    pub path: PathBuf,
    pub join_key: String,
}

impl Default for ReferenceSection {
    fn default() -> Self { Self { path: PathBuf::from("data/zipcode_demographics.csv"), join_key: "zipcode".into() } }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Conflict retries per registration; 0 surfaces every lost race to the caller.
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self { Self { max_retries: 3, base_delay_ms: 20, max_delay_ms: 500 } }
}

impl RetrySection {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            ..RetryConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
}

impl Default for CacheSection {
    fn default() -> Self { Self { enabled: true } }
}

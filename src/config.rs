//! TOML configuration.
//!
//! Loaded once at startup and shared read-only (`Arc<Config>`) with every
//! component. Numeric settings are parsed leniently: a value of the wrong
//! type, an unparseable string, or a non-positive number logs a warning and
//! falls back to the documented default instead of aborting startup.
//!
//! ```toml
//! [server]
//! port = 8099
//! key = "shared-secret"
//!
//! [storage]
//! repository_store = "/data/repos"
//!
//! [limits]
//! text_max_mb = 10
//! pdf_max_mb = 100
//!
//! [reindex]
//! timeout_secs = 60
//! workers = 4
//!
//! [backend]
//! url = "http://localhost:9200"
//!
//! [access]
//! url = "http://localhost:3000"
//! ```

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};

use crate::extract::SizeLimits;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub reindex: ReindexConfig,
    pub backend: BackendConfig,
    pub access: AccessConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port", deserialize_with = "lenient_port")]
    pub port: u16,
    /// Shared key for request signatures. Empty disables verification.
    #[serde(default)]
    pub key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            key: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub repository_store: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_text_max_mb", deserialize_with = "lenient_text_max")]
    pub text_max_mb: u64,
    #[serde(default = "default_pdf_max_mb", deserialize_with = "lenient_pdf_max")]
    pub pdf_max_mb: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            text_max_mb: default_text_max_mb(),
            pdf_max_mb: default_pdf_max_mb(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReindexConfig {
    #[serde(default = "default_reindex_timeout", deserialize_with = "lenient_reindex_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_workers", deserialize_with = "lenient_workers")]
    pub workers: usize,
}

impl Default for ReindexConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_reindex_timeout(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub url: String,
    #[serde(default = "default_commit_index")]
    pub commit_index: String,
    #[serde(default = "default_blob_index")]
    pub blob_index: String,
    #[serde(default = "default_client_timeout", deserialize_with = "lenient_backend_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AccessConfig {
    pub url: String,
    #[serde(default = "default_access_timeout", deserialize_with = "lenient_access_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_public_limit", deserialize_with = "lenient_public_limit")]
    pub public_search_limit: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_max_results", deserialize_with = "lenient_max_results")]
    pub max_results: usize,
    #[serde(default = "default_suggest_size", deserialize_with = "lenient_suggest_size")]
    pub suggest_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            suggest_size: default_suggest_size(),
        }
    }
}

fn default_port() -> u16 {
    8099
}
fn default_text_max_mb() -> u64 {
    10
}
fn default_pdf_max_mb() -> u64 {
    100
}
fn default_reindex_timeout() -> u64 {
    60
}
fn default_workers() -> usize {
    4
}
fn default_commit_index() -> String {
    "commits".to_string()
}
fn default_blob_index() -> String {
    "blobs".to_string()
}
fn default_client_timeout() -> u64 {
    30
}
fn default_access_timeout() -> u64 {
    10
}
fn default_public_limit() -> u64 {
    10_000
}
fn default_max_results() -> usize {
    100
}
fn default_suggest_size() -> usize {
    10
}

/// Parses a positive number from an integer or numeric string, falling back
/// to `default` (with a warning) for anything else.
fn lenient<'de, D, T>(deserializer: D, key: &str, default: T) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + FromStr + PartialOrd + Default + Display + Copy,
{
    let raw = toml::Value::deserialize(deserializer)?;
    let parsed = match &raw {
        toml::Value::String(s) => s.trim().parse::<T>().ok(),
        other => other.clone().try_into::<T>().ok(),
    };
    match parsed {
        Some(v) if v > T::default() => Ok(v),
        _ => {
            tracing::warn!(
                key,
                value = %raw,
                default = %default,
                "invalid configuration value, using default"
            );
            Ok(default)
        }
    }
}

macro_rules! lenient_field {
    ($name:ident, $ty:ty, $key:literal, $default:ident) => {
        fn $name<'de, D: Deserializer<'de>>(deserializer: D) -> Result<$ty, D::Error> {
            lenient(deserializer, $key, $default())
        }
    };
}

lenient_field!(lenient_port, u16, "server.port", default_port);
lenient_field!(lenient_text_max, u64, "limits.text_max_mb", default_text_max_mb);
lenient_field!(lenient_pdf_max, u64, "limits.pdf_max_mb", default_pdf_max_mb);
lenient_field!(lenient_reindex_timeout, u64, "reindex.timeout_secs", default_reindex_timeout);
lenient_field!(lenient_workers, usize, "reindex.workers", default_workers);
lenient_field!(lenient_backend_timeout, u64, "backend.timeout_secs", default_client_timeout);
lenient_field!(lenient_access_timeout, u64, "access.timeout_secs", default_access_timeout);
lenient_field!(lenient_public_limit, u64, "access.public_search_limit", default_public_limit);
lenient_field!(lenient_max_results, usize, "query.max_results", default_max_results);
lenient_field!(lenient_suggest_size, usize, "query.suggest_size", default_suggest_size);

impl Config {
    pub fn size_limits(&self) -> SizeLimits {
        SizeLimits {
            text: self.limits.text_max_mb.saturating_mul(MIB),
            pdf: self.limits.pdf_max_mb.saturating_mul(MIB),
        }
    }

    pub fn reindex_timeout(&self) -> Duration {
        Duration::from_secs(self.reindex.timeout_secs)
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;

        if config.backend.url.trim().is_empty() {
            bail!("backend.url must not be empty");
        }
        if config.access.url.trim().is_empty() {
            bail!("access.url must not be empty");
        }
        if config.storage.repository_store.as_os_str().is_empty() {
            bail!("storage.repository_store must not be empty");
        }

        Ok(config)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = content.parse()?;

    if !config.storage.repository_store.is_dir() {
        tracing::warn!(
            store = %config.storage.repository_store.display(),
            "repository store does not exist yet"
        );
    }
    Ok(config)
}

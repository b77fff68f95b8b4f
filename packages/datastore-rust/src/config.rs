//! Datastore configuration.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::storage::RetryPolicy;

/// Which backend holds the datums, and where.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-process tables; contents vanish with the process.
    #[default]
    Memory,
    /// Embedded redb database file.
    Redb { path: PathBuf },
    /// `PostgreSQL` database reachable at `url`.
    Postgres { url: String },
}

/// Top-level datastore configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    pub backend: BackendConfig,
    /// Payload byte quota. 0 means unlimited.
    pub quota_bytes: u64,
    /// Connection attempts per reconnect after a backend failure.
    pub reconnect_attempts: u32,
    /// Times a failed read is re-issued after reconnecting.
    pub read_retries: u32,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            quota_bytes: 0,
            reconnect_attempts: 3,
            read_retries: 1,
        }
    }
}

impl DatastoreConfig {
    /// Parses a configuration from JSON; omitted fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if `input` is not valid configuration JSON.
    pub fn from_json(input: &str) -> anyhow::Result<Self> {
        serde_json::from_str(input).context("invalid datastore configuration")
    }

    /// Loads a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// The reconnect policy these settings describe.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            reconnect_attempts: self.reconnect_attempts,
            read_retries: self.read_retries,
        }
    }
}

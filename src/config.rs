//! WolfLedger Replication Configuration
//!
//! This module provides configuration structures for the replica-side
//! replication engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main replica configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Primary database connection configuration
    pub primary: PrimaryConfig,

    /// Replication pipeline configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Backoff configuration for transient failures
    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// Primary database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryConfig {
    /// Database to replicate from
    pub database: String,

    /// Primary host
    pub address: String,

    /// Primary replication port
    #[serde(default = "default_primary_port")]
    pub port: u16,

    /// Username used by the replica to authenticate
    pub username: String,

    /// Password used by the replica to authenticate
    pub password: String,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Replication pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Bytes per stream frame when exporting transactions
    #[serde(default = "default_stream_chunk_size")]
    pub stream_chunk_size: usize,

    /// Capacity of the exported-transaction prefetch queue
    #[serde(default = "default_prefetch_tx_buffer")]
    pub prefetch_tx_buffer: usize,

    /// Number of concurrent commit workers (>= 1)
    #[serde(default = "default_commit_concurrency")]
    pub commit_concurrency: usize,

    /// Allow discarding precommitted transactions to recover from a
    /// precommit divergence (otherwise divergence is fatal)
    #[serde(default)]
    pub allow_tx_discarding: bool,

    /// Force a disconnect after this many consecutive fetch failures so the
    /// next iteration re-establishes the session (0 = never)
    #[serde(default = "default_disconnect_after_failures")]
    pub disconnect_after_failures: u32,
}

/// Backoff configuration for transient failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay after the first failure in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on the delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_primary_port() -> u16 {
    3322
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_stream_chunk_size() -> usize {
    4096
}

fn default_prefetch_tx_buffer() -> usize {
    100
}

fn default_commit_concurrency() -> usize {
    10
}

fn default_disconnect_after_failures() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            stream_chunk_size: default_stream_chunk_size(),
            prefetch_tx_buffer: default_prefetch_tx_buffer(),
            commit_concurrency: default_commit_concurrency(),
            allow_tx_discarding: false,
            disconnect_after_failures: default_disconnect_after_failures(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReplicaConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ReplicaConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.primary.database.is_empty() {
            return Err(crate::Error::Config("primary.database cannot be empty".into()));
        }

        if self.primary.address.is_empty() {
            return Err(crate::Error::Config("primary.address cannot be empty".into()));
        }

        if self.replication.stream_chunk_size == 0 {
            return Err(crate::Error::Config(
                "replication.stream_chunk_size must be positive".into(),
            ));
        }

        if self.replication.prefetch_tx_buffer == 0 {
            return Err(crate::Error::Config(
                "replication.prefetch_tx_buffer must be positive".into(),
            ));
        }

        if self.replication.commit_concurrency == 0 {
            return Err(crate::Error::Config(
                "replication.commit_concurrency must be at least 1".into(),
            ));
        }

        if self.backoff.base_delay_ms == 0 {
            return Err(crate::Error::Config("backoff.base_delay_ms must be positive".into()));
        }

        if self.backoff.max_delay_ms < self.backoff.base_delay_ms {
            return Err(crate::Error::Config(
                "backoff.max_delay_ms cannot be below backoff.base_delay_ms".into(),
            ));
        }

        Ok(())
    }

    /// Identifier of the primary database used in logs: `<db>@<addr>:<port>`
    pub fn primary_id(&self) -> String {
        format!(
            "{}@{}:{}",
            self.primary.database, self.primary.address, self.primary.port
        )
    }

    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.primary.connect_timeout_secs)
    }

    /// Get base backoff delay as Duration
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.backoff.base_delay_ms)
    }

    /// Get maximum backoff delay as Duration
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.backoff.max_delay_ms)
    }
}

//! WolfLedger Replication Error Types

use thiserror::Error;

/// Result type alias for replication operations
pub type Result<T> = std::result::Result<T, Error>;

/// Replication error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Lifecycle errors
    #[error("Replicator already running")]
    AlreadyRunning,

    #[error("Replicator already stopped")]
    AlreadyStopped,

    /// Cooperative unwind signal, never counted as a failure
    #[error("Replication stopped")]
    Stopped,

    // Divergence errors
    #[error("Replica commit state diverged from primary's")]
    CommitStateDiverged,

    #[error("Replica precommit state diverged from primary's")]
    PrecommitStateDiverged,

    /// Fatal classification: the replica cannot safely continue
    #[error("Replica diverged from primary")]
    ReplicaDiverged,

    // Remote signals
    #[error("Transaction already committed")]
    TxAlreadyCommitted,

    #[error("Primary is not running with synchronous replication")]
    PrimaryNotSync,

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Wire serialization error: {0}")]
    WireSerialization(#[from] bincode::Error),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Remote errors without a typed mapping
    #[error("Primary error: {0}")]
    Remote(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is one of the divergence signals reported by
    /// the primary or the local store
    pub fn is_divergence(&self) -> bool {
        matches!(
            self,
            Error::CommitStateDiverged | Error::PrecommitStateDiverged | Error::ReplicaDiverged
        )
    }

    /// Check if this error is retryable by the supervisor backoff loop
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Config(_)
                | Error::ConfigParse(_)
                | Error::AlreadyRunning
                | Error::AlreadyStopped
                | Error::Stopped
                | Error::ReplicaDiverged
        )
    }

    /// Check if this error means the replication machinery is shutting down
    pub fn is_stopped(&self) -> bool {
        matches!(self, Error::Stopped | Error::AlreadyStopped)
    }
}

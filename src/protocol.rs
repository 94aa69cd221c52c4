//! Replication Wire Protocol
//!
//! Defines the framed request/response protocol the replica speaks to the
//! primary's replication endpoint. Every frame is a length-prefixed,
//! CRC-checked bincode payload. One `ExportTx` request yields a stream of
//! `TxChunk` frames terminated by a `TxTrailer` frame.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Error;
use crate::state::{ReplicaState, TxId};

/// Request to export one transaction from the primary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportTxRequest {
    /// Transaction to export
    pub tx: TxId,
    /// Replica state, attached when synchronous replication is enabled
    pub replica_state: Option<ReplicaState>,
    /// Allow the primary to export precommitted transactions
    pub allow_precommitted: bool,
}

/// Trailer metadata delivered after the last chunk of an export stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trailer {
    entries: HashMap<String, Vec<u8>>,
}

impl Trailer {
    /// Create an empty trailer
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a trailer value by key
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// Set a trailer value
    pub fn insert(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.entries.insert(key.into(), value);
    }

    /// Check whether the trailer carries no metadata
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Protocol requests sent by the replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Authenticate the session
    Login { username: String, password: String },

    /// Select the database to replicate; refreshes the session token
    UseDatabase { token: String, database: String },

    /// Export one transaction as a chunk stream
    ExportTx {
        token: String,
        request: ExportTxRequest,
        /// Bytes per chunk frame the primary should use
        chunk_size: usize,
    },

    /// Terminate the session
    Logout { token: String },
}

/// Protocol responses sent by the primary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Login succeeded
    LoggedIn { token: String },

    /// Database selected, session token refreshed
    DatabaseSelected { token: String },

    /// One chunk of the exported transaction payload
    TxChunk { data: Vec<u8> },

    /// End of the export stream; the payload may have been empty
    TxTrailer { trailer: Trailer },

    /// Logout acknowledged
    LoggedOut,

    /// Request failed
    Error { code: ErrorCode, message: String },
}

/// Typed error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Credentials rejected
    InvalidCredentials,
    /// Unknown or inaccessible database
    DatabaseNotFound,
    /// Replica commit state diverged from the primary's history
    CommitStateDiverged,
    /// Replica precommit state diverged from the primary's history
    PrecommitStateDiverged,
    /// Transaction already committed on the receiving side
    TxAlreadyCommitted,
    /// Internal primary error, message carries detail
    Internal,
}

impl ErrorCode {
    /// Map a typed wire error into a crate error.
    ///
    /// `Internal` errors fall back to legacy substring matching so primaries
    /// that only report plain text still classify correctly.
    pub fn into_error(self, message: String) -> Error {
        match self {
            ErrorCode::InvalidCredentials => Error::Auth(message),
            ErrorCode::DatabaseNotFound => Error::Remote(message),
            ErrorCode::CommitStateDiverged => Error::CommitStateDiverged,
            ErrorCode::PrecommitStateDiverged => Error::PrecommitStateDiverged,
            ErrorCode::TxAlreadyCommitted => Error::TxAlreadyCommitted,
            ErrorCode::Internal => classify_legacy_message(message),
        }
    }
}

/// Map the legacy textual error contract onto typed errors.
///
/// These strings are the wire contract of older primaries; keep this mapping
/// confined to the protocol edge.
fn classify_legacy_message(message: String) -> Error {
    if message.contains("follower commit state diverged from master's") {
        Error::CommitStateDiverged
    } else if message.contains("follower precommit state diverged from master's") {
        Error::PrecommitStateDiverged
    } else if message.contains("tx already committed") {
        Error::TxAlreadyCommitted
    } else {
        Error::Remote(message)
    }
}

impl Request {
    /// Serialize request to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize request from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

impl Response {
    /// Serialize response to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize response from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            checksum: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}

//! Replica ID Generator
//!
//! Generates globally unique, time-ordered 96-bit identifiers for replicator
//! instances. The id travels to the primary with every synchronous-mode
//! export request so the primary can track acknowledgements per replica.
//!
//! ID Structure (96 bits):
//! - 48 bits: timestamp (milliseconds since epoch, ~8900 years)
//! - 48 bits: random entropy drawn at generation time

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Raw length of a replica id in bytes
pub const REPLICA_ID_LEN: usize = 12;

const TIMESTAMP_BYTES: usize = 6;

/// Opaque 96-bit replica identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId([u8; REPLICA_ID_LEN]);

impl ReplicaId {
    /// Generate a new id from the current time and fresh entropy
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let mut bytes = [0u8; REPLICA_ID_LEN];
        bytes[..TIMESTAMP_BYTES].copy_from_slice(&millis.to_be_bytes()[2..]);
        rand::thread_rng().fill(&mut bytes[TIMESTAMP_BYTES..]);

        Self(bytes)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; REPLICA_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; REPLICA_ID_LEN] {
        &self.0
    }

    /// Extract the embedded timestamp (milliseconds since the UNIX epoch)
    pub fn timestamp_millis(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf[2..].copy_from_slice(&self.0[..TIMESTAMP_BYTES]);
        u64::from_be_bytes(buf)
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

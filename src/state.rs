//! Replication State Types
//!
//! Snapshots of the local commit state, the replica state uploaded to the
//! primary in synchronous mode, and the commit hint the primary returns in
//! the export trailer.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::ReplicaId;
use crate::protocol::Trailer;

/// Transaction identifier, assigned sequentially by the primary
pub type TxId = u64;

/// Accumulative linear hash binding a transaction to its predecessors
pub type Alh = [u8; 32];

/// Trailer key carrying the commit watermark tx id (8-byte big-endian u64)
pub const TRAILER_MAY_COMMIT_TX_ID: &str = "may-commit-up-to-txid-bin";

/// Trailer key carrying the commit watermark ALH (32 bytes)
pub const TRAILER_MAY_COMMIT_ALH: &str = "may-commit-up-to-alh-bin";

/// Snapshot of the local store's commit state
///
/// `tx_id <= precommitted_tx_id` holds by store invariant: precommitted
/// transactions are written ahead of the commit watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitState {
    /// Last durably committed transaction
    pub tx_id: TxId,
    /// ALH of the last committed transaction
    pub tx_hash: Alh,
    /// Last precommitted transaction
    pub precommitted_tx_id: TxId,
    /// ALH of the last precommitted transaction
    pub precommitted_tx_hash: Alh,
}

/// Replica state uploaded to the primary with each synchronous-mode export
/// request, built from the latest [`CommitState`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    /// Stable identity of the replicator instance
    pub uuid: String,
    /// Last committed transaction
    pub committed_tx_id: TxId,
    /// ALH of the last committed transaction
    pub committed_alh: Alh,
    /// Last precommitted transaction
    pub precommitted_tx_id: TxId,
    /// ALH of the last precommitted transaction
    pub precommitted_alh: Alh,
}

impl ReplicaState {
    /// Build the replica state for an export request
    pub fn new(uuid: ReplicaId, commit_state: &CommitState) -> Self {
        Self {
            uuid: uuid.to_string(),
            committed_tx_id: commit_state.tx_id,
            committed_alh: commit_state.tx_hash,
            precommitted_tx_id: commit_state.precommitted_tx_id,
            precommitted_alh: commit_state.precommitted_tx_hash,
        }
    }
}

/// Advisory from the primary that the replica may advance its commit
/// watermark to the given transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitHint {
    /// Transaction id the replica may commit up to (0 = no advisory yet)
    pub tx_id: TxId,
    /// Expected ALH at that transaction
    pub alh: Alh,
}

impl CommitHint {
    /// Decode the commit hint from an export trailer.
    ///
    /// Both trailer keys are mandatory whenever the primary runs with
    /// synchronous replication; a missing or malformed entry means the
    /// primary is not configured for it.
    pub fn from_trailer(trailer: &Trailer) -> Result<Self> {
        let raw_tx_id = trailer.get(TRAILER_MAY_COMMIT_TX_ID).ok_or(Error::PrimaryNotSync)?;
        let raw_alh = trailer.get(TRAILER_MAY_COMMIT_ALH).ok_or(Error::PrimaryNotSync)?;

        let tx_id = TxId::from_be_bytes(
            raw_tx_id
                .try_into()
                .map_err(|_| Error::Protocol("commit hint tx id is not 8 bytes".into()))?,
        );

        let alh: Alh = raw_alh
            .try_into()
            .map_err(|_| Error::Protocol("commit hint ALH is not 32 bytes".into()))?;

        Ok(Self { tx_id, alh })
    }
}

//! Replica Store Contract
//!
//! The storage engine consumed by the replicator. The engine owns the
//! transaction log and the commit/precommit machinery; the replicator only
//! feeds it exported transactions and relays the primary's commit hints.

use async_trait::async_trait;

use crate::error::Result;
use crate::state::{Alh, CommitState, TxId};

/// Local database surface the replicator drives
///
/// Implementations must tolerate out-of-order [`replicate_tx`] calls from
/// concurrent commit workers: application is idempotent per transaction id
/// and the store enforces its own internal sequencing.
///
/// [`replicate_tx`]: ReplicaStore::replicate_tx
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Name of the local database, used in logs
    fn name(&self) -> &str;

    /// Snapshot the current commit state
    async fn current_state(&self) -> Result<CommitState>;

    /// Whether this database participates in synchronous replication
    fn is_sync_replication_enabled(&self) -> bool;

    /// Apply one exported transaction, returning the applied transaction id.
    ///
    /// May fail with [`Error::TxAlreadyCommitted`] (idempotent success for
    /// the caller) or [`Error::Stopped`] when the store is shutting down.
    ///
    /// [`Error::TxAlreadyCommitted`]: crate::Error::TxAlreadyCommitted
    /// [`Error::Stopped`]: crate::Error::Stopped
    async fn replicate_tx(&self, exported_tx: &[u8]) -> Result<TxId>;

    /// Advance the commit watermark up to `tx_id`, verifying the ALH.
    ///
    /// May fail with [`Error::CommitStateDiverged`] when the hint does not
    /// match local history.
    ///
    /// [`Error::CommitStateDiverged`]: crate::Error::CommitStateDiverged
    async fn allow_commit_up_to(&self, tx_id: TxId, alh: Alh) -> Result<()>;

    /// Discard all precommitted transactions with id >= `tx_id`
    async fn discard_precommitted_txs_since(&self, tx_id: TxId) -> Result<()>;
}

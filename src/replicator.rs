//! Transaction Replicator
//!
//! Pulls committed (and, in synchronous mode, precommitted) transactions
//! from a primary database and applies them to the local store in order, so
//! the local transaction log stays a prefix of the primary's.
//!
//! One replicator instance runs a single fetcher task that requests strictly
//! increasing transaction ids, plus a pool of commit workers that drain the
//! prefetch queue concurrently. The store tolerates out-of-order application,
//! so only the fetch side is ordered.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::ReplicaConfig;
use crate::delay::{Delayer, ExponentialDelayer};
use crate::error::{Error, Result};
use crate::id::ReplicaId;
use crate::network::{read_fully, PrimaryClient, PrimaryConnector};
use crate::protocol::ExportTxRequest;
use crate::state::{CommitHint, CommitState, ReplicaState, TxId};
use crate::store::ReplicaStore;

/// Replica-side transaction replicator, one per local↔primary database pair
pub struct TxReplicator<S, C>
where
    S: ReplicaStore + 'static,
    C: PrimaryConnector + 'static,
{
    shared: Arc<Shared<S, C>>,
}

/// State shared between the caller, the fetcher task and the commit workers
struct Shared<S, C>
where
    S: ReplicaStore + 'static,
    C: PrimaryConnector + 'static,
{
    uuid: ReplicaId,
    store: Arc<S>,
    connector: C,
    config: ReplicaConfig,
    /// `<database>@<address>:<port>`, used in logs
    primary_id: String,
    delayer: Arc<dyn Delayer>,
    /// Mutated only under the supervisor lock; atomic so callers can
    /// observe the replicator without contending with a fetch in flight
    running: AtomicBool,
    /// Last transaction fetched and enqueued; 0 means "resample the store".
    /// Mutated only by the fetcher, under the supervisor lock
    last_tx: AtomicU64,
    /// Shutdown sender lives outside the supervisor lock so `stop()` can
    /// trigger cancellation while a backoff sleep still holds the lock
    shutdown: SyncMutex<Option<watch::Sender<bool>>>,
    /// Supervisor lock
    state: Mutex<Runtime<C::Client>>,
}

/// Runtime state, created on start and cleared on stop
struct Runtime<Cl> {
    client: Option<Cl>,
    consecutive_failures: u32,
    /// Handoff queue sender; dropping it closes the queue
    queue: Option<mpsc::Sender<Vec<u8>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<Cl> Runtime<Cl> {
    fn new() -> Self {
        Self {
            client: None,
            consecutive_failures: 0,
            queue: None,
            tasks: Vec::new(),
        }
    }
}

/// Cancellation handle derived from the replicator's shutdown channel
struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// An already-triggered handle
    fn finished() -> Self {
        let (tx, rx) = watch::channel(true);
        drop(tx);
        Self { rx }
    }

    /// Resolve once shutdown is signalled or the replicator is dropped
    async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Run a future, bailing out with `Stopped` when shutdown wins the race
    async fn guard<F: std::future::Future>(&mut self, fut: F) -> Result<F::Output> {
        tokio::select! {
            _ = self.triggered() => Err(Error::Stopped),
            output = fut => Ok(output),
        }
    }
}

impl<S, C> TxReplicator<S, C>
where
    S: ReplicaStore + 'static,
    C: PrimaryConnector + 'static,
{
    /// Create a new replicator with the default exponential backoff
    pub fn new(uuid: ReplicaId, store: Arc<S>, connector: C, config: ReplicaConfig) -> Result<Self> {
        let delayer: Arc<dyn Delayer> = Arc::new(ExponentialDelayer::from(&config.backoff));
        Self::with_delayer(uuid, store, connector, config, delayer)
    }

    /// Create a new replicator with a custom backoff strategy
    pub fn with_delayer(
        uuid: ReplicaId,
        store: Arc<S>,
        connector: C,
        config: ReplicaConfig,
        delayer: Arc<dyn Delayer>,
    ) -> Result<Self> {
        config.validate()?;

        let primary_id = config.primary_id();

        Ok(Self {
            shared: Arc::new(Shared {
                uuid,
                store,
                connector,
                config,
                primary_id,
                delayer,
                running: AtomicBool::new(false),
                last_tx: AtomicU64::new(0),
                shutdown: SyncMutex::new(None),
                state: Mutex::new(Runtime::new()),
            }),
        })
    }

    /// Identity of this replicator instance
    pub fn uuid(&self) -> ReplicaId {
        self.shared.uuid
    }

    /// Identifier of the primary database this replicator pulls from
    pub fn primary_id(&self) -> &str {
        &self.shared.primary_id
    }

    /// Whether the replicator is currently running
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Last transaction fetched and handed to the commit workers
    pub fn last_fetched_tx(&self) -> TxId {
        self.shared.last_tx.load(Ordering::SeqCst)
    }

    /// Start replication: spawn the fetcher task and the commit workers.
    ///
    /// Restart after a stop is permitted and resumes from the store's
    /// current precommitted state.
    pub async fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;

        if shared.running.load(Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        tracing::info!(
            "Initializing replication from '{}' to '{}'...",
            shared.primary_id,
            shared.store.name()
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel(shared.config.replication.prefetch_tx_buffer);

        *shared.shutdown.lock() = Some(shutdown_tx);
        shared.running.store(true, Ordering::SeqCst);
        shared.last_tx.store(0, Ordering::SeqCst);
        state.client = None;
        state.consecutive_failures = 0;
        state.queue = Some(queue_tx);

        let fetcher = Arc::clone(shared);
        let cancel = Shutdown::new(shutdown_rx.clone());
        state.tasks.push(tokio::spawn(async move {
            fetcher.fetch_loop(cancel).await;
        }));

        let queue_rx = Arc::new(Mutex::new(queue_rx));
        for _ in 0..shared.config.replication.commit_concurrency {
            let worker = Arc::clone(shared);
            let queue_rx = Arc::clone(&queue_rx);
            let cancel = Shutdown::new(shutdown_rx.clone());
            state.tasks.push(tokio::spawn(async move {
                worker.apply_loop(queue_rx, cancel).await;
            }));
        }

        tracing::info!(
            "Replication from '{}' to '{}' successfully initialized",
            shared.primary_id,
            shared.store.name()
        );

        Ok(())
    }

    /// Stop replication: cancel all waits, close the handoff queue, release
    /// the session and wait for the workers to exit. Idempotent by effect.
    pub async fn stop(&self) -> Result<()> {
        self.shared.stop(true).await
    }
}

impl<S, C> Shared<S, C>
where
    S: ReplicaStore + 'static,
    C: PrimaryConnector + 'static,
{
    async fn stop(&self, join_workers: bool) -> Result<()> {
        // Trigger cancellation before taking the supervisor lock: the lock
        // may be held across a network wait or a backoff sleep, and both
        // unblock only once the shutdown channel flips
        let mut cancel = {
            let shutdown = self.shutdown.lock();
            match shutdown.as_ref() {
                Some(tx) => {
                    let _ = tx.send(true);
                    Shutdown::new(tx.subscribe())
                }
                None => Shutdown::finished(),
            }
        };

        let mut state = self.state.lock().await;

        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::AlreadyStopped);
        }

        tracing::info!("Stopping replication of database '{}'...", self.store.name());

        // Closing the queue lets the commit workers drain and exit
        state.queue = None;

        self.disconnect_session(&mut state, &mut cancel).await;

        self.running.store(false, Ordering::SeqCst);
        let tasks = std::mem::take(&mut state.tasks);
        drop(state);

        *self.shutdown.lock() = None;

        if join_workers {
            for task in tasks {
                let _ = task.await;
            }
        }

        tracing::info!(
            "Replication of database '{}' successfully stopped",
            self.store.name()
        );

        Ok(())
    }

    /// Single-producer fetch loop; exactly one runs per replicator
    async fn fetch_loop(self: Arc<Self>, mut cancel: Shutdown) {
        loop {
            match self.fetch_next_tx(&mut cancel).await {
                Ok(()) => {
                    self.state.lock().await.consecutive_failures = 0;
                }
                Err(err) if err.is_stopped() => return,
                Err(Error::ReplicaDiverged) => {
                    // Divergence stops the whole replicator; joining our own
                    // task from here would never complete
                    let _ = self.stop(false).await;
                    return;
                }
                Err(err) => {
                    if self.handle_error(err, &mut cancel).await {
                        return;
                    }
                }
            }
        }
    }

    /// One fetch iteration, run entirely under the supervisor lock
    async fn fetch_next_tx(&self, cancel: &mut Shutdown) -> Result<()> {
        let mut state = self.state.lock().await;

        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::AlreadyStopped);
        }

        if state.client.is_none() {
            state.client = Some(cancel.guard(self.connect()).await??);
        }

        let commit_state = cancel.guard(self.store.current_state()).await??;
        let sync_enabled = self.store.is_sync_replication_enabled();

        if self.last_tx.load(Ordering::SeqCst) == 0 {
            // Resume from the furthest precommitted position; committed
            // ground is never refetched
            self.last_tx.store(commit_state.precommitted_tx_id, Ordering::SeqCst);
        }

        let next_tx = self.last_tx.load(Ordering::SeqCst) + 1;

        let replica_state = sync_enabled.then(|| ReplicaState::new(self.uuid, &commit_state));

        let request = ExportTxRequest {
            tx: next_tx,
            replica_state,
            allow_precommitted: sync_enabled,
        };

        let (payload, hint) = {
            let client = match state.client.as_mut() {
                Some(client) => client,
                None => return Err(Error::AlreadyStopped),
            };

            let mut stream = match cancel.guard(client.export_tx(request)).await? {
                Ok(stream) => stream,
                Err(err) => {
                    return Err(self.classify_export_error(&commit_state, err, cancel).await)
                }
            };

            let payload = match cancel.guard(read_fully(stream.as_mut())).await? {
                Ok(payload) => payload,
                Err(err) => {
                    return Err(self.classify_export_error(&commit_state, err, cancel).await)
                }
            };

            let hint = if sync_enabled {
                let trailer = stream.trailer().ok_or(Error::PrimaryNotSync)?;
                Some(CommitHint::from_trailer(trailer)?)
            } else {
                None
            };

            (payload, hint)
        };

        if let Some(hint) = hint {
            if hint.tx_id > 0 {
                match cancel.guard(self.store.allow_commit_up_to(hint.tx_id, hint.alh)).await? {
                    Ok(()) => {}
                    Err(Error::CommitStateDiverged) => {
                        tracing::error!(
                            "Replica commit state at '{}' diverged from primary's",
                            self.store.name()
                        );
                        return Err(Error::ReplicaDiverged);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        if !payload.is_empty() {
            // An empty payload means the primary only shared its commit
            // state; nothing to enqueue and the fetch position stays put
            let queue = match state.queue.as_ref() {
                Some(queue) => queue,
                None => return Err(Error::AlreadyStopped),
            };

            if cancel.guard(queue.send(payload)).await?.is_err() {
                return Err(Error::Stopped);
            }

            self.last_tx.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Map export errors onto the replicator taxonomy, running the
    /// precommit-discard recovery when it is allowed
    async fn classify_export_error(
        &self,
        commit_state: &CommitState,
        err: Error,
        cancel: &mut Shutdown,
    ) -> Error {
        match err {
            Error::CommitStateDiverged => {
                tracing::error!(
                    "Replica commit state at '{}' diverged from primary's",
                    self.store.name()
                );
                Error::ReplicaDiverged
            }
            Error::PrecommitStateDiverged => {
                if !self.config.replication.allow_tx_discarding {
                    tracing::error!(
                        "Replica precommit state at '{}' diverged from primary's",
                        self.store.name()
                    );
                    return Error::ReplicaDiverged;
                }

                tracing::info!(
                    "Discarding precommitted txs since {} from '{}'...",
                    commit_state.tx_id + 1,
                    self.store.name()
                );

                let discarded = cancel
                    .guard(self.store.discard_precommitted_txs_since(commit_state.tx_id + 1))
                    .await;
                match discarded {
                    Ok(Ok(())) => {}
                    Ok(Err(discard_err)) => return discard_err,
                    Err(stopped) => return stopped,
                }

                // The next iteration resamples the store, whose precommitted
                // position the discard just rewound to the committed one
                self.last_tx.store(0, Ordering::SeqCst);

                tracing::info!(
                    "Precommitted txs successfully discarded from '{}'",
                    self.store.name()
                );

                Error::PrecommitStateDiverged
            }
            other => other,
        }
    }

    /// Supervisor error handling: log, back off, force a disconnect after
    /// repeated failures. Returns true when the fetch loop must terminate.
    async fn handle_error(&self, err: Error, cancel: &mut Shutdown) -> bool {
        let mut state = self.state.lock().await;

        state.consecutive_failures += 1;

        tracing::warn!(
            "Replication error on database '{}' from '{}' ({} consecutive failures): {}",
            self.store.name(),
            self.primary_id,
            state.consecutive_failures,
            err
        );

        let delay = self.delayer.delay_after(state.consecutive_failures);
        if cancel.guard(tokio::time::sleep(delay)).await.is_err() {
            return true;
        }

        let threshold = self.config.replication.disconnect_after_failures;
        if threshold > 0 && state.consecutive_failures >= threshold {
            // The session may be stale or wedged; the next iteration
            // re-connects and re-authenticates
            self.disconnect_session(&mut state, cancel).await;
        }

        false
    }

    /// Establish an authenticated session against the primary
    async fn connect(&self) -> Result<C::Client> {
        let primary = &self.config.primary;

        tracing::info!(
            "Connecting to '{}:{}' for database '{}'...",
            primary.address,
            primary.port,
            self.store.name()
        );

        let mut client = self.connector.connect(&primary.address, primary.port).await?;
        client.login(&primary.username, &primary.password).await?;
        client.use_database(&primary.database).await?;

        tracing::info!(
            "Connection to '{}:{}' for database '{}' successfully established",
            primary.address,
            primary.port,
            self.store.name()
        );

        Ok(client)
    }

    /// Log out and drop the session; logout failures are only logged
    async fn disconnect_session(&self, state: &mut Runtime<C::Client>, cancel: &mut Shutdown) {
        let Some(mut client) = state.client.take() else {
            return;
        };

        tracing::info!(
            "Disconnecting from '{}' for database '{}'...",
            self.primary_id,
            self.store.name()
        );

        match cancel.guard(client.logout()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::debug!("Logout from '{}' failed: {}", self.primary_id, err);
            }
            // Shutting down: drop the session without a goodbye
            Err(_) => {}
        }

        client.disconnect().await;

        tracing::info!(
            "Disconnected from '{}' for database '{}'",
            self.primary_id,
            self.store.name()
        );
    }

    /// Commit worker loop; `commit_concurrency` of these share the queue
    async fn apply_loop(
        self: Arc<Self>,
        queue: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
        mut cancel: Shutdown,
    ) {
        loop {
            let exported_tx = queue.lock().await.recv().await;

            let Some(exported_tx) = exported_tx else {
                // Queue closed and drained
                return;
            };

            if !self.apply_tx(&exported_tx, &mut cancel).await {
                return;
            }
        }
    }

    /// Apply one exported transaction, retrying as many times as necessary.
    /// Returns false when the worker must exit.
    async fn apply_tx(&self, exported_tx: &[u8], cancel: &mut Shutdown) -> bool {
        // Worker-local counter: apply failures are independent of fetch
        // health and must not fold into the supervisor counter
        let mut consecutive_failures = 0u32;

        loop {
            let result = match cancel.guard(self.store.replicate_tx(exported_tx)).await {
                Ok(result) => result,
                Err(_) => return false,
            };

            match result {
                Ok(_) => return true,
                Err(err) if err.is_stopped() => return false,
                // The transaction landed through another worker or an
                // earlier run: idempotent success
                Err(Error::TxAlreadyCommitted) => return true,
                Err(err) => {
                    tracing::info!(
                        "Failed to replicate transaction from '{}' to '{}': {}",
                        self.primary_id,
                        self.store.name(),
                        err
                    );

                    consecutive_failures += 1;

                    let delay = self.delayer.delay_after(consecutive_failures);
                    if cancel.guard(tokio::time::sleep(delay)).await.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffConfig, PrimaryConfig, ReplicationConfig};
    use crate::delay::FixedDelayer;
    use crate::network::TxStream;
    use crate::protocol::Trailer;
    use crate::state::{Alh, TRAILER_MAY_COMMIT_ALH, TRAILER_MAY_COMMIT_TX_ID};
    use async_trait::async_trait;
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    // ---------- mock store ----------

    struct MockStore {
        name: String,
        sync_enabled: bool,
        commit_state: SyncMutex<CommitState>,
        replicate_attempts: AtomicU32,
        replicate_failures_left: AtomicU32,
        replicated: SyncMutex<Vec<Vec<u8>>>,
        seen: SyncMutex<HashSet<Vec<u8>>>,
        allow_commit_calls: SyncMutex<Vec<(TxId, Alh)>>,
        allow_commit_diverges: AtomicBool,
        discard_calls: SyncMutex<Vec<TxId>>,
    }

    impl MockStore {
        fn new(name: &str, sync_enabled: bool, commit_state: CommitState) -> Self {
            Self {
                name: name.to_string(),
                sync_enabled,
                commit_state: SyncMutex::new(commit_state),
                replicate_attempts: AtomicU32::new(0),
                replicate_failures_left: AtomicU32::new(0),
                replicated: SyncMutex::new(Vec::new()),
                seen: SyncMutex::new(HashSet::new()),
                allow_commit_calls: SyncMutex::new(Vec::new()),
                allow_commit_diverges: AtomicBool::new(false),
                discard_calls: SyncMutex::new(Vec::new()),
            }
        }

        fn set_commit_state(&self, commit_state: CommitState) {
            *self.commit_state.lock() = commit_state;
        }

        fn replicated_sorted(&self) -> Vec<Vec<u8>> {
            let mut replicated = self.replicated.lock().clone();
            replicated.sort();
            replicated
        }
    }

    #[async_trait]
    impl ReplicaStore for MockStore {
        fn name(&self) -> &str {
            &self.name
        }

        async fn current_state(&self) -> Result<CommitState> {
            Ok(*self.commit_state.lock())
        }

        fn is_sync_replication_enabled(&self) -> bool {
            self.sync_enabled
        }

        async fn replicate_tx(&self, exported_tx: &[u8]) -> Result<TxId> {
            self.replicate_attempts.fetch_add(1, Ordering::SeqCst);

            if self.replicate_failures_left.load(Ordering::SeqCst) > 0 {
                self.replicate_failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Storage("transient apply failure".into()));
            }

            let mut seen = self.seen.lock();
            if !seen.insert(exported_tx.to_vec()) {
                return Err(Error::TxAlreadyCommitted);
            }

            let mut replicated = self.replicated.lock();
            replicated.push(exported_tx.to_vec());
            Ok(replicated.len() as TxId)
        }

        async fn allow_commit_up_to(&self, tx_id: TxId, alh: Alh) -> Result<()> {
            if self.allow_commit_diverges.load(Ordering::SeqCst) {
                return Err(Error::CommitStateDiverged);
            }
            self.allow_commit_calls.lock().push((tx_id, alh));
            Ok(())
        }

        async fn discard_precommitted_txs_since(&self, tx_id: TxId) -> Result<()> {
            self.discard_calls.lock().push(tx_id);

            // Rewind the precommitted position to the committed one
            let mut commit_state = self.commit_state.lock();
            commit_state.precommitted_tx_id = commit_state.tx_id;
            commit_state.precommitted_tx_hash = commit_state.tx_hash;
            Ok(())
        }
    }

    // ---------- mock primary ----------

    enum ExportOutcome {
        /// Payload chunks plus an empty trailer
        Tx(Vec<u8>),
        /// Payload chunks plus a commit hint trailer
        TxWithHint(Vec<u8>, TxId, Alh),
        /// No payload, commit hint trailer only
        HintOnly(TxId, Alh),
        /// No payload and a trailer without the commit hint keys
        EmptyTrailer,
        Fail(Error),
        /// Block until cancelled
        Hang,
    }

    #[derive(Default)]
    struct MockScript {
        outcomes: SyncMutex<VecDeque<ExportOutcome>>,
        connects: AtomicU32,
        logins: AtomicU32,
        use_databases: AtomicU32,
        logouts: AtomicU32,
        disconnects: AtomicU32,
        exports: SyncMutex<Vec<ExportTxRequest>>,
    }

    impl MockScript {
        fn push(&self, outcome: ExportOutcome) {
            self.outcomes.lock().push_back(outcome);
        }

        fn export_txids(&self) -> Vec<TxId> {
            self.exports.lock().iter().map(|request| request.tx).collect()
        }
    }

    struct MockConnector {
        script: Arc<MockScript>,
    }

    #[async_trait]
    impl PrimaryConnector for MockConnector {
        type Client = MockClient;

        async fn connect(&self, _address: &str, _port: u16) -> Result<MockClient> {
            self.script.connects.fetch_add(1, Ordering::SeqCst);
            Ok(MockClient {
                script: Arc::clone(&self.script),
            })
        }
    }

    struct MockClient {
        script: Arc<MockScript>,
    }

    #[async_trait]
    impl PrimaryClient for MockClient {
        async fn login(&mut self, _username: &str, _password: &str) -> Result<()> {
            self.script.logins.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn use_database(&mut self, _database: &str) -> Result<()> {
            self.script.use_databases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn export_tx<'a>(
            &'a mut self,
            request: ExportTxRequest,
        ) -> Result<Box<dyn TxStream + 'a>> {
            self.script.exports.lock().push(request);

            let outcome = self.script.outcomes.lock().pop_front();
            match outcome {
                // An exhausted script behaves like a primary with nothing
                // new to export
                None | Some(ExportOutcome::Hang) => std::future::pending().await,
                Some(ExportOutcome::Fail(err)) => Err(err),
                Some(ExportOutcome::Tx(payload)) => {
                    Ok(Box::new(MockTxStream::new(payload, Trailer::new())))
                }
                Some(ExportOutcome::TxWithHint(payload, tx_id, alh)) => {
                    Ok(Box::new(MockTxStream::new(payload, hint_trailer(tx_id, alh))))
                }
                Some(ExportOutcome::HintOnly(tx_id, alh)) => {
                    Ok(Box::new(MockTxStream::new(Vec::new(), hint_trailer(tx_id, alh))))
                }
                Some(ExportOutcome::EmptyTrailer) => {
                    Ok(Box::new(MockTxStream::new(Vec::new(), Trailer::new())))
                }
            }
        }

        async fn logout(&mut self) -> Result<()> {
            self.script.logouts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.script.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct MockTxStream {
        chunks: VecDeque<Vec<u8>>,
        trailer: Trailer,
        done: bool,
    }

    impl MockTxStream {
        fn new(payload: Vec<u8>, trailer: Trailer) -> Self {
            // Split the payload so reassembly is exercised
            let mut chunks = VecDeque::new();
            if !payload.is_empty() {
                let mid = payload.len() / 2;
                if mid > 0 {
                    chunks.push_back(payload[..mid].to_vec());
                }
                chunks.push_back(payload[mid..].to_vec());
            }

            Self {
                chunks,
                trailer,
                done: false,
            }
        }
    }

    #[async_trait]
    impl TxStream for MockTxStream {
        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
            match self.chunks.pop_front() {
                Some(chunk) => Ok(Some(chunk)),
                None => {
                    self.done = true;
                    Ok(None)
                }
            }
        }

        fn trailer(&self) -> Option<&Trailer> {
            self.done.then_some(&self.trailer)
        }
    }

    // ---------- helpers ----------

    fn hint_trailer(tx_id: TxId, alh: Alh) -> Trailer {
        let mut trailer = Trailer::new();
        trailer.insert(TRAILER_MAY_COMMIT_TX_ID, tx_id.to_be_bytes().to_vec());
        trailer.insert(TRAILER_MAY_COMMIT_ALH, alh.to_vec());
        trailer
    }

    fn commit_state(tx_id: TxId, precommitted_tx_id: TxId) -> CommitState {
        CommitState {
            tx_id,
            tx_hash: [0xaa; 32],
            precommitted_tx_id,
            precommitted_tx_hash: [0xbb; 32],
        }
    }

    fn test_config() -> ReplicaConfig {
        ReplicaConfig {
            primary: PrimaryConfig {
                database: "defaultdb".into(),
                address: "127.0.0.1".into(),
                port: 3322,
                username: "replicator".into(),
                password: "secret".into(),
                connect_timeout_secs: 1,
            },
            replication: ReplicationConfig {
                stream_chunk_size: 4096,
                prefetch_tx_buffer: 16,
                commit_concurrency: 2,
                allow_tx_discarding: false,
                disconnect_after_failures: 3,
            },
            backoff: BackoffConfig {
                base_delay_ms: 1,
                max_delay_ms: 10,
            },
        }
    }

    fn replicator(
        store: Arc<MockStore>,
        script: Arc<MockScript>,
        config: ReplicaConfig,
    ) -> TxReplicator<MockStore, MockConnector> {
        TxReplicator::with_delayer(
            ReplicaId::generate(),
            store,
            MockConnector { script },
            config,
            Arc::new(FixedDelayer(Duration::ZERO)),
        )
        .unwrap()
    }

    async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            if Instant::now() > deadline {
                panic!("timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_for_stopped(replicator: &TxReplicator<MockStore, MockConnector>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while replicator.is_running() {
            if Instant::now() > deadline {
                panic!("timed out waiting for replicator to stop");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    // ---------- scenarios ----------

    #[tokio::test]
    async fn test_async_happy_path() {
        let store = Arc::new(MockStore::new("replicadb", false, commit_state(4, 4)));
        let script = Arc::new(MockScript::default());
        script.push(ExportOutcome::Tx(b"tx-5".to_vec()));
        script.push(ExportOutcome::Tx(b"tx-6".to_vec()));
        script.push(ExportOutcome::Tx(b"tx-7".to_vec()));

        let replicator = replicator(Arc::clone(&store), Arc::clone(&script), test_config());
        replicator.start().await.unwrap();

        {
            let store = Arc::clone(&store);
            wait_for("three applied txs", move || store.replicated.lock().len() == 3).await;
        }

        // Strictly increasing ids from initial precommitted + 1, no gaps;
        // a fourth in-flight request for tx 8 may already be pending
        let txids = script.export_txids();
        assert_eq!(&txids[..3], &[5, 6, 7]);
        assert_eq!(replicator.last_fetched_tx(), 7);

        // Async mode uploads no replica state and forbids precommitted txs
        for request in script.exports.lock().iter() {
            assert!(request.replica_state.is_none());
            assert!(!request.allow_precommitted);
        }

        assert_eq!(
            store.replicated_sorted(),
            vec![b"tx-5".to_vec(), b"tx-6".to_vec(), b"tx-7".to_vec()]
        );

        replicator.stop().await.unwrap();
        assert!(!replicator.is_running());
        assert!(matches!(replicator.stop().await, Err(Error::AlreadyStopped)));
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let store = Arc::new(MockStore::new("replicadb", false, commit_state(0, 0)));
        let script = Arc::new(MockScript::default());

        let replicator = replicator(store, script, test_config());
        replicator.start().await.unwrap();

        assert!(matches!(replicator.start().await, Err(Error::AlreadyRunning)));

        replicator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let store = Arc::new(MockStore::new("replicadb", false, commit_state(0, 0)));
        let script = Arc::new(MockScript::default());

        let replicator = replicator(store, script, test_config());
        assert!(matches!(replicator.stop().await, Err(Error::AlreadyStopped)));
    }

    #[tokio::test]
    async fn test_empty_payload_with_commit_hint() {
        let store = Arc::new(MockStore::new("replicadb", true, commit_state(4, 4)));
        let script = Arc::new(MockScript::default());
        script.push(ExportOutcome::HintOnly(10, [9u8; 32]));

        let replicator = replicator(Arc::clone(&store), Arc::clone(&script), test_config());
        replicator.start().await.unwrap();

        {
            let store = Arc::clone(&store);
            wait_for("commit hint relayed", move || {
                !store.allow_commit_calls.lock().is_empty()
            })
            .await;
        }

        // The hint is relayed verbatim and the fetch position does not move
        assert_eq!(store.allow_commit_calls.lock()[0], (10, [9u8; 32]));
        assert_eq!(replicator.last_fetched_tx(), 4);

        // Sync mode uploads the replica state built from the sampled commit
        // state and allows precommitted exports
        let request = script.exports.lock()[0].clone();
        assert!(request.allow_precommitted);
        let replica_state = request.replica_state.unwrap();
        assert_eq!(replica_state.uuid, replicator.uuid().to_string());
        assert_eq!(replica_state.committed_tx_id, 4);
        assert_eq!(replica_state.precommitted_tx_id, 4);

        replicator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_commit_hint_is_ignored() {
        let store = Arc::new(MockStore::new("replicadb", true, commit_state(4, 4)));
        let script = Arc::new(MockScript::default());
        script.push(ExportOutcome::HintOnly(0, [0u8; 32]));

        let replicator = replicator(Arc::clone(&store), Arc::clone(&script), test_config());
        replicator.start().await.unwrap();

        {
            let script = Arc::clone(&script);
            wait_for("second fetch attempt", move || script.exports.lock().len() >= 2).await;
        }

        assert!(store.allow_commit_calls.lock().is_empty());
        assert_eq!(replicator.last_fetched_tx(), 4);

        replicator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_committed_divergence_stops_replicator() {
        let store = Arc::new(MockStore::new("replicadb", false, commit_state(4, 4)));
        let script = Arc::new(MockScript::default());
        script.push(ExportOutcome::Fail(Error::CommitStateDiverged));

        let replicator = replicator(store, Arc::clone(&script), test_config());
        replicator.start().await.unwrap();

        wait_for_stopped(&replicator).await;

        // No further RPCs after the fatal divergence
        assert_eq!(script.exports.lock().len(), 1);
        assert!(script.disconnects.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_precommit_divergence_without_discarding_is_fatal() {
        let store = Arc::new(MockStore::new("replicadb", true, commit_state(4, 6)));
        let script = Arc::new(MockScript::default());
        script.push(ExportOutcome::Fail(Error::PrecommitStateDiverged));

        let replicator = replicator(Arc::clone(&store), Arc::clone(&script), test_config());
        replicator.start().await.unwrap();

        wait_for_stopped(&replicator).await;

        assert!(store.discard_calls.lock().is_empty());
        assert_eq!(script.exports.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_precommit_divergence_with_discarding() {
        let store = Arc::new(MockStore::new("replicadb", true, commit_state(4, 6)));
        let script = Arc::new(MockScript::default());
        script.push(ExportOutcome::Fail(Error::PrecommitStateDiverged));
        script.push(ExportOutcome::TxWithHint(b"tx-5".to_vec(), 0, [0u8; 32]));

        let mut config = test_config();
        config.replication.allow_tx_discarding = true;

        let replicator = replicator(Arc::clone(&store), Arc::clone(&script), config);
        replicator.start().await.unwrap();

        {
            let store = Arc::clone(&store);
            wait_for("discarded tx refetched", move || {
                store.replicated.lock().len() == 1
            })
            .await;
        }

        // Discard from the committed position + 1, then restart the fetch
        // from the rewound precommitted state
        assert_eq!(*store.discard_calls.lock(), vec![5]);
        let txids = script.export_txids();
        assert_eq!(&txids[..2], &[7, 5]);
        assert!(replicator.is_running());

        replicator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_storm_forces_disconnect() {
        let store = Arc::new(MockStore::new("replicadb", false, commit_state(4, 4)));
        let script = Arc::new(MockScript::default());
        for _ in 0..5 {
            script.push(ExportOutcome::Fail(Error::Network("primary unreachable".into())));
        }
        script.push(ExportOutcome::Tx(b"tx-5".to_vec()));

        let replicator = replicator(Arc::clone(&store), Arc::clone(&script), test_config());
        replicator.start().await.unwrap();

        {
            let store = Arc::clone(&store);
            wait_for("tx applied after the storm", move || {
                store.replicated.lock().len() == 1
            })
            .await;
        }

        // Each failed attempt re-requested the same tx; nothing advanced
        let txids = script.export_txids();
        assert_eq!(&txids[..6], &[5, 5, 5, 5, 5, 5]);

        // Disconnect after the 3rd, 4th and 5th consecutive failures, and a
        // full re-authentication on every reconnect
        assert_eq!(script.disconnects.load(Ordering::SeqCst), 3);
        assert_eq!(script.connects.load(Ordering::SeqCst), 4);
        assert_eq!(script.logins.load(Ordering::SeqCst), 4);
        assert_eq!(script.use_databases.load(Ordering::SeqCst), 4);

        assert!(replicator.is_running());
        replicator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_fetch() {
        let store = Arc::new(MockStore::new("replicadb", false, commit_state(4, 4)));
        let script = Arc::new(MockScript::default());
        script.push(ExportOutcome::Hang);

        let replicator = replicator(store, Arc::clone(&script), test_config());
        replicator.start().await.unwrap();

        {
            let script = Arc::clone(&script);
            wait_for("fetch in flight", move || !script.exports.lock().is_empty()).await;
        }

        let stopped = tokio::time::timeout(Duration::from_secs(1), replicator.stop()).await;
        assert!(stopped.expect("stop must not block on the pending fetch").is_ok());

        assert!(!replicator.is_running());
        assert_eq!(script.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_trailer_keys_is_retryable() {
        let store = Arc::new(MockStore::new("replicadb", true, commit_state(4, 4)));
        let script = Arc::new(MockScript::default());
        script.push(ExportOutcome::EmptyTrailer);
        script.push(ExportOutcome::EmptyTrailer);
        script.push(ExportOutcome::HintOnly(10, [1u8; 32]));

        let replicator = replicator(Arc::clone(&store), Arc::clone(&script), test_config());
        replicator.start().await.unwrap();

        {
            let store = Arc::clone(&store);
            wait_for("hint relayed after retries", move || {
                !store.allow_commit_calls.lock().is_empty()
            })
            .await;
        }

        assert!(script.exports.lock().len() >= 3);
        assert!(replicator.is_running());

        replicator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_hint_divergence_is_fatal() {
        let store = Arc::new(MockStore::new("replicadb", true, commit_state(4, 4)));
        store.allow_commit_diverges.store(true, Ordering::SeqCst);

        let script = Arc::new(MockScript::default());
        script.push(ExportOutcome::HintOnly(10, [1u8; 32]));

        let replicator = replicator(store, script, test_config());
        replicator.start().await.unwrap();

        wait_for_stopped(&replicator).await;
    }

    #[tokio::test]
    async fn test_apply_retries_until_success() {
        let store = Arc::new(MockStore::new("replicadb", false, commit_state(4, 4)));
        store.replicate_failures_left.store(2, Ordering::SeqCst);

        let script = Arc::new(MockScript::default());
        script.push(ExportOutcome::Tx(b"tx-5".to_vec()));

        let replicator = replicator(Arc::clone(&store), script, test_config());
        replicator.start().await.unwrap();

        {
            let store = Arc::clone(&store);
            wait_for("apply retried to success", move || {
                store.replicated.lock().len() == 1
            })
            .await;
        }

        assert_eq!(store.replicate_attempts.load(Ordering::SeqCst), 3);
        assert!(replicator.is_running());

        replicator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_apply_is_idempotent_success() {
        let store = Arc::new(MockStore::new("replicadb", false, commit_state(4, 4)));
        let script = Arc::new(MockScript::default());
        script.push(ExportOutcome::Tx(b"tx-5".to_vec()));
        script.push(ExportOutcome::Tx(b"tx-5".to_vec()));

        let replicator = replicator(Arc::clone(&store), Arc::clone(&script), test_config());
        replicator.start().await.unwrap();

        {
            let store = Arc::clone(&store);
            wait_for("both copies handled", move || {
                store.replicated.lock().len() == 1
                    && store.replicate_attempts.load(Ordering::SeqCst) >= 2
            })
            .await;
        }

        // Exactly one net state change; the duplicate resolved without
        // retrying
        assert_eq!(store.replicated.lock().len(), 1);
        assert_eq!(store.replicate_attempts.load(Ordering::SeqCst), 2);
        assert!(replicator.is_running());

        replicator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_resumes_from_precommitted_state() {
        let store = Arc::new(MockStore::new("replicadb", false, commit_state(4, 4)));
        let script = Arc::new(MockScript::default());
        script.push(ExportOutcome::Tx(b"tx-5".to_vec()));

        let replicator = replicator(Arc::clone(&store), Arc::clone(&script), test_config());
        replicator.start().await.unwrap();

        {
            let store = Arc::clone(&store);
            wait_for("first run applied", move || store.replicated.lock().len() == 1).await;
        }
        replicator.stop().await.unwrap();

        // The store moved forward while the replicator was down
        store.set_commit_state(commit_state(5, 5));
        script.push(ExportOutcome::Tx(b"tx-6".to_vec()));

        replicator.start().await.unwrap();
        {
            let store = Arc::clone(&store);
            wait_for("second run applied", move || store.replicated.lock().len() == 2).await;
        }

        // tx 5 was never refetched: the second run resumed at 6
        let txids = script.export_txids();
        assert_eq!(txids.iter().filter(|tx| **tx == 5).count(), 1);
        assert!(txids.contains(&6));
        assert_eq!(
            store.replicated_sorted(),
            vec![b"tx-5".to_vec(), b"tx-6".to_vec()]
        );

        replicator.stop().await.unwrap();
    }
}

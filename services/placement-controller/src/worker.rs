//! Reconcile trigger worker.
//!
//! Feeds request keys into the [`PlacementReconciler`] from four sources:
//! store change notifications, a periodic resync of every key, explicit
//! [`WorkerHandle::enqueue`] calls and delayed requeues. Reconciles for the
//! same key never overlap; different keys run in parallel up to
//! `max_concurrent`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use placement_reconcile::{
    BackoffPolicy, KeyLocks, RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RESYNC_INTERVAL,
    DEFAULT_RETRY_WINDOW,
};
use placement_refs::RequestKey;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::PlacementReconciler;
use crate::store::PlacementStore;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often every stored key is re-enqueued.
    pub resync_interval: Duration,

    /// Upper bound on reconciles running at once.
    pub max_concurrent: usize,

    /// Delay schedule for failed reconciles.
    pub backoff: BackoffPolicy,

    /// Failures inside `retry_window` after which a key is reported as
    /// exhausted. Exhausted keys keep retrying at the backoff ceiling.
    pub max_retries: u32,

    /// Window over which failures are counted.
    pub retry_window: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            max_concurrent: 8,
            backoff: BackoffPolicy::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_window: DEFAULT_RETRY_WINDOW,
        }
    }
}

/// Cloneable handle for enqueueing keys into a running worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    queue: mpsc::UnboundedSender<RequestKey>,
}

impl WorkerHandle {
    /// Ask for `key` to be reconciled. Returns false once the worker is gone.
    pub fn enqueue(&self, key: RequestKey) -> bool {
        self.queue.send(key).is_ok()
    }
}

/// State shared between the dispatch loop and reconcile tasks.
struct Shared {
    reconciler: Arc<PlacementReconciler>,
    locks: KeyLocks<RequestKey>,
    retries: Mutex<RetryTracker<RequestKey>>,
    /// Keys with a delayed requeue already pending.
    scheduled: Mutex<HashSet<RequestKey>>,
    permits: Arc<Semaphore>,
    backoff: BackoffPolicy,
    queue: mpsc::UnboundedSender<RequestKey>,
}

impl Shared {
    /// Re-enqueue `key` after `delay`, unless a requeue is already pending.
    fn schedule(self: &Arc<Self>, key: RequestKey, delay: Duration) {
        {
            let mut scheduled = self.scheduled.lock().unwrap_or_else(|e| e.into_inner());
            if !scheduled.insert(key.clone()) {
                debug!(key = %key, "Requeue already pending");
                return;
            }
        }

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared
                .scheduled
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
            // The worker may have stopped meanwhile.
            let _ = shared.queue.send(key);
        });
    }

    fn pending_requeues(&self) -> usize {
        self.scheduled.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn process(self: Arc<Self>, key: RequestKey) {
        let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return;
        };
        let guard = self.locks.lock(&key).await;
        let outcome = self.reconciler.reconcile(&key).await;
        drop(guard);

        match outcome {
            Ok(report) => {
                self.retries
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clear(&key);
                if let Some(delay) = report.requeue_after() {
                    debug!(
                        key = %key,
                        delay_ms = delay.as_millis() as u64,
                        action = ?report.action,
                        "Requeue requested"
                    );
                    self.schedule(key, delay);
                }
            }
            Err(e) if e.is_conflict() => {
                debug!(key = %key, error = %e, "Status write conflicted, requeueing");
                let _ = self.queue.send(key);
            }
            Err(e) => {
                let (attempt, exhausted) = {
                    let mut retries = self.retries.lock().unwrap_or_else(|e| e.into_inner());
                    let attempt = retries.record_failure(&key);
                    (attempt, retries.is_exhausted(&key))
                };
                let delay = self.backoff.delay(attempt.saturating_sub(1));
                if exhausted {
                    error!(key = %key, error = %e, attempt, "Reconcile keeps failing");
                } else {
                    warn!(
                        key = %key,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Reconcile failed, backing off"
                    );
                }
                self.schedule(key, delay);
            }
        }
    }
}

/// Runs reconciles in response to triggers until shutdown.
pub struct ReconcileWorker {
    shared: Arc<Shared>,
    store: Arc<dyn PlacementStore>,
    resync_interval: Duration,
    max_concurrent: usize,
    queue: mpsc::UnboundedReceiver<RequestKey>,
}

impl ReconcileWorker {
    pub fn new(
        reconciler: Arc<PlacementReconciler>,
        store: Arc<dyn PlacementStore>,
        config: WorkerConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let max_concurrent = config.max_concurrent.max(1);
        let shared = Shared {
            reconciler,
            locks: KeyLocks::new(),
            retries: Mutex::new(RetryTracker::new(config.max_retries, config.retry_window)),
            scheduled: Mutex::new(HashSet::new()),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            backoff: config.backoff,
            queue: tx,
        };

        Self {
            shared: Arc::new(shared),
            store,
            resync_interval: config.resync_interval,
            max_concurrent,
            queue: rx,
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            queue: self.shared.queue.clone(),
        }
    }

    /// Run until `shutdown` turns true, then wait for in-flight reconciles.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            resync_interval_secs = self.resync_interval.as_secs(),
            max_concurrent = self.max_concurrent,
            "Starting reconcile worker"
        );

        let mut changes = self.store.subscribe();
        let mut changes_open = true;
        // The first tick fires immediately and picks up existing requests.
        let mut resync = tokio::time::interval(self.resync_interval);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                Some(key) = self.queue.recv() => {
                    self.dispatch(&mut tasks, key);
                }
                change = changes.recv(), if changes_open => match change {
                    Ok(key) => self.dispatch(&mut tasks, key),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Change notifications lagged, resyncing");
                        self.resync(&mut tasks).await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Change notifications closed, relying on resync");
                        changes_open = false;
                    }
                },
                _ = resync.tick() => {
                    self.resync(&mut tasks).await;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Reconcile task panicked");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconcile worker shutting down");
                        break;
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Reconcile task panicked");
            }
        }
        info!("Reconcile worker stopped");
    }

    fn dispatch(&self, tasks: &mut JoinSet<()>, key: RequestKey) {
        tasks.spawn(Arc::clone(&self.shared).process(key));
    }

    async fn resync(&self, tasks: &mut JoinSet<()>) {
        let keys = match self.store.list_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                error!(error = %e, "Failed to list requests for resync");
                return;
            }
        };

        self.shared.locks.prune();
        self.shared
            .retries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .prune();

        debug!(
            requests = keys.len(),
            pending_requeues = self.shared.pending_requeues(),
            "Resync"
        );
        for key in keys {
            self.dispatch(tasks, key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MemoryCatalog, Target};
    use crate::decision::FirstMatch;
    use crate::engine::ReconcilerConfig;
    use crate::store::{MemoryStore, StoreError, StoreResult};
    use crate::types::{PlacementRequest, PlacementSpec, PlacementStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::broadcast;

    /// Fails the first `failures` reads.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl PlacementStore for FlakyStore {
        async fn get(&self, key: &RequestKey) -> StoreResult<PlacementRequest> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::internal("backend unavailable"));
            }
            self.inner.get(key).await
        }

        async fn update_status(
            &self,
            key: &RequestKey,
            status: &PlacementStatus,
            expected_version: u64,
        ) -> StoreResult<u64> {
            self.inner.update_status(key, status, expected_version).await
        }

        async fn apply_spec(
            &self,
            key: &RequestKey,
            spec: PlacementSpec,
        ) -> StoreResult<PlacementRequest> {
            self.inner.apply_spec(key, spec).await
        }

        async fn delete(&self, key: &RequestKey) -> StoreResult<()> {
            self.inner.delete(key).await
        }

        async fn list_keys(&self) -> StoreResult<Vec<RequestKey>> {
            self.inner.list_keys().await
        }

        fn subscribe(&self) -> broadcast::Receiver<RequestKey> {
            self.inner.subscribe()
        }
    }

    fn key() -> RequestKey {
        "team-a/web".parse().unwrap()
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            resync_interval: Duration::from_secs(3600),
            backoff: BackoffPolicy {
                base: Duration::from_millis(5),
                max: Duration::from_millis(50),
                jitter: 0.0,
            },
            ..Default::default()
        }
    }

    fn worker(store: Arc<dyn PlacementStore>) -> ReconcileWorker {
        let catalog = MemoryCatalog::new();
        catalog.upsert_target(Target::new("Cluster:fleet/a".parse().unwrap()));
        let reconciler = PlacementReconciler::new(
            store.clone(),
            Arc::new(catalog),
            Arc::new(FirstMatch::default()),
            ReconcilerConfig::default(),
        );
        ReconcileWorker::new(Arc::new(reconciler), store, config())
    }

    async fn wait_for_reset(store: &dyn PlacementStore) -> PlacementRequest {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(request) = store.get(&key()).await {
                    if request.status.observed_generation == request.generation {
                        return request;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("request was never reset")
    }

    #[tokio::test]
    async fn test_existing_request_is_picked_up_on_start() {
        let store = Arc::new(MemoryStore::new());
        store.apply_spec(&key(), PlacementSpec::default()).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(worker(store.clone()).run(shutdown_rx));

        let request = wait_for_reset(store.as_ref()).await;
        assert_eq!(request.status.candidates.len(), 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_spec_change_triggers_reconcile() {
        let store = Arc::new(MemoryStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(worker(store.clone()).run(shutdown_rx));

        // Give the worker time to subscribe before writing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.apply_spec(&key(), PlacementSpec::default()).await.unwrap();

        let request = wait_for_reset(store.as_ref()).await;
        assert_eq!(request.status.observed_generation, 1);

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_reconcile_is_retried() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(3),
        });
        store.apply_spec(&key(), PlacementSpec::default()).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = worker(store.clone());
        let shared = Arc::clone(&worker.shared);
        let running = tokio::spawn(worker.run(shutdown_rx));

        wait_for_reset(&store.inner).await;
        assert_eq!(store.failures.load(Ordering::SeqCst), 0);

        shutdown_tx.send(true).unwrap();
        running.await.unwrap();
        assert_eq!(
            shared
                .retries
                .lock()
                .unwrap()
                .attempts(&key()),
            0
        );
    }

    #[tokio::test]
    async fn test_delayed_requeues_are_deduplicated() {
        let store = Arc::new(MemoryStore::new());
        let worker = worker(store);
        let mut queue = worker.queue;

        worker.shared.schedule(key(), Duration::from_millis(20));
        worker.shared.schedule(key(), Duration::from_millis(20));
        assert_eq!(worker.shared.pending_requeues(), 1);

        let requeued = tokio::time::timeout(Duration::from_secs(1), queue.recv())
            .await
            .unwrap();
        assert_eq!(requeued, Some(key()));
        assert_eq!(worker.shared.pending_requeues(), 0);
        assert!(queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handle_enqueues() {
        let store = Arc::new(MemoryStore::new());
        let mut worker = worker(store);
        let handle = worker.handle();

        assert!(handle.enqueue(key()));
        assert_eq!(worker.queue.recv().await, Some(key()));
    }
}

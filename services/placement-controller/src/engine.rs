//! Placement reconciler.
//!
//! Each call to [`PlacementReconciler::reconcile`] does exactly one of:
//! - nothing (request gone, or still waiting on advisors)
//! - reset the decision state because the spec or candidates changed
//! - hand complete recommendations to the decision maker
//!
//! A reset always ends the call. Recommendations are only evaluated on a
//! later call, after advisors have seen the new candidates.
//!
//! Callers must not run two reconciles for the same key at once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use placement_reconcile::{
    ReconcileError, ReconcileResult, DEFAULT_ADVISOR_POLL_INTERVAL,
    DEFAULT_GENERATION_RETRY_INTERVAL,
};
use placement_refs::{AdvisorName, RequestKey};
use tracing::{debug, info, instrument, warn};

use crate::catalog::TargetCatalog;
use crate::decision::DecisionMaker;
use crate::detector::{self, Staleness};
use crate::generator::{CandidateGenerator, GenerationError};
use crate::store::{PlacementStore, StoreError};
use crate::types::PlacementRequest;

/// Reconciler timing configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Delay before re-checking a request that has no decision yet.
    pub advisor_poll_interval: Duration,

    /// Delay before retrying a request whose candidates could not be fully
    /// generated.
    pub generation_retry_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            advisor_poll_interval: DEFAULT_ADVISOR_POLL_INTERVAL,
            generation_retry_interval: DEFAULT_GENERATION_RETRY_INTERVAL,
        }
    }
}

/// What a reconcile did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// The request no longer exists.
    NotFound,

    /// Decision state was reset for a new generation or candidate set.
    Reset { generation: i64, candidates: usize },

    /// Some advisors have not reported yet.
    Waiting { missing: Vec<AdvisorName> },

    /// The decision maker evaluated complete recommendations.
    Continued { mutated: bool, decided: bool },

    /// Stored state is ahead of the request's generation; left untouched.
    Ignored { observed_generation: i64, generation: i64 },
}

/// Report of a single reconcile.
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub action: ReconcileAction,
    pub result: ReconcileResult,
    pub generation_error: Option<GenerationError>,
}

impl ReconcileReport {
    pub fn requeue_after(&self) -> Option<Duration> {
        self.result.requeue_after
    }
}

/// Drives one request's decision state toward a placement decision.
pub struct PlacementReconciler {
    store: Arc<dyn PlacementStore>,
    generator: CandidateGenerator,
    decision_maker: Arc<dyn DecisionMaker>,
    config: ReconcilerConfig,
}

impl PlacementReconciler {
    pub fn new(
        store: Arc<dyn PlacementStore>,
        catalog: Arc<dyn TargetCatalog>,
        decision_maker: Arc<dyn DecisionMaker>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            generator: CandidateGenerator::new(catalog),
            decision_maker,
            config,
        }
    }

    pub fn decision_maker(&self) -> &Arc<dyn DecisionMaker> {
        &self.decision_maker
    }

    /// Reconcile a single request.
    #[instrument(skip(self, key), fields(key = %key, policy = self.decision_maker.name()))]
    pub async fn reconcile(&self, key: &RequestKey) -> Result<ReconcileReport, ReconcileError> {
        let mut request = match self.store.get(key).await {
            Ok(request) => request,
            Err(StoreError::NotFound(_)) => {
                debug!("Request not found, nothing to do");
                return Ok(self.report(ReconcileAction::NotFound, None));
            }
            Err(e) => return Err(e.into()),
        };

        let generated = self.generator.generate(&request.spec);
        if let Some(e) = &generated.error {
            warn!(
                error = %e,
                candidates = generated.candidates.len(),
                "Candidate generation degraded, continuing with partial list"
            );
        }

        let staleness =
            detector::detect(request.generation, &generated.candidates, &request.status);

        let action = match staleness {
            Staleness::GenerationChanged { observed, current } if observed > current => {
                warn!(
                    observed_generation = observed,
                    generation = current,
                    "Stored state is ahead of the request generation, skipping"
                );
                ReconcileAction::Ignored {
                    observed_generation: observed,
                    generation: current,
                }
            }
            Staleness::GenerationChanged { .. } | Staleness::CandidatesChanged { .. } => {
                let expected_version = request.resource_version;
                request
                    .status
                    .reset(request.generation, generated.candidates.clone(), Utc::now());

                self.decision_maker
                    .reset(&request.status.candidates, &request)
                    .map_err(|e| {
                        warn!(error = %e, "Decision maker reset failed");
                        ReconcileError::Policy(e.to_string())
                    })?;

                self.store
                    .update_status(key, &request.status, expected_version)
                    .await?;

                info!(
                    reason = ?staleness,
                    generation = request.generation,
                    candidates = request.status.candidates.len(),
                    "Decision state reset"
                );
                ReconcileAction::Reset {
                    generation: request.generation,
                    candidates: request.status.candidates.len(),
                }
            }
            Staleness::Fresh => self.advance(key, &mut request).await?,
        };

        Ok(self.report(action, generated.error))
    }

    async fn advance(
        &self,
        key: &RequestKey,
        request: &mut PlacementRequest,
    ) -> Result<ReconcileAction, ReconcileError> {
        let missing = request.status.missing_advisors(&request.spec.advisors);
        if !missing.is_empty() {
            debug!(missing = ?missing, "Waiting for advisors");
            return Ok(ReconcileAction::Waiting { missing });
        }

        let expected_version = request.resource_version;
        let mutated = self.decision_maker.advance(request).map_err(|e| {
            warn!(error = %e, "Decision maker failed");
            ReconcileError::Policy(e.to_string())
        })?;

        if mutated {
            request.status.last_update_time = Some(Utc::now());
            self.store
                .update_status(key, &request.status, expected_version)
                .await?;

            match &request.status.decision {
                Some(decision) => info!(decision = %decision, "Placement decided"),
                None => info!(
                    eliminators = request.status.eliminators.len(),
                    "Decision state advanced without a decision"
                ),
            }
        } else {
            debug!("No qualifying candidate, waiting for the next trigger");
        }

        Ok(ReconcileAction::Continued {
            mutated,
            decided: request.status.decision.is_some(),
        })
    }

    fn report(
        &self,
        action: ReconcileAction,
        generation_error: Option<GenerationError>,
    ) -> ReconcileReport {
        let poll = ReconcileResult::after(self.config.advisor_poll_interval);
        let mut result = match &action {
            ReconcileAction::NotFound => ReconcileResult::done(),
            ReconcileAction::Continued { decided: true, .. } => ReconcileResult::done(),
            ReconcileAction::Reset { .. }
            | ReconcileAction::Waiting { .. }
            | ReconcileAction::Continued { .. }
            | ReconcileAction::Ignored { .. } => poll,
        };

        if generation_error.is_some() && action != ReconcileAction::NotFound {
            result = result.min(ReconcileResult::after(self.config.generation_retry_interval));
        }

        ReconcileReport {
            action,
            result,
            generation_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MemoryCatalog, Target};
    use crate::decision::{FirstMatch, PolicyError};
    use crate::store::MemoryStore;
    use crate::types::{AdvisorRef, PlacementSpec, Recommendation, TargetRef};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPolicy {
        resets: AtomicUsize,
        advances: AtomicUsize,
        fail_reset: bool,
    }

    impl CountingPolicy {
        fn new(fail_reset: bool) -> Self {
            Self {
                resets: AtomicUsize::new(0),
                advances: AtomicUsize::new(0),
                fail_reset,
            }
        }
    }

    impl DecisionMaker for CountingPolicy {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn reset(
            &self,
            _candidates: &[TargetRef],
            _request: &PlacementRequest,
        ) -> Result<(), PolicyError> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            if self.fail_reset {
                return Err(PolicyError::Internal("advisor bus down".to_string()));
            }
            Ok(())
        }

        fn advance(&self, request: &mut PlacementRequest) -> Result<bool, PolicyError> {
            self.advances.fetch_add(1, Ordering::SeqCst);
            FirstMatch::default().advance(request)
        }
    }

    fn key() -> RequestKey {
        "team-a/web".parse().unwrap()
    }

    fn catalog() -> Arc<MemoryCatalog> {
        let catalog = MemoryCatalog::new();
        catalog.upsert_target(Target::new("Cluster:fleet/a".parse().unwrap()));
        catalog.upsert_target(Target::new("Cluster:fleet/b".parse().unwrap()));
        Arc::new(catalog)
    }

    async fn setup(
        policy: Arc<CountingPolicy>,
        advisors: &[&str],
    ) -> (Arc<MemoryStore>, PlacementReconciler) {
        let store = Arc::new(MemoryStore::new());
        let spec = PlacementSpec {
            advisors: advisors
                .iter()
                .map(|a| AdvisorRef::new(a.parse().unwrap()))
                .collect(),
            ..Default::default()
        };
        store.apply_spec(&key(), spec).await.unwrap();
        let reconciler =
            PlacementReconciler::new(store.clone(), catalog(), policy, ReconcilerConfig::default());
        (store, reconciler)
    }

    async fn recommend(store: &MemoryStore, advisor: &str, favored: &str) {
        let request = store.get(&key()).await.unwrap();
        let mut status = request.status.clone();
        status.recommendations.insert(
            advisor.parse().unwrap(),
            Recommendation::new(
                request.generation,
                vec![TargetRef::from_key(favored.parse().unwrap())],
                vec![],
            ),
        );
        store
            .update_status(&key(), &status, request.resource_version)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_request_is_done() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = PlacementReconciler::new(
            store,
            catalog(),
            Arc::new(FirstMatch::default()),
            ReconcilerConfig::default(),
        );

        let report = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(report.action, ReconcileAction::NotFound);
        assert_eq!(report.requeue_after(), None);
    }

    #[tokio::test]
    async fn test_reset_does_not_continue_in_same_call() {
        let policy = Arc::new(CountingPolicy::new(false));
        let (_store, reconciler) = setup(policy.clone(), &[]).await;

        let report = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(
            report.action,
            ReconcileAction::Reset {
                generation: 1,
                candidates: 2
            }
        );
        assert_eq!(policy.resets.load(Ordering::SeqCst), 1);
        assert_eq!(policy.advances.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_advisor_list_continues_immediately() {
        let policy = Arc::new(CountingPolicy::new(false));
        let (_store, reconciler) = setup(policy.clone(), &[]).await;

        reconciler.reconcile(&key()).await.unwrap();
        let report = reconciler.reconcile(&key()).await.unwrap();

        assert_eq!(
            report.action,
            ReconcileAction::Continued {
                mutated: false,
                decided: false
            }
        );
        assert_eq!(policy.advances.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_hook_failure_leaves_state_untouched() {
        let policy = Arc::new(CountingPolicy::new(true));
        let (store, reconciler) = setup(policy.clone(), &["cost"]).await;

        let err = reconciler.reconcile(&key()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Policy(_)));

        let stored = store.get(&key()).await.unwrap();
        assert_eq!(stored.status.observed_generation, 0);
        assert_eq!(stored.resource_version, 1);
    }

    #[tokio::test]
    async fn test_decided_request_is_not_requeued() {
        let policy = Arc::new(CountingPolicy::new(false));
        let (store, reconciler) = setup(policy, &["cost"]).await;

        reconciler.reconcile(&key()).await.unwrap();
        recommend(&store, "cost", "Cluster:fleet/b").await;

        let report = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(
            report.action,
            ReconcileAction::Continued {
                mutated: true,
                decided: true
            }
        );
        assert_eq!(report.requeue_after(), None);

        let again = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(
            again.action,
            ReconcileAction::Continued {
                mutated: false,
                decided: true
            }
        );
    }

    /// Lets another writer bump the record right after the next `races` reads.
    struct RacingStore {
        inner: MemoryStore,
        races: AtomicUsize,
    }

    impl RacingStore {
        fn new(races: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                races: AtomicUsize::new(races),
            }
        }
    }

    #[async_trait::async_trait]
    impl PlacementStore for RacingStore {
        async fn get(&self, key: &RequestKey) -> crate::store::StoreResult<PlacementRequest> {
            let request = self.inner.get(key).await?;
            let raced = self
                .races
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if raced {
                self.inner
                    .update_status(key, &request.status, request.resource_version)
                    .await?;
            }
            Ok(request)
        }

        async fn update_status(
            &self,
            key: &RequestKey,
            status: &crate::types::PlacementStatus,
            expected_version: u64,
        ) -> crate::store::StoreResult<u64> {
            self.inner.update_status(key, status, expected_version).await
        }

        async fn apply_spec(
            &self,
            key: &RequestKey,
            spec: PlacementSpec,
        ) -> crate::store::StoreResult<PlacementRequest> {
            self.inner.apply_spec(key, spec).await
        }

        async fn delete(&self, key: &RequestKey) -> crate::store::StoreResult<()> {
            self.inner.delete(key).await
        }

        async fn list_keys(&self) -> crate::store::StoreResult<Vec<RequestKey>> {
            self.inner.list_keys().await
        }

        fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RequestKey> {
            self.inner.subscribe()
        }
    }

    #[tokio::test]
    async fn test_concurrent_write_surfaces_as_conflict() {
        let store = Arc::new(RacingStore::new(1));
        store.apply_spec(&key(), PlacementSpec::default()).await.unwrap();
        let policy = Arc::new(CountingPolicy::new(false));
        let reconciler = PlacementReconciler::new(
            store.clone(),
            catalog(),
            policy.clone(),
            ReconcilerConfig::default(),
        );

        let err = reconciler.reconcile(&key()).await.unwrap_err();
        assert!(err.is_conflict());

        let stored = store.inner.get(&key()).await.unwrap();
        assert_eq!(stored.status.observed_generation, 0);
        assert!(stored.status.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_reset_retried_after_conflict_matches_clean_reset() {
        let racing = Arc::new(RacingStore::new(1));
        racing.apply_spec(&key(), PlacementSpec::default()).await.unwrap();
        let policy = Arc::new(CountingPolicy::new(false));
        let reconciler = PlacementReconciler::new(
            racing.clone(),
            catalog(),
            policy.clone(),
            ReconcilerConfig::default(),
        );

        assert!(reconciler.reconcile(&key()).await.unwrap_err().is_conflict());
        let retried = reconciler.reconcile(&key()).await.unwrap();
        assert!(matches!(retried.action, ReconcileAction::Reset { .. }));
        assert_eq!(policy.resets.load(Ordering::SeqCst), 2);

        let (clean_store, clean) = setup(Arc::new(CountingPolicy::new(false)), &[]).await;
        clean.reconcile(&key()).await.unwrap();

        let mut after_retry = racing.inner.get(&key()).await.unwrap().status;
        let mut after_clean = clean_store.get(&key()).await.unwrap().status;
        after_retry.last_update_time = None;
        after_clean.last_update_time = None;
        assert_eq!(
            serde_json::to_value(&after_retry).unwrap(),
            serde_json::to_value(&after_clean).unwrap()
        );
    }

    #[tokio::test]
    async fn test_policy_not_consulted_while_advisor_missing() {
        let policy = Arc::new(CountingPolicy::new(false));
        let (store, reconciler) = setup(policy.clone(), &["cost", "latency"]).await;

        reconciler.reconcile(&key()).await.unwrap();
        recommend(&store, "cost", "Cluster:fleet/a").await;

        for _ in 0..3 {
            let report = reconciler.reconcile(&key()).await.unwrap();
            assert_eq!(
                report.action,
                ReconcileAction::Waiting {
                    missing: vec!["latency".parse().unwrap()]
                }
            );
        }
        assert_eq!(policy.advances.load(Ordering::SeqCst), 0);
        assert!(store.get(&key()).await.unwrap().status.decision.is_none());

        recommend(&store, "latency", "Cluster:fleet/a").await;
        reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(policy.advances.load(Ordering::SeqCst), 1);
    }
}

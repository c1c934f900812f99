//! Decision makers.
//!
//! A decision maker is the policy half of the reconcile loop. The reconciler
//! owns staleness and persistence; the decision maker owns what happens to a
//! freshly reset request and how accumulated recommendations turn into a
//! decision.
//!
//! Implementations must be deterministic (same accumulated state, same
//! decision) and monotonic (once `decision` is set it stays set until the
//! next reset).

mod announce;
mod first_match;
mod weighted;

pub use announce::{Broadcast, CandidateBroadcast};
pub use first_match::{FirstMatch, TieBreak};
pub use weighted::WeightedVote;

use std::sync::Arc;

use thiserror::Error;

use crate::types::{AdvisorRef, PlacementRequest, PlacementStatus, Recommendation, TargetRef};

/// Errors raised by decision maker hooks.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The policy refused to act on the request as it stands.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("internal: {0}")]
    Internal(String),
}

/// Pluggable placement policy.
pub trait DecisionMaker: Send + Sync {
    /// Policy name for logging.
    fn name(&self) -> &'static str;

    /// Called after the reconciler reset the request's decision state.
    ///
    /// May run more than once for the same generation and candidates.
    fn reset(
        &self,
        candidates: &[TargetRef],
        request: &PlacementRequest,
    ) -> Result<(), PolicyError>;

    /// Called once every advisor in the spec has a recommendation.
    ///
    /// Returns true if `request.status` was changed and must be persisted.
    fn advance(&self, request: &mut PlacementRequest) -> Result<bool, PolicyError>;
}

/// The policy used when nothing else is configured.
pub fn default_decision_maker() -> Arc<dyn DecisionMaker> {
    Arc::new(FirstMatch::default())
}

/// Recommendations of the advisors named in the spec, in spec order.
pub(crate) fn advisor_recommendations<'a>(
    advisors: &'a [AdvisorRef],
    status: &'a PlacementStatus,
) -> impl Iterator<Item = (&'a AdvisorRef, &'a Recommendation)> + 'a {
    advisors
        .iter()
        .filter_map(|advisor| status.recommendations.get(&advisor.name).map(|r| (advisor, r)))
}

/// Refuse to advance decision state that was not reset for the request's
/// current generation.
pub(crate) fn ensure_current(request: &PlacementRequest) -> Result<(), PolicyError> {
    let observed = request.status.observed_generation;
    if observed != request.generation {
        return Err(PolicyError::Rejected(format!(
            "decision state observes generation {observed}, request is at {}",
            request.generation
        )));
    }
    Ok(())
}

/// Fold the vetoes of reporting advisors into the eliminators.
///
/// Only current candidates can be eliminated. Returns true if any target was
/// added.
pub(crate) fn fold_vetoes(advisors: &[AdvisorRef], status: &mut PlacementStatus) -> bool {
    let vetoed: Vec<TargetRef> = status
        .candidates
        .iter()
        .filter(|candidate| {
            let key = candidate.key();
            advisor_recommendations(advisors, status).any(|(_, r)| r.vetoes_target(&key))
        })
        .cloned()
        .collect();

    let mut changed = false;
    for target in &vetoed {
        changed |= status.eliminate(target);
    }
    changed
}

#[cfg(test)]
pub(crate) mod testing {
    use chrono::Utc;

    use crate::types::{
        AdvisorRef, PlacementRequest, PlacementSpec, PlacementStatus, Recommendation, TargetRef,
    };

    pub fn target(name: &str) -> TargetRef {
        TargetRef::from_key(format!("Cluster:fleet/{name}").parse().unwrap())
    }

    pub fn targets(names: &[&str]) -> Vec<TargetRef> {
        names.iter().map(|n| target(n)).collect()
    }

    pub fn request(advisors: &[(&str, u32)], candidates: &[&str]) -> PlacementRequest {
        let mut status = PlacementStatus::default();
        status.reset(1, targets(candidates), Utc::now());
        PlacementRequest {
            key: "team-a/web".parse().unwrap(),
            generation: 1,
            resource_version: 1,
            spec: PlacementSpec {
                advisors: advisors
                    .iter()
                    .map(|(n, w)| AdvisorRef::weighted(n.parse().unwrap(), *w))
                    .collect(),
                ..Default::default()
            },
            status,
        }
    }

    pub fn recommend(
        request: &mut PlacementRequest,
        advisor: &str,
        favored: &[&str],
        vetoed: &[&str],
    ) {
        request.status.recommendations.insert(
            advisor.parse().unwrap(),
            Recommendation::new(request.generation, targets(favored), targets(vetoed)),
        );
    }

    pub fn decision(request: &PlacementRequest) -> Option<String> {
        request.status.decision.as_ref().map(|t| t.name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_fold_vetoes_only_touches_candidates() {
        let mut request = request(&[("cost", 1), ("risk", 1)], &["a", "b"]);
        recommend(&mut request, "cost", &["a"], &["b", "zz"]);
        recommend(&mut request, "risk", &["a"], &["b"]);

        let advisors = request.spec.advisors.clone();
        assert!(fold_vetoes(&advisors, &mut request.status));
        assert_eq!(request.status.eliminators.len(), 1);
        assert_eq!(request.status.eliminators[0].name.as_str(), "b");

        assert!(!fold_vetoes(&advisors, &mut request.status));
    }

    #[test]
    fn test_unlisted_advisors_are_ignored() {
        let mut request = request(&[("cost", 1)], &["a", "b"]);
        recommend(&mut request, "rogue", &["b"], &["a"]);

        let advisors = request.spec.advisors.clone();
        assert!(!fold_vetoes(&advisors, &mut request.status));
        assert_eq!(advisor_recommendations(&advisors, &request.status).count(), 0);
    }

    #[test]
    fn test_out_of_date_state_is_rejected() {
        let mut request = request(&[], &["a"]);
        assert!(ensure_current(&request).is_ok());

        request.generation = 2;
        let err = ensure_current(&request).unwrap_err();
        assert!(matches!(err, PolicyError::Rejected(_)));

        for policy in [
            Arc::new(FirstMatch::default()) as Arc<dyn DecisionMaker>,
            Arc::new(WeightedVote::default()),
        ] {
            assert!(matches!(policy.advance(&mut request), Err(PolicyError::Rejected(_))));
            assert!(request.status.decision.is_none());
        }
    }

    #[test]
    fn test_default_decision_maker() {
        assert_eq!(default_decision_maker().name(), "first-match");
    }
}

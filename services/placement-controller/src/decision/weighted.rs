//! Weighted voting placement policy.

use tracing::debug;

use super::{advisor_recommendations, ensure_current, fold_vetoes, DecisionMaker, PolicyError};
use crate::types::{PlacementRequest, TargetRef};

/// Scores every non-eliminated candidate by the summed weight of the
/// advisors recommending it and decides once the best score reaches
/// `min_score`. Equal scores are resolved in generator order.
#[derive(Debug, Clone)]
pub struct WeightedVote {
    min_score: u32,
}

impl Default for WeightedVote {
    fn default() -> Self {
        Self { min_score: 1 }
    }
}

impl WeightedVote {
    pub fn new(min_score: u32) -> Self {
        Self {
            min_score: min_score.max(1),
        }
    }

    /// Summed advisor weight per non-eliminated candidate, in generator order.
    fn scores<'a>(&self, request: &'a PlacementRequest) -> Vec<(&'a TargetRef, u64)> {
        let status = &request.status;
        status
            .candidates
            .iter()
            .filter(|candidate| !status.is_eliminated(&candidate.key()))
            .map(|candidate| {
                let key = candidate.key();
                let score = advisor_recommendations(&request.spec.advisors, status)
                    .filter(|(_, r)| r.recommends(&key))
                    .map(|(advisor, _)| u64::from(advisor.weight))
                    .sum();
                (candidate, score)
            })
            .collect()
    }
}

impl DecisionMaker for WeightedVote {
    fn name(&self) -> &'static str {
        "weighted-vote"
    }

    fn reset(
        &self,
        _candidates: &[TargetRef],
        _request: &PlacementRequest,
    ) -> Result<(), PolicyError> {
        Ok(())
    }

    fn advance(&self, request: &mut PlacementRequest) -> Result<bool, PolicyError> {
        ensure_current(request)?;
        if request.status.decision.is_some() {
            return Ok(false);
        }

        let mut mutated = fold_vetoes(&request.spec.advisors, &mut request.status);

        let mut best: Option<(&TargetRef, u64)> = None;
        for (candidate, score) in self.scores(request) {
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((candidate, score));
            }
        }

        let choice = best
            .filter(|(_, score)| *score >= u64::from(self.min_score))
            .map(|(candidate, score)| (candidate.clone(), score));

        if let Some((choice, score)) = choice {
            debug!(key = %request.key, decision = %choice, score, "Candidate selected");
            request.status.decision = Some(choice);
            mutated = true;
        }

        Ok(mutated)
    }
}

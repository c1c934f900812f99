//! First-match placement policy.

use std::str::FromStr;

use tracing::debug;

use super::{advisor_recommendations, ensure_current, fold_vetoes, DecisionMaker, PolicyError};
use crate::types::{PlacementRequest, TargetRef};

/// How to choose between several recommended, non-eliminated candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TieBreak {
    /// The earliest candidate in generator order wins.
    #[default]
    GeneratorOrder,

    /// The candidate named by the most advisors wins; equal counts fall back
    /// to generator order.
    MostRecommended,
}

impl FromStr for TieBreak {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generator-order" => Ok(Self::GeneratorOrder),
            "most-recommended" => Ok(Self::MostRecommended),
            other => Err(format!(
                "unknown tie-break '{other}' (expected generator-order or most-recommended)"
            )),
        }
    }
}

/// Picks a candidate that at least one advisor recommends and no advisor
/// vetoed.
#[derive(Debug, Clone, Default)]
pub struct FirstMatch {
    tie_break: TieBreak,
}

impl FirstMatch {
    pub fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    fn choose(&self, request: &PlacementRequest) -> Option<TargetRef> {
        let advisors = &request.spec.advisors;
        let status = &request.status;

        let qualifying = status.candidates.iter().filter_map(|candidate| {
            let key = candidate.key();
            if status.is_eliminated(&key) {
                return None;
            }
            let votes = advisor_recommendations(advisors, status)
                .filter(|(_, r)| r.recommends(&key))
                .count();
            (votes > 0).then_some((candidate, votes))
        });

        match self.tie_break {
            TieBreak::GeneratorOrder => qualifying.map(|(candidate, _)| candidate.clone()).next(),
            TieBreak::MostRecommended => {
                let mut best: Option<(&TargetRef, usize)> = None;
                for (candidate, votes) in qualifying {
                    if best.map_or(true, |(_, top)| votes > top) {
                        best = Some((candidate, votes));
                    }
                }
                best.map(|(candidate, _)| candidate.clone())
            }
        }
    }
}

impl DecisionMaker for FirstMatch {
    fn name(&self) -> &'static str {
        "first-match"
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

        if let Some(choice) = self.choose(request) {
            debug!(key = %request.key, decision = %choice, "Candidate selected");
            request.status.decision = Some(choice);
            mutated = true;
        }

        Ok(mutated)
    }
}

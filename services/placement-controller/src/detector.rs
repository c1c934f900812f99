//! Change detection between a request spec and its stored decision state.

use placement_refs::TargetKey;

use crate::types::{target_keys, PlacementStatus, TargetRef};

/// Why stored decision state no longer matches the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    /// Stored state is current.
    Fresh,

    /// The request spec moved to a different generation.
    GenerationChanged { observed: i64, current: i64 },

    /// The candidate set diverged under the same generation.
    CandidatesChanged {
        added: Vec<TargetKey>,
        removed: Vec<TargetKey>,
    },
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        !matches!(self, Self::Fresh)
    }
}

/// Compare a freshly generated candidate list and the current generation
/// against stored state.
///
/// Candidate lists are compared as sets of target identities; order and
/// descriptor fields other than the identity are ignored.
pub fn detect(generation: i64, candidates: &[TargetRef], status: &PlacementStatus) -> Staleness {
    if status.observed_generation != generation {
        return Staleness::GenerationChanged {
            observed: status.observed_generation,
            current: generation,
        };
    }

    let generated = target_keys(candidates);
    let stored = target_keys(&status.candidates);
    if generated == stored {
        return Staleness::Fresh;
    }

    Staleness::CandidatesChanged {
        added: generated.difference(&stored).cloned().collect(),
        removed: stored.difference(&generated).cloned().collect(),
    }
}

/// Returns true if the stored state must be reset.
pub fn is_stale(generation: i64, candidates: &[TargetRef], status: &PlacementStatus) -> bool {
    detect(generation, candidates, status).is_stale()
}

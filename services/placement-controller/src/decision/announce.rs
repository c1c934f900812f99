//! Candidate broadcasting on reset.

use std::sync::Arc;

use placement_refs::RequestKey;
use tokio::sync::broadcast;
use tracing::debug;

use super::{DecisionMaker, PolicyError};
use crate::types::{PlacementRequest, TargetRef};

/// Fresh candidates published to advisors after a reset.
///
/// The same `(key, generation)` pair can be published more than once;
/// receivers should treat repeats as no-ops.
#[derive(Debug, Clone)]
pub struct CandidateBroadcast {
    pub key: RequestKey,
    pub generation: i64,
    pub candidates: Vec<TargetRef>,
}

/// Wraps a decision maker and announces every reset on a broadcast channel.
pub struct Broadcast {
    inner: Arc<dyn DecisionMaker>,
    sender: broadcast::Sender<CandidateBroadcast>,
}

impl Broadcast {
    pub fn new(inner: Arc<dyn DecisionMaker>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { inner, sender }
    }

    /// Receive announcements made after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CandidateBroadcast> {
        self.sender.subscribe()
    }
}

impl DecisionMaker for Broadcast {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn reset(
        &self,
        candidates: &[TargetRef],
        request: &PlacementRequest,
    ) -> Result<(), PolicyError> {
        self.inner.reset(candidates, request)?;

        let announcement = CandidateBroadcast {
            key: request.key.clone(),
            generation: request.generation,
            candidates: candidates.to_vec(),
        };
        // Advisors that are not listening pick the candidates up from status.
        let receivers = self.sender.send(announcement).unwrap_or(0);
        debug!(
            key = %request.key,
            generation = request.generation,
            receivers,
            "Candidates announced"
        );
        Ok(())
    }

    fn advance(&self, request: &mut PlacementRequest) -> Result<bool, PolicyError> {
        self.inner.advance(request)
    }
}

//! Advisor write path.
//!
//! Advisors record their opinion by overwriting their own entry in a
//! request's recommendations. Entries are only accepted for the generation
//! the decision state currently observes.

use placement_refs::{AdvisorName, RequestKey};
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{PlacementStore, StoreError};
use crate::types::Recommendation;

/// Attempts made when the status write races with another writer.
pub const MAX_SUBMIT_ATTEMPTS: u32 = 5;

/// Errors from submitting a recommendation.
#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("advisor {advisor} is not listed in the spec of {key}")]
    UnknownAdvisor { key: RequestKey, advisor: AdvisorName },

    #[error("recommendation for generation {submitted} does not match observed {observed}")]
    StaleGeneration { submitted: i64, observed: i64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Record `recommendation` as `advisor`'s opinion on the request.
///
/// Returns the resource version written.
pub async fn submit_recommendation(
    store: &dyn PlacementStore,
    key: &RequestKey,
    advisor: &AdvisorName,
    recommendation: Recommendation,
) -> Result<u64, AdvisorError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let request = store.get(key).await?;

        if !request.spec.advisors.iter().any(|a| &a.name == advisor) {
            return Err(AdvisorError::UnknownAdvisor {
                key: key.clone(),
                advisor: advisor.clone(),
            });
        }

        let observed = request.status.observed_generation;
        if observed == 0 || recommendation.observed_generation != observed {
            return Err(AdvisorError::StaleGeneration {
                submitted: recommendation.observed_generation,
                observed,
            });
        }

        let mut status = request.status;
        status
            .recommendations
            .insert(advisor.clone(), recommendation.clone());

        match store
            .update_status(key, &status, request.resource_version)
            .await
        {
            Ok(version) => {
                debug!(
                    key = %key,
                    advisor = %advisor,
                    generation = observed,
                    "Recommendation recorded"
                );
                return Ok(version);
            }
            Err(StoreError::Conflict { .. }) if attempt < MAX_SUBMIT_ATTEMPTS => {
                warn!(
                    key = %key,
                    advisor = %advisor,
                    attempt,
                    "Recommendation write conflicted, retrying"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }
}

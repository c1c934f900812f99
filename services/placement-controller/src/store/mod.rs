//! Placement request storage.
//!
//! The reconciler only needs `get` and `update_status`. The remaining
//! operations belong to the request owner (spec writes, deletion) and to the
//! trigger layer (listing, change notifications).

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use placement_reconcile::ReconcileError;
use placement_refs::RequestKey;
use tokio::sync::broadcast;

use crate::types::{PlacementRequest, PlacementSpec, PlacementStatus};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("placement request not found: {0}")]
    NotFound(RequestKey),

    #[error("conflict on {key}: expected resource version {expected}, found {actual}")]
    Conflict {
        key: RequestKey,
        expected: u64,
        actual: u64,
    },

    #[error("store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => ReconcileError::NotFound(key.to_string()),
            err @ StoreError::Conflict { .. } => ReconcileError::Conflict(err.to_string()),
            StoreError::Internal(message) => ReconcileError::Store(message),
        }
    }
}

/// Backend for placement requests.
///
/// `update_status` replaces the whole status record or fails without
/// effect; there are no partial writes.
#[async_trait]
pub trait PlacementStore: Send + Sync {
    /// Load a request.
    async fn get(&self, key: &RequestKey) -> StoreResult<PlacementRequest>;

    /// Replace a request's status if its resource version still matches.
    ///
    /// Returns the new resource version.
    async fn update_status(
        &self,
        key: &RequestKey,
        status: &PlacementStatus,
        expected_version: u64,
    ) -> StoreResult<u64>;

    /// Create a request or replace its spec.
    ///
    /// The generation starts at 1 and is bumped only when the spec content
    /// changes.
    async fn apply_spec(&self, key: &RequestKey, spec: PlacementSpec)
        -> StoreResult<PlacementRequest>;

    /// Delete a request and its status.
    async fn delete(&self, key: &RequestKey) -> StoreResult<()>;

    /// Keys of every stored request.
    async fn list_keys(&self) -> StoreResult<Vec<RequestKey>>;

    /// Subscribe to keys of requests that changed.
    fn subscribe(&self) -> broadcast::Receiver<RequestKey>;
}

//! In-memory placement store.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use placement_reconcile::SpecHash;
use placement_refs::RequestKey;
use tokio::sync::broadcast;
use tracing::debug;

use super::{PlacementStore, StoreError, StoreResult};
use crate::types::{PlacementRequest, PlacementSpec, PlacementStatus};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    request: PlacementRequest,
    spec_hash: SpecHash,
}

/// In-memory placement store.
///
/// Data is lost when the process exits.
#[derive(Debug)]
pub struct MemoryStore {
    requests: RwLock<HashMap<RequestKey, Entry>>,
    changes: broadcast::Sender<RequestKey>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            requests: RwLock::new(HashMap::new()),
            changes,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, key: &RequestKey) {
        // No subscribers is fine.
        let _ = self.changes.send(key.clone());
    }
}

#[async_trait]
impl PlacementStore for MemoryStore {
    async fn get(&self, key: &RequestKey) -> StoreResult<PlacementRequest> {
        let requests = self
            .requests
            .read()
            .map_err(|_| StoreError::internal("lock poisoned"))?;

        requests
            .get(key)
            .map(|entry| entry.request.clone())
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn update_status(
        &self,
        key: &RequestKey,
        status: &PlacementStatus,
        expected_version: u64,
    ) -> StoreResult<u64> {
        let version = {
            let mut requests = self
                .requests
                .write()
                .map_err(|_| StoreError::internal("lock poisoned"))?;

            let entry = requests
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;

            if entry.request.resource_version != expected_version {
                return Err(StoreError::Conflict {
                    key: key.clone(),
                    expected: expected_version,
                    actual: entry.request.resource_version,
                });
            }

            entry.request.status = status.clone();
            entry.request.resource_version += 1;
            entry.request.resource_version
        };

        debug!(key = %key, resource_version = version, "Status updated");
        self.notify(key);
        Ok(version)
    }

    async fn apply_spec(
        &self,
        key: &RequestKey,
        spec: PlacementSpec,
    ) -> StoreResult<PlacementRequest> {
        let spec_hash = SpecHash::of(&spec).map_err(|e| StoreError::internal(e.to_string()))?;

        let request = {
            let mut requests = self
                .requests
                .write()
                .map_err(|_| StoreError::internal("lock poisoned"))?;

            match requests.get_mut(key) {
                Some(entry) if entry.spec_hash == spec_hash => return Ok(entry.request.clone()),
                Some(entry) => {
                    entry.request.spec = spec;
                    entry.request.generation += 1;
                    entry.request.resource_version += 1;
                    entry.spec_hash = spec_hash;
                    entry.request.clone()
                }
                None => {
                    let request = PlacementRequest {
                        key: key.clone(),
                        generation: 1,
                        resource_version: 1,
                        spec,
                        status: PlacementStatus::default(),
                    };
                    requests.insert(
                        key.clone(),
                        Entry {
                            request: request.clone(),
                            spec_hash,
                        },
                    );
                    request
                }
            }
        };

        debug!(key = %key, generation = request.generation, "Spec applied");
        self.notify(key);
        Ok(request)
    }

    async fn delete(&self, key: &RequestKey) -> StoreResult<()> {
        let removed = self
            .requests
            .write()
            .map_err(|_| StoreError::internal("lock poisoned"))?
            .remove(key);

        if removed.is_none() {
            return Err(StoreError::NotFound(key.clone()));
        }

        self.notify(key);
        Ok(())
    }

    async fn list_keys(&self) -> StoreResult<Vec<RequestKey>> {
        let requests = self
            .requests
            .read()
            .map_err(|_| StoreError::internal("lock poisoned"))?;

        let mut keys: Vec<_> = requests.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn subscribe(&self) -> broadcast::Receiver<RequestKey> {
        self.changes.subscribe()
    }
}

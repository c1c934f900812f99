//! Target catalog.
//!
//! The catalog lists every placement target the controller knows about and
//! the named target sets requests can scope themselves to. The generator
//! reads it; nothing in the reconcile path writes it.

use std::collections::BTreeMap;
use std::sync::RwLock;

use placement_refs::{Namespace, ObjectName, TargetKey, TargetKind};
use serde::{Deserialize, Serialize};

use crate::types::TargetRef;

/// A placement target with its labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    pub namespace: Namespace,
    pub name: ObjectName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Target {
    pub fn new(key: TargetKey) -> Self {
        Self {
            kind: key.kind,
            namespace: key.namespace,
            name: key.name,
            api_version: None,
            labels: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> TargetKey {
        TargetKey::new(self.kind.clone(), self.namespace.clone(), self.name.clone())
    }

    /// The reference recorded in decision state for this target.
    pub fn to_ref(&self) -> TargetRef {
        TargetRef {
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            api_version: self.api_version.clone(),
            uid: None,
        }
    }
}

/// A named group of targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSet {
    pub name: String,
    #[serde(default)]
    pub members: Vec<TargetKey>,
}

/// Read access to known targets.
pub trait TargetCatalog: Send + Sync {
    /// Every target, ordered by key.
    fn targets(&self) -> Vec<Target>;

    /// Look up a single target.
    fn target(&self, key: &TargetKey) -> Option<Target>;

    /// Look up a target set by name.
    fn target_set(&self, name: &str) -> Option<TargetSet>;
}

/// In-memory catalog.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    targets: RwLock<BTreeMap<TargetKey, Target>>,
    sets: RwLock<BTreeMap<String, TargetSet>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a target.
    pub fn upsert_target(&self, target: Target) {
        let mut targets = self.targets.write().unwrap_or_else(|e| e.into_inner());
        targets.insert(target.key(), target);
    }

    /// Remove a target. Set memberships are left untouched.
    pub fn remove_target(&self, key: &TargetKey) -> Option<Target> {
        let mut targets = self.targets.write().unwrap_or_else(|e| e.into_inner());
        targets.remove(key)
    }

    /// Insert or replace a target set.
    pub fn upsert_set(&self, set: TargetSet) {
        let mut sets = self.sets.write().unwrap_or_else(|e| e.into_inner());
        sets.insert(set.name.clone(), set);
    }

    pub fn len(&self) -> usize {
        self.targets.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TargetCatalog for MemoryCatalog {
    fn targets(&self) -> Vec<Target> {
        let targets = self.targets.read().unwrap_or_else(|e| e.into_inner());
        targets.values().cloned().collect()
    }

    fn target(&self, key: &TargetKey) -> Option<Target> {
        let targets = self.targets.read().unwrap_or_else(|e| e.into_inner());
        targets.get(key).cloned()
    }

    fn target_set(&self, name: &str) -> Option<TargetSet> {
        let sets = self.sets.read().unwrap_or_else(|e| e.into_inner());
        sets.get(name).cloned()
    }
}

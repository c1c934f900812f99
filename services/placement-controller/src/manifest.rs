//! Manifest loading.
//!
//! A manifest is a TOML file that seeds the target catalog and the initial
//! placement requests:
//!
//! ```toml
//! [[targets]]
//! kind = "Cluster"
//! namespace = "fleet"
//! name = "eu-1"
//! labels = { region = "eu" }
//!
//! [[target_sets]]
//! name = "europe"
//! members = ["Cluster:fleet/eu-1"]
//!
//! [[requests]]
//! namespace = "team-a"
//! name = "web"
//!
//! [requests.spec]
//! target_set = "europe"
//! advisors = [{ name = "cost" }]
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use placement_refs::{Namespace, ObjectName, RequestKey};
use serde::Deserialize;
use tracing::info;

use crate::catalog::{MemoryCatalog, Target, TargetSet};
use crate::store::PlacementStore;
use crate::types::PlacementSpec;

/// A placement request declared in a manifest.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestManifest {
    pub namespace: Namespace,
    pub name: ObjectName,
    #[serde(default)]
    pub spec: PlacementSpec,
}

impl RequestManifest {
    pub fn key(&self) -> RequestKey {
        RequestKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// Parsed manifest contents.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub target_sets: Vec<TargetSet>,
    #[serde(default)]
    pub requests: Vec<RequestManifest>,
}

impl Manifest {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let manifest: Manifest = toml::from_str(contents).context("invalid manifest TOML")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest: {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("failed to load manifest: {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut targets = HashSet::new();
        for target in &self.targets {
            if !targets.insert(target.key()) {
                bail!("duplicate target {}", target.key());
            }
        }

        let mut sets = HashSet::new();
        for set in &self.target_sets {
            if !sets.insert(set.name.as_str()) {
                bail!("duplicate target set '{}'", set.name);
            }
            if let Some(missing) = set.members.iter().find(|m| !targets.contains(*m)) {
                bail!("target set '{}' references unknown target {missing}", set.name);
            }
        }

        let mut requests = HashSet::new();
        for request in &self.requests {
            let key = request.key();
            if let Some(selector) = &request.spec.selector {
                if let Err(e) = selector.validate() {
                    bail!("request {key} has an invalid selector: {e}");
                }
            }
            if !requests.insert(key.clone()) {
                bail!("duplicate request {key}");
            }
        }

        Ok(())
    }

    /// Build a catalog holding the manifest's targets and sets.
    pub fn catalog(&self) -> MemoryCatalog {
        let catalog = MemoryCatalog::new();
        for target in &self.targets {
            catalog.upsert_target(target.clone());
        }
        for set in &self.target_sets {
            catalog.upsert_set(set.clone());
        }
        catalog
    }

    /// Apply every request spec to `store`. Returns the number applied.
    pub async fn seed(&self, store: &dyn PlacementStore) -> Result<usize> {
        for request in &self.requests {
            let key = request.key();
            let applied = store
                .apply_spec(&key, request.spec.clone())
                .await
                .with_context(|| format!("failed to seed request {key}"))?;
            info!(key = %key, generation = applied.generation, "Seeded placement request");
        }
        Ok(self.requests.len())
    }
}

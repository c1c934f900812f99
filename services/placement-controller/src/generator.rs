//! Candidate generation.
//!
//! Derives the eligible targets for a request spec from the catalog:
//! - The universe is the named target set, or the whole catalog
//! - Explicit targets narrow the universe and fix the order
//! - The label selector filters what is left
//!
//! Generation never touches decision state. Failures are reported next to a
//! best-effort candidate list rather than instead of it.

use std::collections::BTreeSet;
use std::sync::Arc;

use placement_refs::TargetKey;
use thiserror::Error;

use crate::catalog::{Target, TargetCatalog};
use crate::types::{PlacementSpec, TargetRef};

/// Reasons a request spec could not be fully resolved.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("target set not found: {0}")]
    UnknownTargetSet(String),

    #[error("targets not found in catalog: {}", join_keys(.0))]
    UnknownTargets(Vec<TargetKey>),

    #[error("invalid selector: {0}")]
    InvalidSelector(String),
}

fn join_keys(keys: &[TargetKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Output of one generator run.
#[derive(Debug, Clone, Default)]
pub struct Generated {
    /// Ordered, duplicate-free candidates. Best effort when `error` is set.
    pub candidates: Vec<TargetRef>,
    pub error: Option<GenerationError>,
}

impl Generated {
    fn failed(error: GenerationError) -> Self {
        Self {
            candidates: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

/// Computes candidates from a request spec and the catalog.
#[derive(Clone)]
pub struct CandidateGenerator {
    catalog: Arc<dyn TargetCatalog>,
}

impl CandidateGenerator {
    pub fn new(catalog: Arc<dyn TargetCatalog>) -> Self {
        Self { catalog }
    }

    pub fn generate(&self, spec: &PlacementSpec) -> Generated {
        if let Some(selector) = &spec.selector {
            if let Err(message) = selector.validate() {
                return Generated::failed(GenerationError::InvalidSelector(message));
            }
        }

        let mut missing = Vec::new();

        let mut universe: Vec<Target> = match &spec.target_set {
            Some(set_name) => {
                let Some(set) = self.catalog.target_set(set_name) else {
                    return Generated::failed(GenerationError::UnknownTargetSet(set_name.clone()));
                };
                set.members
                    .iter()
                    .filter_map(|key| {
                        let target = self.catalog.target(key);
                        if target.is_none() {
                            missing.push(key.clone());
                        }
                        target
                    })
                    .collect()
            }
            None => self.catalog.targets(),
        };
        universe.sort_by_key(Target::key);

        let eligible: Vec<Target> = if spec.targets.is_empty() {
            universe
        } else {
            spec.targets
                .iter()
                .filter_map(|wanted| {
                    let key = wanted.key();
                    let found = universe.iter().find(|t| t.key() == key).cloned();
                    if found.is_none() {
                        missing.push(key);
                    }
                    found
                })
                .collect()
        };

        let mut seen = BTreeSet::new();
        let candidates = eligible
            .into_iter()
            .filter(|t| {
                spec.selector
                    .as_ref()
                    .map_or(true, |selector| selector.matches(&t.labels))
            })
            .filter(|t| seen.insert(t.key()))
            .map(|t| t.to_ref())
            .collect();

        missing.sort();
        missing.dedup();
        let error = (!missing.is_empty()).then(|| GenerationError::UnknownTargets(missing));

        Generated { candidates, error }
    }
}

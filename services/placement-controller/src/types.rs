//! Placement request and decision state records.
//!
//! A [`PlacementRequest`] is owned by the persistence layer. Its `spec` and
//! `generation` are written by the request owner; its `status` is written
//! only by the reconciler and the decision maker it drives.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use placement_refs::{AdvisorName, Namespace, ObjectName, RequestKey, TargetKey, TargetKind};
use serde::{Deserialize, Serialize};

// =============================================================================
// Targets
// =============================================================================

/// Descriptor of a placement target.
///
/// Only `kind`, `namespace` and `name` form the identity (see [`TargetRef::key`]).
/// Compare targets with [`same_target`] or by key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRef {
    pub kind: TargetKind,
    pub namespace: Namespace,
    pub name: ObjectName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl TargetRef {
    /// Build a bare reference from an identity key.
    pub fn from_key(key: TargetKey) -> Self {
        Self {
            kind: key.kind,
            namespace: key.namespace,
            name: key.name,
            api_version: None,
            uid: None,
        }
    }

    /// The identity of this target.
    pub fn key(&self) -> TargetKey {
        TargetKey::new(self.kind.clone(), self.namespace.clone(), self.name.clone())
    }
}

impl std::fmt::Display for TargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Target identity comparison used for candidate and eliminator sets.
pub fn same_target(a: &TargetRef, b: &TargetRef) -> bool {
    a.kind == b.kind && a.namespace == b.namespace && a.name == b.name
}

/// Collect the identity keys of a list of targets.
pub fn target_keys(targets: &[TargetRef]) -> BTreeSet<TargetKey> {
    targets.iter().map(TargetRef::key).collect()
}

// =============================================================================
// Selectors
// =============================================================================

/// Operator of a label selector expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A single label selector expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Label selector over catalog targets.
///
/// All `match_labels` entries and all `match_expressions` must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<SelectorRequirement>,
}

impl LabelSelector {
    /// Check that every expression is well formed.
    pub fn validate(&self) -> Result<(), String> {
        for req in &self.match_expressions {
            if req.key.is_empty() {
                return Err("expression key cannot be empty".to_string());
            }
            match req.operator {
                SelectorOperator::In | SelectorOperator::NotIn if req.values.is_empty() => {
                    return Err(format!(
                        "operator {:?} on '{}' requires at least one value",
                        req.operator, req.key
                    ));
                }
                SelectorOperator::Exists | SelectorOperator::DoesNotExist
                    if !req.values.is_empty() =>
                {
                    return Err(format!(
                        "operator {:?} on '{}' does not take values",
                        req.operator, req.key
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Returns true if the labels satisfy the selector.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let labels_ok = self
            .match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v));

        labels_ok
            && self.match_expressions.iter().all(|req| {
                let value = labels.get(&req.key);
                match req.operator {
                    SelectorOperator::In => value.is_some_and(|v| req.values.contains(v)),
                    SelectorOperator::NotIn => !value.is_some_and(|v| req.values.contains(v)),
                    SelectorOperator::Exists => value.is_some(),
                    SelectorOperator::DoesNotExist => value.is_none(),
                }
            })
    }
}

// =============================================================================
// Specification
// =============================================================================

fn default_weight() -> u32 {
    1
}

/// An advisor that must weigh in before a decision is finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisorRef {
    pub name: AdvisorName,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl AdvisorRef {
    pub fn new(name: AdvisorName) -> Self {
        Self { name, weight: 1 }
    }

    pub fn weighted(name: AdvisorName, weight: u32) -> Self {
        Self { name, weight }
    }
}

/// Placement criteria.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementSpec {
    /// Catalog target set forming the universe of eligible targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_set: Option<String>,

    /// Explicit targets, in preference order.
    #[serde(default)]
    pub targets: Vec<TargetRef>,

    /// Label filter applied after the universe and explicit targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Advisors that must all report.
    #[serde(default)]
    pub advisors: Vec<AdvisorRef>,
}

// =============================================================================
// Decision State
// =============================================================================

/// An advisor's opinion about the candidates of one generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    /// Candidates the advisor favors.
    #[serde(default)]
    pub candidates: Vec<TargetRef>,

    /// Candidates the advisor vetoes.
    #[serde(default)]
    pub vetoes: Vec<TargetRef>,

    /// Generation the advisor evaluated.
    pub observed_generation: i64,

    pub timestamp: DateTime<Utc>,
}

impl Recommendation {
    pub fn new(
        observed_generation: i64,
        candidates: Vec<TargetRef>,
        vetoes: Vec<TargetRef>,
    ) -> Self {
        Self {
            candidates,
            vetoes,
            observed_generation,
            timestamp: Utc::now(),
        }
    }

    pub fn recommends(&self, key: &TargetKey) -> bool {
        self.candidates.iter().any(|t| &t.key() == key)
    }

    pub fn vetoes_target(&self, key: &TargetKey) -> bool {
        self.vetoes.iter().any(|t| &t.key() == key)
    }
}

/// Derived lifecycle phase of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionPhase {
    /// Never reset.
    Uninitialized,
    /// Reset; waiting for advisors or for a qualifying candidate.
    AwaitingRecommendations,
    /// A target was chosen for the observed generation.
    Decided,
}

/// The mutable decision state of one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementStatus {
    pub observed_generation: i64,

    #[serde(default)]
    pub candidates: Vec<TargetRef>,

    #[serde(default)]
    pub recommendations: BTreeMap<AdvisorName, Recommendation>,

    #[serde(default)]
    pub eliminators: Vec<TargetRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<TargetRef>,

    /// Observability only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

impl PlacementStatus {
    pub fn phase(&self) -> DecisionPhase {
        if self.decision.is_some() {
            DecisionPhase::Decided
        } else if self.observed_generation == 0 && self.candidates.is_empty() {
            DecisionPhase::Uninitialized
        } else {
            DecisionPhase::AwaitingRecommendations
        }
    }

    /// Start over for a new generation and candidate list.
    ///
    /// Every field except `last_update_time` is a function of the arguments,
    /// so resetting twice with the same inputs yields the same state.
    pub fn reset(&mut self, generation: i64, candidates: Vec<TargetRef>, now: DateTime<Utc>) {
        self.observed_generation = generation;
        self.candidates = candidates;
        self.recommendations.clear();
        self.eliminators.clear();
        self.decision = None;
        self.last_update_time = Some(now);
    }

    pub fn is_eliminated(&self, key: &TargetKey) -> bool {
        self.eliminators.iter().any(|t| &t.key() == key)
    }

    /// Add a target to the eliminators. Returns false if it was already there.
    pub fn eliminate(&mut self, target: &TargetRef) -> bool {
        if self.eliminators.iter().any(|t| same_target(t, target)) {
            return false;
        }
        self.eliminators.push(target.clone());
        true
    }

    /// Advisors from `advisors` that have not recorded a recommendation.
    pub fn missing_advisors(&self, advisors: &[AdvisorRef]) -> Vec<AdvisorName> {
        advisors
            .iter()
            .filter(|a| !self.recommendations.contains_key(&a.name))
            .map(|a| a.name.clone())
            .collect()
    }
}

/// A placement request as stored by the persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub key: RequestKey,

    /// Bumped by the owner whenever `spec` changes.
    pub generation: i64,

    /// Optimistic concurrency token, bumped on every write.
    pub resource_version: u64,

    pub spec: PlacementSpec,

    #[serde(default)]
    pub status: PlacementStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(s: &str) -> TargetRef {
        TargetRef::from_key(s.parse().unwrap())
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_identity_ignores_descriptor_fields() {
        let a = target("Cluster:fleet/east");
        let mut b = target("Cluster:fleet/east");
        b.uid = Some("1234".to_string());
        b.api_version = Some("v1".to_string());

        assert!(same_target(&a, &b));
        assert_eq!(a.key(), b.key());
        assert!(!same_target(&a, &target("Deployer:fleet/east")));
    }

    #[test]
    fn test_selector_matches() {
        let selector = LabelSelector {
            match_labels: labels(&[("tier", "prod")]),
            match_expressions: vec![
                SelectorRequirement {
                    key: "region".to_string(),
                    operator: SelectorOperator::In,
                    values: vec!["us".to_string(), "eu".to_string()],
                },
                SelectorRequirement {
                    key: "cordoned".to_string(),
                    operator: SelectorOperator::DoesNotExist,
                    values: vec![],
                },
            ],
        };

        assert!(selector.matches(&labels(&[("tier", "prod"), ("region", "eu")])));
        assert!(!selector.matches(&labels(&[("tier", "dev"), ("region", "eu")])));
        assert!(!selector.matches(&labels(&[("tier", "prod"), ("region", "ap")])));
        assert!(!selector.matches(&labels(&[
            ("tier", "prod"),
            ("region", "us"),
            ("cordoned", "true")
        ])));
    }

    #[test]
    fn test_selector_validation() {
        let bad = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![SelectorRequirement {
                key: "region".to_string(),
                operator: SelectorOperator::In,
                values: vec![],
            }],
        };
        assert!(bad.validate().is_err());
        assert!(LabelSelector::default().validate().is_ok());
    }

    #[test]
    fn test_reset_clears_decision_state() {
        let mut status = PlacementStatus::default();
        assert_eq!(status.phase(), DecisionPhase::Uninitialized);

        status.reset(1, vec![target("Cluster:fleet/a")], Utc::now());
        status.recommendations.insert(
            "cost".parse().unwrap(),
            Recommendation::new(1, vec![target("Cluster:fleet/a")], vec![]),
        );
        status.eliminate(&target("Cluster:fleet/a"));
        status.decision = Some(target("Cluster:fleet/a"));
        assert_eq!(status.phase(), DecisionPhase::Decided);

        status.reset(2, vec![target("Cluster:fleet/b")], Utc::now());
        assert_eq!(status.observed_generation, 2);
        assert!(status.recommendations.is_empty());
        assert!(status.eliminators.is_empty());
        assert!(status.decision.is_none());
        assert_eq!(status.phase(), DecisionPhase::AwaitingRecommendations);
    }

    #[test]
    fn test_reset_twice_yields_same_state() {
        let candidates = vec![target("Cluster:fleet/a"), target("Cluster:fleet/b")];

        let mut once = PlacementStatus::default();
        once.reset(3, candidates.clone(), Utc::now());

        let mut twice = once.clone();
        twice.recommendations.insert(
            "cost".parse().unwrap(),
            Recommendation::new(3, vec![target("Cluster:fleet/b")], vec![]),
        );
        twice.eliminate(&target("Cluster:fleet/a"));
        twice.reset(3, candidates.clone(), Utc::now());
        twice.reset(3, candidates, Utc::now());

        once.last_update_time = None;
        twice.last_update_time = None;
        assert_eq!(
            serde_json::to_value(&once).unwrap(),
            serde_json::to_value(&twice).unwrap()
        );
    }

    #[test]
    fn test_eliminate_is_a_set() {
        let mut status = PlacementStatus::default();
        assert!(status.eliminate(&target("Cluster:fleet/a")));
        assert!(!status.eliminate(&target("Cluster:fleet/a")));
        assert_eq!(status.eliminators.len(), 1);
    }

    #[test]
    fn test_missing_advisors() {
        let mut status = PlacementStatus::default();
        let advisors = vec![
            AdvisorRef::new("cost".parse().unwrap()),
            AdvisorRef::new("latency".parse().unwrap()),
        ];
        status
            .recommendations
            .insert("cost".parse().unwrap(), Recommendation::new(1, vec![], vec![]));

        let missing = status.missing_advisors(&advisors);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].as_str(), "latency");
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let spec: PlacementSpec = serde_json::from_value(serde_json::json!({
            "targets": [{"kind": "Cluster", "namespace": "fleet", "name": "east"}],
            "advisors": [{"name": "cost"}, {"name": "latency", "weight": 3}]
        }))
        .unwrap();

        assert!(spec.target_set.is_none());
        assert_eq!(spec.advisors[0].weight, 1);
        assert_eq!(spec.advisors[1].weight, 3);
    }
}

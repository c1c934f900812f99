//! Reference definitions for placement requests, targets, and advisors.
//!
//! Component names follow DNS-style label rules. Composite keys are the
//! identity used for every equality and set comparison in the engine.

use crate::{define_name, string_serde, RefError};

/// Maximum length of a namespace.
pub const MAX_NAMESPACE_LEN: usize = 63;

/// Maximum length of an object or advisor name.
pub const MAX_NAME_LEN: usize = 253;

/// Maximum length of a target kind.
pub const MAX_KIND_LEN: usize = 63;

// =============================================================================
// Validators
// =============================================================================

fn validate_dns(what: &'static str, s: &str, max: usize, allow_dot: bool) -> Result<(), RefError> {
    if s.is_empty() {
        return Err(RefError::Empty { what });
    }
    if s.len() > max {
        return Err(RefError::TooLong {
            what,
            max,
            actual: s.to_string(),
        });
    }
    let allowed = |c: &char| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || (allow_dot && *c == '.')
    };
    if let Some(found) = s.chars().find(|c| !allowed(c)) {
        return Err(RefError::InvalidCharacter {
            what,
            found,
            actual: s.to_string(),
        });
    }
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let first_ok = s.chars().next().is_some_and(alnum);
    let last_ok = s.chars().last().is_some_and(alnum);
    if !first_ok || !last_ok {
        return Err(RefError::InvalidBoundary {
            what,
            actual: s.to_string(),
        });
    }
    Ok(())
}

/// Validates a DNS-1123 label (namespaces).
pub fn validate_dns_label(what: &'static str, s: &str) -> Result<(), RefError> {
    validate_dns(what, s, MAX_NAMESPACE_LEN, false)
}

/// Validates a DNS-1123 subdomain (object and advisor names).
pub fn validate_dns_subdomain(what: &'static str, s: &str) -> Result<(), RefError> {
    validate_dns(what, s, MAX_NAME_LEN, true)
}

/// Validates a resource kind: an ASCII letter followed by ASCII alphanumerics.
pub fn validate_kind(what: &'static str, s: &str) -> Result<(), RefError> {
    if s.is_empty() {
        return Err(RefError::Empty { what });
    }
    if s.len() > MAX_KIND_LEN {
        return Err(RefError::TooLong {
            what,
            max: MAX_KIND_LEN,
            actual: s.to_string(),
        });
    }
    if let Some(found) = s.chars().find(|c| !c.is_ascii_alphanumeric()) {
        return Err(RefError::InvalidCharacter {
            what,
            found,
            actual: s.to_string(),
        });
    }
    if !s.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return Err(RefError::InvalidBoundary {
            what,
            actual: s.to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Names
// =============================================================================

define_name!(Namespace, "namespace", validate_dns_label);
define_name!(ObjectName, "object name", validate_dns_subdomain);
define_name!(AdvisorName, "advisor name", validate_dns_subdomain);
define_name!(TargetKind, "target kind", validate_kind);

// =============================================================================
// Request Keys
// =============================================================================

/// Identity of a placement request: `{namespace}/{name}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestKey {
    pub namespace: Namespace,
    pub name: ObjectName,
}

impl RequestKey {
    /// Creates a key from already-validated parts.
    #[must_use]
    pub fn new(namespace: Namespace, name: ObjectName) -> Self {
        Self { namespace, name }
    }

    /// Parses a key from `{namespace}/{name}`.
    pub fn parse(s: &str) -> Result<Self, RefError> {
        let Some((namespace, name)) = s.split_once('/') else {
            return Err(RefError::MissingSeparator {
                separator: '/',
                actual: s.to_string(),
            });
        };

        Ok(Self {
            namespace: Namespace::parse(namespace)?,
            name: ObjectName::parse(name)?,
        })
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl std::str::FromStr for RequestKey {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

string_serde!(RequestKey);

// =============================================================================
// Target Keys
// =============================================================================

/// Identity of a placement target: `{Kind}:{namespace}/{name}`.
///
/// Ordering is kind, then namespace, then name. Generators rely on this
/// ordering for deterministic candidate lists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetKey {
    pub kind: TargetKind,
    pub namespace: Namespace,
    pub name: ObjectName,
}

impl TargetKey {
    /// Creates a key from already-validated parts.
    #[must_use]
    pub fn new(kind: TargetKind, namespace: Namespace, name: ObjectName) -> Self {
        Self {
            kind,
            namespace,
            name,
        }
    }

    /// Parses a key from `{Kind}:{namespace}/{name}`.
    pub fn parse(s: &str) -> Result<Self, RefError> {
        let Some((kind, rest)) = s.split_once(':') else {
            return Err(RefError::MissingSeparator {
                separator: ':',
                actual: s.to_string(),
            });
        };
        let Some((namespace, name)) = rest.split_once('/') else {
            return Err(RefError::MissingSeparator {
                separator: '/',
                actual: s.to_string(),
            });
        };

        Ok(Self {
            kind: TargetKind::parse(kind)?,
            namespace: Namespace::parse(namespace)?,
            name: ObjectName::parse(name)?,
        })
    }
}

impl std::fmt::Display for TargetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.kind, self.namespace, self.name)
    }
}

impl std::str::FromStr for TargetKey {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

string_serde!(TargetKey);

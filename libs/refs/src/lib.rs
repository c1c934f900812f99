//! # placement-refs
//!
//! Stable reference types, parsing, and validation for placement requests
//! and the targets they are placed onto.
//!
//! ## Design Principles
//!
//! - Names are user-controlled labels validated at the boundary
//! - Every reference has a canonical string form with strict parsing
//! - Identity is an explicit composite key, never a whole descriptor
//! - References are typed so request keys and target keys cannot be mixed
//!
//! ## Reference Format
//!
//! - Request keys: `{namespace}/{name}`, e.g. `team-a/web-frontend`
//! - Target keys: `{Kind}:{namespace}/{name}`, e.g. `Cluster:fleet/east-1`

mod error;
mod macros;
mod types;

pub use error::RefError;
pub use types::*;

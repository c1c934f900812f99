//! Placement controller.
//!
//! Decides where a placement request should land. For each request the
//! controller generates candidate targets from the catalog, waits until every
//! configured advisor has recommended or vetoed candidates, and then lets a
//! pluggable [`decision::DecisionMaker`] pick one.
//!
//! This crate primarily ships a `placement-controller` binary, but the
//! library surface is what advisors and integration tests use.

pub mod advisor;
pub mod catalog;
pub mod config;
pub mod decision;
pub mod detector;
pub mod engine;
pub mod generator;
pub mod manifest;
pub mod store;
pub mod types;
pub mod worker;

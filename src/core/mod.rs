//! Core engine functionality
//!
//! This module contains the rule model and the components that version and
//! deploy it:
//!
//! - [`firewall`]: Rules, rule sets, canonical hashing, text export
//! - [`rule_constraints`]: Business rules for valid field combinations
//! - [`store`]: Working-set CRUD with optimistic concurrency
//! - [`versions`]: Immutable snapshots, activation, history, diffs
//! - [`deploy`]: The validate, snapshot, apply, activate pipeline
//! - [`rollback`]: Re-applying historical versions
//! - [`backend`]: Enforcement backends
//! - [`engine`]: The [`engine::Firewall`] facade
//! - [`persist`]: State file load/save with checksums
//! - [`error`]: Error types for engine operations

pub mod backend;
pub mod deploy;
pub mod engine;
pub mod error;
pub mod firewall;
pub mod persist;
pub mod rollback;
pub mod rule_constraints;
pub mod state;
pub mod store;
pub mod versions;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;

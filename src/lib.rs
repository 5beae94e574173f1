//! fwvault - versioned firewall rule deployment
//!
//! Keeps a working set of packet-filter rules, snapshots it into immutable
//! content-hashed versions, applies versions through an enforcement backend
//! and rolls back to any earlier version. Every state transition is recorded
//! in an append-only audit log.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, versioning, deploy pipeline, backends
//! - [`audit`] - Append-only audit log
//! - [`command`] - Typed requests from the presentation layer
//! - [`validators`] - Rule validation
//! - [`config`] - Configuration persistence
//! - [`utils`] - Utility functions (XDG directories, atomic writes)
//!
//! # Guarantees
//!
//! - At most one active version at any time
//! - A failed apply never changes the active version
//! - Versions are immutable and history is append-only
//! - Stale edits are rejected, never silently merged

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod command;
pub mod config;
pub mod core;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::engine::Firewall;
pub use core::error::{Error, Result};
pub use core::firewall::{Rule, RuleSet, RuleSpec};

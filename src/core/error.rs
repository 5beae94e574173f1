use crate::core::backend::BackendError;
use crate::core::firewall::RuleId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// A single field-level validation failure.
///
/// Validation never stops at the first problem, so these always travel in
/// batches (see [`Error::Validation`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn summarize(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Core error types for fwvault
#[derive(Debug, Error)]
pub enum Error {
    /// One or more fields failed validation (user-fixable)
    #[error("Validation failed: {}", summarize(.0))]
    Validation(Vec<ValidationError>),

    /// The optimistic-concurrency token is stale
    #[error("Conflict: rule {id} was modified concurrently (token {expected}, current {current})")]
    Conflict {
        id: RuleId,
        expected: DateTime<Utc>,
        current: DateTime<Utc>,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Edit of a rule that is applied in the active version without the override flag
    #[error("Rule {0} is applied in the active version; pass the override flag to edit it")]
    RuleLocked(RuleId),

    /// Another deploy or rollback holds the coordinator
    #[error("A deploy or rollback is already in progress")]
    DeployInProgress,

    /// Backend refused or never confirmed the rule set. The previously active
    /// version is untouched.
    #[error("Backend apply failed for version {version_id}: {source}")]
    BackendApplyFailure {
        version_id: Uuid,
        #[source]
        source: BackendError,
    },

    #[error("Refusing to snapshot an empty rule set (a non-empty baseline is required)")]
    EmptyRuleSet,

    #[error("Version {0} is already active")]
    AlreadyActive(Uuid),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// State file could not be trusted
    #[error("State file error: {0}")]
    StateFile(#[from] StateFileError),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn rule_not_found(id: RuleId) -> Self {
        Self::NotFound {
            kind: "Rule",
            id: id.to_string(),
        }
    }

    pub fn version_not_found(id: Uuid) -> Self {
        Self::NotFound {
            kind: "Version",
            id: id.to_string(),
        }
    }

    /// Returns `true` when retrying the same call later can succeed without
    /// the caller changing its input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DeployInProgress | Error::BackendApplyFailure { .. }
        )
    }

    /// Field errors carried by a validation failure, empty for other variants.
    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            Error::Validation(errors) => errors,
            _ => &[],
        }
    }
}

/// State-file specific errors
#[derive(Debug, Error)]
pub enum StateFileError {
    #[error("State file corrupted: {0}")]
    Corrupted(String),

    #[error("State file checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("State file format version mismatch: found v{found}, expected v{expected}")]
    VersionMismatch { found: u32, expected: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;

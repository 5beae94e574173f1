//! Typed commands for every state-changing request
//!
//! The presentation layer never mutates state directly. It builds one of
//! these commands and hands it to the engine:
//! - [`CreateRuleCommand`]: adds a rule to the working set
//! - [`UpdateRuleCommand`]: patches a rule (optimistic concurrency token required)
//! - [`DeleteRuleCommand`]: removes a rule, leaving a tombstone
//! - [`DeployCommand`]: snapshots and applies the working set
//! - [`RollbackCommand`]: re-applies a historical version
//!
//! Each command checks its own metadata (actor, description) through
//! [`Command::check`] before any state is touched. Rule content is checked
//! separately by [`crate::validators`].
//!
//! # Example
//!
//! ```
//! use fwvault::command::{Command, CreateRuleCommand};
//! use fwvault::core::firewall::RuleSpec;
//!
//! let cmd = CreateRuleCommand::new("alice", RuleSpec::new("filter", "INPUT", "DROP"));
//! assert!(cmd.check().is_ok());
//! assert_eq!(cmd.describe(), "Create filter/INPUT rule (DROP)");
//!
//! let anonymous = CreateRuleCommand::new("", RuleSpec::new("filter", "INPUT", "DROP"));
//! assert!(anonymous.check().is_err());
//! ```

use crate::core::error::ValidationError;
use crate::core::firewall::{RuleId, RulePatch, RuleSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum actor name length
pub const MAX_ACTOR_LEN: usize = 64;

/// Maximum version description length
pub const MAX_DESCRIPTION_LEN: usize = 256;

/// A request to change engine state
pub trait Command: std::fmt::Debug {
    /// Identity recorded in the audit log
    fn actor(&self) -> &str;

    /// Returns a human-readable description of this command
    fn describe(&self) -> String;

    /// Checks request metadata.
    ///
    /// # Errors
    ///
    /// Returns every metadata violation found.
    fn check(&self) -> Result<(), Vec<ValidationError>> {
        let errors = check_actor(self.actor());
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn check_actor(actor: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if actor.trim().is_empty() {
        errors.push(ValidationError::new("actor", "Actor is required"));
    } else if actor.len() > MAX_ACTOR_LEN {
        errors.push(ValidationError::new(
            "actor",
            format!("Actor too long (max {MAX_ACTOR_LEN} bytes)"),
        ));
    } else if actor.chars().any(char::is_control) {
        errors.push(ValidationError::new(
            "actor",
            "Actor contains control characters",
        ));
    }
    errors
}

fn check_description(description: &str, errors: &mut Vec<ValidationError>) {
    if description.len() > MAX_DESCRIPTION_LEN {
        errors.push(ValidationError::new(
            "description",
            format!("Description too long (max {MAX_DESCRIPTION_LEN} bytes)"),
        ));
    }
    if description.chars().any(|c| c.is_control() && c != '\n') {
        errors.push(ValidationError::new(
            "description",
            "Description contains control characters",
        ));
    }
}

/// Adds a rule to the working set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRuleCommand {
    pub actor: String,
    pub rule: RuleSpec,
}

impl CreateRuleCommand {
    pub fn new(actor: impl Into<String>, rule: RuleSpec) -> Self {
        Self {
            actor: actor.into(),
            rule,
        }
    }
}

impl Command for CreateRuleCommand {
    fn actor(&self) -> &str {
        &self.actor
    }

    fn describe(&self) -> String {
        format!(
            "Create {}/{} rule ({})",
            self.rule.table_name, self.rule.chain, self.rule.action
        )
    }
}

/// Patches an existing rule
///
/// `expected_token` must equal the rule's current `updated_at`, otherwise
/// the update fails with a conflict. Rules applied in the active version
/// are locked unless `override_applied` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRuleCommand {
    pub actor: String,
    pub id: RuleId,
    pub expected_token: DateTime<Utc>,
    pub patch: RulePatch,
    #[serde(default)]
    pub override_applied: bool,
}

impl UpdateRuleCommand {
    pub fn new(
        actor: impl Into<String>,
        id: RuleId,
        expected_token: DateTime<Utc>,
        patch: RulePatch,
    ) -> Self {
        Self {
            actor: actor.into(),
            id,
            expected_token,
            patch,
            override_applied: false,
        }
    }

    /// Allows editing a rule that is applied in the active version.
    #[must_use]
    pub fn with_override(mut self) -> Self {
        self.override_applied = true;
        self
    }
}

impl Command for UpdateRuleCommand {
    fn actor(&self) -> &str {
        &self.actor
    }

    fn describe(&self) -> String {
        if self.override_applied {
            format!("Update rule {} (override)", self.id)
        } else {
            format!("Update rule {}", self.id)
        }
    }

    fn check(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = check_actor(&self.actor);
        if self.patch.is_empty() {
            errors.push(ValidationError::new("patch", "Patch changes nothing"));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Removes a rule from the working set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRuleCommand {
    pub actor: String,
    pub id: RuleId,
}

impl DeleteRuleCommand {
    pub fn new(actor: impl Into<String>, id: RuleId) -> Self {
        Self {
            actor: actor.into(),
            id,
        }
    }
}

impl Command for DeleteRuleCommand {
    fn actor(&self) -> &str {
        &self.actor
    }

    fn describe(&self) -> String {
        format!("Delete rule {}", self.id)
    }
}

/// Snapshots the working set and applies it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployCommand {
    pub actor: String,
    pub description: String,
}

impl DeployCommand {
    pub fn new(actor: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            description: description.into(),
        }
    }
}

impl Command for DeployCommand {
    fn actor(&self) -> &str {
        &self.actor
    }

    fn describe(&self) -> String {
        if self.description.is_empty() {
            "Deploy working set".to_string()
        } else {
            format!("Deploy: {}", self.description)
        }
    }

    fn check(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = check_actor(&self.actor);
        check_description(&self.description, &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Re-applies a historical version as a new forward version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackCommand {
    pub actor: String,
    pub version_id: Uuid,
    /// Defaults to "Rollback to version <id>"
    #[serde(default)]
    pub description: Option<String>,
}

impl RollbackCommand {
    pub fn new(actor: impl Into<String>, version_id: Uuid) -> Self {
        Self {
            actor: actor.into(),
            version_id,
            description: None,
        }
    }

    /// Description recorded on the new version.
    pub fn version_description(&self) -> String {
        self.description
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| format!("Rollback to version {}", self.version_id))
    }
}

impl Command for RollbackCommand {
    fn actor(&self) -> &str {
        &self.actor
    }

    fn describe(&self) -> String {
        format!("Rollback to version {}", self.version_id)
    }

    fn check(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = check_actor(&self.actor);
        if let Some(description) = &self.description {
            check_description(description, &mut errors);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_required() {
        let cmd = DeleteRuleCommand::new("  ", 1);
        let errors = cmd.check().unwrap_err();
        assert_eq!(errors[0].field, "actor");
    }

    #[test]
    fn test_actor_length_limit() {
        let cmd = DeleteRuleCommand::new("a".repeat(MAX_ACTOR_LEN + 1), 1);
        assert!(cmd.check().is_err());
        let cmd = DeleteRuleCommand::new("a".repeat(MAX_ACTOR_LEN), 1);
        assert!(cmd.check().is_ok());
    }

    #[test]
    fn test_empty_patch_rejected() {
        let cmd = UpdateRuleCommand::new("alice", 1, Utc::now(), RulePatch::default());
        let errors = cmd.check().unwrap_err();
        assert!(errors.iter().any(|e| e.field == "patch"));
    }

    #[test]
    fn test_override_flag() {
        let patch = RulePatch {
            enabled: Some(false),
            ..RulePatch::default()
        };
        let cmd = UpdateRuleCommand::new("alice", 4, Utc::now(), patch).with_override();
        assert!(cmd.override_applied);
        assert_eq!(cmd.describe(), "Update rule 4 (override)");
        assert!(cmd.check().is_ok());
    }

    #[test]
    fn test_deploy_description_checked() {
        let cmd = DeployCommand::new("alice", "x".repeat(MAX_DESCRIPTION_LEN + 1));
        assert!(cmd.check().is_err());
        let cmd = DeployCommand::new("alice", "nightly\nbatch");
        assert!(cmd.check().is_ok());
        let cmd = DeployCommand::new("alice", "tab\there");
        assert!(cmd.check().is_err());
        assert_eq!(DeployCommand::new("bob", "").describe(), "Deploy working set");
    }

    #[test]
    fn test_rollback_default_description() {
        let id = Uuid::new_v4();
        let cmd = RollbackCommand::new("alice", id);
        assert_eq!(cmd.version_description(), format!("Rollback to version {id}"));

        let cmd = RollbackCommand {
            description: Some("restore ssh".to_string()),
            ..RollbackCommand::new("alice", id)
        };
        assert_eq!(cmd.version_description(), "restore ssh");
    }
}

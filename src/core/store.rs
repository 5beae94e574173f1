//! Working-set CRUD with optimistic concurrency
//!
//! Every mutation takes the state lock once, checks the caller's token,
//! applies the change and appends an audit entry before releasing the lock,
//! so the audit order always matches the order changes were made.
//!
//! Tokens are the rule's `updated_at`. Each edit moves it strictly forward,
//! which makes a stale token detectable even when two edits land in the same
//! clock tick.

use crate::audit::{AuditAction, AuditLog, AuditRecord, AuditTarget, Severity};
use crate::command::{Command, CreateRuleCommand, DeleteRuleCommand, UpdateRuleCommand};
use crate::core::error::{Error, Result, ValidationError};
use crate::core::firewall::{
    Action, Chain, MAX_RULES, Rule, RuleId, RulePatch, RuleSpec, RuleStatus, Table,
};
use crate::core::state::{FirewallState, Tombstone, next_instant};
use crate::validators;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Criteria for [`RuleStore::list`]; every set field must match.
#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    pub table: Option<Table>,
    pub chain: Option<Chain>,
    pub action: Option<Action>,
    pub status: Option<RuleStatus>,
    pub enabled: Option<bool>,
    /// Case-insensitive text over addresses, ports, interfaces, protocol, comment
    pub search: Option<String>,
}

impl RuleFilter {
    pub fn matches(&self, rule: &Rule) -> bool {
        let d = &rule.definition;
        self.table.is_none_or(|t| d.table == t)
            && self.chain.is_none_or(|c| d.chain == c)
            && self.action.is_none_or(|a| d.action == a)
            && self.status.is_none_or(|s| rule.status == s)
            && self.enabled.is_none_or(|e| d.enabled == e)
            && self
                .search
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .is_none_or(|s| rule.matches_text(&s.to_lowercase()))
    }
}

/// Handle for working-set operations
#[derive(Debug, Clone)]
pub struct RuleStore {
    state: Arc<Mutex<FirewallState>>,
    audit: Arc<AuditLog>,
}

impl RuleStore {
    pub(crate) fn new(state: Arc<Mutex<FirewallState>>, audit: Arc<AuditLog>) -> Self {
        Self { state, audit }
    }

    /// Validates and stores a new DRAFT rule.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for bad metadata or rule content, or when the
    /// working set is full.
    pub async fn create(&self, cmd: CreateRuleCommand) -> Result<Rule> {
        cmd.check().map_err(Error::Validation)?;
        let definition = validators::validate(&cmd.rule).map_err(Error::Validation)?;

        let mut state = self.state.lock().await;
        if state.working.len() >= MAX_RULES {
            return Err(Error::Validation(vec![ValidationError::new(
                "rules",
                format!("Working set is full (max {MAX_RULES} rules)"),
            )]));
        }

        let id = state.allocate_rule_id();
        let now = next_instant(None);
        let rule = Rule {
            id,
            definition,
            status: RuleStatus::Draft,
            created_at: now,
            updated_at: now,
        };
        state.working.insert(rule.clone());

        info!("{} (rule {}) by {}", cmd.describe(), id, cmd.actor);
        self.audit
            .append(
                AuditRecord::new(
                    AuditAction::RuleCreated,
                    Severity::Info,
                    &cmd.actor,
                    format!("Created rule {id}"),
                )
                .with_target(AuditTarget::Rule(id))
                .with_after(&rule),
            )
            .await;

        Ok(rule)
    }

    /// Applies a patch to a rule; the result is DRAFT with a new token.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the rule does not exist
    /// - [`Error::Conflict`] if `expected_token` is stale
    /// - [`Error::RuleLocked`] if the rule is live in the active version and
    ///   the override flag is not set
    /// - [`Error::Validation`] if the patched rule is invalid
    pub async fn update(&self, cmd: UpdateRuleCommand) -> Result<Rule> {
        cmd.check().map_err(Error::Validation)?;

        let mut state = self.state.lock().await;
        let current = state
            .working
            .get(cmd.id)
            .cloned()
            .ok_or_else(|| Error::rule_not_found(cmd.id))?;

        if current.updated_at != cmd.expected_token {
            warn!(
                "Stale token for rule {} from {} ({} != {})",
                cmd.id, cmd.actor, cmd.expected_token, current.updated_at
            );
            return Err(Error::Conflict {
                id: cmd.id,
                expected: cmd.expected_token,
                current: current.updated_at,
            });
        }

        let live = current.status == RuleStatus::Applied && state.is_rule_live(&current);
        if live && !cmd.override_applied {
            return Err(Error::RuleLocked(cmd.id));
        }

        let mut spec = RuleSpec::from(&current.definition);
        cmd.patch.apply_to(&mut spec);
        let definition = validators::validate(&spec).map_err(Error::Validation)?;

        let mut updated = current.clone();
        updated.definition = definition;
        updated.status = RuleStatus::Draft;
        updated.updated_at = next_instant(Some(current.updated_at));
        state.working.insert(updated.clone());

        let severity = if live {
            Severity::Warning
        } else {
            Severity::Info
        };
        let message = if live {
            format!("Updated applied rule {} (override)", cmd.id)
        } else {
            format!("Updated rule {}", cmd.id)
        };

        info!("{} by {}", cmd.describe(), cmd.actor);
        self.audit
            .append(
                AuditRecord::new(AuditAction::RuleUpdated, severity, &cmd.actor, message)
                    .with_target(AuditTarget::Rule(cmd.id))
                    .with_before(&current)
                    .with_after(&updated),
            )
            .await;

        Ok(updated)
    }

    /// Enables or disables a rule. Toggling is always allowed on applied
    /// rules (it implies the override flag).
    ///
    /// # Errors
    ///
    /// Same as [`Self::update`], except [`Error::RuleLocked`].
    pub async fn set_enabled(
        &self,
        actor: &str,
        id: RuleId,
        enabled: bool,
        expected_token: DateTime<Utc>,
    ) -> Result<Rule> {
        let patch = RulePatch {
            enabled: Some(enabled),
            ..RulePatch::default()
        };
        self.update(UpdateRuleCommand::new(actor, id, expected_token, patch).with_override())
            .await
    }

    /// Removes a rule from the working set and records a tombstone.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the rule does not exist.
    pub async fn delete(&self, cmd: DeleteRuleCommand) -> Result<Tombstone> {
        cmd.check().map_err(Error::Validation)?;

        let mut state = self.state.lock().await;
        let rule = state
            .working
            .remove(cmd.id)
            .ok_or_else(|| Error::rule_not_found(cmd.id))?;

        let tombstone = Tombstone {
            rule,
            deleted_at: Utc::now(),
            deleted_by: cmd.actor.clone(),
        };
        state.tombstones.push(tombstone.clone());

        info!("{} by {}", cmd.describe(), cmd.actor);
        self.audit
            .append(
                AuditRecord::new(
                    AuditAction::RuleDeleted,
                    Severity::Warning,
                    &cmd.actor,
                    format!("Deleted rule {}", cmd.id),
                )
                .with_target(AuditTarget::Rule(cmd.id))
                .with_before(&tombstone.rule),
            )
            .await;

        Ok(tombstone)
    }

    /// # Errors
    ///
    /// [`Error::NotFound`] if the rule does not exist.
    pub async fn get(&self, id: RuleId) -> Result<Rule> {
        self.state
            .lock()
            .await
            .working
            .get(id)
            .cloned()
            .ok_or_else(|| Error::rule_not_found(id))
    }

    /// Matching rules in evaluation order
    pub async fn list(&self, filter: &RuleFilter) -> Vec<Rule> {
        self.state
            .lock()
            .await
            .working
            .ordered()
            .into_iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    /// Deleted rules, oldest first
    pub async fn tombstones(&self) -> Vec<Tombstone> {
        self.state.lock().await.tombstones.clone()
    }
}

//! Version history: immutable rule-set snapshots
//!
//! A [`Version`] is created once and never edited afterwards, except for its
//! `is_active` flag. At most one version in the history is active; that
//! invariant is maintained by [`VersionManager::activate`], which clears
//! every flag before setting the new one inside a single state mutation.
//!
//! History is listed newest first, keyed by `(created_at, id)`, and paged
//! with a [`HistoryCursor`].

use crate::core::error::{Error, Result};
use crate::core::firewall::RuleSet;
use crate::core::state::{FirewallState, next_instant};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Immutable snapshot of a rule set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: Uuid,
    /// SHA-256 of the canonical rule-set form (lowercase hex)
    pub hash: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub description: String,
    pub is_active: bool,
    /// Last time this version became active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    /// Source version when this snapshot was produced by a rollback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_of: Option<Uuid>,
    pub rules: RuleSet,
}

impl Version {
    pub fn summary(&self) -> VersionSummary {
        VersionSummary {
            id: self.id,
            hash: self.hash.clone(),
            created_at: self.created_at,
            created_by: self.created_by.clone(),
            description: self.description.clone(),
            is_active: self.is_active,
            rule_count: self.rules.len(),
        }
    }

    pub fn short_hash(&self) -> &str {
        self.hash.get(..12).unwrap_or(&self.hash)
    }

    fn history_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

/// Version metadata without its rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub id: Uuid,
    pub hash: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub description: String,
    pub is_active: bool,
    pub rule_count: usize,
}

/// Position after which the next history page starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

/// Renders as `<rfc3339 created_at>,<id>`, the form accepted by `history --before`
impl fmt::Display for HistoryCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{}",
            self.created_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            self.id
        )
    }
}

impl FromStr for HistoryCursor {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (created_at, id) = s
            .split_once(',')
            .ok_or_else(|| format!("Cursor '{s}' must look like <created_at>,<version id>"))?;
        let created_at = DateTime::parse_from_rfc3339(created_at.trim())
            .map_err(|e| format!("Invalid cursor timestamp '{created_at}': {e}"))?
            .with_timezone(&Utc);
        let id = Uuid::parse_str(id.trim()).map_err(|e| format!("Invalid cursor id '{id}': {e}"))?;
        Ok(Self { created_at, id })
    }
}

/// One page of history, newest first
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub versions: Vec<Version>,
    /// Present when more (older) versions exist
    pub next: Option<HistoryCursor>,
}

/// Owns snapshot, activation and history semantics
#[derive(Debug, Clone)]
pub struct VersionManager {
    require_non_empty: bool,
}

impl VersionManager {
    pub fn new(require_non_empty: bool) -> Self {
        Self { require_non_empty }
    }

    /// Records an immutable, inactive snapshot of `rules` in history.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyRuleSet`] for an empty rule set when a
    /// non-empty baseline is required.
    pub fn snapshot(
        &self,
        state: &mut FirewallState,
        rules: RuleSet,
        author: &str,
        description: &str,
    ) -> Result<Version> {
        if self.require_non_empty && rules.is_empty() {
            return Err(Error::EmptyRuleSet);
        }

        let created_at = next_instant(state.versions.iter().map(|v| v.created_at).max());

        let version = Version {
            id: Uuid::new_v4(),
            hash: rules.content_hash(),
            created_at,
            created_by: author.to_string(),
            description: description.to_string(),
            is_active: false,
            activated_at: None,
            rollback_of: None,
            rules,
        };

        tracing::info!(
            "Snapshot {} ({} rules, hash {}) recorded by {}",
            version.id,
            version.rules.len(),
            version.short_hash(),
            author
        );

        state.versions.push(version.clone());
        Ok(version)
    }

    /// Makes `id` the only active version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the version does not exist; no flag
    /// is touched in that case.
    pub fn activate(&self, state: &mut FirewallState, id: Uuid) -> Result<()> {
        if state.version(id).is_none() {
            return Err(Error::version_not_found(id));
        }

        let now = Utc::now();
        for version in &mut state.versions {
            version.is_active = false;
        }
        for version in &mut state.versions {
            if version.id == id {
                version.is_active = true;
                version.activated_at = Some(now);
            }
        }

        debug_assert_eq!(state.active_count(), 1);
        tracing::info!("Version {} is now active", id);
        Ok(())
    }

    /// Lists history newest first, starting after `cursor`.
    pub fn history(
        &self,
        state: &FirewallState,
        limit: usize,
        cursor: Option<&HistoryCursor>,
    ) -> HistoryPage {
        let mut ordered: Vec<&Version> = state
            .versions
            .iter()
            .filter(|v| cursor.is_none_or(|c| v.history_key() < (c.created_at, c.id)))
            .collect();
        ordered.sort_by_key(|v| Reverse(v.history_key()));

        let has_more = ordered.len() > limit;
        let versions: Vec<Version> = ordered.into_iter().take(limit).cloned().collect();
        let next = if has_more {
            versions.last().map(|v| HistoryCursor {
                created_at: v.created_at,
                id: v.id,
            })
        } else {
            None
        };

        HistoryPage { versions, next }
    }

    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no version has this id.
    pub fn get(&self, state: &FirewallState, id: Uuid) -> Result<Version> {
        state
            .version(id)
            .cloned()
            .ok_or_else(|| Error::version_not_found(id))
    }

    pub fn active(&self, state: &FirewallState) -> Option<Version> {
        state.active_version().cloned()
    }

    /// Unified diff of the iptables-style listings of two versions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if either version is unknown.
    pub fn diff(&self, state: &FirewallState, from: Uuid, to: Uuid) -> Result<String> {
        let old = state.version(from).ok_or_else(|| Error::version_not_found(from))?;
        let new = state.version(to).ok_or_else(|| Error::version_not_found(to))?;
        Ok(diff_rulesets(
            &old.rules,
            &new.rules,
            &old.id.to_string(),
            &new.id.to_string(),
        ))
    }
}

/// Unified diff of two rule-set listings; empty when they render the same.
pub fn diff_rulesets(old: &RuleSet, new: &RuleSet, old_name: &str, new_name: &str) -> String {
    let old_text = old.to_iptables_text();
    let new_text = new.to_iptables_text();

    TextDiff::from_lines(&old_text, &new_text)
        .unified_diff()
        .context_radius(3)
        .header(old_name, new_name)
        .to_string()
}

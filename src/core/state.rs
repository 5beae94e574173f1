//! Mutable engine state guarded by a single lock
//!
//! [`FirewallState`] holds the working set, the version history and the
//! tombstones of deleted rules. The engine wraps it in
//! `Arc<tokio::sync::Mutex<_>>`; every mutation happens in one short critical
//! section, so readers never observe a half-applied change.

use crate::core::firewall::{Rule, RuleId, RuleSet, RuleStatus};
use crate::core::versions::Version;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Returns the current time, or `prev + 1µs` if the clock has not moved
/// past `prev`. Used wherever timestamps must be strictly increasing.
pub fn next_instant(prev: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match prev {
        Some(prev) if now <= prev => prev + TimeDelta::microseconds(1),
        _ => now,
    }
}

/// Record of a deleted rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub rule: Rule,
    pub deleted_at: DateTime<Utc>,
    pub deleted_by: String,
}

/// Working set, history and tombstones
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallState {
    pub(crate) working: RuleSet,
    /// Chronological (append order)
    pub(crate) versions: Vec<Version>,
    #[serde(default)]
    pub(crate) tombstones: Vec<Tombstone>,
    pub(crate) next_rule_id: RuleId,
}

impl Default for FirewallState {
    fn default() -> Self {
        Self::new()
    }
}

/// Rule counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCounts {
    pub total: usize,
    pub draft: usize,
    pub pending: usize,
    pub applied: usize,
    pub disabled: usize,
}

impl FirewallState {
    pub fn new() -> Self {
        Self {
            working: RuleSet::new(),
            versions: Vec::new(),
            tombstones: Vec::new(),
            next_rule_id: 1,
        }
    }

    pub fn working(&self) -> &RuleSet {
        &self.working
    }

    /// History in creation order
    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    pub fn tombstones(&self) -> &[Tombstone] {
        &self.tombstones
    }

    pub fn version(&self, id: Uuid) -> Option<&Version> {
        self.versions.iter().find(|v| v.id == id)
    }

    pub fn active_version(&self) -> Option<&Version> {
        self.versions.iter().find(|v| v.is_active)
    }

    pub fn active_count(&self) -> usize {
        self.versions.iter().filter(|v| v.is_active).count()
    }

    /// Hands out the next rule id. Ids are never reused, deleted ones included.
    pub(crate) fn allocate_rule_id(&mut self) -> RuleId {
        let id = self.next_rule_id;
        self.next_rule_id += 1;
        id
    }

    /// `true` if the rule is part of the active version with the same content.
    pub fn is_rule_live(&self, rule: &Rule) -> bool {
        self.active_version()
            .and_then(|v| v.rules.get(rule.id))
            .is_some_and(|live| live.definition == rule.definition)
    }

    pub fn rule_counts(&self) -> RuleCounts {
        let mut counts = RuleCounts::default();
        for rule in self.working.ordered() {
            counts.total += 1;
            match rule.status {
                RuleStatus::Draft => counts.draft += 1,
                RuleStatus::Pending => counts.pending += 1,
                RuleStatus::Applied => counts.applied += 1,
            }
            if !rule.definition.enabled {
                counts.disabled += 1;
            }
        }
        counts
    }

    /// Repairs state loaded from disk so it satisfies the engine invariants.
    ///
    /// Keeps only the most recently activated version active and moves the
    /// id allocator past every id in use. Returns `true` if anything changed.
    pub(crate) fn repair(&mut self) -> bool {
        let mut changed = false;

        if self.active_count() > 1 {
            let keep = self
                .versions
                .iter()
                .filter(|v| v.is_active)
                .max_by_key(|v| (v.activated_at, v.created_at))
                .map(|v| v.id);
            tracing::warn!(
                "State had {} active versions; keeping {:?}",
                self.active_count(),
                keep
            );
            for version in &mut self.versions {
                version.is_active = Some(version.id) == keep;
            }
            changed = true;
        }

        let max_id = self
            .working
            .ids()
            .chain(self.tombstones.iter().map(|t| t.rule.id))
            .chain(self.versions.iter().flat_map(|v| v.rules.ids().collect::<Vec<_>>()))
            .max()
            .unwrap_or(0);
        if self.next_rule_id <= max_id {
            tracing::warn!(
                "Rule id allocator at {} but id {} is in use; advancing",
                self.next_rule_id,
                max_id
            );
            self.next_rule_id = max_id + 1;
            changed = true;
        }

        changed
    }
}

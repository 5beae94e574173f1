//! Append-only audit log of every state transition
//!
//! Entries get a strictly increasing id and a non-decreasing timestamp at
//! append time. Nothing in this module updates or removes an entry.
//!
//! When a sink path is configured each entry is also written to disk in
//! JSON-lines format (one JSON object per line) and fsynced. Disk failures
//! are logged and never fail the operation being audited.
//!
//! Queries are lazy: [`AuditQuery`] walks the log newest first, a page at a
//! time, so large logs are never copied in full.

use crate::core::firewall::RuleId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Entries fetched per lock acquisition while iterating
const QUERY_PAGE: usize = 64;

/// Severity of an audit entry
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// Types of auditable events
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditAction {
    RuleCreated,
    RuleUpdated,
    RuleDeleted,
    DeploySucceeded,
    DeploySkipped,
    DeployFailed,
    RollbackSucceeded,
    RollbackSkipped,
    RollbackFailed,
}

impl AuditAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            AuditAction::RuleCreated => "rule_created",
            AuditAction::RuleUpdated => "rule_updated",
            AuditAction::RuleDeleted => "rule_deleted",
            AuditAction::DeploySucceeded => "deploy_succeeded",
            AuditAction::DeploySkipped => "deploy_skipped",
            AuditAction::DeployFailed => "deploy_failed",
            AuditAction::RollbackSucceeded => "rollback_succeeded",
            AuditAction::RollbackSkipped => "rollback_skipped",
            AuditAction::RollbackFailed => "rollback_failed",
        }
    }
}

/// What an entry is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AuditTarget {
    Rule(RuleId),
    Version(Uuid),
}

impl std::fmt::Display for AuditTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditTarget::Rule(id) => write!(f, "rule {id}"),
            AuditTarget::Version(id) => write!(f, "version {id}"),
        }
    }
}

/// A single, sequenced audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<AuditTarget>,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
}

/// An entry before the log assigns it an id and timestamp
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub action: AuditAction,
    pub severity: Severity,
    pub actor: String,
    pub message: String,
    pub target: Option<AuditTarget>,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
}

impl AuditRecord {
    pub fn new(
        action: AuditAction,
        severity: Severity,
        actor: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            action,
            severity,
            actor: actor.into(),
            message: message.into(),
            target: None,
            before: None,
            after: None,
        }
    }

    #[must_use]
    pub fn with_target(mut self, target: AuditTarget) -> Self {
        self.target = Some(target);
        self
    }

    /// Attaches the serialized state before the change.
    #[must_use]
    pub fn with_before<T: Serialize>(mut self, value: &T) -> Self {
        self.before = serde_json::to_value(value).ok();
        self
    }

    /// Attaches the serialized state after the change.
    #[must_use]
    pub fn with_after<T: Serialize>(mut self, value: &T) -> Self {
        self.after = serde_json::to_value(value).ok();
        self
    }
}

/// Criteria for [`AuditLog::query`]; every set field must match.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub action: Option<AuditAction>,
    pub actor: Option<String>,
    pub target: Option<AuditTarget>,
    pub severity: Option<Severity>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.action.is_none_or(|a| entry.action == a)
            && self.actor.as_ref().is_none_or(|a| &entry.actor == a)
            && self.target.is_none_or(|t| entry.target == Some(t))
            && self.severity.is_none_or(|s| entry.severity == s)
            && self.since.is_none_or(|t| entry.timestamp >= t)
            && self.until.is_none_or(|t| entry.timestamp <= t)
    }
}

/// Resume point for a query: continue with entries older than `before_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditCursor {
    pub before_id: u64,
}

/// Audit log shared by every component
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
    sink: Option<PathBuf>,
    sink_lock: tokio::sync::Mutex<()>,
}

impl AuditLog {
    /// Creates a log that lives only in memory
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens (or creates) a log backed by a JSON-lines file.
    ///
    /// Existing entries are loaded so ids keep increasing across restarts.
    /// Lines that fail to parse are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file exists but cannot be read.
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let mut entries = Vec::new();

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                for (lineno, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<AuditEntry>(line) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => tracing::warn!(
                            "Skipping unreadable audit line {} in {}: {}",
                            lineno + 1,
                            path.display(),
                            e
                        ),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        entries.sort_by_key(|e| e.id);
        entries.dedup_by_key(|e| e.id);
        tracing::debug!("Loaded {} audit entries from {}", entries.len(), path.display());

        Ok(Self {
            entries: Arc::new(RwLock::new(entries)),
            sink: Some(path),
            sink_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.sink.as_deref()
    }

    /// Appends an entry, returning it with its assigned id and timestamp.
    pub async fn append(&self, record: AuditRecord) -> AuditEntry {
        let entry = self.record(record);
        self.persist(&entry).await;
        entry
    }

    /// Assigns an id and timestamp and stores the entry in memory only.
    pub(crate) fn record(&self, record: AuditRecord) -> AuditEntry {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let (id, timestamp) = match entries.last() {
            Some(last) => (last.id + 1, Utc::now().max(last.timestamp)),
            None => (1, Utc::now()),
        };
        let entry = AuditEntry {
            id,
            timestamp,
            action: record.action,
            actor: record.actor,
            target: record.target,
            severity: record.severity,
            message: record.message,
            before: record.before,
            after: record.after,
        };
        entries.push(entry.clone());
        entry
    }

    /// Writes an already recorded entry to the sink, if there is one.
    pub(crate) async fn persist(&self, entry: &AuditEntry) {
        if let Some(path) = &self.sink {
            let _guard = self.sink_lock.lock().await;
            if let Err(e) = Self::write_line(path, entry).await {
                tracing::warn!("Failed to write audit log: {}", e);
            }
        }
    }

    /// Like [`Self::persist`], for callers that cannot await.
    ///
    /// The write runs on the current tokio runtime. Outside a runtime the
    /// entry is kept in memory only.
    pub(crate) fn persist_detached(log: &Arc<Self>, entry: AuditEntry) {
        if log.sink.is_none() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let log = Arc::clone(log);
                handle.spawn(async move { log.persist(&entry).await });
            }
            Err(_) => tracing::warn!(
                "Audit entry {} not written to disk: no runtime available",
                entry.id
            ),
        }
    }

    async fn write_line(path: &Path, entry: &AuditEntry) -> std::io::Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the entry with the given id
    pub fn get(&self, id: u64) -> Option<AuditEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|idx| entries[idx].clone())
    }

    /// Lazily iterates matching entries, newest first, up to `limit`.
    pub fn query(&self, filter: AuditFilter, limit: usize) -> AuditQuery {
        AuditQuery::new(Arc::clone(&self.entries), filter, limit, None)
    }

    /// Continues a previous query from its cursor.
    pub fn query_from(&self, cursor: AuditCursor, filter: AuditFilter, limit: usize) -> AuditQuery {
        AuditQuery::new(
            Arc::clone(&self.entries),
            filter,
            limit,
            Some(cursor.before_id),
        )
    }

    /// The `count` most recent entries, newest first
    pub fn recent(&self, count: usize) -> Vec<AuditEntry> {
        self.query(AuditFilter::default(), count).collect()
    }
}

/// Lazy, restartable iterator over audit entries (newest first)
#[derive(Debug)]
pub struct AuditQuery {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
    filter: AuditFilter,
    remaining: usize,
    /// Exclusive upper bound of the next scan
    scan_before: Option<u64>,
    last_yielded: Option<u64>,
    buffer: VecDeque<AuditEntry>,
    exhausted: bool,
}

impl AuditQuery {
    fn new(
        entries: Arc<RwLock<Vec<AuditEntry>>>,
        filter: AuditFilter,
        limit: usize,
        before_id: Option<u64>,
    ) -> Self {
        // Pin the upper bound so entries appended mid-iteration are not seen
        let scan_before = before_id.or_else(|| {
            entries
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .last()
                .map(|e| e.id + 1)
        });
        Self {
            entries,
            filter,
            remaining: limit,
            scan_before,
            last_yielded: before_id,
            buffer: VecDeque::new(),
            exhausted: scan_before.is_none(),
        }
    }

    /// Cursor to resume after the last entry yielded so far.
    pub fn cursor(&self) -> Option<AuditCursor> {
        self.last_yielded.map(|before_id| AuditCursor { before_id })
    }

    fn refill(&mut self) {
        let Some(bound) = self.scan_before else {
            self.exhausted = true;
            return;
        };

        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let end = entries.partition_point(|e| e.id < bound);
        let mut idx = end;
        let mut scanned = 0;

        while idx > 0 && self.buffer.len() < QUERY_PAGE && scanned < QUERY_PAGE * 4 {
            idx -= 1;
            scanned += 1;
            let entry = &entries[idx];
            if self.filter.matches(entry) {
                self.buffer.push_back(entry.clone());
            }
        }

        if idx == 0 {
            self.exhausted = true;
            self.scan_before = None;
        } else {
            self.scan_before = Some(entries[idx].id);
        }
    }
}

impl Iterator for AuditQuery {
    type Item = AuditEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        while self.buffer.is_empty() {
            if self.exhausted {
                return None;
            }
            self.refill();
        }
        let entry = self.buffer.pop_front()?;
        self.remaining -= 1;
        self.last_yielded = Some(entry.id);
        Some(entry)
    }
}

//! Engine facade
//!
//! [`Firewall`] wires the shared state, audit log, rule store, deploy
//! coordinator and rollback executor together. It is the only type the
//! presentation layer needs.
//!
//! # Example
//!
//! ```
//! use fwvault::audit::AuditLog;
//! use fwvault::command::{CreateRuleCommand, DeployCommand};
//! use fwvault::config::EngineConfig;
//! use fwvault::core::backend::DryRunBackend;
//! use fwvault::core::engine::Firewall;
//! use fwvault::core::firewall::RuleSpec;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let fw = Firewall::new(&EngineConfig::default(), DryRunBackend, AuditLog::in_memory());
//! fw.rules()
//!     .create(CreateRuleCommand::new("alice", RuleSpec::new("filter", "INPUT", "ACCEPT")))
//!     .await
//!     .unwrap();
//! let outcome = fw.deploy(DeployCommand::new("alice", "first")).await.unwrap();
//! assert_eq!(fw.active_version().await.unwrap().id, outcome.version_id());
//! # });
//! ```

use crate::audit::AuditLog;
use crate::command::{DeployCommand, RollbackCommand};
use crate::config::EngineConfig;
use crate::core::backend::EnforcementBackend;
use crate::core::deploy::{DeployCoordinator, DeployOutcome, DeployPhase, DeployReport};
use crate::core::error::{Error, Result};
use crate::core::rollback::RollbackExecutor;
use crate::core::state::{FirewallState, RuleCounts};
use crate::core::store::RuleStore;
use crate::core::versions::{
    HistoryCursor, HistoryPage, Version, VersionManager, VersionSummary, diff_rulesets,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

/// Everything a status display needs in one call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub phase: DeployPhase,
    pub backend: String,
    pub active_version: Option<VersionSummary>,
    pub version_count: usize,
    pub rules: RuleCounts,
    /// Working set differs from the active version
    pub has_undeployed_changes: bool,
    pub last_run: Option<DeployReport>,
    pub audit_entries: usize,
}

/// Versioned firewall rule engine
#[derive(Debug)]
pub struct Firewall<B> {
    state: Arc<Mutex<FirewallState>>,
    audit: Arc<AuditLog>,
    versions: VersionManager,
    store: RuleStore,
    coordinator: Arc<DeployCoordinator<B>>,
    rollback: RollbackExecutor<B>,
}

impl<B: EnforcementBackend> Firewall<B> {
    /// Engine with an empty working set and no history.
    pub fn new(config: &EngineConfig, backend: B, audit: AuditLog) -> Self {
        Self::with_state(config, backend, audit, FirewallState::new())
    }

    /// Engine resuming from previously saved state.
    pub fn with_state(
        config: &EngineConfig,
        backend: B,
        audit: AuditLog,
        state: FirewallState,
    ) -> Self {
        Self::build(
            backend,
            audit,
            state,
            config.require_non_empty_baseline,
            config.apply_timeout(),
        )
    }

    /// Like [`Self::with_state`] with an explicit apply timeout (sub-second
    /// timeouts are allowed here, unlike in the config file).
    pub fn with_timeout(
        config: &EngineConfig,
        backend: B,
        audit: AuditLog,
        state: FirewallState,
        apply_timeout: Duration,
    ) -> Self {
        Self::build(
            backend,
            audit,
            state,
            config.require_non_empty_baseline,
            apply_timeout,
        )
    }

    fn build(
        backend: B,
        audit: AuditLog,
        state: FirewallState,
        require_non_empty: bool,
        apply_timeout: Duration,
    ) -> Self {
        let state = Arc::new(Mutex::new(state));
        let audit = Arc::new(audit);
        let versions = VersionManager::new(require_non_empty);
        let store = RuleStore::new(Arc::clone(&state), Arc::clone(&audit));
        let coordinator = Arc::new(DeployCoordinator::new(
            Arc::clone(&state),
            Arc::clone(&audit),
            versions.clone(),
            backend,
            apply_timeout,
        ));
        let rollback = RollbackExecutor::new(Arc::clone(&state), Arc::clone(&coordinator));

        Self {
            state,
            audit,
            versions,
            store,
            coordinator,
            rollback,
        }
    }

    /// Working-set operations
    pub fn rules(&self) -> &RuleStore {
        &self.store
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn backend(&self) -> &B {
        self.coordinator.backend()
    }

    /// # Errors
    ///
    /// See [`DeployCoordinator::deploy`].
    pub async fn deploy(&self, cmd: DeployCommand) -> Result<DeployOutcome> {
        self.coordinator.deploy(cmd).await
    }

    /// # Errors
    ///
    /// See [`RollbackExecutor::rollback`].
    pub async fn rollback(&self, cmd: RollbackCommand) -> Result<DeployOutcome> {
        self.rollback.rollback(cmd).await
    }

    /// Observes deploy phases
    pub fn subscribe(&self) -> watch::Receiver<DeployPhase> {
        self.coordinator.subscribe()
    }

    pub async fn history(&self, limit: usize, cursor: Option<&HistoryCursor>) -> HistoryPage {
        let state = self.state.lock().await;
        self.versions.history(&state, limit, cursor)
    }

    /// # Errors
    ///
    /// [`Error::NotFound`] if no version has this id.
    pub async fn version(&self, id: Uuid) -> Result<Version> {
        let state = self.state.lock().await;
        self.versions.get(&state, id)
    }

    pub async fn active_version(&self) -> Option<Version> {
        let state = self.state.lock().await;
        self.versions.active(&state)
    }

    /// Unified diff between two versions.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if either version is unknown.
    pub async fn diff(&self, from: Uuid, to: Uuid) -> Result<String> {
        let state = self.state.lock().await;
        self.versions.diff(&state, from, to)
    }

    /// Diff from the active version (or nothing) to the working set.
    pub async fn pending_diff(&self) -> String {
        let state = self.state.lock().await;
        let empty = crate::core::firewall::RuleSet::new();
        let active = state.active_version().map_or(&empty, |v| &v.rules);
        diff_rulesets(active, &state.working, "active", "working")
    }

    /// iptables-style listing of a version, or of the working set for `None`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the version is unknown.
    pub async fn export(&self, version: Option<Uuid>) -> Result<String> {
        let state = self.state.lock().await;
        match version {
            None => Ok(state.working.to_iptables_text()),
            Some(id) => state
                .version(id)
                .map(|v| v.rules.to_iptables_text())
                .ok_or_else(|| Error::version_not_found(id)),
        }
    }

    pub async fn status(&self) -> SystemStatus {
        let deploy = self.coordinator.status();
        let state = self.state.lock().await;
        let active = state.active_version();
        let has_undeployed_changes = match active {
            Some(v) => v.hash != state.working.content_hash(),
            None => !state.working.is_empty(),
        };

        SystemStatus {
            phase: deploy.phase,
            backend: self.coordinator.backend().name().to_string(),
            active_version: active.map(Version::summary),
            version_count: state.versions.len(),
            rules: state.rule_counts(),
            has_undeployed_changes,
            last_run: deploy.last_run,
            audit_entries: self.audit.len(),
        }
    }

    /// Copy of the full state, for persistence
    pub async fn snapshot_state(&self) -> FirewallState {
        self.state.lock().await.clone()
    }
}

//! Deploy pipeline
//!
//! A deploy walks through a fixed sequence of phases:
//!
//! ```text
//! IDLE -> VALIDATING -> BUILDING_SNAPSHOT -> APPLYING -> ACTIVE -> IDLE
//!                                                 \----> FAILED -> IDLE
//! ```
//!
//! Only one deploy or rollback runs at a time. A second caller gets
//! [`Error::DeployInProgress`] immediately instead of queueing.
//!
//! # Locking
//!
//! Validation and snapshotting happen in one critical section on the state
//! lock. The lock is released while the backend applies, so rule edits and
//! reads stay responsive during a slow apply. Activation re-takes the lock.
//! A rule edited while its snapshot is being applied keeps its new DRAFT
//! status: only rules whose token still matches the snapshot are promoted.
//! The same holds for rollbacks: rules created, edited or deleted during
//! the apply are left as the editor left them.
//!
//! # Failure
//!
//! When the backend refuses or times out, the previously active version is
//! left untouched, the new version stays in history as inactive, and the
//! affected rules go back to PENDING so the deploy can be retried.
//! Dropping the pipeline future while the backend applies counts as a
//! failure too: the phase returns to IDLE and the cancellation is audited.

use crate::audit::{AuditAction, AuditLog, AuditRecord, AuditTarget, Severity};
use crate::command::{Command, DeployCommand};
use crate::core::backend::{BackendError, EnforcementBackend};
use crate::core::error::{Error, Result};
use crate::core::firewall::{Rule, RuleId, RuleSet, RuleStatus};
use crate::core::state::{FirewallState, Tombstone};
use crate::core::versions::{Version, VersionManager, VersionSummary};
use crate::validators;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Pipeline phase, observable through [`DeployCoordinator::subscribe`]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployPhase {
    #[default]
    Idle,
    Validating,
    BuildingSnapshot,
    Applying,
    Active,
    Failed,
}

/// Result of a deploy or rollback that did not fail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeployOutcome {
    /// A new version was applied and is now active
    Deployed { version: VersionSummary },
    /// The candidate matched the active version; nothing was applied
    Skipped { active: Uuid },
}

impl DeployOutcome {
    pub fn version_id(&self) -> Uuid {
        match self {
            DeployOutcome::Deployed { version } => version.id,
            DeployOutcome::Skipped { active } => *active,
        }
    }
}

/// How the last pipeline run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RunResult {
    Succeeded,
    Skipped,
    Failed,
}

/// Summary of the last completed pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployReport {
    pub result: RunResult,
    pub rollback: bool,
    pub version_id: Option<Uuid>,
    pub actor: String,
    pub message: String,
    pub finished_at: DateTime<Utc>,
}

/// Snapshot of the coordinator for status displays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployStatus {
    pub phase: DeployPhase,
    pub last_run: Option<DeployReport>,
}

/// What the pipeline should apply
#[derive(Debug, Clone)]
pub(crate) enum Candidate {
    /// The current working set
    WorkingSet,
    /// The rules of a historical version
    Rollback { from: Uuid, rules: RuleSet },
}

/// A single pipeline run request
#[derive(Debug, Clone)]
pub(crate) struct DeployRequest {
    pub actor: String,
    pub description: String,
    pub candidate: Candidate,
}

impl DeployRequest {
    fn is_rollback(&self) -> bool {
        matches!(self.candidate, Candidate::Rollback { .. })
    }

    fn succeeded_action(&self) -> AuditAction {
        if self.is_rollback() {
            AuditAction::RollbackSucceeded
        } else {
            AuditAction::DeploySucceeded
        }
    }

    fn skipped_action(&self) -> AuditAction {
        if self.is_rollback() {
            AuditAction::RollbackSkipped
        } else {
            AuditAction::DeploySkipped
        }
    }

    fn failed_action(&self) -> AuditAction {
        if self.is_rollback() {
            AuditAction::RollbackFailed
        } else {
            AuditAction::DeployFailed
        }
    }

    fn noun(&self) -> &'static str {
        if self.is_rollback() {
            "Rollback"
        } else {
            "Deploy"
        }
    }
}

/// Proof that the caller holds the single deploy slot
pub struct DeployPermit<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// Runs deploys and rollbacks one at a time
#[derive(Debug)]
pub struct DeployCoordinator<B> {
    state: Arc<Mutex<FirewallState>>,
    audit: Arc<AuditLog>,
    versions: VersionManager,
    backend: B,
    apply_timeout: Duration,
    slot: Mutex<()>,
    phase: watch::Sender<DeployPhase>,
    last_run: std::sync::Mutex<Option<DeployReport>>,
}

impl<B: EnforcementBackend> DeployCoordinator<B> {
    pub(crate) fn new(
        state: Arc<Mutex<FirewallState>>,
        audit: Arc<AuditLog>,
        versions: VersionManager,
        backend: B,
        apply_timeout: Duration,
    ) -> Self {
        let (phase, _) = watch::channel(DeployPhase::Idle);
        Self {
            state,
            audit,
            versions,
            backend,
            apply_timeout,
            slot: Mutex::new(()),
            phase,
            last_run: std::sync::Mutex::new(None),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn phase(&self) -> DeployPhase {
        *self.phase.borrow()
    }

    /// Receiver that observes every phase change
    pub fn subscribe(&self) -> watch::Receiver<DeployPhase> {
        self.phase.subscribe()
    }

    pub fn status(&self) -> DeployStatus {
        DeployStatus {
            phase: self.phase(),
            last_run: self
                .last_run
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Snapshots the working set and applies it.
    ///
    /// # Errors
    ///
    /// - [`Error::DeployInProgress`] if another deploy or rollback is running
    /// - [`Error::Validation`] if any rule fails validation (nothing is recorded)
    /// - [`Error::EmptyRuleSet`] if the working set is empty and the policy forbids it
    /// - [`Error::BackendApplyFailure`] if the backend refuses or times out
    pub async fn deploy(&self, cmd: DeployCommand) -> Result<DeployOutcome> {
        cmd.check().map_err(Error::Validation)?;
        let permit = self.acquire()?;
        info!("{} by {}", cmd.describe(), cmd.actor);
        self.run(
            &permit,
            DeployRequest {
                actor: cmd.actor,
                description: cmd.description,
                candidate: Candidate::WorkingSet,
            },
        )
        .await
    }

    /// Claims the deploy slot without waiting.
    pub(crate) fn acquire(&self) -> Result<DeployPermit<'_>> {
        self.slot
            .try_lock()
            .map(|guard| DeployPermit { _guard: guard })
            .map_err(|_| {
                warn!("Deploy requested while another is in progress");
                Error::DeployInProgress
            })
    }

    fn set_phase(&self, phase: DeployPhase) {
        self.phase.send_replace(phase);
        tracing::debug!("Deploy phase: {}", phase);
    }

    fn finish(&self, phase: DeployPhase, report: DeployReport) {
        self.set_phase(phase);
        *self.last_run.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
        self.set_phase(DeployPhase::Idle);
    }

    /// Records a terminal run: audit entry in memory first, then the
    /// status update, then the durable audit write.
    async fn conclude(&self, phase: DeployPhase, report: DeployReport, record: AuditRecord) {
        let entry = self.audit.record(record);
        self.finish(phase, report);
        self.audit.persist(&entry).await;
    }

    /// Fails a run whose future was dropped while the backend applied.
    fn cancelled(&self, request: &DeployRequest, version_id: Uuid) {
        let message = format!(
            "{} of version {} cancelled while applying",
            request.noun(),
            version_id
        );
        error!("{}", message);
        let entry = self.audit.record(
            AuditRecord::new(
                request.failed_action(),
                Severity::Error,
                &request.actor,
                message.clone(),
            )
            .with_target(AuditTarget::Version(version_id)),
        );
        self.finish(
            DeployPhase::Failed,
            Self::report(request, RunResult::Failed, Some(version_id), message),
        );
        AuditLog::persist_detached(&self.audit, entry);
    }

    fn report(
        request: &DeployRequest,
        result: RunResult,
        version_id: Option<Uuid>,
        message: String,
    ) -> DeployReport {
        DeployReport {
            result,
            rollback: request.is_rollback(),
            version_id,
            actor: request.actor.clone(),
            message,
            finished_at: Utc::now(),
        }
    }

    /// Runs the pipeline for `request`. The permit ties the run to the slot.
    pub(crate) async fn run(
        &self,
        _permit: &DeployPermit<'_>,
        request: DeployRequest,
    ) -> Result<DeployOutcome> {
        // VALIDATING + BUILDING_SNAPSHOT under one lock acquisition
        let (version, baseline) = {
            let mut state = self.state.lock().await;
            self.set_phase(DeployPhase::Validating);

            let candidate = match &request.candidate {
                Candidate::WorkingSet => state.working.clone(),
                Candidate::Rollback { rules, .. } => rules.clone(),
            };

            if let Err(errors) = validators::validate_ruleset(&candidate) {
                let message = format!(
                    "{} rejected: {} rule validation error(s)",
                    request.noun(),
                    errors.len()
                );
                warn!("{}", message);
                drop(state);
                self.conclude(
                    DeployPhase::Failed,
                    Self::report(&request, RunResult::Failed, None, message.clone()),
                    AuditRecord::new(
                        request.failed_action(),
                        Severity::Error,
                        &request.actor,
                        message,
                    )
                    .with_after(&errors),
                )
                .await;
                return Err(Error::Validation(errors));
            }

            self.set_phase(DeployPhase::BuildingSnapshot);

            let hash = candidate.content_hash();
            if let Some(active) = state.active_version()
                && active.hash == hash
            {
                let active_id = active.id;
                let active_rules = active.rules.clone();
                let promoted = promote_unchanged(&mut state, &active_rules);
                let message = format!(
                    "{} skipped — no changes (version {} already active)",
                    request.noun(),
                    active_id
                );
                info!("{}", message);
                if !promoted.is_empty() {
                    info!("Rules {:?} match the active version; marked applied", promoted);
                }
                drop(state);
                self.conclude(
                    DeployPhase::Idle,
                    Self::report(&request, RunResult::Skipped, Some(active_id), message.clone()),
                    AuditRecord::new(
                        request.skipped_action(),
                        Severity::Info,
                        &request.actor,
                        message,
                    )
                    .with_target(AuditTarget::Version(active_id)),
                )
                .await;
                return Ok(DeployOutcome::Skipped { active: active_id });
            }

            let baseline: BTreeMap<RuleId, DateTime<Utc>> = state
                .working
                .ordered()
                .into_iter()
                .map(|r| (r.id, r.updated_at))
                .collect();

            let mut version = match self.versions.snapshot(
                &mut state,
                candidate,
                &request.actor,
                &request.description,
            ) {
                Ok(version) => version,
                Err(e) => {
                    let message = format!("{} rejected: {e}", request.noun());
                    warn!("{}", message);
                    drop(state);
                    self.conclude(
                        DeployPhase::Failed,
                        Self::report(&request, RunResult::Failed, None, message.clone()),
                        AuditRecord::new(
                            request.failed_action(),
                            Severity::Error,
                            &request.actor,
                            message,
                        ),
                    )
                    .await;
                    return Err(e);
                }
            };

            if let Candidate::Rollback { from, .. } = request.candidate {
                version.rollback_of = Some(from);
                if let Some(recorded) = state.versions.iter_mut().find(|v| v.id == version.id) {
                    recorded.rollback_of = Some(from);
                }
            }

            mark_matching(&mut state, &version.rules, RuleStatus::Pending);
            (version, baseline)
        };

        // APPLYING, without the state lock
        let guard = ApplyGuard {
            coordinator: self,
            request: &request,
            version_id: version.id,
            armed: true,
        };
        self.set_phase(DeployPhase::Applying);
        info!(
            "Applying version {} ({} rules) via {}",
            version.id,
            version.rules.len(),
            self.backend.name()
        );
        let applied = match tokio::time::timeout(self.apply_timeout, self.backend.apply(&version.rules))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                timeout_secs: self.apply_timeout.as_secs().max(1),
            }),
        };

        let mut state = self.state.lock().await;
        guard.disarm();
        match applied {
            Ok(()) => {
                if let Err(e) = self.versions.activate(&mut state, version.id) {
                    // Only reachable if the snapshot vanished from history
                    error!("Activation of {} failed: {}", version.id, e);
                    drop(state);
                    self.finish(
                        DeployPhase::Failed,
                        Self::report(&request, RunResult::Failed, Some(version.id), e.to_string()),
                    );
                    return Err(e);
                }

                let dropped = match &request.candidate {
                    Candidate::WorkingSet => {
                        mark_matching(&mut state, &version.rules, RuleStatus::Applied);
                        Vec::new()
                    }
                    Candidate::Rollback { .. } => {
                        replace_working_set(&mut state, &version.rules, &baseline, &request.actor)
                    }
                };

                let summary = state
                    .version(version.id)
                    .map_or_else(|| version.summary(), Version::summary);
                let mut message = format!(
                    "{} of version {} succeeded ({} rules)",
                    request.noun(),
                    version.id,
                    version.rules.len()
                );
                if !dropped.is_empty() {
                    message.push_str(&format!("; removed rules {dropped:?} from working set"));
                }
                info!("{}", message);
                drop(state);

                self.conclude(
                    DeployPhase::Active,
                    Self::report(&request, RunResult::Succeeded, Some(version.id), message.clone()),
                    AuditRecord::new(
                        request.succeeded_action(),
                        Severity::Success,
                        &request.actor,
                        message,
                    )
                    .with_target(AuditTarget::Version(version.id))
                    .with_after(&summary),
                )
                .await;
                Ok(DeployOutcome::Deployed { version: summary })
            }
            Err(source) => {
                mark_matching(&mut state, &version.rules, RuleStatus::Pending);
                debug_assert!(state.active_count() <= 1);
                drop(state);

                let message = format!(
                    "{} of version {} failed: {}",
                    request.noun(),
                    version.id,
                    source
                );
                error!("{}", message);
                self.conclude(
                    DeployPhase::Failed,
                    Self::report(&request, RunResult::Failed, Some(version.id), message.clone()),
                    AuditRecord::new(
                        request.failed_action(),
                        Severity::Error,
                        &request.actor,
                        message,
                    )
                    .with_target(AuditTarget::Version(version.id))
                    .with_after(&source),
                )
                .await;
                Err(Error::BackendApplyFailure {
                    version_id: version.id,
                    source,
                })
            }
        }
    }
}

/// Fails the run if it is dropped between APPLYING and re-taking the state lock
struct ApplyGuard<'a, B: EnforcementBackend> {
    coordinator: &'a DeployCoordinator<B>,
    request: &'a DeployRequest,
    version_id: Uuid,
    armed: bool,
}

impl<B: EnforcementBackend> ApplyGuard<'_, B> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<B: EnforcementBackend> Drop for ApplyGuard<'_, B> {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.cancelled(self.request, self.version_id);
        }
    }
}

/// Sets `status` on working-set rules whose token still matches the snapshot.
fn mark_matching(state: &mut FirewallState, snapshot: &RuleSet, status: RuleStatus) {
    for rule in state.working.iter_mut() {
        if let Some(snap) = snapshot.get(rule.id)
            && snap.updated_at == rule.updated_at
        {
            rule.status = status;
        }
    }
}

/// Marks working-set rules whose definition equals the active one as APPLIED.
///
/// Returns the ids that changed status.
fn promote_unchanged(state: &mut FirewallState, active: &RuleSet) -> Vec<RuleId> {
    let mut promoted = Vec::new();
    for rule in state.working.iter_mut() {
        if rule.status != RuleStatus::Applied
            && active
                .get(rule.id)
                .is_some_and(|live| live.definition == rule.definition)
        {
            rule.status = RuleStatus::Applied;
            promoted.push(rule.id);
        }
    }
    promoted
}

/// Makes the working set mirror a rolled-back version.
///
/// `baseline` holds the working-set tokens taken when the version was
/// snapshotted. Rules created, edited or deleted since then are left alone
/// and stay DRAFT. Untouched rules absent from the version are tombstoned.
/// Returns their ids.
fn replace_working_set(
    state: &mut FirewallState,
    rules: &RuleSet,
    baseline: &BTreeMap<RuleId, DateTime<Utc>>,
    actor: &str,
) -> Vec<RuleId> {
    let untouched = |rule: &Rule| baseline.get(&rule.id) == Some(&rule.updated_at);

    let now = Utc::now();
    let dropped: Vec<RuleId> = state
        .working
        .ordered()
        .into_iter()
        .filter(|r| !rules.contains(r.id) && untouched(r))
        .map(|r| r.id)
        .collect();

    for id in &dropped {
        if let Some(rule) = state.working.remove(*id) {
            state.tombstones.push(Tombstone {
                rule,
                deleted_at: now,
                deleted_by: actor.to_string(),
            });
        }
    }

    for rule in rules.ordered() {
        let edited = match state.working.get(rule.id) {
            Some(current) => !untouched(current),
            // Deleted after the snapshot was taken
            None => baseline.contains_key(&rule.id),
        };
        if edited {
            warn!("Rule {} changed during rollback; keeping the edit", rule.id);
            continue;
        }
        let mut restored = rule.clone();
        restored.status = RuleStatus::Applied;
        state.working.insert(restored);
    }

    dropped
}

//! Rollback to a historical version
//!
//! A rollback never re-activates the old version in place. It re-runs the
//! deploy pipeline with the old version's rules, which records a new forward
//! version pointing back at its source (`rollback_of`). History stays
//! strictly append-only and a failed rollback behaves exactly like a failed
//! deploy: the current active version is kept.

use crate::command::{Command, RollbackCommand};
use crate::core::backend::EnforcementBackend;
use crate::core::deploy::{Candidate, DeployCoordinator, DeployOutcome, DeployRequest};
use crate::core::error::{Error, Result};
use crate::core::state::FirewallState;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Re-applies historical versions through the deploy pipeline
#[derive(Debug)]
pub struct RollbackExecutor<B> {
    state: Arc<Mutex<FirewallState>>,
    coordinator: Arc<DeployCoordinator<B>>,
}

impl<B: EnforcementBackend> RollbackExecutor<B> {
    pub(crate) fn new(
        state: Arc<Mutex<FirewallState>>,
        coordinator: Arc<DeployCoordinator<B>>,
    ) -> Self {
        Self { state, coordinator }
    }

    /// Rolls back to `cmd.version_id`.
    ///
    /// # Errors
    ///
    /// - [`Error::DeployInProgress`] if a deploy or rollback is running
    /// - [`Error::NotFound`] if the version does not exist
    /// - [`Error::AlreadyActive`] if the version is the active one
    /// - [`Error::BackendApplyFailure`] if the backend refuses or times out
    pub async fn rollback(&self, cmd: RollbackCommand) -> Result<DeployOutcome> {
        cmd.check().map_err(Error::Validation)?;
        let permit = self.coordinator.acquire()?;

        let rules = {
            let state = self.state.lock().await;
            let target = state
                .version(cmd.version_id)
                .ok_or_else(|| Error::version_not_found(cmd.version_id))?;
            if target.is_active {
                return Err(Error::AlreadyActive(cmd.version_id));
            }
            target.rules.clone()
        };

        info!("{} by {}", cmd.describe(), cmd.actor);
        self.coordinator
            .run(
                &permit,
                DeployRequest {
                    description: cmd.version_description(),
                    actor: cmd.actor,
                    candidate: Candidate::Rollback {
                        from: cmd.version_id,
                        rules,
                    },
                },
            )
            .await
    }
}

//! Enforcement backends
//!
//! The deploy pipeline hands a complete rule set to an [`EnforcementBackend`]
//! and waits for confirmation. Backends never see partial rule sets and never
//! touch engine state.
//!
//! - [`CommandBackend`]: pipes the rule set as JSON to an external program
//! - [`DryRunBackend`]: accepts everything without side effects
//! - [`ConfiguredBackend`]: one of the above, chosen from configuration
//!
//! # Command protocol
//!
//! The program receives `{"hash": "...", "rules": [...]}` on stdin (rules in
//! evaluation order, same shape as the rule wire contract). Exit status 0
//! confirms the apply. Any other status is a rejection; stderr becomes the
//! error message. If stderr is a JSON object with an `errors` array of
//! `{"rule_id", "message"}` items, those are reported per rule.

use crate::config::BackendConfig;
use crate::core::firewall::{RuleId, RuleSet};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

/// Per-rule detail reported by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFailure {
    pub rule_id: RuleId,
    pub message: String,
}

/// Why a backend did not confirm a rule set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum BackendError {
    #[error("backend rejected the rule set: {message}")]
    Rejected {
        message: String,
        #[serde(default)]
        rule_errors: Vec<RuleFailure>,
    },

    #[error("backend did not confirm within {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
            rule_errors: Vec::new(),
        }
    }

    pub fn rule_errors(&self) -> &[RuleFailure] {
        match self {
            BackendError::Rejected { rule_errors, .. } => rule_errors,
            _ => &[],
        }
    }
}

/// Something that can enforce a complete rule set
pub trait EnforcementBackend: Send + Sync {
    /// Applies the whole rule set. Returning `Ok` means the backend confirmed
    /// every rule is in force.
    fn apply(&self, ruleset: &RuleSet) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Short name for logs and status output
    fn name(&self) -> &str;
}

#[derive(Serialize)]
struct ApplyPayload<'a> {
    hash: String,
    rules: &'a RuleSet,
}

#[derive(Deserialize)]
struct StructuredErrors {
    errors: Vec<RuleFailure>,
}

/// Runs an external program for every apply
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    elevate: bool,
}

impl CommandBackend {
    /// `argv[0]` is the program, the rest are its arguments.
    ///
    /// Returns `None` for an empty argv.
    pub fn new(argv: &[String], elevate: bool) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            elevate,
        })
    }

    fn build_command(&self) -> tokio::process::Command {
        let needs_sudo = self.elevate && !nix::unistd::getuid().is_root();
        let mut cmd = if needs_sudo {
            let mut cmd = tokio::process::Command::new("sudo");
            // Non-interactive: never block a deploy on a password prompt
            cmd.arg("-n").arg(&self.program);
            cmd
        } else {
            tokio::process::Command::new(&self.program)
        };
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn parse_failure(stderr: &str, code: Option<i32>) -> BackendError {
        let trimmed = stderr.trim();
        if let Ok(structured) = serde_json::from_str::<StructuredErrors>(trimmed) {
            let message = structured
                .errors
                .iter()
                .map(|e| format!("rule {}: {}", e.rule_id, e.message))
                .collect::<Vec<_>>()
                .join("; ");
            return BackendError::Rejected {
                message,
                rule_errors: structured.errors,
            };
        }

        let message = if trimmed.is_empty() {
            match code {
                Some(code) => format!("exited with status {code}"),
                None => "terminated by signal".to_string(),
            }
        } else {
            trimmed.to_string()
        };
        BackendError::rejected(message)
    }
}

impl EnforcementBackend for CommandBackend {
    async fn apply(&self, ruleset: &RuleSet) -> Result<(), BackendError> {
        let payload = serde_json::to_vec(&ApplyPayload {
            hash: ruleset.content_hash(),
            rules: ruleset,
        })
        .map_err(|e| BackendError::Unavailable(format!("Failed to encode rule set: {e}")))?;

        info!(
            "Applying {} rules via {} {:?}",
            ruleset.len(),
            self.program,
            self.args
        );

        let mut child = self.build_command().spawn().map_err(|e| {
            error!("Failed to spawn backend {}: {e}", self.program);
            BackendError::Unavailable(format!("Failed to spawn {}: {e}", self.program))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A backend that exits without reading stdin is judged by its exit status
            match stdin.write_all(&payload).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    warn!("Backend closed stdin early");
                }
                Err(e) => {
                    return Err(BackendError::Unavailable(format!(
                        "Failed to write rule set: {e}"
                    )));
                }
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackendError::Unavailable(format!("Failed to wait for backend: {e}")))?;

        if output.status.success() {
            info!("Backend confirmed {} rules", ruleset.len());
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("Backend apply failed: {}", stderr.trim());
            Err(Self::parse_failure(&stderr, output.status.code()))
        }
    }

    fn name(&self) -> &str {
        &self.program
    }
}

/// Accepts every rule set without enforcing anything
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunBackend;

impl EnforcementBackend for DryRunBackend {
    async fn apply(&self, ruleset: &RuleSet) -> Result<(), BackendError> {
        info!(
            "Dry run: would apply {} rules (hash {})",
            ruleset.len(),
            ruleset.content_hash()
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "dry-run"
    }
}

/// Backend selected at runtime from [`BackendConfig`]
#[derive(Debug, Clone)]
pub enum ConfiguredBackend {
    Command(CommandBackend),
    DryRun(DryRunBackend),
}

impl ConfiguredBackend {
    /// An empty command selects the dry-run backend.
    pub fn from_config(config: &BackendConfig) -> Self {
        let argv = config.command();
        match CommandBackend::new(&argv, config.elevate) {
            Some(backend) => Self::Command(backend),
            None => {
                warn!("No backend command configured; deploys are dry runs");
                Self::DryRun(DryRunBackend)
            }
        }
    }
}

impl EnforcementBackend for ConfiguredBackend {
    async fn apply(&self, ruleset: &RuleSet) -> Result<(), BackendError> {
        match self {
            ConfiguredBackend::Command(backend) => backend.apply(ruleset).await,
            ConfiguredBackend::DryRun(backend) => backend.apply(ruleset).await,
        }
    }

    fn name(&self) -> &str {
        match self {
            ConfiguredBackend::Command(backend) => backend.name(),
            ConfiguredBackend::DryRun(backend) => backend.name(),
        }
    }
}

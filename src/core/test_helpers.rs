//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::backend::{BackendError, EnforcementBackend};
use crate::core::firewall::{Rule, RuleDefinition, RuleId, RuleSet, RuleSpec, RuleStatus};
use crate::validators;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

/// Builds a validated definition; panics on invalid input.
pub fn definition(table: &str, chain: &str, action: &str) -> RuleDefinition {
    validators::validate(&RuleSpec::new(table, chain, action)).expect("valid test rule")
}

/// Wraps a definition in a DRAFT rule with fresh timestamps.
pub fn rule_with(id: RuleId, definition: RuleDefinition) -> Rule {
    let now = Utc::now();
    Rule {
        id,
        definition,
        status: RuleStatus::Draft,
        created_at: now,
        updated_at: now,
    }
}

/// `n` valid filter/INPUT rules with ids `1..=n` and distinct priorities.
pub fn ruleset(n: u64) -> RuleSet {
    RuleSet::from_rules((1..=n).map(|id| {
        let mut d = definition("filter", "INPUT", "ACCEPT");
        d.priority = i32::try_from(id).unwrap_or(i32::MAX);
        rule_with(id, d)
    }))
    .expect("unique ids")
}

/// Behaviour of a [`ScriptedBackend`] apply call
#[derive(Debug, Clone)]
pub enum Script {
    Succeed,
    Fail(String),
    /// Never completes; the coordinator's timeout must fire
    Hang,
    /// Blocks until [`ScriptedBackend::release`] is called, then succeeds
    Gate,
}

#[derive(Debug)]
struct Inner {
    script: Mutex<Script>,
    calls: AtomicUsize,
    applied: Mutex<Vec<RuleSet>>,
    entered: Notify,
    released: Notify,
}

/// In-process backend whose answers are scripted by the test
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    inner: Arc<Inner>,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Self {
        Self {
            inner: Arc::new(Inner {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
                applied: Mutex::new(Vec::new()),
                entered: Notify::new(),
                released: Notify::new(),
            }),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(Script::Succeed)
    }

    pub fn hanging() -> Self {
        Self::new(Script::Hang)
    }

    pub fn gated() -> Self {
        Self::new(Script::Gate)
    }

    pub fn set_script(&self, script: Script) {
        *self
            .inner
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = script;
    }

    /// Number of apply calls so far
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Rule sets that were confirmed, in order
    pub fn applied(&self) -> Vec<RuleSet> {
        self.inner
            .applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolves once a gated apply has started.
    pub async fn wait_until_applying(&self) {
        self.inner.entered.notified().await;
    }

    /// Lets a gated apply finish.
    pub fn release(&self) {
        self.inner.released.notify_one();
    }
}

impl EnforcementBackend for ScriptedBackend {
    async fn apply(&self, ruleset: &RuleSet) -> Result<(), BackendError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .inner
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match script {
            Script::Succeed => {}
            Script::Fail(message) => return Err(BackendError::rejected(message)),
            Script::Hang => std::future::pending::<()>().await,
            Script::Gate => {
                self.inner.entered.notify_one();
                self.inner.released.notified().await;
            }
        }

        self.inner
            .applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ruleset.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

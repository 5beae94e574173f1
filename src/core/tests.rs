//! End-to-end engine tests through the [`Firewall`] facade

use crate::audit::{AuditAction, AuditFilter, AuditLog, Severity};
use crate::command::{
    CreateRuleCommand, DeleteRuleCommand, DeployCommand, RollbackCommand, UpdateRuleCommand,
};
use crate::config::EngineConfig;
use crate::core::backend::BackendError;
use crate::core::deploy::{DeployOutcome, RunResult};
use crate::core::engine::Firewall;
use crate::core::error::Error;
use crate::core::firewall::{Rule, RulePatch, RuleSet, RuleSpec, RuleStatus};
use crate::core::state::FirewallState;
use crate::core::store::RuleFilter;
use crate::core::test_helpers::{Script, ScriptedBackend};
use std::sync::Arc;
use std::time::Duration;

fn engine(backend: ScriptedBackend) -> Firewall<ScriptedBackend> {
    Firewall::with_timeout(
        &EngineConfig::default(),
        backend,
        AuditLog::in_memory(),
        FirewallState::new(),
        Duration::from_secs(10),
    )
}

fn drop_subnet() -> RuleSpec {
    RuleSpec {
        priority: Some(50),
        src_ip: Some("10.0.0.0/24".to_string()),
        ..RuleSpec::new("filter", "INPUT", "DROP")
    }
}

fn accept_all() -> RuleSpec {
    RuleSpec {
        priority: Some(100),
        ..RuleSpec::new("FILTER", "INPUT", "ACCEPT")
    }
}

async fn create(fw: &Firewall<ScriptedBackend>, spec: RuleSpec) -> Rule {
    fw.rules()
        .create(CreateRuleCommand::new("alice", spec))
        .await
        .unwrap()
}

async fn all_rules(fw: &Firewall<ScriptedBackend>) -> Vec<Rule> {
    fw.rules().list(&RuleFilter::default()).await
}

#[tokio::test]
async fn test_first_deploy_activates_and_applies() {
    let backend = ScriptedBackend::succeeding();
    let fw = engine(backend.clone());
    let r1 = create(&fw, drop_subnet()).await;
    let r2 = create(&fw, accept_all()).await;

    let outcome = fw
        .deploy(DeployCommand::new("alice", "initial policy"))
        .await
        .unwrap();
    let DeployOutcome::Deployed { version } = outcome else {
        panic!("expected a new version");
    };

    let expected_hash = RuleSet::from_rules(vec![r1.clone(), r2.clone()])
        .unwrap()
        .content_hash();
    assert_eq!(version.hash, expected_hash);
    assert!(version.is_active);
    assert_eq!(version.rule_count, 2);

    for rule in all_rules(&fw).await {
        assert_eq!(rule.status, RuleStatus::Applied);
    }
    let order: Vec<u64> = backend.applied()[0].ordered().iter().map(|r| r.id).collect();
    assert_eq!(order, vec![r1.id, r2.id]);

    let successes: Vec<_> = fw
        .audit()
        .query(
            AuditFilter {
                severity: Some(Severity::Success),
                ..AuditFilter::default()
            },
            10,
        )
        .collect();
    assert_eq!(successes.len(), 1);
    assert_eq!(successes[0].action, AuditAction::DeploySucceeded);
}

#[tokio::test]
async fn test_snat_in_input_chain_rejected() {
    let fw = engine(ScriptedBackend::succeeding());
    let err = fw
        .rules()
        .create(CreateRuleCommand::new(
            "alice",
            RuleSpec::new("nat", "INPUT", "SNAT"),
        ))
        .await
        .unwrap_err();

    let fields: Vec<&str> = err
        .validation_errors()
        .iter()
        .map(|e| e.field.as_str())
        .collect();
    assert!(fields.contains(&"chain"));
    assert!(fields.contains(&"action"));
    assert!(all_rules(&fw).await.is_empty());
}

#[tokio::test]
async fn test_backend_failure_keeps_previous_version() {
    let backend = ScriptedBackend::succeeding();
    let fw = engine(backend.clone());
    create(&fw, drop_subnet()).await;
    let r2 = create(&fw, accept_all()).await;
    let v1 = fw
        .deploy(DeployCommand::new("alice", "v1"))
        .await
        .unwrap()
        .version_id();

    let patch = RulePatch {
        priority: Some(10),
        ..RulePatch::default()
    };
    fw.rules()
        .update(UpdateRuleCommand::new("alice", r2.id, r2.token(), patch).with_override())
        .await
        .unwrap();

    backend.set_script(Script::Fail("table locked".to_string()));
    let err = fw
        .deploy(DeployCommand::new("alice", "v2"))
        .await
        .unwrap_err();
    let Error::BackendApplyFailure { version_id, source } = &err else {
        panic!("expected backend failure, got {err:?}");
    };
    let version_id = *version_id;
    assert_eq!(*source, BackendError::rejected("table locked"));

    assert_eq!(fw.active_version().await.unwrap().id, v1);
    let failed = fw.version(version_id).await.unwrap();
    assert!(!failed.is_active);
    assert_eq!(fw.history(10, None).await.versions.len(), 2);

    for rule in all_rules(&fw).await {
        assert_eq!(rule.status, RuleStatus::Pending);
    }

    let errors: Vec<_> = fw
        .audit()
        .query(
            AuditFilter {
                severity: Some(Severity::Error),
                ..AuditFilter::default()
            },
            10,
        )
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].action, AuditAction::DeployFailed);

    let status = fw.status().await;
    assert_eq!(status.last_run.unwrap().result, RunResult::Failed);
    assert!(status.has_undeployed_changes);

    // Retry after the backend recovers
    backend.set_script(Script::Succeed);
    let v3 = fw
        .deploy(DeployCommand::new("alice", "v2 retry"))
        .await
        .unwrap()
        .version_id();
    assert_ne!(v3, version_id);
    assert_eq!(fw.active_version().await.unwrap().id, v3);
}

#[tokio::test]
async fn test_unchanged_deploy_is_skipped() {
    let backend = ScriptedBackend::succeeding();
    let fw = engine(backend.clone());
    create(&fw, accept_all()).await;

    let first = fw.deploy(DeployCommand::new("alice", "")).await.unwrap();
    let second = fw.deploy(DeployCommand::new("alice", "")).await.unwrap();

    assert_eq!(second, DeployOutcome::Skipped {
        active: first.version_id()
    });
    assert_eq!(fw.history(10, None).await.versions.len(), 1);
    assert_eq!(backend.calls(), 1);

    let skipped = fw.audit().recent(1);
    assert_eq!(skipped[0].action, AuditAction::DeploySkipped);
    assert_eq!(skipped[0].severity, Severity::Info);
    assert!(skipped[0].message.contains("no changes"));
}

#[tokio::test]
async fn test_rollback_to_active_version() {
    let fw = engine(ScriptedBackend::succeeding());
    create(&fw, accept_all()).await;
    let v1 = fw
        .deploy(DeployCommand::new("alice", ""))
        .await
        .unwrap()
        .version_id();

    let err = fw
        .rollback(RollbackCommand::new("alice", v1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyActive(id) if id == v1));
}

#[tokio::test]
async fn test_rollback_restores_hash_and_history_grows() {
    let fw = engine(ScriptedBackend::succeeding());
    create(&fw, accept_all()).await;
    let v1 = fw.deploy(DeployCommand::new("alice", "")).await.unwrap();
    let extra = create(&fw, drop_subnet()).await;
    fw.deploy(DeployCommand::new("alice", "")).await.unwrap();

    let rolled = fw
        .rollback(RollbackCommand::new("bob", v1.version_id()))
        .await
        .unwrap();
    let DeployOutcome::Deployed { version } = rolled else {
        panic!("expected a new version");
    };

    let original = fw.version(v1.version_id()).await.unwrap();
    assert_eq!(version.hash, original.hash);
    assert_ne!(version.id, original.id);
    assert_eq!(fw.history(10, None).await.versions.len(), 3);

    let tombstones = fw.rules().tombstones().await;
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].rule.id, extra.id);
    assert!(!fw.status().await.has_undeployed_changes);
}

#[tokio::test]
async fn test_applied_rule_is_locked() {
    let fw = engine(ScriptedBackend::succeeding());
    let rule = create(&fw, accept_all()).await;
    fw.deploy(DeployCommand::new("alice", "")).await.unwrap();
    let applied = fw.rules().get(rule.id).await.unwrap();

    let patch = RulePatch {
        action: Some("DROP".to_string()),
        ..RulePatch::default()
    };
    let err = fw
        .rules()
        .update(UpdateRuleCommand::new("alice", rule.id, applied.token(), patch.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RuleLocked(id) if id == rule.id));

    let edited = fw
        .rules()
        .update(UpdateRuleCommand::new("alice", rule.id, applied.token(), patch).with_override())
        .await
        .unwrap();
    assert_eq!(edited.status, RuleStatus::Draft);
    assert_eq!(fw.audit().recent(1)[0].severity, Severity::Warning);
}

#[tokio::test]
async fn test_concurrent_updates_one_conflicts() {
    let fw = Arc::new(engine(ScriptedBackend::succeeding()));
    let rule = create(&fw, accept_all()).await;

    let update = |priority: i64| {
        let fw = Arc::clone(&fw);
        let token = rule.token();
        let id = rule.id;
        tokio::spawn(async move {
            let patch = RulePatch {
                priority: Some(priority),
                ..RulePatch::default()
            };
            fw.rules()
                .update(UpdateRuleCommand::new("editor", id, token, patch))
                .await
        })
    };

    let (a, b) = tokio::join!(update(1), update(2));
    let results = [a.unwrap(), b.unwrap()];
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(Error::Conflict { .. })))
        .count();
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 1);
}

#[tokio::test]
async fn test_concurrent_deploys_one_rejected() {
    let backend = ScriptedBackend::gated();
    let fw = Arc::new(engine(backend.clone()));
    create(&fw, accept_all()).await;

    let first = {
        let fw = Arc::clone(&fw);
        tokio::spawn(async move { fw.deploy(DeployCommand::new("alice", "")).await })
    };
    backend.wait_until_applying().await;

    // Reads and edits stay available while the backend is applying
    assert_eq!(all_rules(&fw).await.len(), 1);
    create(&fw, drop_subnet()).await;

    assert!(matches!(
        fw.deploy(DeployCommand::new("bob", "")).await,
        Err(Error::DeployInProgress)
    ));
    assert!(matches!(
        fw.rollback(RollbackCommand::new("bob", uuid::Uuid::new_v4()))
            .await,
        Err(Error::DeployInProgress)
    ));

    backend.release();
    first.await.unwrap().unwrap();

    let statuses: Vec<RuleStatus> = all_rules(&fw).await.iter().map(|r| r.status).collect();
    assert!(statuses.contains(&RuleStatus::Applied));
    assert!(statuses.contains(&RuleStatus::Draft));
}

#[tokio::test]
async fn test_timeout_reverts_to_pending() {
    let backend = ScriptedBackend::succeeding();
    let fw = Firewall::with_timeout(
        &EngineConfig::default(),
        backend.clone(),
        AuditLog::in_memory(),
        FirewallState::new(),
        Duration::from_millis(50),
    );
    create(&fw, accept_all()).await;
    let v1 = fw
        .deploy(DeployCommand::new("alice", ""))
        .await
        .unwrap()
        .version_id();
    let added = create(&fw, drop_subnet()).await;

    backend.set_script(Script::Hang);
    let err = fw.deploy(DeployCommand::new("alice", "")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::BackendApplyFailure {
            source: BackendError::Timeout { .. },
            ..
        }
    ));

    assert_eq!(fw.active_version().await.unwrap().id, v1);
    assert_eq!(fw.snapshot_state().await.active_count(), 1);
    for rule in all_rules(&fw).await {
        assert_eq!(rule.status, RuleStatus::Pending, "rule {}", rule.id);
    }
    assert!(fw.rules().get(added.id).await.is_ok());

    let errors = fw
        .audit()
        .query(
            AuditFilter {
                severity: Some(Severity::Error),
                ..AuditFilter::default()
            },
            10,
        )
        .count();
    assert_eq!(errors, 1);
}

#[tokio::test]
async fn test_first_deploy_timeout_leaves_nothing_active() {
    let fw = Firewall::with_timeout(
        &EngineConfig::default(),
        ScriptedBackend::hanging(),
        AuditLog::in_memory(),
        FirewallState::new(),
        Duration::from_millis(50),
    );
    create(&fw, accept_all()).await;

    assert!(fw.deploy(DeployCommand::new("alice", "")).await.is_err());
    assert!(fw.active_version().await.is_none());
    assert_eq!(fw.history(10, None).await.versions.len(), 1);
}

#[tokio::test]
async fn test_delete_then_deploy() {
    let fw = engine(ScriptedBackend::succeeding());
    let a = create(&fw, accept_all()).await;
    create(&fw, drop_subnet()).await;
    fw.deploy(DeployCommand::new("alice", "")).await.unwrap();

    fw.rules()
        .delete(DeleteRuleCommand::new("alice", a.id))
        .await
        .unwrap();
    let outcome = fw.deploy(DeployCommand::new("alice", "")).await.unwrap();
    let active = fw.version(outcome.version_id()).await.unwrap();
    assert_eq!(active.rules.len(), 1);
    assert!(!active.rules.contains(a.id));
}

#[tokio::test]
async fn test_export_and_diff() {
    let fw = engine(ScriptedBackend::succeeding());
    create(&fw, accept_all()).await;
    let v1 = fw
        .deploy(DeployCommand::new("alice", ""))
        .await
        .unwrap()
        .version_id();
    create(&fw, drop_subnet()).await;
    assert!(fw.pending_diff().await.contains("-s 10.0.0.0/24"));

    let v2 = fw
        .deploy(DeployCommand::new("alice", ""))
        .await
        .unwrap()
        .version_id();

    let diff = fw.diff(v1, v2).await.unwrap();
    assert!(diff.contains("+-A INPUT -s 10.0.0.0/24"));
    assert!(fw.export(Some(v1)).await.unwrap().contains("*filter"));
    assert!(fw.export(Some(uuid::Uuid::new_v4())).await.is_err());
    assert!(fw.pending_diff().await.is_empty());
}

#[tokio::test]
async fn test_history_paging_through_facade() {
    let fw = engine(ScriptedBackend::succeeding());
    let mut ids = Vec::new();
    for port in [22, 80, 443] {
        create(
            &fw,
            RuleSpec {
                protocol: Some("tcp".to_string()),
                dst_port: Some(port),
                ..RuleSpec::new("filter", "INPUT", "ACCEPT")
            },
        )
        .await;
        ids.push(
            fw.deploy(DeployCommand::new("alice", format!("open {port}")))
                .await
                .unwrap()
                .version_id(),
        );
    }

    let page = fw.history(2, None).await;
    assert_eq!(page.versions[0].id, ids[2]);
    assert_eq!(page.versions[1].id, ids[1]);
    let rest = fw.history(2, page.next.as_ref()).await;
    assert_eq!(rest.versions.len(), 1);
    assert_eq!(rest.versions[0].id, ids[0]);
}

mod invariants {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        AddRule(u16),
        Deploy,
        FailingDeploy,
        Rollback(usize),
        DeleteFirst,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u16..=1024).prop_map(Op::AddRule),
            Just(Op::Deploy),
            Just(Op::FailingDeploy),
            (0usize..8).prop_map(Op::Rollback),
            Just(Op::DeleteFirst),
        ]
    }

    async fn apply(fw: &Firewall<ScriptedBackend>, backend: &ScriptedBackend, op: Op) {
        match op {
            Op::AddRule(port) => {
                let spec = RuleSpec {
                    protocol: Some("udp".to_string()),
                    dst_port: Some(i64::from(port)),
                    ..RuleSpec::new("filter", "INPUT", "ACCEPT")
                };
                let _ = fw.rules().create(CreateRuleCommand::new("prop", spec)).await;
            }
            Op::Deploy => {
                backend.set_script(Script::Succeed);
                let _ = fw.deploy(DeployCommand::new("prop", "")).await;
            }
            Op::FailingDeploy => {
                backend.set_script(Script::Fail("refused".to_string()));
                let _ = fw.deploy(DeployCommand::new("prop", "")).await;
            }
            Op::Rollback(idx) => {
                backend.set_script(Script::Succeed);
                let history = fw.history(usize::MAX, None).await.versions;
                if let Some(v) = history.get(idx) {
                    let _ = fw.rollback(RollbackCommand::new("prop", v.id)).await;
                }
            }
            Op::DeleteFirst => {
                if let Some(rule) = all_rules(fw).await.first() {
                    let _ = fw
                        .rules()
                        .delete(DeleteRuleCommand::new("prop", rule.id))
                        .await;
                }
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_version_json_roundtrip_keeps_hash(
            rules in proptest::collection::vec((-1000i64..1000, proptest::option::of(1i64..=65535)), 1..20)
        ) {
            let set = RuleSet::from_rules(rules.into_iter().enumerate().map(|(i, (priority, port))| {
                let spec = RuleSpec {
                    priority: Some(priority),
                    protocol: Some("tcp".to_string()),
                    dst_port: port,
                    ..RuleSpec::new("filter", "FORWARD", "ACCEPT")
                };
                let definition = crate::validators::validate(&spec).unwrap();
                crate::core::test_helpers::rule_with(i as u64 + 1, definition)
            }))
            .unwrap();

            let json = serde_json::to_string(&set).unwrap();
            let back: RuleSet = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back.content_hash(), set.content_hash());
            prop_assert_eq!(back, set);
        }

        #[test]
        fn test_at_most_one_active_version(ops in proptest::collection::vec(op(), 1..25)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();

            rt.block_on(async {
                let backend = ScriptedBackend::succeeding();
                let fw = engine(backend.clone());
                let mut previous_active = None;

                for op in ops {
                    let failing = matches!(op, Op::FailingDeploy);
                    apply(&fw, &backend, op).await;

                    let state = fw.snapshot_state().await;
                    assert!(state.active_count() <= 1);

                    let active = state.active_version().map(|v| v.id);
                    if failing {
                        assert_eq!(active, previous_active, "failed deploy changed the active version");
                    }
                    if let Some(v) = state.active_version() {
                        assert_eq!(v.hash, v.rules.content_hash());
                    }
                    previous_active = active;
                }
            });
        }
    }
}

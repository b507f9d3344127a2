//! End-to-end reconciliation scenarios over an in-memory fleet.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{decl_name, matched_members, member, member_id, test_config, Fleet};
use fleetclass_api::{
    AgentHealth, ClassifierLabel, ConditionKind, MatchState, CLASSIFIER_FINALIZER,
};
use fleetclass_controller::controller::{Phase, ReconcilerConfig};
use fleetclass_controller::store::{DeclarationPatch, DeclarationStore, DeleteOutcome};
use fleetclass_reconcile::Directive;

fn five_members() -> Vec<fleetclass_api::Member> {
    vec![
        member("fleet/m1", &[("env", "prod")]),
        member("fleet/m2", &[("env", "prod")]),
        member("fleet/m3", &[("env", "dev")]),
        member("fleet/m4", &[("env", "staging")]),
        member("fleet/m5", &[]),
    ]
}

async fn edit_spec(fleet: &Fleet, name: &str, label: &str) {
    let stored = fleet.store.get(&decl_name(name)).await.unwrap().unwrap();
    let mut edited = stored.declaration.clone();
    edited.spec.classifier_labels.push(ClassifierLabel {
        key: label.to_string(),
        value: "true".to_string(),
    });
    fleet
        .store
        .update(
            &decl_name(name),
            &DeclarationPatch::diff(&stored.declaration, &edited),
            stored.version,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn env_prod_selects_two_then_one() {
    let fleet = Fleet::new(five_members());
    fleet.declare("prod-clusters", "env=prod").await;

    let first = fleet.reconcile("prod-clusters").await;
    assert_eq!(first.directive, Directive::Success);
    assert!(fleet.has_artifact("fleet/m1", "prod-clusters"));
    assert!(fleet.has_artifact("fleet/m2", "prod-clusters"));
    assert!(!fleet.has_artifact("fleet/m3", "prod-clusters"));

    fleet.agents_report(&["fleet/m1", "fleet/m2"], "prod-clusters", true);
    fleet.reconcile("prod-clusters").await;

    let decl = fleet.declaration("prod-clusters").await.unwrap();
    assert_eq!(matched_members(&decl), vec!["fleet/m1", "fleet/m2"]);
    assert!(decl
        .status
        .matching_cluster_statuses
        .iter()
        .all(|s| s.state == MatchState::Matching && !s.pending_refresh));
    assert_eq!(decl.status.condition.unwrap().kind, ConditionKind::Ready);

    fleet
        .catalog
        .set_labels(
            &member_id("fleet/m2"),
            [("env".to_string(), "dev".to_string())].into(),
        )
        .await;
    let summary = fleet.reconcile("prod-clusters").await;
    assert_eq!(summary.directive, Directive::Success);

    let decl = fleet.declaration("prod-clusters").await.unwrap();
    assert_eq!(matched_members(&decl), vec!["fleet/m1"]);
    assert_eq!(decl.status.cluster_info.len(), 1);
    assert!(!fleet.has_artifact("fleet/m2", "prod-clusters"));
    assert_eq!(decl.status.condition.unwrap().kind, ConditionKind::Ready);
}

#[tokio::test]
async fn stale_report_keeps_previous_result() {
    let fleet = Fleet::new(vec![member("fleet/a", &[("env", "prod")])]);
    fleet.declare("prod", "env=prod").await;

    fleet.reconcile("prod").await;
    fleet.report("fleet/a", "prod", true, 1);
    fleet.reconcile("prod").await;

    edit_spec(&fleet, "prod", "gpu").await;
    let summary = fleet.reconcile("prod").await;
    assert_eq!(summary.generation, Some(2));

    let decl = fleet.declaration("prod").await.unwrap();
    let status = decl.status.match_status(&member_id("fleet/a")).unwrap();
    assert_eq!(status.state, MatchState::Matching);
    assert_eq!(status.observed_generation, Some(1));
    assert!(status.pending_refresh);
    assert_eq!(decl.status.observed_generation, 2);
    assert_eq!(decl.status.condition.unwrap().kind, ConditionKind::Progressing);

    let artifact = fleet
        .client
        .artifact(&member_id("fleet/a"), &decl_name("prod"))
        .unwrap();
    assert_eq!(artifact.classifier.generation, 2);

    fleet.report("fleet/a", "prod", false, 2);
    fleet.reconcile("prod").await;
    let decl = fleet.declaration("prod").await.unwrap();
    let status = decl.status.match_status(&member_id("fleet/a")).unwrap();
    assert_eq!(status.state, MatchState::NotMatching);
    assert!(!status.pending_refresh);
}

#[tokio::test]
async fn unreachable_member_does_not_block_others() {
    let fleet = Fleet::new(vec![
        member("fleet/a", &[("env", "prod")]),
        member("fleet/b", &[("env", "prod")]),
        member("fleet/c", &[("env", "prod")]),
    ]);
    fleet.client.set_unreachable(&member_id("fleet/b"), true);
    fleet.declare("prod", "env=prod").await;

    let summary = fleet.reconcile("prod").await;
    assert!(summary.directive.is_retry());
    assert!(summary.member_errors >= 1);

    let decl = fleet.declaration("prod").await.unwrap();
    assert!(decl.meta.has_finalizer(CLASSIFIER_FINALIZER));
    let health = |m: &str| {
        decl.status
            .member_info(&member_id(m))
            .map(|i| i.agent_health)
            .unwrap()
    };
    assert_eq!(health("fleet/a"), AgentHealth::Provisioned);
    assert_eq!(health("fleet/b"), AgentHealth::Failed);
    assert_eq!(health("fleet/c"), AgentHealth::Provisioned);
    assert!(decl
        .status
        .member_info(&member_id("fleet/b"))
        .unwrap()
        .error
        .is_some());
}

#[tokio::test]
async fn blocked_withdrawal_keeps_declaration_until_cleared() {
    let fleet = Fleet::new(vec![
        member("fleet/a", &[("env", "prod")]),
        member("fleet/b", &[("env", "prod")]),
        member("fleet/c", &[("env", "prod")]),
    ]);
    fleet.declare("prod", "env=prod").await;
    fleet.reconcile("prod").await;
    let decl = fleet.declaration("prod").await.unwrap();
    assert_eq!(decl.status.cluster_info.len(), 3);

    fleet.client.set_reject_deletes(&member_id("fleet/b"), true);
    let outcome = fleet.store.delete(&decl_name("prod")).await.unwrap();
    assert!(matches!(outcome, DeleteOutcome::Pending(_)));

    let summary = fleet.reconcile("prod").await;
    assert_eq!(summary.phase, Phase::Withdrawing);
    assert!(summary.directive.is_retry());
    assert_eq!(summary.member_errors, 1);

    let decl = fleet.declaration("prod").await.unwrap();
    assert!(decl.meta.is_deleting());
    assert!(decl.meta.has_finalizer(CLASSIFIER_FINALIZER));
    assert!(!fleet.has_artifact("fleet/a", "prod"));
    assert!(fleet.has_artifact("fleet/b", "prod"));
    assert!(!fleet.has_artifact("fleet/c", "prod"));
    assert_eq!(decl.status.cluster_info.len(), 1);
    let remaining = decl.status.member_info(&member_id("fleet/b")).unwrap();
    assert_eq!(remaining.agent_health, AgentHealth::Removing);
    assert_eq!(decl.status.condition.unwrap().kind, ConditionKind::Deleting);

    // Still blocked: nothing changes and the declaration stays.
    let summary = fleet.reconcile("prod").await;
    assert_eq!(summary.phase, Phase::Withdrawing);
    let decl = fleet.declaration("prod").await.unwrap();
    assert_eq!(decl.status.cluster_info.len(), 1);

    fleet.client.set_reject_deletes(&member_id("fleet/b"), false);
    let summary = fleet.reconcile("prod").await;
    assert_eq!(summary.phase, Phase::Removed);
    assert_eq!(summary.directive, Directive::Success);
    assert!(fleet.declaration("prod").await.is_none());
    assert!(!fleet.has_artifact("fleet/b", "prod"));
}

#[tokio::test(start_paused = true)]
async fn delete_during_first_attempt_still_withdraws() {
    let fleet = Fleet::new(vec![member("fleet/a", &[("env", "prod")])]);
    fleet
        .client
        .set_latency(&member_id("fleet/a"), Some(Duration::from_millis(200)));
    fleet.declare("prod", "env=prod").await;

    let (summary, outcome) = tokio::join!(fleet.reconcile("prod"), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        fleet.store.delete(&decl_name("prod")).await.unwrap()
    });
    assert!(matches!(outcome, DeleteOutcome::Pending(_)));
    assert_eq!(summary.directive, Directive::Success);
    assert!(fleet.has_artifact("fleet/a", "prod"));

    let decl = fleet.declaration("prod").await.unwrap();
    assert!(decl.meta.is_deleting());
    assert!(decl.status.member_info(&member_id("fleet/a")).is_some());

    let summary = fleet.reconcile("prod").await;
    assert_eq!(summary.phase, Phase::Removed);
    assert!(fleet.declaration("prod").await.is_none());
    assert!(!fleet.has_artifact("fleet/a", "prod"));
}

#[tokio::test]
async fn delete_before_placement_touches_no_member() {
    let fleet = Fleet::new(vec![member("fleet/a", &[("env", "prod")])]);
    fleet.declare("prod", "env=prod").await;
    fleet.store.delete(&decl_name("prod")).await.unwrap();

    let summary = fleet.reconcile("prod").await;
    assert_eq!(summary.directive, Directive::Success);
    assert!(!fleet.has_artifact("fleet/a", "prod"));
    assert_eq!(fleet.client.apply_count(&member_id("fleet/a")), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_final_commit_does_not_lose_placements() {
    let fleet = Fleet::new(vec![member("fleet/a", &[("env", "prod")])]);
    fleet
        .client
        .set_latency(&member_id("fleet/a"), Some(Duration::from_millis(200)));
    fleet.declare("prod", "env=prod").await;

    let (summary, ()) = tokio::join!(fleet.reconcile("prod"), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        fleet.store.set_unavailable(true);
    });
    assert!(summary.directive.is_retry());
    assert_eq!(summary.phase, Phase::Committing);
    assert!(fleet.has_artifact("fleet/a", "prod"));

    fleet.store.set_unavailable(false);
    let decl = fleet.declaration("prod").await.unwrap();
    let recorded = decl.status.member_info(&member_id("fleet/a")).unwrap();
    assert_eq!(recorded.agent_health, AgentHealth::Provisioning);

    fleet
        .catalog
        .set_labels(&member_id("fleet/a"), BTreeMap::new())
        .await;
    let summary = fleet.reconcile("prod").await;
    assert_eq!(summary.directive, Directive::Success);
    assert!(!fleet.has_artifact("fleet/a", "prod"));
    let decl = fleet.declaration("prod").await.unwrap();
    assert!(decl.status.cluster_info.is_empty());
}

#[tokio::test]
async fn unrecorded_placement_is_never_attempted() {
    let fleet = Fleet::new(vec![member("fleet/a", &[("env", "prod")])]);
    fleet.declare("prod", "env=prod").await;

    fleet.store.inject_conflicts(10);
    let summary = fleet.reconcile("prod").await;
    assert!(summary.directive.is_retry());
    assert_eq!(summary.phase, Phase::Recording);
    assert_eq!(fleet.client.apply_count(&member_id("fleet/a")), 0);
    assert!(!fleet.has_artifact("fleet/a", "prod"));
}

#[tokio::test]
async fn unreadable_declaration_reports_loading() {
    let fleet = Fleet::new(vec![member("fleet/a", &[("env", "prod")])]);
    fleet.declare("prod", "env=prod").await;

    fleet.store.set_unavailable(true);
    let summary = fleet.reconcile("prod").await;
    assert!(summary.directive.is_retry());
    assert_eq!(summary.phase, Phase::Loading);
    assert_eq!(fleet.client.apply_count(&member_id("fleet/a")), 0);
}

#[tokio::test]
async fn removed_member_counts_as_withdrawn_on_delete() {
    let fleet = Fleet::new(vec![member("fleet/a", &[("env", "prod")])]);
    fleet.declare("prod", "env=prod").await;
    fleet.reconcile("prod").await;

    fleet.catalog.remove(&member_id("fleet/a")).await;
    fleet.store.delete(&decl_name("prod")).await.unwrap();

    let summary = fleet.reconcile("prod").await;
    assert_eq!(summary.phase, Phase::Removed);
    assert!(fleet.declaration("prod").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn concurrent_spec_edit_survives_status_commit() {
    let fleet = Fleet::new(vec![member("fleet/a", &[("env", "prod")])]);
    fleet.declare("prod", "env=prod").await;
    fleet.reconcile("prod").await;

    // Hold the attempt inside member I/O while another writer edits the spec.
    fleet
        .client
        .set_latency(&member_id("fleet/a"), Some(Duration::from_millis(200)));
    fleet.report("fleet/a", "prod", true, 1);

    let (summary, ()) = tokio::join!(fleet.reconcile("prod"), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        edit_spec(&fleet, "prod", "tier").await;
    });
    assert_eq!(summary.directive, Directive::Success);
    assert_eq!(summary.generation, Some(1));

    let decl = fleet.declaration("prod").await.unwrap();
    assert_eq!(decl.meta.generation, 2);
    assert_eq!(decl.spec.classifier_labels.len(), 1);
    assert!(decl.meta.has_finalizer(CLASSIFIER_FINALIZER));
    assert_eq!(decl.status.observed_generation, 1);
    assert_eq!(
        decl.status
            .match_status(&member_id("fleet/a"))
            .unwrap()
            .state,
        MatchState::Matching
    );
}

#[tokio::test]
async fn commit_conflicts_retry_then_give_up() {
    let fleet = Fleet::new(vec![member("fleet/a", &[("env", "prod")])]);
    fleet.declare("prod", "env=prod").await;

    fleet.store.inject_conflicts(2);
    let summary = fleet.reconcile("prod").await;
    assert_eq!(summary.directive, Directive::Success);
    assert!(fleet
        .declaration("prod")
        .await
        .unwrap()
        .meta
        .has_finalizer(CLASSIFIER_FINALIZER));

    fleet.report("fleet/a", "prod", true, 1);
    fleet.store.inject_conflicts(10);
    let summary = fleet.reconcile("prod").await;
    assert!(summary.directive.is_retry());
    assert_eq!(summary.phase, Phase::Committing);
}

#[tokio::test]
async fn newer_report_generation_counts_as_fresh() {
    let fleet = Fleet::new(vec![member("fleet/a", &[("env", "prod")])]);
    fleet.declare("prod", "env=prod").await;
    fleet.reconcile("prod").await;

    fleet.report("fleet/a", "prod", true, 5);
    fleet.reconcile("prod").await;

    let decl = fleet.declaration("prod").await.unwrap();
    let status = decl.status.match_status(&member_id("fleet/a")).unwrap();
    assert_eq!(status.state, MatchState::Matching);
    assert_eq!(status.observed_generation, Some(5));
    assert!(!status.pending_refresh);
    assert_eq!(decl.status.condition.unwrap().kind, ConditionKind::Ready);
}

#[tokio::test]
async fn invalid_selector_is_terminal_until_fixed() {
    let fleet = Fleet::new(vec![member("fleet/a", &[("env", "prod")])]);
    fleet.declare("broken", "env in prod").await;

    let summary = fleet.reconcile("broken").await;
    assert!(summary.directive.is_terminal());
    assert!(!fleet.has_artifact("fleet/a", "broken"));

    let decl = fleet.declaration("broken").await.unwrap();
    let condition = decl.status.condition.clone().unwrap();
    assert_eq!(condition.kind, ConditionKind::Invalid);
    assert_eq!(condition.reason, "InvalidSelector");

    let stored = fleet.store.get(&decl_name("broken")).await.unwrap().unwrap();
    let mut fixed = stored.declaration.clone();
    fixed.spec.cluster_selector = "env in (prod)".to_string();
    fleet
        .store
        .update(
            &decl_name("broken"),
            &DeclarationPatch::diff(&stored.declaration, &fixed),
            stored.version,
        )
        .await
        .unwrap();

    let summary = fleet.reconcile("broken").await;
    assert_eq!(summary.directive, Directive::Success);
    assert!(fleet.has_artifact("fleet/a", "broken"));
}

#[tokio::test]
async fn repeated_attempts_are_idempotent() {
    let fleet = Fleet::new(five_members());
    fleet.declare("prod", "env=prod").await;
    fleet.reconcile("prod").await;
    fleet.agents_report(&["fleet/m1", "fleet/m2"], "prod", true);
    fleet.reconcile("prod").await;

    let before = fleet.declaration("prod").await.unwrap();
    let writes = fleet.store.write_count();

    fleet.reconcile("prod").await;

    assert_eq!(fleet.declaration("prod").await.unwrap(), before);
    assert_eq!(fleet.store.write_count(), writes);
    assert_eq!(fleet.client.apply_count(&member_id("fleet/m1")), 1);
}

#[tokio::test(start_paused = true)]
async fn attempt_deadline_abandons_slow_members_and_still_commits() {
    let config = ReconcilerConfig {
        member_timeout: Duration::from_secs(30),
        attempt_deadline: Duration::from_secs(2),
        ..test_config()
    };
    let fleet = Fleet::with_config(
        vec![
            member("fleet/fast", &[("env", "prod")]),
            member("fleet/slow", &[("env", "prod")]),
        ],
        config,
    );
    fleet
        .client
        .set_latency(&member_id("fleet/slow"), Some(Duration::from_secs(60)));
    fleet.declare("prod", "env=prod").await;

    let summary = fleet.reconcile("prod").await;
    assert!(summary.directive.is_retry());

    let decl = fleet.declaration("prod").await.unwrap();
    let slow = decl.status.member_info(&member_id("fleet/slow")).unwrap();
    assert_eq!(slow.agent_health, AgentHealth::Failed);
    assert!(slow.error.as_deref().unwrap().contains("deadline"));
    let fast = decl.status.member_info(&member_id("fleet/fast")).unwrap();
    assert_eq!(fast.agent_health, AgentHealth::Provisioned);
}

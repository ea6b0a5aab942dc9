// End-to-end scenarios driving the kubernetes dispatcher against the
// planner, the approvals manager and a recording orchestrator.

mod common;

use common::{deployment, event, harness, seed_cache};
use quilla::approvals::{ApprovalStatus, ListFilter, Manager};
use quilla::audit::AuditQuery;
use quilla::clock::Clock;
use quilla::models::annotations;
use quilla::policy::Policy;
use quilla::trigger::poll::best_candidate;

#[tokio::test]
async fn test_semver_patch_update_is_dispatched() {
    let h = harness();
    seed_cache(
        &h.cache,
        vec![deployment(
            "wd-main",
            "default",
            "example.com/app:1.2.3",
            &[(annotations::POLICY, "patch")],
        )],
    )
    .await;

    h.provider.process_event(&event("example.com/app", "1.2.4")).await;

    assert_eq!(h.implementer.update_count(), 1);
    let updated = h.implementer.last_update().unwrap();
    assert_eq!(
        updated.containers()[0].image.as_deref(),
        Some("example.com/app:1.2.4")
    );

    let records = h.audit.query(&AuditQuery::default()).unwrap();
    let dispatched: Vec<_> = records
        .iter()
        .filter(|r| r.kind == "deployment update")
        .collect();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].identifier, "deployment/default/wd-main");
}

#[tokio::test]
async fn test_major_jump_is_rejected_under_minor_policy() {
    let h = harness();
    seed_cache(
        &h.cache,
        vec![deployment(
            "wd-main",
            "default",
            "example.com/app:1.2.3",
            &[(annotations::POLICY, "minor")],
        )],
    )
    .await;

    h.provider.process_event(&event("example.com/app", "2.0.0")).await;

    assert_eq!(h.implementer.update_count(), 0);
    let records = h.audit.query(&AuditQuery::default()).unwrap();
    assert!(records.iter().all(|r| r.kind != "deployment update"));
}

#[tokio::test]
async fn test_force_match_tag_re_rolls_same_tag() {
    let h = harness();
    seed_cache(
        &h.cache,
        vec![deployment(
            "wd-main",
            "default",
            "example.com/app:staging",
            &[
                (annotations::POLICY, "force"),
                (annotations::MATCH_TAG, "true"),
            ],
        )],
    )
    .await;

    h.provider
        .process_event(&event("example.com/app", "staging"))
        .await;

    assert_eq!(h.implementer.update_count(), 1);
    let updated = h.implementer.last_update().unwrap();
    // Image string unchanged; the template stamp moves the rollout
    assert_eq!(
        updated.containers()[0].image.as_deref(),
        Some("example.com/app:staging")
    );
    assert_eq!(
        updated.template_annotation(annotations::UPDATE_TIME),
        Some(common::start_time().to_rfc3339().as_str())
    );
}

#[tokio::test]
async fn test_approval_quorum_gates_dispatch() {
    let h = harness();
    seed_cache(
        &h.cache,
        vec![deployment(
            "wd-main",
            "default",
            "example.com/app:1.2.3",
            &[(annotations::POLICY, "all"), (annotations::APPROVALS, "2")],
        )],
    )
    .await;

    let identifier = "kubernetes/deployment/default/wd-main:1.2.4";

    // First event opens the approval and dispatches nothing
    h.provider.process_event(&event("example.com/app", "1.2.4")).await;
    assert_eq!(h.implementer.update_count(), 0);

    let approval = h.approvals.get(identifier).await.unwrap().unwrap();
    assert_eq!(approval.votes_required, 2);
    assert_eq!(approval.votes_received(), 0);

    // Two distinct users reach quorum
    h.approvals.vote(identifier, "alice").await.unwrap();
    let approved = h.approvals.vote(identifier, "bob").await.unwrap();
    assert_eq!(approved.status(h.clock.now()), ApprovalStatus::Approved);

    // The next event for the same target dispatches and archives
    h.provider.process_event(&event("example.com/app", "1.2.4")).await;
    assert_eq!(h.implementer.update_count(), 1);
    assert!(h.approvals.get(identifier).await.unwrap().is_none());

    let archived = h
        .approvals
        .list(&ListFilter {
            include_archived: true,
            identifier_prefix: Some(identifier.to_string()),
        })
        .await
        .unwrap();
    assert_eq!(archived.len(), 1);
    assert!(archived[0].archived);
}

#[tokio::test]
async fn test_expired_approval_is_swept_and_recreated() {
    let h = harness();
    seed_cache(
        &h.cache,
        vec![deployment(
            "wd-main",
            "default",
            "example.com/app:1.2.3",
            &[
                (annotations::POLICY, "all"),
                (annotations::APPROVALS, "1"),
                (annotations::APPROVAL_DEADLINE, "1"),
            ],
        )],
    )
    .await;

    let identifier = "kubernetes/deployment/default/wd-main:1.2.4";

    h.provider.process_event(&event("example.com/app", "1.2.4")).await;
    assert!(h.approvals.get(identifier).await.unwrap().is_some());

    // One hour plus a tick later the sweeper archives the record
    h.clock
        .advance(chrono::Duration::hours(1) + chrono::Duration::minutes(1));
    let expired = h.approvals.sweep_expired().await.unwrap();
    assert_eq!(expired, vec![identifier.to_string()]);
    assert!(h.approvals.get(identifier).await.unwrap().is_none());

    // A subsequent event opens a fresh approval instead of reusing
    h.provider.process_event(&event("example.com/app", "1.2.4")).await;
    assert_eq!(h.implementer.update_count(), 0);

    let fresh = h.approvals.get(identifier).await.unwrap().unwrap();
    assert_eq!(fresh.votes_received(), 0);
    assert_eq!(fresh.status(h.clock.now()), ApprovalStatus::Pending);
}

#[tokio::test]
async fn test_glob_poll_selection_updates_once() {
    let h = harness();
    seed_cache(
        &h.cache,
        vec![deployment(
            "wd-main",
            "default",
            "example.com/app:release-1",
            &[(annotations::POLICY, "glob:release-*")],
        )],
    )
    .await;

    let policy = Policy::parse("glob:release-*", false, true).unwrap();
    let registry_tags = vec![
        "release-1".to_string(),
        "release-2".to_string(),
        "feature-x".to_string(),
    ];

    // Poll fires: the watcher picks release-2 and emits an event
    let best = best_candidate(&policy, "release-1", &registry_tags).unwrap();
    assert_eq!(best, "release-2");
    h.provider.process_event(&event("example.com/app", &best)).await;

    assert_eq!(h.implementer.update_count(), 1);
    assert_eq!(
        h.implementer.last_update().unwrap().containers()[0]
            .image
            .as_deref(),
        Some("example.com/app:release-2")
    );

    // A second poll with no new tags stays quiet
    assert_eq!(best_candidate(&policy, "release-2", &registry_tags), None);
}

mod common;

use std::sync::Arc;

use common::*;
use funcgrid_control::{GroupCtrl, GroupScheduleRequest};
use funcgrid_core::{ExitType, InstanceExitStatus, InstanceRange, StatusCode};
use funcgrid_state::{GroupPolicy, GroupState, InstanceState};

fn group_ctrl(h: &Harness) -> GroupCtrl {
    GroupCtrl::new(h.ctrl.clone(), Arc::new(h.store.clone()))
}

#[tokio::test]
async fn group_members_run_together() {
    let h = Harness::new();
    let groups = group_ctrl(&h);
    let response = groups
        .schedule_group(GroupScheduleRequest {
            group_id: "g1".into(),
            request_id: "gr1".into(),
            policy: GroupPolicy::Spread,
            range: None,
            requests: vec![request("m1", "a"), request("m2", "b")],
        })
        .await;
    assert_eq!(response.code, StatusCode::Ok);
    assert_eq!(response.instance_ids, vec!["a".to_string(), "b".to_string()]);

    let a = wait_for_state(&h.ctrl, "a", InstanceState::Running).await;
    assert_eq!(a.group_id, "g1");
    wait_for_state(&h.ctrl, "b", InstanceState::Running).await;
    eventually("group running", || async {
        groups.group("g1").await.map(|g| g.state) == Some(GroupState::Running)
    })
    .await;
    assert!(h.store.get_group("g1").unwrap().is_some());

    // Same request again returns the existing outcome; a new request is refused.
    let again = groups
        .schedule_group(GroupScheduleRequest {
            group_id: "g1".into(),
            request_id: "gr1".into(),
            requests: vec![request("m1", "a")],
            ..Default::default()
        })
        .await;
    assert_eq!(again.code, StatusCode::Ok);
    let other = groups
        .schedule_group(GroupScheduleRequest {
            group_id: "g1".into(),
            request_id: "gr2".into(),
            requests: vec![request("m9", "z")],
            ..Default::default()
        })
        .await;
    assert_eq!(other.code, StatusCode::ErrInstanceDuplicated);
}

#[tokio::test]
async fn strict_group_fails_when_one_member_cannot_schedule() {
    let h = Harness::new();
    let groups = group_ctrl(&h);
    let mut bad = request("m2", "b");
    bad.function_key = "missing/fn".into();
    let response = groups
        .schedule_group(GroupScheduleRequest {
            group_id: "g1".into(),
            request_id: "gr1".into(),
            policy: GroupPolicy::StrictPack,
            range: None,
            requests: vec![request("m1", "a"), bad],
        })
        .await;

    assert_eq!(response.code, StatusCode::ErrGroupScheduleFailed);
    assert!(response.message.contains("function"));
    let a = wait_for_state(&h.ctrl, "a", InstanceState::Fatal).await;
    assert_eq!(a.status.err_code, StatusCode::ErrGroupExitTogether);
    assert_eq!(
        groups.group("g1").await.map(|g| g.state),
        Some(GroupState::Failed)
    );
}

#[tokio::test]
async fn elastic_group_keeps_the_largest_admissible_count() {
    let h = Harness::new();
    *h.scheduler.capacity.lock().unwrap() = Some(3);
    let groups = group_ctrl(&h);
    let response = groups
        .schedule_group(GroupScheduleRequest {
            group_id: "g1".into(),
            request_id: "gr1".into(),
            policy: GroupPolicy::Pack,
            range: Some(InstanceRange { min: 2, max: 5, step: 2 }),
            requests: vec![request("tmpl", "")],
        })
        .await;

    assert_eq!(response.code, StatusCode::Ok);
    assert_eq!(response.instance_ids.len(), 2);
    assert_eq!(h.scheduler.calls.load(std::sync::atomic::Ordering::SeqCst), 5);
    eventually("extra member removed", || async {
        let placed = h.ctrl.instances().await;
        placed
            .iter()
            .filter(|r| r.state != InstanceState::ScheduleFailed)
            .count()
            == 2
    })
    .await;
    for id in &response.instance_ids {
        wait_for_state(&h.ctrl, id, InstanceState::Running).await;
    }
}

#[tokio::test]
async fn elastic_group_below_minimum_fails() {
    let h = Harness::new();
    *h.scheduler.capacity.lock().unwrap() = Some(1);
    let groups = group_ctrl(&h);
    let response = groups
        .schedule_group(GroupScheduleRequest {
            group_id: "g1".into(),
            request_id: "gr1".into(),
            range: Some(InstanceRange { min: 2, max: 4, step: 1 }),
            requests: vec![request("tmpl", "")],
            ..Default::default()
        })
        .await;
    assert_eq!(response.code, StatusCode::ErrGroupScheduleFailed);
    assert_eq!(response.message, "only 1 of at least 2 members scheduled");
}

#[tokio::test]
async fn strict_member_exit_takes_the_group_down() {
    let h = Harness::new();
    let groups = group_ctrl(&h);
    groups
        .schedule_group(GroupScheduleRequest {
            group_id: "g1".into(),
            request_id: "gr1".into(),
            policy: GroupPolicy::StrictSpread,
            range: None,
            requests: vec![request("m1", "a"), request("m2", "b")],
        })
        .await;
    wait_for_state(&h.ctrl, "a", InstanceState::Running).await;
    wait_for_state(&h.ctrl, "b", InstanceState::Running).await;

    h.ctrl
        .update_instance_status(InstanceExitStatus {
            instance_id: "a".into(),
            exit_code: 1,
            status_msg: "crashed".into(),
            exit_type: ExitType::Exception,
            err_code: StatusCode::ErrUserFunctionException,
        })
        .await;

    let b = wait_for_state(&h.ctrl, "b", InstanceState::Fatal).await;
    assert_eq!(b.status.err_code, StatusCode::ErrGroupExitTogether);
    eventually("group failed", || async {
        groups.group("g1").await.map(|g| g.state) == Some(GroupState::Failed)
    })
    .await;

    assert!(groups.kill_group("g1").await.is_ok());
    assert!(groups.group("g1").await.is_none());
    assert!(h.store.get_group("g1").unwrap().is_none());
}

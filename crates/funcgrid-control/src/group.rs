//! Group control: co-scheduled instances that succeed or fail together.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use funcgrid_core::{InstanceRange, KillRequest, ScheduleRequest, Signal, Status, StatusCode};
use funcgrid_state::{GroupPolicy, GroupRecord, GroupState, InstanceRecord, InstanceState};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::ctrl::InstanceCtrl;
use crate::traits::MetaStoreClient;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupScheduleRequest {
    pub group_id: String,
    pub request_id: String,
    #[serde(default)]
    pub policy: GroupPolicy,
    /// Elastic member count. When set, `requests[0]` is the template for
    /// every member.
    #[serde(default)]
    pub range: Option<InstanceRange>,
    pub requests: Vec<ScheduleRequest>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupScheduleResponse {
    pub group_id: String,
    pub code: StatusCode,
    pub message: String,
    pub instance_ids: Vec<String>,
}

impl GroupScheduleResponse {
    fn failed(group_id: &str, code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            group_id: group_id.to_string(),
            code,
            message: message.into(),
            instance_ids: Vec::new(),
        }
    }
}

struct GroupInner {
    ctrl: InstanceCtrl,
    meta_store: Arc<dyn MetaStoreClient>,
    groups: RwLock<HashMap<String, GroupRecord>>,
}

#[derive(Clone)]
pub struct GroupCtrl {
    inner: Arc<GroupInner>,
}

impl GroupCtrl {
    /// Build the group controller and start following member transitions.
    pub fn new(ctrl: InstanceCtrl, meta_store: Arc<dyn MetaStoreClient>) -> Self {
        let rx = ctrl.subscribe_state_changes();
        let inner = Arc::new(GroupInner {
            ctrl,
            meta_store,
            groups: RwLock::new(HashMap::new()),
        });
        tokio::spawn(watch_members(Arc::downgrade(&inner), rx));
        Self { inner }
    }

    pub async fn group(&self, group_id: &str) -> Option<GroupRecord> {
        self.inner.groups.read().await.get(group_id).cloned()
    }

    pub async fn schedule_group(&self, request: GroupScheduleRequest) -> GroupScheduleResponse {
        let group_id = request.group_id.clone();
        if group_id.is_empty() || request.requests.is_empty() {
            return GroupScheduleResponse::failed(
                &group_id,
                StatusCode::ErrParamInvalid,
                "group id and member requests are required",
            );
        }
        if let Some(range) = &request.range {
            if !range.is_valid() {
                return GroupScheduleResponse::failed(
                    &group_id,
                    StatusCode::ErrParamInvalid,
                    "invalid instance range",
                );
            }
        }
        if let Some(existing) = self.group(&group_id).await {
            if existing.request_id == request.request_id {
                debug!(%group_id, "duplicate group schedule");
                return GroupScheduleResponse {
                    group_id,
                    code: if existing.state == GroupState::Failed {
                        StatusCode::ErrGroupScheduleFailed
                    } else {
                        StatusCode::Ok
                    },
                    message: existing.msg,
                    instance_ids: existing.members,
                };
            }
            return GroupScheduleResponse::failed(
                &group_id,
                StatusCode::ErrInstanceDuplicated,
                format!("group {group_id} already exists"),
            );
        }

        let mut record = GroupRecord {
            group_id: group_id.clone(),
            request_id: request.request_id.clone(),
            policy: request.policy,
            state: GroupState::Scheduling,
            owner: self.inner.ctrl.node_id().to_string(),
            ..Default::default()
        };
        self.inner
            .groups
            .write()
            .await
            .insert(group_id.clone(), record.clone());
        self.persist(&mut record).await;

        let members = member_requests(&request);
        info!(%group_id, policy = ?request.policy, members = members.len(), "scheduling group");
        let responses =
            futures::future::join_all(members.into_iter().map(|r| self.inner.ctrl.schedule(r)))
                .await;

        let mut scheduled = Vec::new();
        let mut failures = Vec::new();
        for response in responses {
            if response.code.is_ok() {
                scheduled.push(response.instance_id);
            } else {
                failures.push(format!("{}: {}", response.code, response.message));
            }
        }

        let outcome = match request.range {
            Some(range) => match range.fit(scheduled.len() as u32) {
                Some(keep) => {
                    let extras = scheduled.split_off(keep as usize);
                    self.kill_members(&extras, Signal::ShutDown).await;
                    Ok(())
                }
                None => Err(format!(
                    "only {} of at least {} members scheduled",
                    scheduled.len(),
                    range.min
                )),
            },
            None if request.policy.is_strict() && !failures.is_empty() => {
                Err(failures.join("; "))
            }
            None if scheduled.is_empty() => Err(failures.join("; ")),
            None => Ok(()),
        };

        match outcome {
            Ok(()) => {
                record.members = scheduled.clone();
                record.state = self.reduce(&record).await;
                self.store(&mut record).await;
                info!(%group_id, members = scheduled.len(), state = ?record.state, "group scheduled");
                GroupScheduleResponse {
                    group_id,
                    code: StatusCode::Ok,
                    message: String::new(),
                    instance_ids: scheduled,
                }
            }
            Err(reason) => {
                warn!(%group_id, %reason, "group schedule failed");
                self.kill_members(&scheduled, Signal::GroupExit).await;
                record.members = scheduled;
                record.state = GroupState::Failed;
                record.msg = reason.clone();
                self.store(&mut record).await;
                GroupScheduleResponse::failed(&group_id, StatusCode::ErrGroupScheduleFailed, reason)
            }
        }
    }

    /// Recompute the group of `record` after a member transition.
    pub async fn on_member_state(&self, record: &InstanceRecord) {
        if record.group_id.is_empty() {
            return;
        }
        self.reconcile(&record.group_id).await;
    }

    /// Kill every member and drop the group.
    pub async fn kill_group(&self, group_id: &str) -> Status {
        let Some(record) = self.inner.groups.write().await.remove(group_id) else {
            return Status::error(
                StatusCode::ErrInstanceNotFound,
                format!("group {group_id} not found"),
            );
        };
        let status = self.kill_members(&record.members, Signal::ShutDown).await;
        if let Err(e) = self.inner.meta_store.delete_group(group_id).await {
            warn!(%group_id, error = %e, "failed to delete group record");
        }
        info!(%group_id, members = record.members.len(), "group killed");
        status
    }

    async fn reconcile(&self, group_id: &str) {
        let Some(mut record) = self.group(group_id).await else {
            return;
        };
        if record.members.is_empty() || record.state == GroupState::Failed {
            return;
        }
        let state = self.reduce(&record).await;
        if state == record.state {
            return;
        }
        info!(%group_id, from = ?record.state, to = ?state, "group state changed");
        record.state = state;
        self.store(&mut record).await;

        if state == GroupState::Failed && record.policy.is_strict() {
            let this = self.clone();
            let members = record.members.clone();
            tokio::spawn(async move {
                this.kill_members(&members, Signal::GroupExit).await;
            });
        }
    }

    async fn reduce(&self, record: &GroupRecord) -> GroupState {
        let mut states = Vec::with_capacity(record.members.len());
        for id in &record.members {
            let state = match self.inner.ctrl.instance(id).await {
                Some(instance) => instance.state,
                None => match self.inner.ctrl.directory().record(id).await {
                    Some(instance) => instance.state,
                    None => InstanceState::Exited,
                },
            };
            states.push(state);
        }
        GroupState::reduce(record.policy, &states)
    }

    async fn kill_members(&self, members: &[String], signal: Signal) -> Status {
        let kills = members.iter().map(|id| {
            self.inner.ctrl.kill(
                "",
                KillRequest {
                    instance_id: id.clone(),
                    signal: signal.as_raw(),
                    ..Default::default()
                },
            )
        });
        let mut status = Status::ok();
        for response in futures::future::join_all(kills).await {
            status.append(&response.status());
        }
        status
    }

    async fn store(&self, record: &mut GroupRecord) {
        self.persist(record).await;
        let mut groups = self.inner.groups.write().await;
        if groups.contains_key(&record.group_id) {
            groups.insert(record.group_id.clone(), record.clone());
        }
    }

    async fn persist(&self, record: &mut GroupRecord) {
        match self.inner.meta_store.put_group(record).await {
            Ok(revision) => record.mod_revision = revision,
            Err(e) => warn!(group_id = %record.group_id, error = %e, "failed to persist group"),
        }
    }
}

/// Member schedule requests for a group. An elastic range expands the
/// first request into `max` copies.
fn member_requests(request: &GroupScheduleRequest) -> Vec<ScheduleRequest> {
    let stamp = |mut member: ScheduleRequest| {
        member.group_id = request.group_id.clone();
        member
    };
    match (&request.range, request.requests.first()) {
        (Some(range), Some(template)) => (0..range.max)
            .map(|i| {
                let mut member = template.clone();
                member.request_id = format!("{}-{i}", request.request_id);
                member.instance_id.clear();
                member.range = None;
                stamp(member)
            })
            .collect(),
        _ => request.requests.iter().cloned().map(stamp).collect(),
    }
}

async fn watch_members(inner: Weak<GroupInner>, mut rx: broadcast::Receiver<InstanceRecord>) {
    loop {
        let event = rx.recv().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let groups = GroupCtrl { inner };
        match event {
            Ok(record) => groups.on_member_state(&record).await,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "group watcher lagged, reconciling all groups");
                let ids: Vec<String> = groups.inner.groups.read().await.keys().cloned().collect();
                for id in ids {
                    groups.reconcile(&id).await;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funcgrid_core::Resources;

    fn template() -> ScheduleRequest {
        ScheduleRequest {
            request_id: "ignored".into(),
            instance_id: "fixed".into(),
            function_key: "fn".into(),
            resources: Resources::new(100, 64),
            ..Default::default()
        }
    }

    #[test]
    fn elastic_range_expands_template() {
        let request = GroupScheduleRequest {
            group_id: "g1".into(),
            request_id: "gr".into(),
            range: Some(InstanceRange { min: 1, max: 3, step: 1 }),
            requests: vec![template()],
            ..Default::default()
        };
        let members = member_requests(&request);
        assert_eq!(members.len(), 3);
        assert_eq!(members[2].request_id, "gr-2");
        assert!(members.iter().all(|m| m.instance_id.is_empty() && m.group_id == "g1"));
    }

    #[test]
    fn fixed_members_keep_their_requests() {
        let request = GroupScheduleRequest {
            group_id: "g1".into(),
            request_id: "gr".into(),
            requests: vec![template(), template()],
            ..Default::default()
        };
        let members = member_requests(&request);
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].instance_id, "fixed");
        assert_eq!(members[1].group_id, "g1");
    }
}

//! Instance, route and group records.

use funcgrid_core::{ExitType, Resources, ScheduleRequest, StatusCode};
use serde::{Deserialize, Serialize};

// ── Instance state ─────────────────────────────────────────────

/// Lifecycle state of an instance. The integer code is what gets
/// persisted and compared across nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    #[default]
    New,
    Scheduling,
    Creating,
    Running,
    Failed,
    Exiting,
    Fatal,
    ScheduleFailed,
    Exited,
    Evicting,
    Evicted,
    SubHealth,
}

impl InstanceState {
    pub const ALL: [InstanceState; 12] = [
        InstanceState::New,
        InstanceState::Scheduling,
        InstanceState::Creating,
        InstanceState::Running,
        InstanceState::Failed,
        InstanceState::Exiting,
        InstanceState::Fatal,
        InstanceState::ScheduleFailed,
        InstanceState::Exited,
        InstanceState::Evicting,
        InstanceState::Evicted,
        InstanceState::SubHealth,
    ];

    pub fn code(self) -> i32 {
        match self {
            InstanceState::New => 0,
            InstanceState::Scheduling => 1,
            InstanceState::Creating => 2,
            InstanceState::Running => 3,
            InstanceState::Failed => 4,
            InstanceState::Exiting => 5,
            InstanceState::Fatal => 6,
            InstanceState::ScheduleFailed => 7,
            InstanceState::Exited => 8,
            InstanceState::Evicting => 9,
            InstanceState::Evicted => 10,
            InstanceState::SubHealth => 11,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// Absorbing states: nothing but orchestrator completion leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceState::Exiting
                | InstanceState::Exited
                | InstanceState::Evicting
                | InstanceState::Evicted
                | InstanceState::Fatal
        )
    }

    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            InstanceState::Scheduling
                | InstanceState::Creating
                | InstanceState::Exiting
                | InstanceState::Evicting
        )
    }

    pub fn is_non_recoverable(self) -> bool {
        matches!(
            self,
            InstanceState::Fatal | InstanceState::ScheduleFailed | InstanceState::Evicted
        )
    }

    pub fn is_ready(self) -> bool {
        self == InstanceState::Running
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstanceState::New => "NEW",
            InstanceState::Scheduling => "SCHEDULING",
            InstanceState::Creating => "CREATING",
            InstanceState::Running => "RUNNING",
            InstanceState::Failed => "FAILED",
            InstanceState::Exiting => "EXITING",
            InstanceState::Fatal => "FATAL",
            InstanceState::ScheduleFailed => "SCHEDULE_FAILED",
            InstanceState::Exited => "EXITED",
            InstanceState::Evicting => "EVICTING",
            InstanceState::Evicted => "EVICTED",
            InstanceState::SubHealth => "SUB_HEALTH",
        };
        f.write_str(name)
    }
}

// ── Instance record ────────────────────────────────────────────

/// Persisted status of an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    /// Integer code of the current [`InstanceState`].
    pub code: i32,
    pub err_code: StatusCode,
    pub exit_code: i32,
    pub msg: String,
    pub exit_type: ExitType,
}

/// The authoritative per-instance record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub request_id: String,
    pub function_key: String,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub parent_id: String,
    #[serde(default)]
    pub parent_proxy_id: String,
    #[serde(default)]
    pub group_id: String,

    /// Agent the instance is deployed on.
    #[serde(default)]
    pub unit_id: String,
    /// Node whose orchestrator owns the instance.
    #[serde(default)]
    pub function_proxy_id: String,
    #[serde(default)]
    pub runtime_id: String,
    #[serde(default)]
    pub runtime_address: String,
    #[serde(default)]
    pub resources: Resources,

    pub state: InstanceState,
    #[serde(default)]
    pub status: InstanceStatus,
    pub version: u64,
    #[serde(default)]
    pub mod_revision: u64,

    #[serde(default)]
    pub schedule_times: u32,
    #[serde(default)]
    pub deploy_times: u32,
    #[serde(default)]
    pub recover_retry_times: u32,
    #[serde(default)]
    pub low_reliability: bool,
    #[serde(default)]
    pub init_args: Vec<String>,

    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl InstanceRecord {
    /// Build a fresh NEW record for a schedule request.
    pub fn from_request(
        request: &ScheduleRequest,
        instance_id: &str,
        owner: &str,
        schedule_times: u32,
        recover_retry_times: u32,
    ) -> Self {
        let now = epoch_secs();
        Self {
            instance_id: instance_id.to_string(),
            request_id: request.request_id.clone(),
            function_key: request.function_key.clone(),
            trace_id: request.trace_id.clone(),
            tenant_id: request.tenant_id.clone(),
            job_id: request.job_id.clone(),
            parent_id: request.parent_id.clone(),
            parent_proxy_id: request.parent_proxy_id.clone(),
            group_id: request.group_id.clone(),
            function_proxy_id: owner.to_string(),
            resources: request.resources.clone(),
            state: InstanceState::New,
            status: InstanceStatus::default(),
            schedule_times,
            recover_retry_times,
            low_reliability: request.low_reliability,
            init_args: request.init_args.clone(),
            created_at: now,
            updated_at: now,
            ..Default::default()
        }
    }

    /// Partial record rebuilt from a routing projection.
    pub fn from_route(route: &RouteRecord) -> Self {
        Self {
            instance_id: route.instance_id.clone(),
            request_id: route.request_id.clone(),
            function_key: route.function_key.clone(),
            tenant_id: route.tenant_id.clone(),
            function_proxy_id: route.function_proxy_id.clone(),
            runtime_id: route.runtime_id.clone(),
            runtime_address: route.runtime_address.clone(),
            state: route.state,
            status: InstanceStatus {
                code: route.state.code(),
                err_code: route.err_code,
                msg: route.msg.clone(),
                ..Default::default()
            },
            version: route.version,
            mod_revision: route.mod_revision,
            low_reliability: route.low_reliability,
            ..Default::default()
        }
    }

    pub fn instance_key(&self) -> String {
        instance_key(&self.function_key, &self.request_id, &self.instance_id)
    }

    pub fn route_key(&self) -> String {
        route_key(&self.instance_id)
    }

    pub fn is_owned_by(&self, node_id: &str) -> bool {
        self.function_proxy_id == node_id
    }
}

pub fn instance_key(function_key: &str, request_id: &str, instance_id: &str) -> String {
    format!("/instance/{function_key}/{request_id}/{instance_id}")
}

pub fn route_key(instance_id: &str) -> String {
    format!("/route/{instance_id}")
}

pub fn group_key(group_id: &str) -> String {
    format!("/group/{group_id}")
}

// ── Route record ───────────────────────────────────────────────

/// What routing needs to know about an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub instance_id: String,
    pub request_id: String,
    pub function_key: String,
    pub tenant_id: String,
    pub function_proxy_id: String,
    pub runtime_id: String,
    pub runtime_address: String,
    pub state: InstanceState,
    pub err_code: StatusCode,
    pub msg: String,
    pub low_reliability: bool,
    pub version: u64,
    #[serde(default)]
    pub mod_revision: u64,
}

impl RouteRecord {
    pub fn from_instance(record: &InstanceRecord) -> Self {
        Self {
            instance_id: record.instance_id.clone(),
            request_id: record.request_id.clone(),
            function_key: record.function_key.clone(),
            tenant_id: record.tenant_id.clone(),
            function_proxy_id: record.function_proxy_id.clone(),
            runtime_id: record.runtime_id.clone(),
            runtime_address: record.runtime_address.clone(),
            state: record.state,
            err_code: record.status.err_code,
            msg: record.status.msg.clone(),
            low_reliability: record.low_reliability,
            version: record.version,
            mod_revision: record.mod_revision,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }
}

// ── Groups ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupPolicy {
    #[default]
    None,
    Spread,
    StrictSpread,
    Pack,
    StrictPack,
}

impl GroupPolicy {
    pub fn is_strict(self) -> bool {
        matches!(self, GroupPolicy::StrictSpread | GroupPolicy::StrictPack)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupState {
    #[default]
    Scheduling,
    Running,
    Failed,
}

impl GroupState {
    /// Reduce member states to a group state. Under strict policies one
    /// failed member fails the group; otherwise the group fails only when
    /// no member can still make progress.
    pub fn reduce(policy: GroupPolicy, members: &[InstanceState]) -> GroupState {
        if members.is_empty() {
            return GroupState::Scheduling;
        }
        let failed = members.iter().filter(|s| member_failed(**s)).count();
        let ready = members.iter().filter(|s| s.is_ready()).count();

        if policy.is_strict() {
            if failed > 0 {
                return GroupState::Failed;
            }
            if ready == members.len() {
                return GroupState::Running;
            }
            return GroupState::Scheduling;
        }

        if failed == members.len() {
            GroupState::Failed
        } else if ready > 0 && ready + failed == members.len() {
            GroupState::Running
        } else {
            GroupState::Scheduling
        }
    }
}

fn member_failed(state: InstanceState) -> bool {
    state == InstanceState::Failed || state.is_terminal() || state.is_non_recoverable()
}

/// A set of co-scheduled instances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub group_id: String,
    pub request_id: String,
    pub policy: GroupPolicy,
    pub state: GroupState,
    pub members: Vec<String>,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub mod_revision: u64,
}

impl GroupRecord {
    pub fn table_key(&self) -> String {
        group_key(&self.group_id)
    }
}

pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_sets() {
        let terminal: Vec<_> = InstanceState::ALL.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![
                InstanceState::Exiting,
                InstanceState::Fatal,
                InstanceState::Exited,
                InstanceState::Evicting,
                InstanceState::Evicted,
            ]
        );
        let ready: Vec<_> = InstanceState::ALL.into_iter().filter(|s| s.is_ready()).collect();
        assert_eq!(ready, vec![InstanceState::Running]);
        assert!(InstanceState::ScheduleFailed.is_non_recoverable());
        assert!(!InstanceState::Failed.is_non_recoverable());
        assert!(InstanceState::Creating.is_waiting());
    }

    #[test]
    fn state_codes_round_trip() {
        for state in InstanceState::ALL {
            assert_eq!(InstanceState::from_code(state.code()), Some(state));
        }
        assert_eq!(InstanceState::from_code(99), None);
    }

    #[test]
    fn keys_are_derived_from_identity() {
        let record = InstanceRecord {
            instance_id: "i-1".into(),
            request_id: "r-1".into(),
            function_key: "tenant/fn/latest".into(),
            ..Default::default()
        };
        assert_eq!(record.instance_key(), "/instance/tenant/fn/latest/r-1/i-1");
        assert_eq!(record.route_key(), "/route/i-1");
    }

    #[test]
    fn route_projection_keeps_routing_fields() {
        let record = InstanceRecord {
            instance_id: "i-1".into(),
            function_proxy_id: "node-a".into(),
            runtime_address: "10.0.0.1:9000".into(),
            state: InstanceState::Running,
            version: 4,
            ..Default::default()
        };
        let route = RouteRecord::from_instance(&record);
        assert!(route.is_ready());
        assert_eq!(route.version, 4);
        let back = InstanceRecord::from_route(&route);
        assert_eq!(back.runtime_address, "10.0.0.1:9000");
        assert_eq!(back.state, InstanceState::Running);
    }

    #[test]
    fn strict_group_fails_on_one_member() {
        use InstanceState::*;
        assert_eq!(
            GroupState::reduce(GroupPolicy::StrictPack, &[Running, Fatal, Running]),
            GroupState::Failed
        );
        assert_eq!(
            GroupState::reduce(GroupPolicy::StrictSpread, &[Running, Running]),
            GroupState::Running
        );
        assert_eq!(
            GroupState::reduce(GroupPolicy::StrictSpread, &[Running, Creating]),
            GroupState::Scheduling
        );
    }

    #[test]
    fn loose_group_tolerates_partial_failure() {
        use InstanceState::*;
        assert_eq!(
            GroupState::reduce(GroupPolicy::Spread, &[Running, Fatal]),
            GroupState::Running
        );
        assert_eq!(
            GroupState::reduce(GroupPolicy::Pack, &[Fatal, ScheduleFailed]),
            GroupState::Failed
        );
        assert_eq!(GroupState::reduce(GroupPolicy::None, &[]), GroupState::Scheduling);
    }
}

//! Collaborator interfaces.
//!
//! The orchestrator never talks to the network or the placement engine
//! directly. Every external system is one of these traits, handed to
//! [`InstanceCtrl`](crate::InstanceCtrl) at construction time through
//! [`Collaborators`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use funcgrid_core::{
    CallResult, CallResultAck, ForwardKillRequest, ForwardKillResponse, Resources,
    ScheduleRequest, ScheduleResponse, StatusCode,
};
use funcgrid_state::{GroupRecord, InstanceRecord, MetaStore};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};

// ── Messages ───────────────────────────────────────────────────

/// Placement decided by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDecision {
    pub code: StatusCode,
    pub message: String,
    /// Agent chosen for the instance.
    pub unit_id: String,
    /// Node that should own the instance. Empty means this node.
    pub function_proxy_id: String,
    pub allocated: Resources,
}

impl ScheduleDecision {
    pub fn placed(unit_id: impl Into<String>, allocated: Resources) -> Self {
        Self {
            unit_id: unit_id.into(),
            allocated,
            ..Default::default()
        }
    }

    pub fn failed(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionMeta {
    pub function_key: String,
    pub runtime: String,
    pub entry: String,
    #[serde(default)]
    pub resources: Resources,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub instance_id: String,
    pub request_id: String,
    pub unit_id: String,
    pub tenant_id: String,
    pub resources: Resources,
    pub meta: FunctionMeta,
    pub init_args: Vec<String>,
}

impl DeployRequest {
    pub fn new(record: &InstanceRecord, meta: &FunctionMeta) -> Self {
        Self {
            instance_id: record.instance_id.clone(),
            request_id: record.request_id.clone(),
            unit_id: record.unit_id.clone(),
            tenant_id: record.tenant_id.clone(),
            resources: record.resources.clone(),
            meta: meta.clone(),
            init_args: record.init_args.clone(),
        }
    }
}

/// Where the agent started the runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployedRuntime {
    pub runtime_id: String,
    pub runtime_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentKillRequest {
    pub instance_id: String,
    pub unit_id: String,
    pub runtime_id: String,
    /// Keep the agent's resources reserved for the next instance.
    pub for_reuse: bool,
}

impl AgentKillRequest {
    pub fn new(record: &InstanceRecord, for_reuse: bool) -> Self {
        Self {
            instance_id: record.instance_id.clone(),
            unit_id: record.unit_id.clone(),
            runtime_id: record.runtime_id.clone(),
            for_reuse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    SubHealth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Evicted,
    Failed,
}

/// An agent as reported by cluster membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub status: AgentStatus,
}

/// A call result relayed to the node owning the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwardCallResultRequest {
    pub request_id: String,
    /// The caller the result is delivered to.
    pub instance_id: String,
    /// Record of the responding instance when it just became ready, so the
    /// receiving node can route to it before the meta-store catches up.
    pub ready_record: Option<InstanceRecord>,
    pub result: CallResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwardCallResultResponse {
    pub request_id: String,
    pub code: StatusCode,
    pub message: String,
}

// ── Traits ─────────────────────────────────────────────────────

/// Placement engine.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Called once per attempt. Safe to call again with a fresh request.
    async fn schedule(&self, request: &ScheduleRequest) -> ScheduleDecision;

    /// Abandon an in-flight placement.
    async fn cancel(&self, request_id: &str);
}

/// Worker agent RPC client.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn deploy_instance(&self, request: &DeployRequest) -> ControlResult<DeployedRuntime>;

    async fn kill_instance(&self, request: &AgentKillRequest) -> ControlResult<()>;
}

/// Connection to the runtime process hosting an instance.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    async fn connect(&self, record: &InstanceRecord) -> ControlResult<()>;

    /// Succeeds once the runtime is able to take the init call.
    async fn readiness(&self, record: &InstanceRecord) -> ControlResult<()>;

    /// Send the create (init) call. The outcome comes back through
    /// [`InstanceCtrl::call_result`](crate::InstanceCtrl::call_result).
    async fn init_call(&self, record: &InstanceRecord) -> ControlResult<()>;

    async fn heartbeat(&self, instance_id: &str, runtime_id: &str) -> ControlResult<HealthState>;

    async fn shutdown(&self, record: &InstanceRecord, timeout: Duration) -> ControlResult<()>;

    async fn signal(&self, record: &InstanceRecord, signal: i32, payload: &str) -> ControlResult<()>;

    /// Deliver a call result to a local caller instance.
    async fn notify_result(&self, instance_id: &str, result: &CallResult) -> ControlResult<CallResultAck>;

    async fn close(&self, instance_id: &str);
}

/// Peer orchestrators.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Forward a kill to the owning node. An empty `proxy_id` addresses the
    /// instance manager, which knows instances no node currently owns.
    async fn forward_kill(
        &self,
        proxy_id: &str,
        request: &ForwardKillRequest,
    ) -> ControlResult<ForwardKillResponse>;

    async fn forward_call_result(
        &self,
        proxy_id: &str,
        request: &ForwardCallResultRequest,
    ) -> ControlResult<ForwardCallResultResponse>;

    async fn forward_schedule(
        &self,
        proxy_id: &str,
        request: &ScheduleRequest,
    ) -> ControlResult<ScheduleResponse>;
}

/// Durable record storage.
#[async_trait]
pub trait MetaStoreClient: Send + Sync {
    /// Version-checked write. Returns the new `mod_revision`.
    async fn put_instance(
        &self,
        record: &InstanceRecord,
        with_route: bool,
        create: bool,
    ) -> ControlResult<u64>;

    async fn delete_instance(&self, instance_id: &str) -> ControlResult<()>;

    async fn list_instances(&self) -> ControlResult<Vec<InstanceRecord>>;

    async fn get_instance(&self, instance_id: &str) -> ControlResult<Option<InstanceRecord>>;

    async fn put_group(&self, group: &GroupRecord) -> ControlResult<u64>;

    async fn get_group(&self, group_id: &str) -> ControlResult<Option<GroupRecord>>;

    async fn delete_group(&self, group_id: &str) -> ControlResult<()>;
}

#[async_trait]
pub trait FunctionMetaSource: Send + Sync {
    async fn get(&self, function_key: &str) -> Option<FunctionMeta>;
}

/// Capacity bookkeeping.
#[async_trait]
pub trait ResourceView: Send + Sync {
    async fn add_instance(&self, unit_id: &str, instance_id: &str, resources: &Resources);

    async fn delete_instance(&self, unit_id: &str, instance_id: &str);
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, request: &ScheduleRequest) -> Result<(), String>;
}

/// Accepts every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _request: &ScheduleRequest) -> Result<(), String> {
        Ok(())
    }
}

#[async_trait]
impl MetaStoreClient for MetaStore {
    async fn put_instance(
        &self,
        record: &InstanceRecord,
        with_route: bool,
        create: bool,
    ) -> ControlResult<u64> {
        Ok(MetaStore::put_instance(self, record, with_route, create)?)
    }

    async fn delete_instance(&self, instance_id: &str) -> ControlResult<()> {
        MetaStore::delete_instance(self, instance_id)?;
        Ok(())
    }

    async fn list_instances(&self) -> ControlResult<Vec<InstanceRecord>> {
        Ok(MetaStore::list_instances(self)?)
    }

    async fn get_instance(&self, instance_id: &str) -> ControlResult<Option<InstanceRecord>> {
        Ok(MetaStore::get_instance(self, instance_id)?)
    }

    async fn put_group(&self, group: &GroupRecord) -> ControlResult<u64> {
        Ok(MetaStore::put_group(self, group)?)
    }

    async fn get_group(&self, group_id: &str) -> ControlResult<Option<GroupRecord>> {
        Ok(MetaStore::get_group(self, group_id)?)
    }

    async fn delete_group(&self, group_id: &str) -> ControlResult<()> {
        MetaStore::delete_group(self, group_id)?;
        Ok(())
    }
}

/// Everything the orchestrator depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub scheduler: Arc<dyn Scheduler>,
    pub agent: Arc<dyn AgentClient>,
    pub runtime: Arc<dyn RuntimeClient>,
    pub cluster: Arc<dyn ClusterClient>,
    pub meta_store: Arc<dyn MetaStoreClient>,
    pub function_meta: Arc<dyn FunctionMetaSource>,
    pub resource_view: Arc<dyn ResourceView>,
    pub authorizer: Arc<dyn Authorizer>,
}

/// Report a collaborator status as an error unless it is OK.
pub fn check_status(code: StatusCode, message: &str) -> ControlResult<()> {
    if code.is_ok() {
        Ok(())
    } else {
        Err(ControlError::Status(funcgrid_core::Status::error(code, message)))
    }
}

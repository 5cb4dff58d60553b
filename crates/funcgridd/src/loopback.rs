//! In-process collaborators for standalone mode.
//!
//! One node, one agent, no peers. Runtimes are simulated: every deploy
//! succeeds and every init call is acknowledged right away through the
//! orchestrator's own `call_result` entry point.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use funcgrid_control::{
    AgentClient, AgentInfo, AgentKillRequest, AgentStatus, ClusterClient, ControlError,
    ControlResult, DeployRequest, DeployedRuntime, ForwardCallResultRequest,
    ForwardCallResultResponse, FunctionMeta, FunctionMetaSource, HealthState, InstanceCtrl,
    ResourceView, RuntimeClient, ScheduleDecision, Scheduler,
};
use funcgrid_core::{
    CallResult, CallResultAck, ForwardKillRequest, ForwardKillResponse, Resources,
    ScheduleRequest, ScheduleResponse, StatusCode,
};
use funcgrid_state::InstanceRecord;
use tokio::sync::mpsc;
use tracing::{debug, info};

const AGENT_CAPACITY: Resources = Resources {
    cpu_millis: 16_000,
    memory_mb: 32_768,
};

#[derive(Default)]
struct AgentSlot {
    capacity: Resources,
    placed: HashMap<String, Resources>,
}

impl AgentSlot {
    fn free(&self) -> Resources {
        let (cpu, mem) = self
            .placed
            .values()
            .fold((0, 0), |(c, m), r| (c + r.cpu_millis, m + r.memory_mb));
        Resources {
            cpu_millis: self.capacity.cpu_millis.saturating_sub(cpu),
            memory_mb: self.capacity.memory_mb.saturating_sub(mem),
        }
    }
}

/// Scheduler, agent and resource view over the agents of this process.
pub struct LoopbackNode {
    agents: Mutex<BTreeMap<String, AgentSlot>>,
}

impl LoopbackNode {
    pub fn new(node_id: &str) -> Self {
        let mut agents = BTreeMap::new();
        agents.insert(
            format!("{node_id}-agent-0"),
            AgentSlot {
                capacity: AGENT_CAPACITY,
                ..Default::default()
            },
        );
        Self {
            agents: Mutex::new(agents),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, AgentSlot>> {
        self.agents.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn agents(&self) -> Vec<AgentInfo> {
        self.lock()
            .keys()
            .map(|id| AgentInfo {
                agent_id: id.clone(),
                status: AgentStatus::Running,
            })
            .collect()
    }
}

#[async_trait]
impl Scheduler for LoopbackNode {
    async fn schedule(&self, request: &ScheduleRequest) -> ScheduleDecision {
        let wanted = &request.resources;
        let agents = self.lock();
        let fit = agents.iter().find(|(_, slot)| {
            let free = slot.free();
            free.cpu_millis >= wanted.cpu_millis && free.memory_mb >= wanted.memory_mb
        });
        match fit {
            Some((agent_id, _)) => {
                debug!(instance_id = %request.instance_id, %agent_id, "placed");
                ScheduleDecision::placed(agent_id.clone(), wanted.clone())
            }
            None => ScheduleDecision::failed(
                StatusCode::ErrResourceNotEnough,
                format!(
                    "no agent has {}m cpu and {}MB memory free",
                    wanted.cpu_millis, wanted.memory_mb
                ),
            ),
        }
    }

    async fn cancel(&self, request_id: &str) {
        debug!(%request_id, "placement cancelled");
    }
}

#[async_trait]
impl AgentClient for LoopbackNode {
    async fn deploy_instance(&self, request: &DeployRequest) -> ControlResult<DeployedRuntime> {
        if !self.lock().contains_key(&request.unit_id) {
            return Err(ControlError::rpc(&request.unit_id, "agent not registered"));
        }
        let runtime_id = format!("runtime-{}", uuid::Uuid::new_v4());
        info!(
            instance_id = %request.instance_id,
            agent_id = %request.unit_id,
            %runtime_id,
            function = %request.meta.function_key,
            "runtime started"
        );
        Ok(DeployedRuntime {
            runtime_address: format!("loopback://{}", request.instance_id),
            runtime_id,
        })
    }

    async fn kill_instance(&self, request: &AgentKillRequest) -> ControlResult<()> {
        info!(instance_id = %request.instance_id, runtime_id = %request.runtime_id, "runtime stopped");
        Ok(())
    }
}

#[async_trait]
impl ResourceView for LoopbackNode {
    async fn add_instance(&self, unit_id: &str, instance_id: &str, resources: &Resources) {
        if let Some(slot) = self.lock().get_mut(unit_id) {
            slot.placed.insert(instance_id.to_string(), resources.clone());
        }
    }

    async fn delete_instance(&self, unit_id: &str, instance_id: &str) {
        if let Some(slot) = self.lock().get_mut(unit_id) {
            slot.placed.remove(instance_id);
        }
    }
}

/// Simulated runtimes. Init calls are handed to [`ack_init_calls`].
pub struct LoopbackRuntime {
    init_calls: mpsc::UnboundedSender<InstanceRecord>,
}

impl LoopbackRuntime {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<InstanceRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { init_calls: tx }, rx)
    }
}

#[async_trait]
impl RuntimeClient for LoopbackRuntime {
    async fn connect(&self, _record: &InstanceRecord) -> ControlResult<()> {
        Ok(())
    }

    async fn readiness(&self, _record: &InstanceRecord) -> ControlResult<()> {
        Ok(())
    }

    async fn init_call(&self, record: &InstanceRecord) -> ControlResult<()> {
        self.init_calls
            .send(record.clone())
            .map_err(|_| ControlError::rpc(&record.runtime_id, "init responder stopped"))
    }

    async fn heartbeat(&self, _instance_id: &str, _runtime_id: &str) -> ControlResult<HealthState> {
        Ok(HealthState::Healthy)
    }

    async fn shutdown(&self, record: &InstanceRecord, _timeout: Duration) -> ControlResult<()> {
        debug!(instance_id = %record.instance_id, "runtime shutdown");
        Ok(())
    }

    async fn signal(&self, record: &InstanceRecord, signal: i32, payload: &str) -> ControlResult<()> {
        info!(instance_id = %record.instance_id, signal, payload_len = payload.len(), "signal delivered");
        Ok(())
    }

    async fn notify_result(&self, instance_id: &str, result: &CallResult) -> ControlResult<CallResultAck> {
        debug!(%instance_id, from = %result.instance_id, code = %result.code, "call result delivered");
        Ok(CallResultAck::ok())
    }

    async fn close(&self, _instance_id: &str) {}
}

/// Acknowledge every init call as a successful create.
pub fn ack_init_calls(ctrl: InstanceCtrl, mut init_calls: mpsc::UnboundedReceiver<InstanceRecord>) {
    tokio::spawn(async move {
        while let Some(record) = init_calls.recv().await {
            let ctrl = ctrl.clone();
            tokio::spawn(async move {
                let result = CallResult {
                    request_id: record.request_id.clone(),
                    instance_id: record.instance_id.clone(),
                    is_create: true,
                    ..Default::default()
                };
                let ack = ctrl.call_result(&record.runtime_id, result).await;
                if !ack.code.is_ok() {
                    debug!(instance_id = %record.instance_id, code = %ack.code, "init ack refused");
                }
            });
        }
    });
}

/// A cluster with no peers. Kills addressed to the instance manager find
/// nothing to kill.
pub struct StandaloneCluster;

#[async_trait]
impl ClusterClient for StandaloneCluster {
    async fn forward_kill(
        &self,
        proxy_id: &str,
        request: &ForwardKillRequest,
    ) -> ControlResult<ForwardKillResponse> {
        if !proxy_id.is_empty() {
            return Err(ControlError::rpc(proxy_id, "no peers in standalone mode"));
        }
        Ok(ForwardKillResponse {
            request_id: request.request_id.clone(),
            code: StatusCode::Ok,
            message: "instance unknown to the cluster".to_string(),
        })
    }

    async fn forward_call_result(
        &self,
        proxy_id: &str,
        _request: &ForwardCallResultRequest,
    ) -> ControlResult<ForwardCallResultResponse> {
        Err(ControlError::rpc(proxy_id, "no peers in standalone mode"))
    }

    async fn forward_schedule(
        &self,
        proxy_id: &str,
        _request: &ScheduleRequest,
    ) -> ControlResult<ScheduleResponse> {
        Err(ControlError::rpc(proxy_id, "no peers in standalone mode"))
    }
}

/// Every function key resolves; the request carries its own resources.
pub struct AnyFunction;

#[async_trait]
impl FunctionMetaSource for AnyFunction {
    async fn get(&self, function_key: &str) -> Option<FunctionMeta> {
        (!function_key.is_empty()).then(|| FunctionMeta {
            function_key: function_key.to_string(),
            runtime: "loopback".to_string(),
            ..Default::default()
        })
    }
}

//! In-memory collaborators for orchestrator integration tests.
//!
//! Every mock counts its calls so tests can assert exactly how often the
//! orchestrator reached out. The runtime acknowledges init calls through a
//! responder task unless `auto_ack` is turned off.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use funcgrid_control::{
    AgentClient, AgentKillRequest, AllowAll, ClusterClient, Collaborators, ControlError,
    ControlResult, DeployRequest, DeployedRuntime, ForwardCallResultRequest,
    ForwardCallResultResponse, FunctionMeta, FunctionMetaSource, HealthState, InstanceCtrl,
    ResourceView, RuntimeClient, ScheduleDecision, Scheduler,
};
use funcgrid_core::{
    CallResult, CallResultAck, ControlConfig, ForwardKillRequest, ForwardKillResponse, Resources,
    ScheduleRequest, ScheduleResponse, StatusCode,
};
use funcgrid_routing::RoutingDirectory;
use funcgrid_state::{InstanceRecord, InstanceState, MetaStore};
use tokio::sync::mpsc;

pub const NODE: &str = "node-a";
pub const FUNCTION: &str = "demo/echo";

// ── Scheduler ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockScheduler {
    pub calls: AtomicUsize,
    pub cancels: AtomicUsize,
    /// Decisions handed out before falling back to a local placement.
    pub scripted: Mutex<VecDeque<ScheduleDecision>>,
    /// Placements allowed before answering `ErrResourceNotEnough`.
    pub capacity: Mutex<Option<usize>>,
    /// Time each decision takes, in milliseconds.
    pub delay_ms: AtomicU64,
    placed: AtomicUsize,
}

#[async_trait]
impl Scheduler for MockScheduler {
    async fn schedule(&self, request: &ScheduleRequest) -> ScheduleDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if let Some(decision) = self.scripted.lock().unwrap().pop_front() {
            return decision;
        }
        if let Some(capacity) = *self.capacity.lock().unwrap() {
            if self.placed.load(Ordering::SeqCst) >= capacity {
                return ScheduleDecision::failed(StatusCode::ErrResourceNotEnough, "no capacity");
            }
        }
        self.placed.fetch_add(1, Ordering::SeqCst);
        ScheduleDecision::placed("agent-1", request.resources.clone())
    }

    async fn cancel(&self, _request_id: &str) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Agent ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockAgent {
    pub deploys: AtomicUsize,
    /// Number of upcoming deploys that fail.
    pub failing_deploys: AtomicU32,
    pub kills: Mutex<Vec<AgentKillRequest>>,
}

impl MockAgent {
    pub fn kill_count(&self) -> usize {
        self.kills.lock().unwrap().len()
    }

    pub fn kills_of(&self, instance_id: &str) -> usize {
        self.kills
            .lock()
            .unwrap()
            .iter()
            .filter(|k| k.instance_id == instance_id)
            .count()
    }
}

#[async_trait]
impl AgentClient for MockAgent {
    async fn deploy_instance(&self, request: &DeployRequest) -> ControlResult<DeployedRuntime> {
        let n = self.deploys.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self.failing_deploys.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_deploys.store(failing - 1, Ordering::SeqCst);
            return Err(ControlError::rpc(&request.unit_id, "deploy refused"));
        }
        Ok(DeployedRuntime {
            runtime_id: format!("rt-{}-{n}", request.instance_id),
            runtime_address: format!("10.0.0.1:{}", 9000 + n),
        })
    }

    async fn kill_instance(&self, request: &AgentKillRequest) -> ControlResult<()> {
        self.kills.lock().unwrap().push(request.clone());
        Ok(())
    }
}

// ── Runtime ───────────────────────────────────────────────────────

pub struct MockRuntime {
    pub auto_ack: AtomicBool,
    /// Code the responder reports for init calls.
    pub init_code: Mutex<StatusCode>,
    pub failing_readiness: AtomicU32,
    pub connect_ok: AtomicBool,
    pub heartbeat_ok: AtomicBool,
    pub health: Mutex<HealthState>,
    pub init_calls: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub signals: Mutex<Vec<(String, i32)>>,
    pub notified: Mutex<Vec<(String, CallResult)>>,
    init_tx: mpsc::UnboundedSender<InstanceRecord>,
}

impl MockRuntime {
    fn new(init_tx: mpsc::UnboundedSender<InstanceRecord>) -> Self {
        Self {
            auto_ack: AtomicBool::new(true),
            init_code: Mutex::new(StatusCode::Ok),
            failing_readiness: AtomicU32::new(0),
            connect_ok: AtomicBool::new(true),
            heartbeat_ok: AtomicBool::new(true),
            health: Mutex::new(HealthState::Healthy),
            init_calls: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            signals: Mutex::new(Vec::new()),
            notified: Mutex::new(Vec::new()),
            init_tx,
        }
    }

    pub fn notified_to(&self, parent_id: &str) -> Vec<CallResult> {
        self.notified
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == parent_id)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl RuntimeClient for MockRuntime {
    async fn connect(&self, record: &InstanceRecord) -> ControlResult<()> {
        if self.connect_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ControlError::rpc(&record.runtime_address, "connection refused"))
        }
    }

    async fn readiness(&self, record: &InstanceRecord) -> ControlResult<()> {
        let failing = self.failing_readiness.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_readiness.store(failing - 1, Ordering::SeqCst);
            return Err(ControlError::rpc(&record.runtime_address, "not ready"));
        }
        Ok(())
    }

    async fn init_call(&self, record: &InstanceRecord) -> ControlResult<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if self.auto_ack.load(Ordering::SeqCst) {
            let _ = self.init_tx.send(record.clone());
        }
        Ok(())
    }

    async fn heartbeat(&self, instance_id: &str, _runtime_id: &str) -> ControlResult<HealthState> {
        if self.heartbeat_ok.load(Ordering::SeqCst) {
            Ok(*self.health.lock().unwrap())
        } else {
            Err(ControlError::rpc(instance_id, "heartbeat refused"))
        }
    }

    async fn shutdown(&self, _record: &InstanceRecord, _timeout: Duration) -> ControlResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn signal(&self, record: &InstanceRecord, signal: i32, _payload: &str) -> ControlResult<()> {
        self.signals
            .lock()
            .unwrap()
            .push((record.instance_id.clone(), signal));
        Ok(())
    }

    async fn notify_result(&self, instance_id: &str, result: &CallResult) -> ControlResult<CallResultAck> {
        self.notified
            .lock()
            .unwrap()
            .push((instance_id.to_string(), result.clone()));
        Ok(CallResultAck::ok())
    }

    async fn close(&self, _instance_id: &str) {}
}

// ── Cluster ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockCluster {
    pub kills: Mutex<Vec<(String, ForwardKillRequest)>>,
    /// Number of upcoming forwarded kills that fail.
    pub failing_kills: AtomicU32,
    pub call_results: Mutex<Vec<(String, ForwardCallResultRequest)>>,
    pub schedules: Mutex<Vec<(String, ScheduleRequest)>>,
    /// Number of upcoming forwarded schedules that fail.
    pub failing_schedules: AtomicU32,
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn forward_kill(
        &self,
        proxy_id: &str,
        request: &ForwardKillRequest,
    ) -> ControlResult<ForwardKillResponse> {
        self.kills
            .lock()
            .unwrap()
            .push((proxy_id.to_string(), request.clone()));
        let failing = self.failing_kills.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_kills.store(failing - 1, Ordering::SeqCst);
            return Err(ControlError::rpc(proxy_id, "peer unreachable"));
        }
        Ok(ForwardKillResponse {
            request_id: request.request_id.clone(),
            ..Default::default()
        })
    }

    async fn forward_call_result(
        &self,
        proxy_id: &str,
        request: &ForwardCallResultRequest,
    ) -> ControlResult<ForwardCallResultResponse> {
        self.call_results
            .lock()
            .unwrap()
            .push((proxy_id.to_string(), request.clone()));
        Ok(ForwardCallResultResponse {
            request_id: request.request_id.clone(),
            ..Default::default()
        })
    }

    async fn forward_schedule(
        &self,
        proxy_id: &str,
        request: &ScheduleRequest,
    ) -> ControlResult<ScheduleResponse> {
        self.schedules
            .lock()
            .unwrap()
            .push((proxy_id.to_string(), request.clone()));
        let failing = self.failing_schedules.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_schedules.store(failing - 1, Ordering::SeqCst);
            return Err(ControlError::rpc(proxy_id, "peer unreachable"));
        }
        Ok(ScheduleResponse {
            request_id: request.request_id.clone(),
            instance_id: request.instance_id.clone(),
            allocated: request.resources.clone(),
            ..Default::default()
        })
    }
}

// ── Function meta and resources ───────────────────────────────────

pub struct StaticMeta;

#[async_trait]
impl FunctionMetaSource for StaticMeta {
    async fn get(&self, function_key: &str) -> Option<FunctionMeta> {
        (function_key == FUNCTION).then(|| FunctionMeta {
            function_key: function_key.to_string(),
            runtime: "wasm".into(),
            entry: "handler".into(),
            resources: Resources::new(500, 128),
        })
    }
}

#[derive(Default)]
pub struct MockResourceView {
    pub placed: Mutex<HashMap<String, String>>,
}

impl MockResourceView {
    pub fn holds(&self, instance_id: &str) -> bool {
        self.placed.lock().unwrap().contains_key(instance_id)
    }
}

#[async_trait]
impl ResourceView for MockResourceView {
    async fn add_instance(&self, unit_id: &str, instance_id: &str, _resources: &Resources) {
        self.placed
            .lock()
            .unwrap()
            .insert(instance_id.to_string(), unit_id.to_string());
    }

    async fn delete_instance(&self, _unit_id: &str, instance_id: &str) {
        self.placed.lock().unwrap().remove(instance_id);
    }
}

// ── Harness ───────────────────────────────────────────────────────

pub struct Harness {
    pub ctrl: InstanceCtrl,
    pub store: MetaStore,
    pub directory: RoutingDirectory,
    pub scheduler: Arc<MockScheduler>,
    pub agent: Arc<MockAgent>,
    pub runtime: Arc<MockRuntime>,
    pub cluster: Arc<MockCluster>,
    pub resources: Arc<MockResourceView>,
}

/// Short timers so failure paths finish quickly.
pub fn test_config() -> ControlConfig {
    ControlConfig {
        node_id: NODE.to_string(),
        max_instance_redeploy_times: 3,
        min_deploy_interval_ms: 1,
        max_deploy_interval_ms: 3,
        max_instance_reconnect_times: 2,
        reconnect_interval_ms: 5,
        connect_timeout_ms: 200,
        readiness_timeout_ms: 500,
        init_call_timeout_ms: 300,
        wait_status_code_update_ms: 50,
        max_forward_kill_retry_times: 3,
        forward_kill_retry_cycle_ms: 100,
        forward_kill_retry_cycle_sync_ms: 200,
        forward_schedule_retry_cycle_ms: 100,
        heartbeat_interval_ms: 20,
        heartbeat_timeout_ms: 50,
        max_heartbeat_misses: 3,
        runtime_shutdown_timeout_ms: 200,
        default_reschedule_times: 0,
        runtime_recover_retry_times: 0,
        ..Default::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ControlConfig) -> Self {
        Self::with_store(config, MetaStore::open_in_memory().unwrap())
    }

    pub fn with_store(config: ControlConfig, store: MetaStore) -> Self {
        let (init_tx, mut init_rx) = mpsc::unbounded_channel::<InstanceRecord>();
        let scheduler = Arc::new(MockScheduler::default());
        let agent = Arc::new(MockAgent::default());
        let runtime = Arc::new(MockRuntime::new(init_tx));
        let cluster = Arc::new(MockCluster::default());
        let resources = Arc::new(MockResourceView::default());
        let directory = RoutingDirectory::spawn(&config.node_id);

        let deps = Collaborators {
            scheduler: scheduler.clone(),
            agent: agent.clone(),
            runtime: runtime.clone(),
            cluster: cluster.clone(),
            meta_store: Arc::new(store.clone()),
            function_meta: Arc::new(StaticMeta),
            resource_view: resources.clone(),
            authorizer: Arc::new(AllowAll),
        };
        let ctrl = InstanceCtrl::new(config, deps, directory.clone());

        let responder = ctrl.clone();
        let codes = runtime.clone();
        tokio::spawn(async move {
            while let Some(record) = init_rx.recv().await {
                let code = *codes.init_code.lock().unwrap();
                let result = CallResult {
                    request_id: record.request_id.clone(),
                    instance_id: record.instance_id.clone(),
                    code,
                    message: if code.is_ok() {
                        String::new()
                    } else {
                        "init raised".to_string()
                    },
                    is_create: true,
                    ..Default::default()
                };
                let ctrl = responder.clone();
                tokio::spawn(async move {
                    ctrl.call_result(&record.runtime_id, result).await;
                });
            }
        });

        Self {
            ctrl,
            store,
            directory,
            scheduler,
            agent,
            runtime,
            cluster,
            resources,
        }
    }

    /// Create an instance and wait until it is running.
    pub async fn running(&self, request_id: &str, instance_id: &str) -> InstanceRecord {
        let result = self.ctrl.create_instance(request(request_id, instance_id)).await;
        assert_eq!(result.code, StatusCode::Ok, "create failed: {}", result.message);
        wait_for_state(&self.ctrl, instance_id, InstanceState::Running).await
    }
}

pub fn request(request_id: &str, instance_id: &str) -> ScheduleRequest {
    ScheduleRequest {
        request_id: request_id.to_string(),
        instance_id: instance_id.to_string(),
        function_key: FUNCTION.to_string(),
        resources: Resources::new(500, 128),
        ..Default::default()
    }
}

/// Poll until the local instance reaches `state`. Panics after 5s.
pub async fn wait_for_state(ctrl: &InstanceCtrl, instance_id: &str, state: InstanceState) -> InstanceRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(record) = ctrl.instance(instance_id).await {
            if record.state == state {
                return record;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "instance {instance_id} never reached {state}; now {:?}",
            ctrl.instance(instance_id).await.map(|r| r.state)
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until `check` holds. Panics after 5s.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

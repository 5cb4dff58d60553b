//! Instance control — the orchestrator.
//!
//! [`InstanceCtrl`] drives every locally owned instance through its state
//! machine. Each instance has one [`InstanceStateMachine`] behind a mutex;
//! a transition holds that mutex until the change is durable, so changes
//! to one instance apply strictly in order while different instances
//! proceed in parallel.
//!
//! Every transition goes through [`InstanceCtrl::commit`]: persist
//! according to the machine's persistence decision, roll back on failure,
//! then fire state callbacks, update the routing directory on the fast
//! path and notify observers.
//!
//! Pending work is tracked in single-resolution promise maps keyed by
//! request or instance id, so concurrent duplicates share one outcome.

mod call_result;
mod evict;
mod kill;
mod schedule;
mod status;
mod sync;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use funcgrid_core::{
    CallResult, ControlConfig, ForwardKillResponse, InstanceExitStatus, Promise, ScheduleRequest,
    ScheduleResponse, Signal, Status, StatusCode,
};
use funcgrid_lifecycle::{InstanceStateMachine, Persistence, TransContext, TransitionResult};
use funcgrid_routing::{DrainStats, RoutingDirectory, UpdateSource};
use funcgrid_state::{InstanceRecord, InstanceState};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult};
use crate::heartbeat::{HeartbeatEvent, HeartbeatMonitor, HeartbeatSettings};
use crate::traits::{AgentKillRequest, Collaborators};

type Machine = Arc<Mutex<InstanceStateMachine>>;

const OBSERVER_CAPACITY: usize = 1024;

/// Bounded set of recently exited instance ids. Kills aimed at them
/// succeed without side effects.
struct Tombstones {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl Tombstones {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

struct Inner {
    config: ControlConfig,
    deps: Collaborators,
    directory: RoutingDirectory,
    machines: RwLock<HashMap<String, Machine>>,
    /// request id -> outcome of the first schedule with that id.
    requests: Mutex<HashMap<String, Promise<ScheduleResponse>>>,
    /// instance id -> result of its create (init) call.
    create_results: Mutex<HashMap<String, Promise<CallResult>>>,
    /// instance id -> exit report awaited after a lost heartbeat.
    status_updates: Mutex<HashMap<String, Promise<InstanceExitStatus>>>,
    /// Instances inside the deploy retry loop.
    redeploying: Mutex<HashSet<String>>,
    /// instance id -> outcome of the local exit in progress.
    exiting: Mutex<HashMap<String, Promise<Status>>>,
    /// forward request id -> outcome of an outgoing forwarded kill.
    forward_kills: Mutex<HashMap<String, Promise<Status>>>,
    /// forward request id -> outcome of an incoming forwarded kill.
    incoming_kills: Mutex<HashMap<String, Promise<ForwardKillResponse>>>,
    tombstones: Mutex<Tombstones>,
    heartbeat: HeartbeatMonitor,
    observers: broadcast::Sender<InstanceRecord>,
    abnormal: AtomicBool,
    shutting_down: AtomicBool,
    shutdown: CancellationToken,
}

/// Cloneable handle to the orchestrator.
#[derive(Clone)]
pub struct InstanceCtrl {
    inner: Arc<Inner>,
}

impl InstanceCtrl {
    /// Build the orchestrator and start its heartbeat event loop.
    pub fn new(config: ControlConfig, deps: Collaborators, directory: RoutingDirectory) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let heartbeat = HeartbeatMonitor::new(
            Arc::clone(&deps.runtime),
            HeartbeatSettings {
                interval: config.heartbeat_interval(),
                timeout: config.heartbeat_timeout(),
                max_misses: config.max_heartbeat_misses,
            },
            events_tx,
        );
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);
        let tombstones = Tombstones::new(config.exited_tombstone_capacity);
        let inner = Arc::new(Inner {
            config,
            deps,
            directory,
            machines: RwLock::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            create_results: Mutex::new(HashMap::new()),
            status_updates: Mutex::new(HashMap::new()),
            redeploying: Mutex::new(HashSet::new()),
            exiting: Mutex::new(HashMap::new()),
            forward_kills: Mutex::new(HashMap::new()),
            incoming_kills: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(tombstones),
            heartbeat,
            observers,
            abnormal: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(run_heartbeat_events(
            Arc::downgrade(&inner),
            events_rx,
            inner.shutdown.clone(),
        ));
        info!(node_id = %inner.config.node_id, "instance control started");
        Self { inner }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    pub fn config(&self) -> &ControlConfig {
        &self.inner.config
    }

    pub fn directory(&self) -> &RoutingDirectory {
        &self.inner.directory
    }

    /// Every committed transition of a local instance.
    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<InstanceRecord> {
        self.inner.observers.subscribe()
    }

    /// Snapshot of a locally owned instance.
    pub async fn instance(&self, instance_id: &str) -> Option<InstanceRecord> {
        let machine = self.machine(instance_id).await?;
        let record = machine.lock().await.record().clone();
        Some(record)
    }

    pub async fn instances(&self) -> Vec<InstanceRecord> {
        let mut records = Vec::new();
        for machine in self.all_machines().await {
            records.push(machine.lock().await.record().clone());
        }
        records
    }

    pub async fn is_heartbeat_active(&self, instance_id: &str) -> bool {
        self.inner.heartbeat.is_monitoring(instance_id).await
    }

    /// Reject every later transition and schedule on this node.
    pub async fn set_abnormal(&self) {
        self.inner.abnormal.store(true, Ordering::SeqCst);
        for machine in self.all_machines().await {
            machine.lock().await.set_local_abnormal();
        }
        warn!(node_id = %self.node_id(), "instance control set abnormal");
    }

    pub fn is_abnormal(&self) -> bool {
        self.inner.abnormal.load(Ordering::SeqCst)
    }

    /// Stop taking schedules, signal local running instances, drain
    /// in-flight responses (bounded by `timeout`) and stop heartbeats.
    pub async fn graceful_shutdown(&self, timeout: Duration) -> DrainStats {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        info!(node_id = %self.node_id(), ?timeout, "graceful shutdown started");

        let running: Vec<InstanceRecord> = self
            .instances()
            .await
            .into_iter()
            .filter(|r| r.state.is_ready())
            .collect();
        let runtime = Arc::clone(&self.inner.deps.runtime);
        let signals = running.iter().map(|record| {
            let runtime = Arc::clone(&runtime);
            async move {
                if let Err(e) = runtime
                    .signal(record, Signal::ShutDown.as_raw(), "graceful shutdown")
                    .await
                {
                    warn!(instance_id = %record.instance_id, error = %e, "shutdown signal not delivered");
                }
            }
        });
        futures::future::join_all(signals).await;

        let stats = self.inner.directory.drain(timeout).await;
        self.inner.heartbeat.stop_all().await;
        self.inner.shutdown.cancel();
        info!(
            signalled = running.len(),
            drained = stats.drained,
            timed_out = stats.timed_out,
            "graceful shutdown finished"
        );
        stats
    }

    // ── Internals ──────────────────────────────────────────────────

    fn accepting(&self) -> ControlResult<()> {
        if self.inner.abnormal.load(Ordering::SeqCst) {
            return Err(ControlError::Abnormal);
        }
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ControlError::ShuttingDown);
        }
        Ok(())
    }

    async fn machine(&self, instance_id: &str) -> Option<Machine> {
        self.inner.machines.read().await.get(instance_id).cloned()
    }

    async fn all_machines(&self) -> Vec<Machine> {
        self.inner.machines.read().await.values().cloned().collect()
    }

    /// Local machines whose record matches `filter`.
    async fn machines_where(&self, filter: impl Fn(&InstanceRecord) -> bool) -> Vec<Machine> {
        let mut selected = Vec::new();
        for machine in self.all_machines().await {
            if filter(machine.lock().await.record()) {
                selected.push(machine);
            }
        }
        selected
    }

    async fn insert_machine(&self, record: InstanceRecord) -> Machine {
        let id = record.instance_id.clone();
        let mut machine = InstanceStateMachine::new(record, self.inner.config.meta_store_enabled);
        if self.is_abnormal() {
            machine.set_local_abnormal();
        }
        let machine = Arc::new(Mutex::new(machine));
        self.inner
            .machines
            .write()
            .await
            .insert(id, Arc::clone(&machine));
        machine
    }

    async fn is_tombstoned(&self, instance_id: &str) -> bool {
        self.inner.tombstones.lock().await.contains(instance_id)
    }

    async fn snapshot(machine: &Machine) -> InstanceRecord {
        machine.lock().await.record().clone()
    }

    /// Apply a table transition and commit it.
    async fn transition(&self, machine: &Machine, ctx: TransContext) -> ControlResult<InstanceRecord> {
        let mut m = machine.lock().await;
        let result = m.transition_to(ctx)?;
        self.commit(&mut m, result).await
    }

    /// Like [`transition`](Self::transition), but only from one of `from`.
    /// The check and the change happen under one lock.
    async fn transition_from(
        &self,
        machine: &Machine,
        from: &[InstanceState],
        ctx: TransContext,
    ) -> ControlResult<InstanceRecord> {
        let mut m = machine.lock().await;
        if !from.contains(&m.state()) {
            return Err(ControlError::Exited {
                id: m.instance_id().to_string(),
                reason: format!("instance is {}, expected one of {from:?}", m.state()),
            });
        }
        let result = m.transition_to(ctx)?;
        self.commit(&mut m, result).await
    }

    /// Apply a completion step out of a terminal state and commit it.
    async fn settle(&self, machine: &Machine, ctx: TransContext) -> ControlResult<InstanceRecord> {
        let mut m = machine.lock().await;
        let result = m.settle_to(ctx)?;
        self.commit(&mut m, result).await
    }

    async fn commit(
        &self,
        m: &mut InstanceStateMachine,
        result: TransitionResult,
    ) -> ControlResult<InstanceRecord> {
        if !result.changed {
            return Ok(result.current);
        }
        match self.persist(&result).await {
            Ok(Some(revision)) => m.set_mod_revision(revision),
            Ok(None) => {}
            Err(e) => {
                warn!(
                    instance_id = %result.current.instance_id,
                    state = %result.current.state,
                    error = %e,
                    "failed to persist instance, rolling back"
                );
                m.rollback(result.previous);
                return Err(e);
            }
        }
        m.publish();
        let record = m.record().clone();
        self.inner
            .directory
            .update(record.clone(), false, UpdateSource::Fast);
        let _ = self.inner.observers.send(record.clone());
        Ok(record)
    }

    async fn persist(&self, result: &TransitionResult) -> ControlResult<Option<u64>> {
        let with_route = match result.persistence {
            Persistence::None => return Ok(None),
            Persistence::InstanceOnly => false,
            Persistence::All => true,
        };
        let revision = self
            .inner
            .deps
            .meta_store
            .put_instance(&result.current, with_route, result.is_create())
            .await?;
        debug!(
            instance_id = %result.current.instance_id,
            state = %result.current.state,
            revision,
            with_route,
            "instance persisted"
        );
        Ok(Some(revision))
    }

    /// Stop the runtime of `machine` and give back its placement. Clears
    /// the runtime fields so a second release is a no-op.
    async fn release_runtime(&self, machine: &Machine, for_reuse: bool, graceful: Option<Duration>) {
        let record = Self::snapshot(machine).await;
        let id = &record.instance_id;
        self.inner.heartbeat.stop(id).await;

        if !record.runtime_id.is_empty() {
            if let Some(timeout) = graceful {
                let shutdown = self.inner.deps.runtime.shutdown(&record, timeout);
                match tokio::time::timeout(timeout, shutdown).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(instance_id = %id, error = %e, "runtime shutdown failed"),
                    Err(_) => warn!(instance_id = %id, "runtime shutdown timed out"),
                }
            }
            self.inner.deps.runtime.close(id).await;
            if let Err(e) = self
                .inner
                .deps
                .agent
                .kill_instance(&AgentKillRequest::new(&record, for_reuse))
                .await
            {
                warn!(instance_id = %id, unit_id = %record.unit_id, error = %e, "agent kill failed");
            }
        }
        if !for_reuse && !record.unit_id.is_empty() {
            self.inner
                .deps
                .resource_view
                .delete_instance(&record.unit_id, id)
                .await;
        }
        machine.lock().await.update_record(|r| {
            r.runtime_id.clear();
            r.runtime_address.clear();
            if !for_reuse {
                r.unit_id.clear();
            }
        });
    }

    /// Move to FATAL and release the runtime.
    async fn set_fatal(&self, machine: &Machine, code: StatusCode, msg: &str) -> ControlResult<InstanceRecord> {
        let record = self
            .transition(
                machine,
                TransContext::new(InstanceState::Fatal).code(code).msg(msg),
            )
            .await?;
        warn!(instance_id = %record.instance_id, %code, %msg, "instance is fatal");
        self.release_runtime(machine, false, None).await;
        Ok(record)
    }

    async fn create_promise(&self, instance_id: &str) -> Option<Promise<CallResult>> {
        self.inner
            .create_results
            .lock()
            .await
            .get(instance_id)
            .cloned()
    }

    /// The pending create promise, or a fresh one when none is pending.
    async fn ensure_create_promise(&self, instance_id: &str) -> Promise<CallResult> {
        let mut promises = self.inner.create_results.lock().await;
        match promises.get(instance_id) {
            Some(promise) if !promise.is_resolved() => promise.clone(),
            _ => {
                let promise = Promise::new();
                promises.insert(instance_id.to_string(), promise.clone());
                promise
            }
        }
    }

    /// Resolve the pending create promise with a failure, if any.
    async fn fail_create_promise(&self, record: &InstanceRecord, code: StatusCode, msg: &str) {
        if let Some(promise) = self.create_promise(&record.instance_id).await {
            promise.resolve(create_failure(record, code, msg));
        }
    }

    /// Drop every trace of an instance that left this node.
    async fn forget(&self, record: &InstanceRecord) {
        let id = &record.instance_id;
        self.inner.machines.write().await.remove(id);
        self.inner.create_results.lock().await.remove(id);
        self.inner.status_updates.lock().await.remove(id);
        self.inner.requests.lock().await.remove(&record.request_id);
    }
}

/// Schedule request reconstructed from a record, used for reschedule.
fn request_from_record(record: &InstanceRecord) -> ScheduleRequest {
    ScheduleRequest {
        request_id: record.request_id.clone(),
        trace_id: record.trace_id.clone(),
        instance_id: record.instance_id.clone(),
        function_key: record.function_key.clone(),
        tenant_id: record.tenant_id.clone(),
        job_id: record.job_id.clone(),
        parent_id: record.parent_id.clone(),
        parent_proxy_id: record.parent_proxy_id.clone(),
        group_id: record.group_id.clone(),
        resources: record.resources.clone(),
        schedule_times: Some(record.schedule_times),
        recover_retry_times: Some(record.recover_retry_times),
        low_reliability: record.low_reliability,
        init_args: record.init_args.clone(),
        ..Default::default()
    }
}

fn create_failure(record: &InstanceRecord, code: StatusCode, msg: &str) -> CallResult {
    CallResult {
        request_id: record.request_id.clone(),
        instance_id: record.instance_id.clone(),
        code,
        message: msg.to_string(),
        is_create: true,
        ..Default::default()
    }
}

async fn run_heartbeat_events(
    inner: Weak<Inner>,
    mut rx: mpsc::UnboundedReceiver<HeartbeatEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let ctrl = InstanceCtrl { inner };
        tokio::spawn(async move {
            match event {
                HeartbeatEvent::Lost {
                    instance_id,
                    runtime_id,
                } => {
                    ctrl.handle_runtime_heartbeat_lost(&instance_id, &runtime_id)
                        .await
                }
                HeartbeatEvent::Health {
                    instance_id,
                    health,
                } => ctrl.handle_instance_health_change(&instance_id, health).await,
            }
        });
    }
    debug!("heartbeat event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstones_are_bounded() {
        let mut tombstones = Tombstones::new(2);
        tombstones.insert("a");
        tombstones.insert("b");
        tombstones.insert("a");
        assert!(tombstones.contains("a"));
        tombstones.insert("c");
        assert!(!tombstones.contains("a"));
        assert!(tombstones.contains("b"));
        assert!(tombstones.contains("c"));
    }

    #[test]
    fn reschedule_request_keeps_identity() {
        let record = InstanceRecord {
            instance_id: "i1".into(),
            request_id: "r1".into(),
            function_key: "fn".into(),
            parent_id: "p".into(),
            schedule_times: 2,
            ..Default::default()
        };
        let request = request_from_record(&record);
        assert_eq!(request.instance_id, "i1");
        assert_eq!(request.request_id, "r1");
        assert_eq!(request.parent_id, "p");
        assert_eq!(request.schedule_times, Some(2));
    }
}

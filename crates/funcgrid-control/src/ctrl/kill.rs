//! Kill: signal dispatch, local exit and forwarded kills.

use std::time::Duration;

use funcgrid_core::{
    ExitType, ForwardKillRequest, ForwardKillResponse, KillRequest, KillResponse, Promise, Signal,
    Status, StatusCode,
};
use funcgrid_lifecycle::TransContext;
use funcgrid_state::{InstanceRecord, InstanceState};
use tracing::{debug, info, warn};

use super::{InstanceCtrl, Machine};

/// Where a kill for an instance has to go.
enum KillRoute {
    Local(Machine),
    /// Owned by a peer node.
    Remote {
        owner: String,
        instance_request_id: String,
    },
    /// Unknown here; the instance manager decides.
    Manager,
    /// Recently exited on this node.
    Exited,
}

const SETTLED_STATES: &[InstanceState] = &[
    InstanceState::Evicted,
    InstanceState::Fatal,
    InstanceState::Exited,
];

const SIGNALLABLE_STATES: &[InstanceState] = &[
    InstanceState::Running,
    InstanceState::SubHealth,
    InstanceState::Fatal,
    InstanceState::Exiting,
    InstanceState::Evicting,
    InstanceState::Evicted,
    InstanceState::Exited,
];

impl InstanceCtrl {
    /// Deliver a kill signal on behalf of instance `src`.
    pub async fn kill(&self, src: &str, request: KillRequest) -> KillResponse {
        let id = request.instance_id.clone();
        let Some(signal) = Signal::from_raw(request.signal) else {
            return KillResponse::from_status(
                &id,
                Status::error(StatusCode::ErrParamInvalid, "invalid signal num"),
            );
        };
        if id.is_empty() {
            return KillResponse::from_status(
                &id,
                Status::error(StatusCode::ErrParamInvalid, "instance id is empty"),
            );
        }
        info!(%src, instance_id = %id, %signal, "kill");

        let status = match signal {
            Signal::ShutDown | Signal::ShutDownSync => self.shutdown_instance(src, &request).await,
            Signal::ShutDownAll => self.shutdown_matching(|r| r.job_id == id).await,
            Signal::ShutDownGroup => self.shutdown_matching(|r| r.group_id == id).await,
            Signal::GroupExit | Signal::FamilyExit | Signal::AppStop => {
                self.exit_together(src, &request, signal).await
            }
            Signal::Subscribe => match self
                .inner
                .directory
                .subscribe_instance_event(src, &id, false)
                .await
            {
                Ok(()) => Status::ok(),
                Err(e) => Status::error(e.code(), e.to_string()),
            },
            Signal::Unsubscribe => {
                self.inner.directory.unsubscribe_instance_event(src, &id);
                Status::ok()
            }
            Signal::Notify => self.notify_signal(src, &request).await,
            Signal::User(_) => self.user_signal(src, &request).await,
        };
        if !status.is_ok() {
            warn!(%src, instance_id = %id, %signal, code = %status.code, message = %status.message, "kill failed");
        }
        KillResponse::from_status(&id, status)
    }

    /// A kill forwarded by a peer node.
    pub async fn handle_forward_kill(&self, request: ForwardKillRequest) -> ForwardKillResponse {
        let respond = |status: Status| ForwardKillResponse {
            request_id: request.request_id.clone(),
            code: status.code,
            message: status.message,
        };
        let id = &request.request.instance_id;

        match self.machine(id).await {
            None if self.is_tombstoned(id).await => return respond(Status::ok()),
            None => {
                return respond(Status::error(
                    StatusCode::ErrInstanceNotFound,
                    format!("instance {id} not found"),
                ));
            }
            Some(machine) => {
                let current = machine.lock().await.record().request_id.clone();
                if !request.instance_request_id.is_empty() && current != request.instance_request_id {
                    return respond(Status::error(
                        StatusCode::ErrInstanceNotFound,
                        format!("instance {id} was recreated by request {current}"),
                    ));
                }
            }
        }

        let (promise, first) = {
            let mut incoming = self.inner.incoming_kills.lock().await;
            match incoming.get(&request.request_id) {
                Some(promise) => (promise.clone(), false),
                None => {
                    let promise = Promise::new();
                    incoming.insert(request.request_id.clone(), promise.clone());
                    (promise, true)
                }
            }
        };
        if !first {
            return promise.wait().await;
        }
        let response = self.kill(&request.src_instance_id, request.request.clone()).await;
        let forwarded = respond(response.status());
        promise.resolve(forwarded.clone());
        self.inner
            .incoming_kills
            .lock()
            .await
            .remove(&request.request_id);
        forwarded
    }

    async fn route(&self, instance_id: &str) -> KillRoute {
        if let Some(machine) = self.machine(instance_id).await {
            return KillRoute::Local(machine);
        }
        if self.is_tombstoned(instance_id).await {
            return KillRoute::Exited;
        }
        match self.inner.directory.record(instance_id).await {
            Some(record) if !record.function_proxy_id.is_empty() && record.function_proxy_id != self.node_id() => {
                KillRoute::Remote {
                    owner: record.function_proxy_id,
                    instance_request_id: record.request_id,
                }
            }
            _ => KillRoute::Manager,
        }
    }

    async fn shutdown_instance(&self, src: &str, request: &KillRequest) -> Status {
        match self.route(&request.instance_id).await {
            KillRoute::Local(machine) => self.exit_local(&machine).await,
            KillRoute::Exited => Status::ok(),
            KillRoute::Remote {
                owner,
                instance_request_id,
            } => {
                self.forward_kill(&owner, src, request, &instance_request_id)
                    .await
            }
            KillRoute::Manager => self.forward_kill("", src, request, "").await,
        }
    }

    async fn shutdown_matching(&self, filter: impl Fn(&InstanceRecord) -> bool) -> Status {
        let machines = self.machines_where(filter).await;
        let exits = machines.iter().map(|m| self.exit_local(m));
        let mut status = Status::ok();
        for result in futures::future::join_all(exits).await {
            status.append(&result);
        }
        status
    }

    /// Mark the instance FATAL so its family or group sees it fail together.
    async fn exit_together(&self, src: &str, request: &KillRequest, signal: Signal) -> Status {
        let (code, msg) = match signal {
            Signal::GroupExit => (StatusCode::ErrGroupExitTogether, "group member exited"),
            Signal::FamilyExit => (StatusCode::ErrInstanceExited, "parent instance exited"),
            _ => (StatusCode::ErrInstanceExited, "application stopped"),
        };
        match self.route(&request.instance_id).await {
            KillRoute::Local(machine) => {
                {
                    let mut m = machine.lock().await;
                    if m.state().is_terminal() {
                        return Status::ok();
                    }
                    m.cancel(msg);
                }
                let ctx = TransContext::new(InstanceState::Fatal)
                    .code(code)
                    .msg(msg)
                    .exit_type(ExitType::Killed);
                match self.transition(&machine, ctx).await {
                    Ok(_) => {
                        self.release_runtime(&machine, false, None).await;
                        self.fail_create_promise(&Self::snapshot(&machine).await, code, msg)
                            .await;
                        Status::ok()
                    }
                    Err(e) => e.to_status(),
                }
            }
            KillRoute::Exited => Status::ok(),
            KillRoute::Remote {
                owner,
                instance_request_id,
            } => {
                self.forward_kill(&owner, src, request, &instance_request_id)
                    .await
            }
            KillRoute::Manager => self.forward_kill("", src, request, "").await,
        }
    }

    async fn notify_signal(&self, src: &str, request: &KillRequest) -> Status {
        let machine = match self.route(&request.instance_id).await {
            KillRoute::Local(machine) => machine,
            KillRoute::Exited => {
                return Status::error(StatusCode::ErrInstanceExited, "instance already exited");
            }
            KillRoute::Remote {
                owner,
                instance_request_id,
            } => {
                return self
                    .forward_kill(&owner, src, request, &instance_request_id)
                    .await;
            }
            KillRoute::Manager => return self.forward_kill("", src, request, "").await,
        };
        let record = Self::snapshot(&machine).await;
        if !record.state.is_ready() {
            return Status::error(
                StatusCode::ErrInstanceExited,
                format!("instance is {}", record.state),
            );
        }

        let attempts = self.inner.config.max_notification_signal_retry_times.max(1);
        let mut last = Status::ok();
        for attempt in 1..=attempts {
            match self
                .inner
                .deps
                .runtime
                .signal(&record, request.signal, &request.payload)
                .await
            {
                Ok(()) => return Status::ok(),
                Err(e) => {
                    debug!(instance_id = %record.instance_id, attempt, error = %e, "notify signal failed");
                    last = e.to_status();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.inner.config.reconnect_interval()).await;
            }
        }
        last
    }

    async fn user_signal(&self, src: &str, request: &KillRequest) -> Status {
        let machine = match self.route(&request.instance_id).await {
            KillRoute::Local(machine) => machine,
            KillRoute::Exited => {
                return Status::error(StatusCode::ErrInstanceExited, "instance already exited");
            }
            KillRoute::Remote {
                owner,
                instance_request_id,
            } => {
                return self
                    .forward_kill(&owner, src, request, &instance_request_id)
                    .await;
            }
            KillRoute::Manager => return self.forward_kill("", src, request, "").await,
        };

        let key = format!("signal-{}-{}", src, request.signal);
        let rx = machine
            .lock()
            .await
            .add_state_change_callback(SIGNALLABLE_STATES, key.clone());
        let record = match tokio::time::timeout(self.inner.config.readiness_timeout(), rx).await {
            Ok(Ok(record)) => record,
            _ => {
                machine.lock().await.remove_state_change_callback(&key);
                return Status::error(
                    StatusCode::ErrInstanceExited,
                    "instance did not become ready for the signal",
                );
            }
        };
        if !record.state.is_ready() {
            return Status::error(
                StatusCode::ErrInstanceExited,
                format!("instance is {}", record.state),
            );
        }
        match self
            .inner
            .deps
            .runtime
            .signal(&record, request.signal, &request.payload)
            .await
        {
            Ok(()) => Status::ok(),
            Err(e) => e.to_status(),
        }
    }

    /// Exit a local instance. Concurrent kills of the same instance share
    /// one exit.
    pub(super) async fn exit_local(&self, machine: &Machine) -> Status {
        let id = machine.lock().await.instance_id().to_string();
        let (promise, first) = {
            let mut exiting = self.inner.exiting.lock().await;
            match exiting.get(&id) {
                Some(promise) => (promise.clone(), false),
                None => {
                    let promise = Promise::new();
                    exiting.insert(id.clone(), promise.clone());
                    (promise, true)
                }
            }
        };
        if !first {
            debug!(instance_id = %id, "exit already in progress");
            return promise.wait().await;
        }

        let status = self.do_exit(machine).await;
        promise.resolve(status.clone());
        self.inner.exiting.lock().await.remove(&id);
        status
    }

    async fn do_exit(&self, machine: &Machine) -> Status {
        let (state, request_id, exits) = {
            let mut m = machine.lock().await;
            m.cancel("instance killed");
            let exits = m.increment_exit_times();
            (m.state(), m.record().request_id.clone(), exits)
        };
        let id = machine.lock().await.instance_id().to_string();
        // Past the exit budget the runtime is killed without a graceful shutdown.
        let graceful = if exits > self.inner.config.max_exit_times {
            warn!(instance_id = %id, exits, "exit retried too often, skipping graceful shutdown");
            None
        } else {
            Some(self.inner.config.runtime_shutdown_timeout())
        };

        if state == InstanceState::Scheduling {
            self.inner.deps.scheduler.cancel(&request_id).await;
        }
        let state = if state == InstanceState::Evicting {
            let rx = machine
                .lock()
                .await
                .add_state_change_callback(SETTLED_STATES, format!("exit-{id}"));
            let wait = self.inner.config.runtime_shutdown_timeout() * 2;
            match tokio::time::timeout(wait, rx).await {
                Ok(Ok(record)) => record.state,
                _ => {
                    return Status::error(
                        StatusCode::ErrInnerSystemError,
                        "instance eviction did not finish",
                    );
                }
            }
        } else {
            state
        };

        match state {
            InstanceState::Exited => return Status::ok(),
            InstanceState::Fatal | InstanceState::Evicted => {}
            InstanceState::Exiting => self.release_runtime(machine, false, graceful).await,
            _ => {
                let ctx = TransContext::new(InstanceState::Exiting)
                    .code(StatusCode::ErrInstanceExited)
                    .msg("instance killed")
                    .exit_type(ExitType::Killed);
                if let Err(e) = self.transition(machine, ctx).await {
                    return e.to_status();
                }
                self.release_runtime(machine, false, graceful).await;
            }
        }
        self.finish_exit(machine, "instance killed").await
    }

    /// Settle to EXITED and drop the instance from this node.
    pub(super) async fn finish_exit(&self, machine: &Machine, reason: &str) -> Status {
        let ctx = TransContext::new(InstanceState::Exited).msg(reason);
        let record = match self.settle(machine, ctx).await {
            Ok(record) => record,
            Err(e) => return e.to_status(),
        };
        let id = &record.instance_id;
        if let Err(e) = self.inner.deps.meta_store.delete_instance(id).await {
            warn!(instance_id = %id, error = %e, "failed to delete instance record");
        }
        self.inner.directory.delete(id);
        self.fail_create_promise(&record, StatusCode::ErrInstanceExited, reason)
            .await;
        self.forget(&record).await;
        self.inner.tombstones.lock().await.insert(id);
        info!(instance_id = %id, "instance exited");
        Status::ok()
    }

    /// Send a kill to `owner` (or the instance manager when empty).
    /// Identical forwards share one in-flight request.
    async fn forward_kill(
        &self,
        owner: &str,
        src: &str,
        request: &KillRequest,
        instance_request_id: &str,
    ) -> Status {
        let request_id = format!("{}-{}", request.instance_id, request.signal);
        let (promise, first) = {
            let mut pending = self.inner.forward_kills.lock().await;
            match pending.get(&request_id) {
                Some(promise) => (promise.clone(), false),
                None => {
                    let promise = Promise::new();
                    pending.insert(request_id.clone(), promise.clone());
                    (promise, true)
                }
            }
        };
        if !first {
            return promise.wait().await;
        }

        let forward = ForwardKillRequest {
            request_id: request_id.clone(),
            src_instance_id: src.to_string(),
            instance_request_id: instance_request_id.to_string(),
            request: request.clone(),
        };
        let status = self.send_forward_kill(owner, &forward).await;
        promise.resolve(status.clone());
        self.inner.forward_kills.lock().await.remove(&request_id);
        status
    }

    async fn send_forward_kill(&self, owner: &str, forward: &ForwardKillRequest) -> Status {
        let config = &self.inner.config;
        let cycle = config.forward_kill_retry_cycle(forward.request.is_synchronized);
        let pause = config.reconnect_interval().min(cycle);
        let attempts = config.max_forward_kill_retry_times.max(1);
        let target = if owner.is_empty() { "instance manager" } else { owner };

        for attempt in 1..=attempts {
            match tokio::time::timeout(cycle, self.inner.deps.cluster.forward_kill(owner, forward)).await
            {
                Ok(Ok(response)) => {
                    debug!(instance_id = %forward.request.instance_id, %target, code = %response.code, "kill forwarded");
                    return Status::error(response.code, response.message);
                }
                Ok(Err(e)) => {
                    warn!(instance_id = %forward.request.instance_id, %target, attempt, error = %e, "forward kill failed")
                }
                Err(_) => {
                    warn!(instance_id = %forward.request.instance_id, %target, attempt, "forward kill timed out")
                }
            }
            if attempt < attempts {
                tokio::time::sleep(pause.max(Duration::from_millis(1))).await;
            }
        }
        Status::error(
            StatusCode::ErrInnerCommunication,
            format!("forward kill to {target} failed after {attempts} attempts"),
        )
    }
}

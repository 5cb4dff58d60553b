//! Schedule, dispatch and reschedule.

use std::time::Duration;

use funcgrid_core::{CallResult, ScheduleRequest, ScheduleResponse, Status, StatusCode};
use funcgrid_lifecycle::TransContext;
use funcgrid_state::{InstanceRecord, InstanceState};
use futures::future::BoxFuture;
use rand::Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{InstanceCtrl, Machine, create_failure, request_from_record};
use crate::error::{ControlError, ControlResult};
use crate::traits::{AgentKillRequest, DeployRequest, FunctionMeta};

const EXISTING_OUTCOME_STATES: &[InstanceState] = &[
    InstanceState::Creating,
    InstanceState::Running,
    InstanceState::SubHealth,
    InstanceState::ScheduleFailed,
    InstanceState::Fatal,
    InstanceState::Exiting,
    InstanceState::Evicting,
    InstanceState::Evicted,
    InstanceState::Exited,
];

fn validate(request: &ScheduleRequest) -> ControlResult<()> {
    if request.request_id.is_empty() {
        return Err(ControlError::InvalidParam("request_id is empty".into()));
    }
    if request.function_key.is_empty() {
        return Err(ControlError::InvalidParam("function_key is empty".into()));
    }
    if !request.resources.is_valid() {
        return Err(ControlError::InvalidParam(format!(
            "invalid resources: cpu {}m, memory {}MB",
            request.resources.cpu_millis, request.resources.memory_mb
        )));
    }
    if let Some(range) = &request.range {
        if !range.is_valid() {
            return Err(ControlError::InvalidParam(format!(
                "invalid instance range {}..={} step {}",
                range.min, range.max, range.step
            )));
        }
    }
    Ok(())
}

impl InstanceCtrl {
    /// Admit a schedule request. Requests sharing a `request_id` share one
    /// outcome and cause at most one placement.
    pub async fn schedule(&self, request: ScheduleRequest) -> ScheduleResponse {
        if let Err(e) = self.accepting().and_then(|()| validate(&request)) {
            warn!(request_id = %request.request_id, error = %e, "schedule rejected");
            return ScheduleResponse::failed(&request, e.code(), e.to_string());
        }

        let (promise, first) = {
            let mut requests = self.inner.requests.lock().await;
            match requests.get(&request.request_id) {
                Some(promise) => (promise.clone(), false),
                None => {
                    let promise = funcgrid_core::Promise::new();
                    requests.insert(request.request_id.clone(), promise.clone());
                    (promise, true)
                }
            }
        };
        if !first {
            debug!(request_id = %request.request_id, "duplicate schedule request");
            return promise.wait().await;
        }

        let response = self.admit(request).await;
        promise.resolve(response.clone());
        if !response.code.is_ok() {
            let mut requests = self.inner.requests.lock().await;
            if requests
                .get(&response.request_id)
                .is_some_and(|p| p.same(&promise))
            {
                requests.remove(&response.request_id);
            }
        }
        response
    }

    async fn admit(&self, mut request: ScheduleRequest) -> ScheduleResponse {
        if let Err(reason) = self.inner.deps.authorizer.authorize(&request).await {
            warn!(request_id = %request.request_id, %reason, "schedule not authorized");
            return ScheduleResponse::failed(&request, StatusCode::ErrAuthorizeFailed, reason);
        }

        if !request.parent_id.is_empty() {
            if let Some(parent) = self.inner.directory.record(&request.parent_id).await {
                if parent.state.is_terminal() {
                    return ScheduleResponse::failed(
                        &request,
                        StatusCode::ErrInstanceExited,
                        format!("parent {} is {}", parent.instance_id, parent.state),
                    );
                }
            }
        }

        let Some(meta) = self.inner.deps.function_meta.get(&request.function_key).await else {
            return ScheduleResponse::failed(
                &request,
                StatusCode::ErrFunctionMetaNotFound,
                format!("function {} not found", request.function_key),
            );
        };

        if request.instance_id.is_empty() {
            request.instance_id = Uuid::new_v4().to_string();
        }
        let id = request.instance_id.clone();

        let machine = match self.machine(&id).await {
            Some(machine) => {
                let state = machine.lock().await.state();
                match state {
                    InstanceState::Running | InstanceState::SubHealth => {
                        return ScheduleResponse::failed(
                            &request,
                            StatusCode::ErrInstanceDuplicated,
                            format!("instance {id} is already running"),
                        );
                    }
                    InstanceState::New | InstanceState::Scheduling | InstanceState::Creating => {
                        return self.wait_existing(&machine, &request).await;
                    }
                    InstanceState::Failed | InstanceState::ScheduleFailed => machine,
                    terminal => {
                        return ScheduleResponse::failed(
                            &request,
                            StatusCode::ErrInstanceExited,
                            format!("instance {id} is {terminal}"),
                        );
                    }
                }
            }
            None if self.is_tombstoned(&id).await => {
                return ScheduleResponse::failed(
                    &request,
                    StatusCode::ErrInstanceExited,
                    format!("instance {id} already exited"),
                );
            }
            None => {
                let config = &self.inner.config;
                let record = InstanceRecord::from_request(
                    &request,
                    &id,
                    &config.node_id,
                    request.schedule_times.unwrap_or(config.default_reschedule_times),
                    request
                        .recover_retry_times
                        .unwrap_or(config.runtime_recover_retry_times),
                );
                self.insert_machine(record).await
            }
        };

        self.ensure_create_promise(&id).await;
        if let Err(e) = self
            .transition(&machine, TransContext::new(InstanceState::Scheduling))
            .await
        {
            warn!(instance_id = %id, error = %e, "failed to start scheduling");
            let record = Self::snapshot(&machine).await;
            if record.state == InstanceState::New {
                self.forget(&record).await;
            }
            return ScheduleResponse::failed(&request, e.code(), e.to_string());
        }
        info!(
            instance_id = %id,
            request_id = %request.request_id,
            function_key = %request.function_key,
            "instance scheduling"
        );
        self.place(&machine, request, meta).await
    }

    /// A request for an instance that is already being scheduled waits for
    /// that schedule's outcome.
    async fn wait_existing(&self, machine: &Machine, request: &ScheduleRequest) -> ScheduleResponse {
        let key = format!("schedule-{}", request.request_id);
        let rx = machine
            .lock()
            .await
            .add_state_change_callback(EXISTING_OUTCOME_STATES, key);
        let Ok(record) = rx.await else {
            return ScheduleResponse::failed(
                request,
                StatusCode::ErrInstanceExited,
                "instance went away while scheduling",
            );
        };
        match record.state {
            InstanceState::Creating | InstanceState::Running | InstanceState::SubHealth => {
                ScheduleResponse {
                    request_id: request.request_id.clone(),
                    instance_id: record.instance_id,
                    code: StatusCode::Ok,
                    message: String::new(),
                    allocated: record.resources,
                }
            }
            _ => {
                let code = if record.status.err_code.is_ok() {
                    StatusCode::ErrInstanceExited
                } else {
                    record.status.err_code
                };
                ScheduleResponse::failed(request, code, record.status.msg)
            }
        }
    }

    /// Ask the scheduler for a placement and act on the decision.
    /// The machine must be in SCHEDULING.
    async fn place(
        &self,
        machine: &Machine,
        request: ScheduleRequest,
        meta: FunctionMeta,
    ) -> ScheduleResponse {
        let cancel = machine.lock().await.cancel_signal();
        let decision = self.inner.deps.scheduler.schedule(&request).await;

        if let Some(reason) = cancel.peek() {
            return ScheduleResponse::failed(&request, StatusCode::ErrInstanceExited, reason);
        }
        if !decision.is_ok() {
            self.schedule_failed(machine, decision.code, &decision.message)
                .await;
            return ScheduleResponse::failed(&request, decision.code, decision.message);
        }
        if !decision.function_proxy_id.is_empty() && decision.function_proxy_id != self.node_id() {
            return self
                .forward_schedule(machine, &request, &decision.function_proxy_id)
                .await;
        }

        let unit_id = decision.unit_id.clone();
        let allocated = decision.allocated.clone();
        let record = match self
            .transition_from(
                machine,
                &[InstanceState::Scheduling],
                TransContext::new(InstanceState::Creating).update(move |r| r.unit_id = unit_id),
            )
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!(instance_id = %request.instance_id, error = %e, "placement dropped");
                return ScheduleResponse::failed(&request, e.code(), e.to_string());
            }
        };
        self.inner
            .deps
            .resource_view
            .add_instance(&record.unit_id, &record.instance_id, &allocated)
            .await;
        info!(
            instance_id = %record.instance_id,
            unit_id = %record.unit_id,
            "instance placed"
        );
        tokio::spawn(self.clone().dispatch(machine.clone(), meta));

        ScheduleResponse {
            request_id: request.request_id,
            instance_id: record.instance_id,
            code: StatusCode::Ok,
            message: String::new(),
            allocated,
        }
    }

    async fn schedule_failed(&self, machine: &Machine, code: StatusCode, msg: &str) {
        let record = match self
            .transition(
                machine,
                TransContext::new(InstanceState::ScheduleFailed).code(code).msg(msg),
            )
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "failed to record schedule failure");
                Self::snapshot(machine).await
            }
        };
        warn!(instance_id = %record.instance_id, %code, %msg, "instance schedule failed");
        let failure = create_failure(&record, code, msg);
        if let Some(promise) = self.create_promise(&record.instance_id).await {
            promise.resolve(failure.clone());
        }
        let ack = self.send_call_result(&record, &failure).await;
        if !ack.code.is_ok() {
            debug!(instance_id = %record.instance_id, code = %ack.code, "parent not notified of schedule failure");
        }
    }

    /// The scheduler picked another node: hand the instance over to it.
    /// A create caller already waiting here is answered with the hand-over
    /// outcome; the peer reports the create result itself.
    async fn forward_schedule(
        &self,
        machine: &Machine,
        request: &ScheduleRequest,
        proxy_id: &str,
    ) -> ScheduleResponse {
        let record = Self::snapshot(machine).await;
        if let Err(e) = self
            .inner
            .deps
            .meta_store
            .delete_instance(&record.instance_id)
            .await
        {
            warn!(instance_id = %record.instance_id, error = %e, "failed to drop local record");
        }
        self.inner.directory.delete(&record.instance_id);
        let pending = self.create_promise(&record.instance_id).await;
        self.forget(&record).await;

        let response = self.send_forward_schedule(&record, request, proxy_id).await;
        if let Some(promise) = pending {
            if response.code.is_ok() {
                promise.resolve(CallResult {
                    request_id: record.request_id.clone(),
                    instance_id: record.instance_id.clone(),
                    code: StatusCode::Ok,
                    message: "instance scheduled on a peer node".to_string(),
                    is_create: true,
                    ..Default::default()
                });
            } else {
                let failure = create_failure(&record, response.code, &response.message);
                if promise.resolve(failure.clone()) {
                    self.send_call_result(&record, &failure).await;
                }
            }
        }
        response
    }

    async fn send_forward_schedule(
        &self,
        record: &InstanceRecord,
        request: &ScheduleRequest,
        proxy_id: &str,
    ) -> ScheduleResponse {
        let config = &self.inner.config;
        let cycle = config.forward_schedule_retry_cycle();
        for attempt in 1..=config.max_forward_schedule_retry_times {
            let forward = self.inner.deps.cluster.forward_schedule(proxy_id, request);
            match tokio::time::timeout(cycle, forward).await {
                Ok(Ok(response)) => {
                    info!(
                        instance_id = %record.instance_id,
                        %proxy_id,
                        code = %response.code,
                        "schedule forwarded"
                    );
                    return response;
                }
                Ok(Err(e)) => {
                    warn!(instance_id = %record.instance_id, %proxy_id, attempt, error = %e, "forward schedule failed")
                }
                Err(_) => {
                    warn!(instance_id = %record.instance_id, %proxy_id, attempt, "forward schedule timed out")
                }
            }
        }
        ScheduleResponse::failed(
            request,
            StatusCode::ErrInnerCommunication,
            format!("forward schedule to {proxy_id} failed"),
        )
    }

    /// Deploy, wait for readiness, then send the init call. Named future
    /// type so reschedule can spawn it again.
    fn dispatch(self, machine: Machine, meta: FunctionMeta) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let id = machine.lock().await.instance_id().to_string();
            self.inner.redeploying.lock().await.insert(id.clone());
            let outcome = self.deploy_with_retry(&machine, &meta).await;
            self.inner.redeploying.lock().await.remove(&id);

            match outcome {
                Ok(()) => self.init_instance(&machine).await,
                Err(status) if status.code == StatusCode::ErrScheduleCanceled => {
                    debug!(instance_id = %id, "dispatch canceled");
                }
                Err(status) => self.reschedule(&machine, status).await,
            }
        })
    }

    async fn deploy_with_retry(&self, machine: &Machine, meta: &FunctionMeta) -> Result<(), Status> {
        let config = &self.inner.config;
        let max = config.max_instance_redeploy_times;
        let mut last = Status::ok();
        for attempt in 1..=max {
            if attempt > 1 {
                let ms = rand::rng()
                    .random_range(config.min_deploy_interval_ms..=config.max_deploy_interval_ms);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            let record = {
                let m = machine.lock().await;
                if m.is_cancelled() || m.state() != InstanceState::Creating {
                    return Err(Status::error(
                        StatusCode::ErrScheduleCanceled,
                        "instance dispatch canceled",
                    ));
                }
                m.record().clone()
            };
            match self.deploy_once(machine, &DeployRequest::new(&record, meta)).await {
                Ok(()) => return Ok(()),
                Err(ControlError::Canceled(reason)) => {
                    return Err(Status::error(StatusCode::ErrScheduleCanceled, reason));
                }
                Err(e) => {
                    warn!(instance_id = %record.instance_id, attempt, max, error = %e, "deploy attempt failed");
                    last = e.to_status();
                }
            }
        }
        Err(Status::error(
            StatusCode::LsDeployInstanceFailed,
            format!("deploy failed after {max} attempts: {}", last.message),
        ))
    }

    async fn deploy_once(&self, machine: &Machine, request: &DeployRequest) -> ControlResult<()> {
        let deployed = self.inner.deps.agent.deploy_instance(request).await?;
        let record = {
            let mut m = machine.lock().await;
            m.update_record(|r| {
                r.runtime_id = deployed.runtime_id.clone();
                r.runtime_address = deployed.runtime_address.clone();
                r.deploy_times += 1;
            });
            m.record().clone()
        };
        if machine.lock().await.is_cancelled() {
            self.kill_deployed(machine, &record).await;
            return Err(ControlError::Canceled("instance killed during deploy".into()));
        }

        let runtime = &self.inner.deps.runtime;
        let ready = async {
            runtime.connect(&record).await?;
            runtime.readiness(&record).await
        };
        let outcome = match tokio::time::timeout(self.inner.config.readiness_timeout(), ready).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::timeout("runtime readiness")),
        };
        if let Err(e) = outcome {
            self.kill_deployed(machine, &record).await;
            return Err(e);
        }
        debug!(
            instance_id = %record.instance_id,
            runtime_id = %record.runtime_id,
            "runtime ready"
        );
        Ok(())
    }

    async fn kill_deployed(&self, machine: &Machine, record: &InstanceRecord) {
        self.inner.deps.runtime.close(&record.instance_id).await;
        if let Err(e) = self
            .inner
            .deps
            .agent
            .kill_instance(&AgentKillRequest::new(record, false))
            .await
        {
            warn!(instance_id = %record.instance_id, error = %e, "failed to kill unready runtime");
        }
        machine.lock().await.update_record(|r| {
            r.runtime_id.clear();
            r.runtime_address.clear();
        });
    }

    async fn init_instance(&self, machine: &Machine) {
        let record = Self::snapshot(machine).await;
        let promise = self.ensure_create_promise(&record.instance_id).await;
        if let Err(e) = self.inner.deps.runtime.init_call(&record).await {
            let msg = format!("failed to send init call: {e}");
            self.fail_create(
                machine,
                StatusCode::ErrRequestBetweenRuntimeBus,
                &msg,
                create_failure(&record, StatusCode::ErrRequestBetweenRuntimeBus, &msg),
            )
            .await;
            return;
        }

        let cancel = machine.lock().await.cancel_signal();
        tokio::select! {
            result = promise.wait_timeout(self.inner.config.init_call_timeout()) => {
                if result.is_some() {
                    return;
                }
            }
            _ = cancel.wait() => return,
        }
        let msg = "failed to receive call result, reason(timeout)";
        warn!(instance_id = %record.instance_id, "init call timed out");
        self.fail_create(
            machine,
            StatusCode::ErrRequestBetweenRuntimeBus,
            msg,
            create_failure(&record, StatusCode::ErrRequestBetweenRuntimeBus, msg),
        )
        .await;
    }

    /// Send the instance back through placement, or to FATAL once its
    /// reschedule budget is spent.
    pub(super) async fn reschedule(&self, machine: &Machine, reason: Status) {
        let record = Self::snapshot(machine).await;
        let id = record.instance_id.clone();
        if machine.lock().await.is_cancelled() {
            debug!(instance_id = %id, "instance canceled, not rescheduling");
            return;
        }
        if record.schedule_times == 0 {
            warn!(instance_id = %id, code = %reason.code, reason = %reason.message, "reschedule budget exhausted");
            if self.set_fatal(machine, reason.code, &reason.message).await.is_ok() {
                self.report_fatal(machine, reason.code, &reason.message).await;
            }
            return;
        }

        self.release_runtime(machine, false, None).await;
        if record.state != InstanceState::Failed {
            let ctx = TransContext::new(InstanceState::Failed)
                .code(reason.code)
                .msg(reason.message.clone());
            if let Err(e) = self.transition(machine, ctx).await {
                warn!(instance_id = %id, error = %e, "cannot reschedule");
                return;
            }
        }
        let ctx = TransContext::new(InstanceState::Scheduling)
            .update(|r| r.schedule_times = r.schedule_times.saturating_sub(1));
        let record = match self.transition(machine, ctx).await {
            Ok(record) => record,
            Err(e) => {
                warn!(instance_id = %id, error = %e, "cannot reschedule");
                return;
            }
        };
        info!(
            instance_id = %id,
            remaining = record.schedule_times,
            reason = %reason.message,
            "instance rescheduling"
        );
        self.ensure_create_promise(&id).await;

        let Some(meta) = self.inner.deps.function_meta.get(&record.function_key).await else {
            let msg = format!("function {} not found", record.function_key);
            if self
                .set_fatal(machine, StatusCode::ErrFunctionMetaNotFound, &msg)
                .await
                .is_ok()
            {
                self.report_fatal(machine, StatusCode::ErrFunctionMetaNotFound, &msg)
                    .await;
            }
            return;
        };
        let response = self.place(machine, request_from_record(&record), meta).await;
        if !response.code.is_ok() {
            warn!(instance_id = %id, code = %response.code, message = %response.message, "reschedule failed");
        }
    }

    /// Tell the creator and the parent that the instance will not start.
    pub(super) async fn report_fatal(&self, machine: &Machine, code: StatusCode, msg: &str) {
        let record = Self::snapshot(machine).await;
        let failure = create_failure(&record, code, msg);
        let pending = self
            .create_promise(&record.instance_id)
            .await
            .is_some_and(|p| p.resolve(failure.clone()));
        if pending {
            self.send_call_result(&record, &failure).await;
        }
    }
}

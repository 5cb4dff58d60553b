//! Create results and call-result relaying.

use funcgrid_core::{CallResult, CallResultAck, ExitType, ScheduleRequest, StatusCode};
use funcgrid_lifecycle::TransContext;
use funcgrid_routing::UpdateSource;
use funcgrid_state::{InstanceRecord, InstanceState};
use tracing::{debug, info, warn};

use super::{InstanceCtrl, Machine};
use crate::traits::{ForwardCallResultRequest, ForwardCallResultResponse};

impl InstanceCtrl {
    /// Schedule an instance and wait for its create result.
    pub async fn create_instance(&self, request: ScheduleRequest) -> CallResult {
        let request_id = request.request_id.clone();
        let response = self.schedule(request).await;
        if !response.code.is_ok() {
            return CallResult {
                request_id,
                instance_id: response.instance_id,
                code: response.code,
                message: response.message,
                is_create: true,
                ..Default::default()
            };
        }

        let id = response.instance_id;
        if let Some(promise) = self.create_promise(&id).await {
            return promise.wait().await;
        }
        let (code, message) = match self.instance(&id).await {
            Some(record) if record.state.is_ready() => (StatusCode::Ok, String::new()),
            Some(record) if !record.status.err_code.is_ok() => {
                (record.status.err_code, record.status.msg)
            }
            Some(record) => (
                StatusCode::ErrInstanceExited,
                format!("instance is {}", record.state),
            ),
            None if self.is_tombstoned(&id).await => {
                (StatusCode::ErrInstanceExited, "instance already exited".to_string())
            }
            None => (StatusCode::Ok, "instance scheduled on a peer node".to_string()),
        };
        CallResult {
            request_id,
            instance_id: id,
            code,
            message,
            is_create: true,
            ..Default::default()
        }
    }

    /// A result reported by a runtime: either the create result of the
    /// reporting instance or an ordinary result bound for its parent.
    pub async fn call_result(&self, from: &str, result: CallResult) -> CallResultAck {
        let id = result.instance_id.clone();
        let Some(machine) = self.machine(&id).await else {
            debug!(%from, instance_id = %id, "call result for unknown instance");
            return CallResultAck::error(StatusCode::LsRequestNotFound, format!("instance {id} not found"));
        };
        let record = Self::snapshot(&machine).await;
        match record.state {
            InstanceState::Running | InstanceState::SubHealth => {
                return self.send_call_result(&record, &result).await;
            }
            InstanceState::Exiting | InstanceState::Evicting => {
                return CallResultAck::error(
                    StatusCode::ErrInstanceEvicted,
                    format!("instance {id} is {}", record.state),
                );
            }
            InstanceState::Creating => {}
            other => {
                return CallResultAck::error(
                    StatusCode::ErrInstanceExited,
                    format!("instance {id} is {other}"),
                );
            }
        }

        if result.code.is_ok() {
            self.create_succeeded(&machine, result).await
        } else {
            let msg = result.message.clone();
            warn!(instance_id = %id, code = %result.code, %msg, "instance init failed");
            self.fail_create(&machine, StatusCode::ErrUserFunctionException, &msg, result)
                .await
        }
    }

    async fn create_succeeded(&self, machine: &Machine, result: CallResult) -> CallResultAck {
        let record = match self
            .transition_from(
                machine,
                &[InstanceState::Creating],
                TransContext::new(InstanceState::Running),
            )
            .await
        {
            Ok(record) => record,
            Err(e) => return CallResultAck::error(e.code(), e.to_string()),
        };
        let id = &record.instance_id;
        if let Some(promise) = self.create_promise(id).await {
            promise.resolve(result.clone());
        }
        self.inner.heartbeat.start(id, &record.runtime_id).await;
        info!(
            instance_id = %id,
            runtime_id = %record.runtime_id,
            deploy_times = record.deploy_times,
            "instance running"
        );

        let ack = self.send_call_result(&record, &result).await;
        if ack.code.is_ok() {
            self.inner.create_results.lock().await.remove(id);
        }
        ack
    }

    /// CREATING -> FATAL: resolve the create promise with `result`, release
    /// the runtime and tell the parent.
    pub(super) async fn fail_create(
        &self,
        machine: &Machine,
        code: StatusCode,
        msg: &str,
        result: CallResult,
    ) -> CallResultAck {
        let ctx = TransContext::new(InstanceState::Fatal)
            .code(code)
            .msg(msg)
            .exit_type(ExitType::Exception);
        let record = match self
            .transition_from(machine, &[InstanceState::Creating], ctx)
            .await
        {
            Ok(record) => record,
            Err(e) => return CallResultAck::error(e.code(), e.to_string()),
        };
        if let Some(promise) = self.create_promise(&record.instance_id).await {
            promise.resolve(result.clone());
        }
        self.release_runtime(machine, false, None).await;
        self.send_call_result(&record, &result).await
    }

    /// Deliver `result` produced by `record` to its parent, locally or via
    /// the parent's node.
    pub(super) async fn send_call_result(
        &self,
        record: &InstanceRecord,
        result: &CallResult,
    ) -> CallResultAck {
        if record.parent_id.is_empty() {
            return CallResultAck::ok();
        }
        let parent_node = &record.parent_proxy_id;
        if parent_node.is_empty() || parent_node == self.node_id() {
            return match self
                .inner
                .deps
                .runtime
                .notify_result(&record.parent_id, result)
                .await
            {
                Ok(ack) => ack,
                Err(e) => {
                    warn!(parent_id = %record.parent_id, error = %e, "failed to notify parent");
                    CallResultAck::error(e.code(), e.to_string())
                }
            };
        }

        let request = ForwardCallResultRequest {
            request_id: result.request_id.clone(),
            instance_id: record.parent_id.clone(),
            ready_record: record.state.is_ready().then(|| record.clone()),
            result: result.clone(),
        };
        match self
            .inner
            .deps
            .cluster
            .forward_call_result(parent_node, &request)
            .await
        {
            Ok(response) => CallResultAck::error(response.code, response.message),
            Err(e) => {
                warn!(parent_id = %record.parent_id, %parent_node, error = %e, "failed to forward call result");
                CallResultAck::error(e.code(), e.to_string())
            }
        }
    }

    /// A call result relayed from the node owning the responding instance.
    pub async fn handle_forward_call_result(
        &self,
        request: ForwardCallResultRequest,
    ) -> ForwardCallResultResponse {
        let respond = |code: StatusCode, message: String| ForwardCallResultResponse {
            request_id: request.request_id.clone(),
            code,
            message,
        };

        if let Some(ready) = &request.ready_record {
            if ready.low_reliability && self.inner.directory.record(&ready.instance_id).await.is_none() {
                return respond(
                    StatusCode::ErrInstanceExited,
                    format!("instance {} already exited", ready.instance_id),
                );
            }
            if ready.state == InstanceState::Running {
                self.inner
                    .directory
                    .update(ready.clone(), false, UpdateSource::Fast);
            }
        }

        match self
            .inner
            .deps
            .runtime
            .notify_result(&request.instance_id, &request.result)
            .await
        {
            Ok(ack) => respond(ack.code, ack.message),
            Err(e) => respond(e.code(), e.to_string()),
        }
    }
}

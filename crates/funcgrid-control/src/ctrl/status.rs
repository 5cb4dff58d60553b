//! Runtime exit reports, heartbeat loss, health changes and recovery.

use funcgrid_core::{ExitType, InstanceExitStatus, Promise, Status, StatusCode};
use funcgrid_lifecycle::TransContext;
use funcgrid_state::InstanceState;
use tracing::{debug, info, warn};

use super::{InstanceCtrl, Machine};
use crate::traits::HealthState;

impl InstanceCtrl {
    /// Exit report from the runtime manager.
    pub async fn update_instance_status(&self, report: InstanceExitStatus) -> Status {
        let id = report.instance_id.clone();
        let Some(machine) = self.machine(&id).await else {
            return Status::error(
                StatusCode::ErrInstanceNotFound,
                format!("instance {id} not found"),
            );
        };
        if self.inner.redeploying.lock().await.contains(&id) {
            debug!(instance_id = %id, "instance is redeploying, exit report ignored");
            return Status::ok();
        }

        let record = Self::snapshot(&machine).await;
        if matches!(
            record.state,
            InstanceState::Scheduling
                | InstanceState::Failed
                | InstanceState::Evicted
                | InstanceState::ScheduleFailed
                | InstanceState::Fatal
        ) {
            return Status::error(
                StatusCode::ErrInnerSystemError,
                "invalid instance state to change",
            );
        }

        if let Some(waiter) = self.inner.status_updates.lock().await.get(&id) {
            waiter.resolve(report.clone());
        }
        if !record.is_owned_by(self.node_id()) {
            return Status::ok();
        }
        if matches!(
            record.state,
            InstanceState::Exiting | InstanceState::Evicting | InstanceState::Exited
        ) {
            return Status::ok();
        }

        info!(
            instance_id = %id,
            exit_code = report.exit_code,
            err_code = %report.err_code,
            msg = %report.status_msg,
            "instance exit reported"
        );
        let code = if report.err_code.is_ok() {
            StatusCode::ErrInstanceExited
        } else {
            report.err_code
        };
        let recoverable = machine.lock().await.is_runtime_recover_enabled()
            && !report.err_code.is_user_error()
            && report.exit_type != ExitType::Return;
        if recoverable {
            self.recover_by_reschedule(&machine, Status::error(code, report.status_msg.clone()))
                .await;
            return Status::ok();
        }

        let ctx = TransContext::new(InstanceState::Fatal)
            .code(code)
            .msg(report.status_msg.clone())
            .exit_code(report.exit_code)
            .exit_type(report.exit_type);
        match self.transition(&machine, ctx).await {
            Ok(_) => {
                self.release_runtime(&machine, false, None).await;
                self.report_fatal(&machine, code, &report.status_msg).await;
                Status::ok()
            }
            Err(e) => e.to_status(),
        }
    }

    /// The heartbeat monitor gave up on `runtime_id`.
    pub async fn handle_runtime_heartbeat_lost(&self, instance_id: &str, runtime_id: &str) {
        let Some(machine) = self.machine(instance_id).await else {
            return;
        };
        let record = Self::snapshot(&machine).await;
        if record.runtime_id != runtime_id || !record.state.is_ready() {
            debug!(%instance_id, %runtime_id, current = %record.runtime_id, "stale heartbeat loss ignored");
            return;
        }
        warn!(%instance_id, %runtime_id, "runtime heartbeat lost");
        self.inner.deps.runtime.close(instance_id).await;

        let waiter = {
            let mut updates = self.inner.status_updates.lock().await;
            updates
                .entry(instance_id.to_string())
                .or_insert_with(Promise::new)
                .clone()
        };
        let reported = waiter
            .wait_timeout(self.inner.config.wait_status_code_update())
            .await;
        self.inner.status_updates.lock().await.remove(instance_id);
        if reported.is_some() {
            debug!(%instance_id, "exit report arrived after heartbeat loss");
            return;
        }

        let record = Self::snapshot(&machine).await;
        if record.runtime_id != runtime_id || !record.state.is_ready() {
            return;
        }
        if !machine.lock().await.is_runtime_recover_enabled() {
            self.fatal_and_report(&machine, StatusCode::ErrInstanceExited, "runtime heartbeat lost")
                .await;
            return;
        }

        let config = &self.inner.config;
        for attempt in 1..=config.max_instance_reconnect_times {
            let connect = self.inner.deps.runtime.connect(&record);
            match tokio::time::timeout(config.connect_timeout(), connect).await {
                Ok(Ok(())) => {
                    info!(%instance_id, attempt, "runtime reconnected");
                    self.inner.heartbeat.start(instance_id, runtime_id).await;
                    return;
                }
                Ok(Err(e)) => debug!(%instance_id, attempt, error = %e, "reconnect failed"),
                Err(_) => debug!(%instance_id, attempt, "reconnect timed out"),
            }
            tokio::time::sleep(config.reconnect_interval()).await;
        }
        self.recover_by_reschedule(
            &machine,
            Status::error(StatusCode::ErrInstanceExited, "runtime heartbeat lost"),
        )
        .await;
    }

    /// RUNNING <-> SUB_HEALTH as reported by heartbeats.
    pub async fn handle_instance_health_change(&self, instance_id: &str, health: HealthState) {
        let Some(machine) = self.machine(instance_id).await else {
            return;
        };
        let state = machine.lock().await.state();
        let ctx = match (state, health) {
            (InstanceState::Running, HealthState::SubHealth) => {
                TransContext::new(InstanceState::SubHealth)
                    .code(StatusCode::ErrInstanceSubHealth)
                    .msg("instance is sub-health")
            }
            (InstanceState::SubHealth, HealthState::Healthy) => {
                TransContext::new(InstanceState::Running)
            }
            _ => return,
        };
        match self.transition(&machine, ctx).await {
            Ok(record) => info!(%instance_id, state = %record.state, "instance health changed"),
            Err(e) => warn!(%instance_id, error = %e, "health change not applied"),
        }
    }

    /// Resume an instance found in `machine` after a restart or agent
    /// resync.
    pub(super) async fn recover_instance(&self, machine: &Machine) {
        let record = Self::snapshot(machine).await;
        let id = &record.instance_id;
        debug!(instance_id = %id, state = %record.state, "recovering instance");
        match record.state {
            InstanceState::Running | InstanceState::SubHealth => {
                let runtime = &self.inner.deps.runtime;
                let reconnect = async {
                    runtime.connect(&record).await?;
                    runtime.readiness(&record).await
                };
                match tokio::time::timeout(self.inner.config.readiness_timeout(), reconnect).await {
                    Ok(Ok(())) => {
                        self.inner.heartbeat.start(id, &record.runtime_id).await;
                        info!(instance_id = %id, "instance recovered");
                    }
                    _ => {
                        self.recover_by_reschedule(
                            machine,
                            Status::error(StatusCode::LsSyncInstanceFail, "runtime unreachable after recovery"),
                        )
                        .await;
                    }
                }
            }
            InstanceState::Scheduling | InstanceState::Creating | InstanceState::Failed => {
                self.reschedule(
                    machine,
                    Status::error(StatusCode::LsSyncInstanceFail, "instance interrupted while starting"),
                )
                .await;
            }
            InstanceState::Exiting => {
                self.exit_local(machine).await;
            }
            InstanceState::Fatal => self.release_runtime(machine, false, None).await,
            InstanceState::Evicting => {
                self.finish_evict(machine, false, None).await;
            }
            _ => {}
        }
    }

    /// Reschedule when the instance may still be recovered, FATAL otherwise.
    pub(super) async fn recover_by_reschedule(&self, machine: &Machine, reason: Status) {
        let recoverable = machine.lock().await.is_runtime_recover_enabled();
        if !recoverable {
            self.fatal_and_report(machine, reason.code, &reason.message)
                .await;
            return;
        }
        machine
            .lock()
            .await
            .update_record(|r| r.recover_retry_times = r.recover_retry_times.saturating_sub(1));
        self.reschedule(machine, reason).await;
    }

    async fn fatal_and_report(&self, machine: &Machine, code: StatusCode, msg: &str) {
        match self.set_fatal(machine, code, msg).await {
            Ok(_) => self.report_fatal(machine, code, msg).await,
            Err(e) => warn!(error = %e, "failed to mark instance fatal"),
        }
    }
}

//! Eviction of instances from an agent.

use std::time::Duration;

use funcgrid_core::{EvictAgentRequest, ExitType, Status, StatusCode};
use funcgrid_lifecycle::TransContext;
use funcgrid_state::InstanceState;
use tracing::{info, warn};

use super::{InstanceCtrl, Machine};

impl InstanceCtrl {
    /// Evict every local instance placed on `request.agent_id`.
    pub async fn evict_instance_on_agent(&self, request: &EvictAgentRequest) -> Status {
        let agent_id = request.agent_id.clone();
        let ids: Vec<String> = self
            .instances()
            .await
            .into_iter()
            .filter(|r| r.unit_id == agent_id)
            .map(|r| r.instance_id)
            .collect();
        info!(%agent_id, count = ids.len(), "evicting instances on agent");
        if ids.is_empty() {
            return Status::ok();
        }
        self.evict_instances(&ids, request, false).await
    }

    /// Evict `ids` concurrently. `for_reuse` keeps the agent's resources
    /// reserved for a replacement instance.
    pub async fn evict_instances(
        &self,
        ids: &[String],
        request: &EvictAgentRequest,
        for_reuse: bool,
    ) -> Status {
        let timeout = if request.timeout_sec > 0 {
            Duration::from_secs(request.timeout_sec)
        } else {
            self.inner.config.runtime_shutdown_timeout()
        };
        let evictions = ids
            .iter()
            .map(|id| self.evict_one(id, &request.agent_id, for_reuse, timeout));
        let mut status = Status::ok();
        for result in futures::future::join_all(evictions).await {
            status.append(&result);
        }
        status
    }

    async fn evict_one(&self, id: &str, agent_id: &str, for_reuse: bool, timeout: Duration) -> Status {
        let Some(machine) = self.machine(id).await else {
            return Status::ok();
        };
        let state = {
            let mut m = machine.lock().await;
            let state = m.state();
            if matches!(state, InstanceState::Running | InstanceState::SubHealth) {
                m.cancel("instance evicted");
            }
            state
        };
        match state {
            InstanceState::Running | InstanceState::SubHealth => {}
            s if s.is_terminal() => return Status::ok(),
            _ => return self.exit_local(&machine).await,
        }

        let ctx = TransContext::new(InstanceState::Evicting)
            .code(StatusCode::ErrInstanceEvicted)
            .msg(format!("instance evicted from agent {agent_id}"))
            .exit_type(ExitType::Killed);
        if let Err(e) = self.transition(&machine, ctx).await {
            return e.to_status();
        }
        self.finish_evict(&machine, for_reuse, Some(timeout)).await
    }

    /// Stop the runtime of an EVICTING instance and settle it EVICTED.
    pub(super) async fn finish_evict(
        &self,
        machine: &Machine,
        for_reuse: bool,
        graceful: Option<Duration>,
    ) -> Status {
        self.release_runtime(machine, for_reuse, graceful).await;
        let ctx = TransContext::new(InstanceState::Evicted)
            .code(StatusCode::ErrInstanceEvicted)
            .msg("instance evicted")
            .exit_type(ExitType::Killed);
        match self.settle(machine, ctx).await {
            Ok(record) => {
                self.fail_create_promise(&record, StatusCode::ErrInstanceEvicted, "instance evicted")
                    .await;
                info!(instance_id = %record.instance_id, for_reuse, "instance evicted");
                Status::ok()
            }
            Err(e) => {
                warn!(error = %e, "failed to settle eviction");
                e.to_status()
            }
        }
    }
}

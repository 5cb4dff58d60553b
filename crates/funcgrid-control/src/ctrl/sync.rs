//! Resynchronisation with the meta-store and with agents.

use std::collections::HashMap;

use funcgrid_core::{Status, StatusCode};
use funcgrid_routing::UpdateSource;
use funcgrid_state::InstanceState;
use tracing::{info, warn};

use super::InstanceCtrl;
use crate::error::ControlResult;
use crate::traits::{AgentInfo, AgentStatus};

impl InstanceCtrl {
    /// Load every persisted instance: all of them into the routing
    /// directory, the ones this node owns into local state machines.
    /// Returns how many local machines were created.
    pub async fn sync_instances(&self) -> ControlResult<usize> {
        let records = self.inner.deps.meta_store.list_instances().await?;
        let mut adopted = 0;
        for record in records {
            self.inner
                .directory
                .update(record.clone(), false, UpdateSource::MetaStore);
            if !record.is_owned_by(self.node_id()) || record.state == InstanceState::Exited {
                continue;
            }
            if self.machine(&record.instance_id).await.is_some() {
                continue;
            }
            self.insert_machine(record).await;
            adopted += 1;
        }
        info!(adopted, "instances synced from meta-store");
        Ok(adopted)
    }

    /// Recover every local instance placed on `agent_id` after the agent
    /// re-registered.
    pub async fn sync_instance(&self, agent_id: &str) -> Status {
        let machines = self.machines_where(|r| r.unit_id == agent_id).await;
        info!(%agent_id, count = machines.len(), "recovering instances on agent");
        let recoveries = machines.iter().map(|m| self.recover_instance(m));
        futures::future::join_all(recoveries).await;
        Status::ok()
    }

    /// Reconcile local instances against the live agent list.
    pub async fn sync_agent(&self, agents: &[AgentInfo]) -> Status {
        let known: HashMap<&str, AgentStatus> = agents
            .iter()
            .map(|a| (a.agent_id.as_str(), a.status))
            .collect();
        let machines = self
            .machines_where(|r| {
                !r.unit_id.is_empty()
                    && (r.state.is_ready() || r.state == InstanceState::Creating)
            })
            .await;

        for machine in machines {
            let record = Self::snapshot(&machine).await;
            let reason = match known.get(record.unit_id.as_str()) {
                Some(AgentStatus::Running) => continue,
                Some(AgentStatus::Evicted) => format!("agent {} evicted", record.unit_id),
                Some(AgentStatus::Failed) => format!("agent {} failed", record.unit_id),
                None => format!("agent {} not found", record.unit_id),
            };
            warn!(instance_id = %record.instance_id, %reason, "instance lost its agent");
            self.recover_by_reschedule(&machine, Status::error(StatusCode::LsAgentNotFound, reason))
                .await;
        }
        Status::ok()
    }
}

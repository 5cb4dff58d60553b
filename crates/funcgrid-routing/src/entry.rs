use funcgrid_state::{InstanceRecord, InstanceState};
use serde::{Deserialize, Serialize};

/// Routing projection of an instance as seen from one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub instance_id: String,
    pub is_ready: bool,
    /// Owned by this node.
    pub is_local: bool,
    pub is_low_reliability: bool,
    pub runtime_id: String,
    pub proxy_id: String,
    pub tenant_id: String,
    pub function_key: String,
    pub runtime_address: String,
    /// Endpoint of the owning node, filled in when the notification is
    /// delivered.
    pub remote: String,
    pub state: InstanceState,
    pub version: u64,
}

impl RoutingEntry {
    pub fn from_record(record: &InstanceRecord, node_id: &str) -> Self {
        Self {
            instance_id: record.instance_id.clone(),
            is_ready: record.state.is_ready(),
            is_local: record.function_proxy_id == node_id,
            is_low_reliability: record.low_reliability,
            runtime_id: record.runtime_id.clone(),
            proxy_id: record.function_proxy_id.clone(),
            tenant_id: record.tenant_id.clone(),
            function_key: record.function_key.clone(),
            runtime_address: record.runtime_address.clone(),
            remote: String::new(),
            state: record.state,
            version: record.version,
        }
    }
}

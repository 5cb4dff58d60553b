//! Protocol messages exchanged with the orchestrator.

use serde::{Deserialize, Serialize};

use crate::status::{Status, StatusCode};

/// Resource needs of a single instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_millis: u64,
    pub memory_mb: u64,
}

impl Resources {
    pub fn new(cpu_millis: u64, memory_mb: u64) -> Self {
        Self {
            cpu_millis,
            memory_mb,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.cpu_millis > 0 && self.memory_mb > 0
    }

    pub fn fits_in(&self, capacity: &Resources) -> bool {
        self.cpu_millis <= capacity.cpu_millis && self.memory_mb <= capacity.memory_mb
    }
}

/// Elastic instance count for group scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRange {
    pub min: u32,
    pub max: u32,
    pub step: u32,
}

impl InstanceRange {
    pub fn is_valid(&self) -> bool {
        self.min > 0 && self.min <= self.max && self.step > 0
    }

    /// Largest admissible count (`min + k * step`) not above `available`.
    pub fn fit(&self, available: u32) -> Option<u32> {
        if available < self.min {
            return None;
        }
        let capped = available.min(self.max);
        let steps = (capped - self.min) / self.step;
        Some(self.min + steps * self.step)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Affinity {
    pub key: String,
    pub values: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub anti: bool,
}

/// Why an instance stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExitType {
    #[default]
    NoneExit,
    Return,
    Exception,
    Killed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub request_id: String,
    #[serde(default)]
    pub trace_id: String,
    /// Generated when empty.
    #[serde(default)]
    pub instance_id: String,
    pub function_key: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub parent_id: String,
    #[serde(default)]
    pub parent_proxy_id: String,
    #[serde(default)]
    pub group_id: String,
    pub resources: Resources,
    #[serde(default)]
    pub affinity: Vec<Affinity>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub range: Option<InstanceRange>,
    /// Reschedule budget; the configured default applies when unset.
    #[serde(default)]
    pub schedule_times: Option<u32>,
    #[serde(default)]
    pub recover_retry_times: Option<u32>,
    #[serde(default)]
    pub low_reliability: bool,
    #[serde(default)]
    pub init_args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub request_id: String,
    pub instance_id: String,
    pub code: StatusCode,
    pub message: String,
    pub allocated: Resources,
}

impl ScheduleResponse {
    pub fn failed(request: &ScheduleRequest, code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            request_id: request.request_id.clone(),
            instance_id: request.instance_id.clone(),
            code,
            message: message.into(),
            allocated: Resources::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KillRequest {
    pub instance_id: String,
    pub signal: i32,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub is_force: bool,
    #[serde(default)]
    pub is_synchronized: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KillResponse {
    pub instance_id: String,
    pub code: StatusCode,
    pub message: String,
}

impl KillResponse {
    pub fn from_status(instance_id: &str, status: Status) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            code: status.code,
            message: status.message,
        }
    }

    pub fn status(&self) -> Status {
        Status::error(self.code, self.message.clone())
    }
}

/// Exit report from the runtime manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceExitStatus {
    pub instance_id: String,
    pub exit_code: i32,
    pub status_msg: String,
    pub exit_type: ExitType,
    pub err_code: StatusCode,
}

/// Result of a call (including the create/init call) returned by an
/// instance to its caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub request_id: String,
    pub instance_id: String,
    pub code: StatusCode,
    pub message: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub is_create: bool,
}

impl CallResult {
    pub fn status(&self) -> Status {
        Status::error(self.code, self.message.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallResultAck {
    pub code: StatusCode,
    pub message: String,
}

impl CallResultAck {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwardKillRequest {
    pub request_id: String,
    pub src_instance_id: String,
    /// Request id of the target instance when the kill was issued. Used to
    /// reject kills aimed at an earlier incarnation.
    pub instance_request_id: String,
    pub request: KillRequest,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwardKillResponse {
    pub request_id: String,
    pub code: StatusCode,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvictAgentRequest {
    pub request_id: String,
    pub agent_id: String,
    pub timeout_sec: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_fit_respects_step() {
        let range = InstanceRange {
            min: 2,
            max: 8,
            step: 3,
        };
        assert!(range.is_valid());
        assert_eq!(range.fit(1), None);
        assert_eq!(range.fit(2), Some(2));
        assert_eq!(range.fit(4), Some(2));
        assert_eq!(range.fit(5), Some(5));
        assert_eq!(range.fit(20), Some(8));
    }

    #[test]
    fn invalid_ranges() {
        assert!(!InstanceRange { min: 0, max: 1, step: 1 }.is_valid());
        assert!(!InstanceRange { min: 3, max: 1, step: 1 }.is_valid());
        assert!(!InstanceRange { min: 1, max: 3, step: 0 }.is_valid());
    }

    #[test]
    fn schedule_request_defaults_from_json() {
        let json = r#"{"request_id":"r1","function_key":"fn","resources":{"cpu_millis":500,"memory_mb":128}}"#;
        let request: ScheduleRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.request_id, "r1");
        assert!(request.instance_id.is_empty());
        assert!(request.resources.is_valid());
        assert_eq!(request.schedule_times, None);
    }
}

//! funcgrid.toml control-plane configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub node_id: String,
    pub data_dir: PathBuf,
    pub meta_store_enabled: bool,
    pub api_port: u16,

    pub max_instance_redeploy_times: u32,
    pub min_deploy_interval_ms: u64,
    pub max_deploy_interval_ms: u64,

    pub max_instance_reconnect_times: u32,
    pub reconnect_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub readiness_timeout_ms: u64,
    pub init_call_timeout_ms: u64,
    pub wait_status_code_update_ms: u64,

    pub max_forward_kill_retry_times: u32,
    pub forward_kill_retry_cycle_ms: u64,
    pub forward_kill_retry_cycle_sync_ms: u64,
    pub max_forward_schedule_retry_times: u32,
    pub forward_schedule_retry_cycle_ms: u64,
    pub max_notification_signal_retry_times: u32,

    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub max_heartbeat_misses: u32,

    pub graceful_shutdown_timeout_ms: u64,
    pub runtime_shutdown_timeout_ms: u64,
    pub default_reschedule_times: u32,
    pub runtime_recover_retry_times: u32,
    pub exited_tombstone_capacity: usize,
    pub max_exit_times: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            data_dir: PathBuf::from("/var/lib/funcgrid"),
            meta_store_enabled: true,
            api_port: 8470,
            max_instance_redeploy_times: 5,
            min_deploy_interval_ms: 1000,
            max_deploy_interval_ms: 5000,
            max_instance_reconnect_times: 3,
            reconnect_interval_ms: 100,
            connect_timeout_ms: 30_000,
            readiness_timeout_ms: 10_000,
            init_call_timeout_ms: 10_000,
            wait_status_code_update_ms: 10_000,
            max_forward_kill_retry_times: 30,
            forward_kill_retry_cycle_ms: 2000,
            forward_kill_retry_cycle_sync_ms: 180_000,
            max_forward_schedule_retry_times: 3,
            forward_schedule_retry_cycle_ms: 1000,
            max_notification_signal_retry_times: 3,
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 3000,
            max_heartbeat_misses: 3,
            graceful_shutdown_timeout_ms: 5000,
            runtime_shutdown_timeout_ms: 3000,
            default_reschedule_times: 1,
            runtime_recover_retry_times: 1,
            exited_tombstone_capacity: 1024,
            max_exit_times: 3,
        }
    }
}

impl ControlConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: ControlConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_id.is_empty() {
            bail!("node_id must not be empty");
        }
        if self.min_deploy_interval_ms > self.max_deploy_interval_ms {
            bail!(
                "min_deploy_interval_ms ({}) exceeds max_deploy_interval_ms ({})",
                self.min_deploy_interval_ms,
                self.max_deploy_interval_ms
            );
        }
        if self.max_instance_redeploy_times == 0 {
            bail!("max_instance_redeploy_times must be at least 1");
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn init_call_timeout(&self) -> Duration {
        Duration::from_millis(self.init_call_timeout_ms)
    }

    pub fn wait_status_code_update(&self) -> Duration {
        Duration::from_millis(self.wait_status_code_update_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }

    pub fn runtime_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.runtime_shutdown_timeout_ms)
    }

    pub fn forward_kill_retry_cycle(&self, synchronized: bool) -> Duration {
        if synchronized {
            Duration::from_millis(self.forward_kill_retry_cycle_sync_ms)
        } else {
            Duration::from_millis(self.forward_kill_retry_cycle_ms)
        }
    }

    pub fn forward_schedule_retry_cycle(&self) -> Duration {
        Duration::from_millis(self.forward_schedule_retry_cycle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: ControlConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_instance_redeploy_times, 5);
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.forward_kill_retry_cycle(true), Duration::from_secs(180));
        config.validate().unwrap();
    }

    #[test]
    fn partial_override() {
        let config: ControlConfig = toml::from_str(
            r#"
node_id = "edge-7"
max_deploy_interval_ms = 2000
"#,
        )
        .unwrap();
        assert_eq!(config.node_id, "edge-7");
        assert_eq!(config.max_deploy_interval_ms, 2000);
        assert_eq!(config.min_deploy_interval_ms, 1000);
    }

    #[test]
    fn validate_rejects_inverted_intervals() {
        let config = ControlConfig {
            min_deploy_interval_ms: 10,
            max_deploy_interval_ms: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("funcgrid.toml");
        let original = ControlConfig {
            node_id: "n2".into(),
            ..Default::default()
        };
        std::fs::write(&path, original.to_toml_string().unwrap()).unwrap();
        let loaded = ControlConfig::from_file(&path).unwrap();
        assert_eq!(loaded.node_id, "n2");
    }
}

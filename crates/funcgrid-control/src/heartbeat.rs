//! Heartbeat monitor — one probe loop per running instance.
//!
//! Each loop probes the instance's runtime every `interval`. A probe that
//! fails or exceeds `timeout` counts as a miss; `max_misses` consecutive
//! misses emit [`HeartbeatEvent::Lost`] and end the loop. Health changes
//! between healthy and sub-health are reported as they happen.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::traits::{HealthState, RuntimeClient};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    Lost {
        instance_id: String,
        runtime_id: String,
    },
    Health {
        instance_id: String,
        health: HealthState,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_misses: u32,
}

struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

pub struct HeartbeatMonitor {
    runtime: Arc<dyn RuntimeClient>,
    settings: HeartbeatSettings,
    monitors: Arc<RwLock<HashMap<String, MonitorSlot>>>,
    events: mpsc::UnboundedSender<HeartbeatEvent>,
}

impl HeartbeatMonitor {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        settings: HeartbeatSettings,
        events: mpsc::UnboundedSender<HeartbeatEvent>,
    ) -> Self {
        Self {
            runtime,
            settings,
            monitors: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Start probing `instance_id`. Replaces a loop already running for it.
    pub async fn start(&self, instance_id: &str, runtime_id: &str) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let probe = Probe {
            instance_id: instance_id.to_string(),
            runtime_id: runtime_id.to_string(),
            runtime: Arc::clone(&self.runtime),
            settings: self.settings,
            events: self.events.clone(),
        };
        let handle = tokio::spawn(probe.run(shutdown_rx));

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            instance_id.to_string(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        debug!(%instance_id, %runtime_id, "heartbeat started");
    }

    pub async fn stop(&self, instance_id: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(instance_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%instance_id, "heartbeat stopped");
        }
    }

    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (_, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
        }
        info!("all heartbeats stopped");
    }

    pub async fn is_monitoring(&self, instance_id: &str) -> bool {
        let monitors = self.monitors.read().await;
        monitors
            .get(instance_id)
            .is_some_and(|slot| !slot.handle.is_finished())
    }

    pub async fn active_monitors(&self) -> Vec<String> {
        let monitors = self.monitors.read().await;
        monitors.keys().cloned().collect()
    }
}

struct Probe {
    instance_id: String,
    runtime_id: String,
    runtime: Arc<dyn RuntimeClient>,
    settings: HeartbeatSettings,
    events: mpsc::UnboundedSender<HeartbeatEvent>,
}

impl Probe {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut misses = 0u32;
        let mut health = HealthState::Healthy;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {
                    let probe = tokio::time::timeout(
                        self.settings.timeout,
                        self.runtime.heartbeat(&self.instance_id, &self.runtime_id),
                    )
                    .await;
                    match probe {
                        Ok(Ok(current)) => {
                            misses = 0;
                            if current != health {
                                health = current;
                                info!(instance_id = %self.instance_id, ?health, "instance health changed");
                                let _ = self.events.send(HeartbeatEvent::Health {
                                    instance_id: self.instance_id.clone(),
                                    health,
                                });
                            }
                        }
                        Ok(Err(e)) => {
                            misses += 1;
                            debug!(instance_id = %self.instance_id, misses, error = %e, "heartbeat failed");
                        }
                        Err(_) => {
                            misses += 1;
                            debug!(instance_id = %self.instance_id, misses, "heartbeat timed out");
                        }
                    }
                    if misses >= self.settings.max_misses {
                        warn!(
                            instance_id = %self.instance_id,
                            runtime_id = %self.runtime_id,
                            misses,
                            "runtime heartbeat lost"
                        );
                        let _ = self.events.send(HeartbeatEvent::Lost {
                            instance_id: self.instance_id.clone(),
                            runtime_id: self.runtime_id.clone(),
                        });
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    debug!(instance_id = %self.instance_id, "heartbeat loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use funcgrid_core::{CallResult, CallResultAck};
    use funcgrid_state::InstanceRecord;

    use crate::error::{ControlError, ControlResult};

    /// Answers heartbeats from a script, then repeats the last answer.
    struct ScriptedRuntime {
        script: Mutex<Vec<Option<HealthState>>>,
        probes: AtomicU32,
    }

    impl ScriptedRuntime {
        fn new(mut script: Vec<Option<HealthState>>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                probes: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl RuntimeClient for ScriptedRuntime {
        async fn connect(&self, _: &InstanceRecord) -> ControlResult<()> {
            Ok(())
        }
        async fn readiness(&self, _: &InstanceRecord) -> ControlResult<()> {
            Ok(())
        }
        async fn init_call(&self, _: &InstanceRecord) -> ControlResult<()> {
            Ok(())
        }
        async fn heartbeat(&self, instance_id: &str, _: &str) -> ControlResult<HealthState> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 {
                script.pop().flatten()
            } else {
                script.last().copied().flatten()
            };
            next.ok_or_else(|| ControlError::rpc(instance_id, "unreachable"))
        }
        async fn shutdown(&self, _: &InstanceRecord, _: Duration) -> ControlResult<()> {
            Ok(())
        }
        async fn signal(&self, _: &InstanceRecord, _: i32, _: &str) -> ControlResult<()> {
            Ok(())
        }
        async fn notify_result(&self, _: &str, _: &CallResult) -> ControlResult<CallResultAck> {
            Ok(CallResultAck::ok())
        }
        async fn close(&self, _: &str) {}
    }

    fn settings() -> HeartbeatSettings {
        HeartbeatSettings {
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(50),
            max_misses: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_misses_report_lost() {
        let runtime = ScriptedRuntime::new(vec![Some(HealthState::Healthy), None]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = HeartbeatMonitor::new(runtime.clone(), settings(), tx);
        monitor.start("i1", "rt-1").await;

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            HeartbeatEvent::Lost {
                instance_id: "i1".into(),
                runtime_id: "rt-1".into()
            }
        );
        assert_eq!(runtime.probes.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn a_success_resets_the_miss_count() {
        let runtime = ScriptedRuntime::new(vec![
            None,
            None,
            Some(HealthState::Healthy),
            None,
            None,
            Some(HealthState::Healthy),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = HeartbeatMonitor::new(runtime.clone(), settings(), tx);
        monitor.start("i1", "rt-1").await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
        monitor.stop("i1").await;
        assert!(!monitor.is_monitoring("i1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn sub_health_is_reported_once() {
        let runtime = ScriptedRuntime::new(vec![
            Some(HealthState::SubHealth),
            Some(HealthState::SubHealth),
            Some(HealthState::Healthy),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = HeartbeatMonitor::new(runtime, settings(), tx);
        monitor.start("i1", "rt-1").await;

        assert_eq!(
            rx.recv().await.unwrap(),
            HeartbeatEvent::Health {
                instance_id: "i1".into(),
                health: HealthState::SubHealth
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            HeartbeatEvent::Health {
                instance_id: "i1".into(),
                health: HealthState::Healthy
            }
        );
        monitor.stop_all().await;
        assert!(monitor.active_monitors().await.is_empty());
    }
}

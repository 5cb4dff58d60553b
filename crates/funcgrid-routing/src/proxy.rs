//! Per-instance local proxy.
//!
//! Each locally owned instance gets one proxy task. The proxy tracks the
//! routing state of every instance it talks to (its callees, and itself),
//! parks callers until a target becomes ready or fails, and counts
//! responses still in flight so that shutdown can drain before cancelling.

use std::collections::HashMap;
use std::time::Duration;

use funcgrid_core::StatusCode;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tracing::{debug, info, warn};

use crate::entry::RoutingEntry;
use crate::error::RoutingError;

pub type RouteResult = Result<RoutingEntry, RoutingError>;

/// Notification emitted by a proxy after it applied a change.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyEvent {
    Ready {
        proxy: String,
        target: String,
        entry: RoutingEntry,
    },
    NotReady {
        proxy: String,
        target: String,
    },
    Fatal {
        proxy: String,
        target: String,
        code: StatusCode,
        message: String,
    },
    Rejected {
        proxy: String,
        target: String,
        code: StatusCode,
        message: String,
    },
    NotExist {
        proxy: String,
        target: String,
    },
    Removed {
        proxy: String,
        target: String,
    },
    Terminated {
        proxy: String,
    },
}

impl ProxyEvent {
    pub fn proxy(&self) -> &str {
        match self {
            ProxyEvent::Ready { proxy, .. }
            | ProxyEvent::NotReady { proxy, .. }
            | ProxyEvent::Fatal { proxy, .. }
            | ProxyEvent::Rejected { proxy, .. }
            | ProxyEvent::NotExist { proxy, .. }
            | ProxyEvent::Removed { proxy, .. }
            | ProxyEvent::Terminated { proxy } => proxy,
        }
    }
}

/// What a proxy knows about one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TargetRoute {
    Pending,
    Ready(RoutingEntry),
    Failed { code: StatusCode, message: String },
    Rejected { code: StatusCode, message: String },
}

enum ProxyCommand {
    NotifyChanged {
        target: String,
        entry: RoutingEntry,
    },
    Fatal {
        target: String,
        code: StatusCode,
        message: String,
    },
    Reject {
        target: String,
        code: StatusCode,
        message: String,
    },
    NotExist {
        target: String,
    },
    RemoveTarget {
        target: String,
    },
    Resolve {
        target: String,
        reply: oneshot::Sender<RouteResult>,
    },
    Snapshot {
        reply: oneshot::Sender<HashMap<String, TargetRoute>>,
    },
    Delete {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running proxy task.
#[derive(Clone)]
pub struct InstanceProxyHandle {
    instance_id: String,
    tenant_id: String,
    tx: mpsc::UnboundedSender<ProxyCommand>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl InstanceProxyHandle {
    /// Spawn the proxy task for `instance_id`.
    pub fn spawn(
        instance_id: &str,
        tenant_id: &str,
        events: broadcast::Sender<ProxyEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let proxy = InstanceProxy {
            instance_id: instance_id.to_string(),
            routes: HashMap::new(),
            waiters: HashMap::new(),
            events,
        };
        tokio::spawn(proxy.run(rx, cancel.clone()));
        info!(%instance_id, "instance proxy spawned");
        Self {
            instance_id: instance_id.to_string(),
            tenant_id: tenant_id.to_string(),
            tx,
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    fn send(&self, command: ProxyCommand) {
        if self.tx.send(command).is_err() {
            debug!(instance_id = %self.instance_id, "proxy already terminated, command dropped");
        }
    }

    pub fn notify_changed(&self, target: &str, entry: RoutingEntry) {
        self.send(ProxyCommand::NotifyChanged {
            target: target.to_string(),
            entry,
        });
    }

    pub fn fatal(&self, target: &str, code: StatusCode, message: &str) {
        self.send(ProxyCommand::Fatal {
            target: target.to_string(),
            code,
            message: message.to_string(),
        });
    }

    pub fn reject(&self, target: &str, code: StatusCode, message: &str) {
        self.send(ProxyCommand::Reject {
            target: target.to_string(),
            code,
            message: message.to_string(),
        });
    }

    /// `target` is unknown to the directory.
    pub fn not_exist(&self, target: &str) {
        self.send(ProxyCommand::NotExist {
            target: target.to_string(),
        });
    }

    /// Forget the route to `target`.
    pub fn delete_remote_dispatcher(&self, target: &str) {
        self.send(ProxyCommand::RemoveTarget {
            target: target.to_string(),
        });
    }

    /// Wait until `target` is ready or has failed.
    pub async fn resolve(&self, target: &str) -> RouteResult {
        let (reply, rx) = oneshot::channel();
        self.send(ProxyCommand::Resolve {
            target: target.to_string(),
            reply,
        });
        rx.await
            .unwrap_or_else(|_| Err(RoutingError::ProxyTerminated(self.instance_id.clone())))
    }

    pub async fn snapshot(&self) -> HashMap<String, TargetRoute> {
        let (reply, rx) = oneshot::channel();
        self.send(ProxyCommand::Snapshot { reply });
        rx.await.unwrap_or_default()
    }

    /// Delete handshake: the proxy fails its parked callers and acknowledges.
    pub async fn delete(&self) {
        let (reply, rx) = oneshot::channel();
        self.send(ProxyCommand::Delete { reply });
        let _ = rx.await;
    }

    /// Mark a response as in flight. The proxy drains until every token
    /// is dropped.
    pub fn begin_response(&self) -> TaskTrackerToken {
        self.tracker.token()
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for in-flight responses. Returns false if `timeout` expired first.
    pub async fn drain(&self, timeout: Option<Duration>) -> bool {
        self.tracker.close();
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.tracker.wait()).await.is_ok(),
            None => {
                self.tracker.wait().await;
                true
            }
        }
    }

    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.tx.is_closed()
    }
}

struct InstanceProxy {
    instance_id: String,
    routes: HashMap<String, TargetRoute>,
    waiters: HashMap<String, Vec<oneshot::Sender<RouteResult>>>,
    events: broadcast::Sender<ProxyEvent>,
}

impl InstanceProxy {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ProxyCommand>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }
        rx.close();
        self.fail_all_waiters();
        let _ = self.events.send(ProxyEvent::Terminated {
            proxy: self.instance_id.clone(),
        });
        info!(instance_id = %self.instance_id, "instance proxy terminated");
    }

    fn handle(&mut self, command: ProxyCommand) {
        match command {
            ProxyCommand::NotifyChanged { target, entry } => self.on_changed(target, entry),
            ProxyCommand::Fatal {
                target,
                code,
                message,
            } => {
                warn!(proxy = %self.instance_id, %target, %code, %message, "target is fatal");
                self.wake(
                    &target,
                    Err(RoutingError::InstanceFatal {
                        target: target.clone(),
                        code,
                        message: message.clone(),
                    }),
                );
                self.routes.insert(
                    target.clone(),
                    TargetRoute::Failed {
                        code,
                        message: message.clone(),
                    },
                );
                self.emit(ProxyEvent::Fatal {
                    proxy: self.instance_id.clone(),
                    target,
                    code,
                    message,
                });
            }
            ProxyCommand::Reject {
                target,
                code,
                message,
            } => {
                self.wake(
                    &target,
                    Err(RoutingError::Rejected {
                        target: target.clone(),
                        code,
                        message: message.clone(),
                    }),
                );
                self.routes.insert(
                    target.clone(),
                    TargetRoute::Rejected {
                        code,
                        message: message.clone(),
                    },
                );
                self.emit(ProxyEvent::Rejected {
                    proxy: self.instance_id.clone(),
                    target,
                    code,
                    message,
                });
            }
            ProxyCommand::NotExist { target } => {
                warn!(proxy = %self.instance_id, %target, "target does not exist");
                self.routes.remove(&target);
                self.wake(&target, Err(RoutingError::InstanceNotFound(target.clone())));
                self.emit(ProxyEvent::NotExist {
                    proxy: self.instance_id.clone(),
                    target,
                });
            }
            ProxyCommand::RemoveTarget { target } => {
                self.routes.remove(&target);
                self.wake(&target, Err(RoutingError::TargetRemoved(target.clone())));
                self.emit(ProxyEvent::Removed {
                    proxy: self.instance_id.clone(),
                    target,
                });
            }
            ProxyCommand::Resolve { target, reply } => match self.routes.get(&target) {
                Some(TargetRoute::Ready(entry)) => {
                    let _ = reply.send(Ok(entry.clone()));
                }
                Some(TargetRoute::Failed { code, message }) => {
                    let _ = reply.send(Err(RoutingError::InstanceFatal {
                        target: target.clone(),
                        code: *code,
                        message: message.clone(),
                    }));
                }
                Some(TargetRoute::Rejected { code, message }) => {
                    let _ = reply.send(Err(RoutingError::Rejected {
                        target: target.clone(),
                        code: *code,
                        message: message.clone(),
                    }));
                }
                Some(TargetRoute::Pending) | None => {
                    self.waiters.entry(target).or_default().push(reply);
                }
            },
            ProxyCommand::Snapshot { reply } => {
                let _ = reply.send(self.routes.clone());
            }
            ProxyCommand::Delete { reply } => {
                self.fail_all_waiters();
                let _ = reply.send(());
            }
        }
    }

    fn on_changed(&mut self, target: String, entry: RoutingEntry) {
        if entry.is_ready {
            debug!(proxy = %self.instance_id, %target, remote = %entry.remote, "target ready");
            self.wake(&target, Ok(entry.clone()));
            self.routes
                .insert(target.clone(), TargetRoute::Ready(entry.clone()));
            self.emit(ProxyEvent::Ready {
                proxy: self.instance_id.clone(),
                target,
                entry,
            });
        } else {
            self.routes.insert(target.clone(), TargetRoute::Pending);
            self.emit(ProxyEvent::NotReady {
                proxy: self.instance_id.clone(),
                target,
            });
        }
    }

    fn wake(&mut self, target: &str, result: RouteResult) {
        if let Some(waiters) = self.waiters.remove(target) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    fn fail_all_waiters(&mut self) {
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(RoutingError::ProxyTerminated(self.instance_id.clone())));
            }
        }
    }

    fn emit(&self, event: ProxyEvent) {
        let _ = self.events.send(event);
    }
}

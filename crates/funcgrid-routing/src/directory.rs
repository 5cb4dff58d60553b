//! Routing directory actor.
//!
//! All state lives in [`DirectoryActor`] and is mutated only from its
//! command loop, so updates for one instance are applied in arrival order
//! and reconciled by version. [`RoutingDirectory`] is the cloneable handle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use funcgrid_state::{InstanceRecord, InstanceState, RouteRecord};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::task::task_tracker::TaskTrackerToken;
use tracing::{debug, info, warn};

use crate::entry::RoutingEntry;
use crate::error::RoutingError;
use crate::proxy::{InstanceProxyHandle, ProxyEvent};

const EVENT_CAPACITY: usize = 4096;
/// Notifications parked per unconnected owner before the oldest is dropped.
const DEFERRED_CAPACITY: usize = 1024;
const EXITED_CAPACITY: usize = 4096;

/// Which path an update arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// Published directly by the local orchestrator.
    Fast,
    /// Delivered by the meta-store watch.
    MetaStore,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub drained: usize,
    pub timed_out: usize,
}

struct Held {
    record: InstanceRecord,
    source: UpdateSource,
    /// Only a routing projection has been seen for this instance.
    route_only: bool,
}

/// A notification waiting for a connection to the owning node.
struct Deferred {
    proxy: InstanceProxyHandle,
    target: String,
    entry: RoutingEntry,
}

/// Last versions of instances that reached a terminal state and were
/// removed, bounded FIFO.
struct ExitedVersions {
    order: VecDeque<String>,
    versions: HashMap<String, u64>,
    capacity: usize,
}

impl ExitedVersions {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            versions: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, id: &str, version: u64) {
        match self.versions.get_mut(id) {
            Some(held) => *held = (*held).max(version),
            None => {
                self.versions.insert(id.to_string(), version);
                self.order.push_back(id.to_string());
            }
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.versions.remove(&oldest);
            }
        }
    }

    fn get(&self, id: &str) -> Option<u64> {
        self.versions.get(id).copied()
    }
}

enum Command {
    Update {
        record: InstanceRecord,
        force: bool,
        source: UpdateSource,
        route_only: bool,
    },
    Delete {
        instance_id: String,
    },
    Subscribe {
        subscriber: String,
        target: String,
        ignore_non_exist: bool,
        reply: oneshot::Sender<Result<(), RoutingError>>,
    },
    Unsubscribe {
        subscriber: String,
        target: String,
    },
    NotifyMigratingRequest {
        instance_id: String,
    },
    TerminateMigratedInstanceProxy {
        instance_id: String,
    },
    PeerConnected {
        proxy_id: String,
        address: String,
    },
    PeerDisconnected {
        proxy_id: String,
    },
    Query(Query),
    TakeProxies {
        reply: oneshot::Sender<Vec<InstanceProxyHandle>>,
    },
}

enum Query {
    Record(String, oneshot::Sender<Option<(InstanceRecord, bool)>>),
    Entry(String, oneshot::Sender<Option<RoutingEntry>>),
    Entries(oneshot::Sender<Vec<RoutingEntry>>),
    Proxy(String, oneshot::Sender<Option<InstanceProxyHandle>>),
    LocalInstances(oneshot::Sender<Vec<String>>),
    SubscribersOf(String, oneshot::Sender<Vec<String>>),
    Barrier(oneshot::Sender<()>),
}

/// Cloneable handle to the routing directory actor.
#[derive(Clone)]
pub struct RoutingDirectory {
    node_id: Arc<str>,
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ProxyEvent>,
}

impl RoutingDirectory {
    /// Spawn the directory actor for `node_id`.
    pub fn spawn(node_id: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let actor = DirectoryActor {
            node_id: node_id.to_string(),
            instances: HashMap::new(),
            local: HashMap::new(),
            watchers: HashMap::new(),
            watching: HashMap::new(),
            peers: HashMap::new(),
            deferred: HashMap::new(),
            exited: ExitedVersions::new(EXITED_CAPACITY),
            events: events.clone(),
        };
        tokio::spawn(actor.run(rx));
        info!(%node_id, "routing directory started");
        Self {
            node_id: Arc::from(node_id),
            tx,
            events,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Notifications applied by local proxies.
    pub fn events(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            warn!("routing directory stopped, command dropped");
        }
    }

    async fn query<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Query) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Query(build(reply)));
        rx.await.ok()
    }

    /// Apply an instance record. Stale versions are ignored unless `force`.
    pub fn update(&self, record: InstanceRecord, force: bool, source: UpdateSource) {
        self.send(Command::Update {
            record,
            force,
            source,
            route_only: false,
        });
    }

    /// Apply a routing projection from a node that owns the instance.
    pub fn update_route(&self, route: &RouteRecord, source: UpdateSource) {
        self.send(Command::Update {
            record: InstanceRecord::from_route(route),
            force: false,
            source,
            route_only: true,
        });
    }

    pub fn delete(&self, instance_id: &str) {
        self.send(Command::Delete {
            instance_id: instance_id.to_string(),
        });
    }

    pub async fn subscribe_instance_event(
        &self,
        subscriber: &str,
        target: &str,
        ignore_non_exist: bool,
    ) -> Result<(), RoutingError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            subscriber: subscriber.to_string(),
            target: target.to_string(),
            ignore_non_exist,
            reply,
        });
        rx.await.unwrap_or(Err(RoutingError::Stopped))
    }

    pub fn unsubscribe_instance_event(&self, subscriber: &str, target: &str) {
        self.send(Command::Unsubscribe {
            subscriber: subscriber.to_string(),
            target: target.to_string(),
        });
    }

    /// Ownership of `instance_id` moved away: drain and stop the local
    /// proxy, and drop the subscriptions it held.
    pub fn notify_migrating_request(&self, instance_id: &str) {
        self.send(Command::NotifyMigratingRequest {
            instance_id: instance_id.to_string(),
        });
    }

    pub fn terminate_migrated_instance_proxy(&self, instance_id: &str) {
        self.send(Command::TerminateMigratedInstanceProxy {
            instance_id: instance_id.to_string(),
        });
    }

    /// A connection to `proxy_id` is up. Fires deferred notifications.
    pub fn peer_connected(&self, proxy_id: &str, address: &str) {
        self.send(Command::PeerConnected {
            proxy_id: proxy_id.to_string(),
            address: address.to_string(),
        });
    }

    pub fn peer_disconnected(&self, proxy_id: &str) {
        self.send(Command::PeerDisconnected {
            proxy_id: proxy_id.to_string(),
        });
    }

    pub async fn record(&self, instance_id: &str) -> Option<InstanceRecord> {
        self.query(|tx| Query::Record(instance_id.to_string(), tx))
            .await
            .flatten()
            .map(|(record, _)| record)
    }

    /// True when only a routing projection has been seen for the instance.
    pub async fn is_route_only(&self, instance_id: &str) -> bool {
        self.query(|tx| Query::Record(instance_id.to_string(), tx))
            .await
            .flatten()
            .map(|(_, route_only)| route_only)
            .unwrap_or(false)
    }

    pub async fn entry(&self, instance_id: &str) -> Option<RoutingEntry> {
        self.query(|tx| Query::Entry(instance_id.to_string(), tx))
            .await
            .flatten()
    }

    pub async fn entries(&self) -> Vec<RoutingEntry> {
        self.query(Query::Entries).await.unwrap_or_default()
    }

    pub async fn is_ready(&self, instance_id: &str) -> bool {
        self.entry(instance_id).await.is_some_and(|e| e.is_ready)
    }

    pub async fn ready_instances(&self) -> Vec<String> {
        self.entries()
            .await
            .into_iter()
            .filter(|e| e.is_ready)
            .map(|e| e.instance_id)
            .collect()
    }

    pub async fn local_instances(&self) -> Vec<String> {
        self.query(Query::LocalInstances).await.unwrap_or_default()
    }

    pub async fn proxy(&self, instance_id: &str) -> Option<InstanceProxyHandle> {
        self.query(|tx| Query::Proxy(instance_id.to_string(), tx))
            .await
            .flatten()
    }

    pub async fn subscribers_of(&self, target: &str) -> Vec<String> {
        self.query(|tx| Query::SubscribersOf(target.to_string(), tx))
            .await
            .unwrap_or_default()
    }

    /// Resolve `target` through the local proxy of `caller`.
    pub async fn resolve(&self, caller: &str, target: &str) -> Result<RoutingEntry, RoutingError> {
        let proxy = self
            .proxy(caller)
            .await
            .ok_or_else(|| RoutingError::InstanceNotFound(caller.to_string()))?;
        proxy.resolve(target).await
    }

    /// Mark a response from `instance_id` as in flight. `None` if the
    /// instance has no local proxy.
    pub async fn begin_response(&self, instance_id: &str) -> Option<TaskTrackerToken> {
        self.proxy(instance_id).await.map(|p| p.begin_response())
    }

    /// Wait until every command sent before this call has been applied.
    pub async fn flush(&self) {
        let _ = self.query(Query::Barrier).await;
    }

    /// Wait (bounded) for every local proxy's in-flight responses, then
    /// terminate the proxies.
    pub async fn drain(&self, timeout: Duration) -> DrainStats {
        let (reply, rx) = oneshot::channel();
        self.send(Command::TakeProxies { reply });
        let proxies = rx.await.unwrap_or_default();
        let results = futures::future::join_all(proxies.iter().map(|p| p.drain(Some(timeout)))).await;
        for proxy in &proxies {
            proxy.terminate();
        }
        let drained = results.iter().filter(|ok| **ok).count();
        let stats = DrainStats {
            drained,
            timed_out: results.len() - drained,
        };
        info!(drained = stats.drained, timed_out = stats.timed_out, "routing directory drained");
        stats
    }
}

struct DirectoryActor {
    node_id: String,
    /// Every known instance, local and remote.
    instances: HashMap<String, Held>,
    /// Proxies of locally owned instances.
    local: HashMap<String, InstanceProxyHandle>,
    /// target -> instances subscribed to it.
    watchers: HashMap<String, HashSet<String>>,
    /// subscriber -> targets it subscribed to.
    watching: HashMap<String, HashSet<String>>,
    /// Connected owning nodes and their endpoints.
    peers: HashMap<String, String>,
    /// owner -> notifications waiting for its connection.
    deferred: HashMap<String, Vec<Deferred>>,
    exited: ExitedVersions,
    events: broadcast::Sender<ProxyEvent>,
}

impl DirectoryActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        for proxy in self.local.values() {
            proxy.terminate();
        }
        debug!(node_id = %self.node_id, "routing directory stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Update {
                record,
                force,
                source,
                route_only,
            } => self.update(record, force, source, route_only),
            Command::Delete { instance_id } => self.delete(&instance_id),
            Command::Subscribe {
                subscriber,
                target,
                ignore_non_exist,
                reply,
            } => {
                let _ = reply.send(self.subscribe(&subscriber, &target, ignore_non_exist));
            }
            Command::Unsubscribe { subscriber, target } => {
                if let Some(targets) = self.watching.get_mut(&subscriber) {
                    targets.remove(&target);
                }
                if let Some(subscribers) = self.watchers.get_mut(&target) {
                    subscribers.remove(&subscriber);
                }
            }
            Command::NotifyMigratingRequest { instance_id } => {
                self.terminate_migrated_instance_proxy(&instance_id);
                if let Some(targets) = self.watching.remove(&instance_id) {
                    for target in targets {
                        if let Some(subscribers) = self.watchers.get_mut(&target) {
                            subscribers.remove(&instance_id);
                        }
                    }
                }
            }
            Command::TerminateMigratedInstanceProxy { instance_id } => {
                self.terminate_migrated_instance_proxy(&instance_id)
            }
            Command::PeerConnected { proxy_id, address } => {
                info!(%proxy_id, %address, "peer connected");
                self.peers.insert(proxy_id.clone(), address.clone());
                for deferred in self.deferred.remove(&proxy_id).unwrap_or_default() {
                    let mut entry = deferred.entry;
                    entry.remote = address.clone();
                    deferred.proxy.notify_changed(&deferred.target, entry);
                }
            }
            Command::PeerDisconnected { proxy_id } => {
                self.peers.remove(&proxy_id);
            }
            Command::Query(query) => self.answer(query),
            Command::TakeProxies { reply } => {
                let _ = reply.send(self.local.values().cloned().collect());
            }
        }
    }

    fn answer(&self, query: Query) {
        match query {
            Query::Record(id, tx) => {
                let _ = tx.send(
                    self.instances
                        .get(&id)
                        .map(|h| (h.record.clone(), h.route_only)),
                );
            }
            Query::Entry(id, tx) => {
                let _ = tx.send(
                    self.instances
                        .get(&id)
                        .map(|h| RoutingEntry::from_record(&h.record, &self.node_id)),
                );
            }
            Query::Entries(tx) => {
                let _ = tx.send(
                    self.instances
                        .values()
                        .map(|h| RoutingEntry::from_record(&h.record, &self.node_id))
                        .collect(),
                );
            }
            Query::Proxy(id, tx) => {
                let _ = tx.send(self.local.get(&id).cloned());
            }
            Query::LocalInstances(tx) => {
                let _ = tx.send(self.local.keys().cloned().collect());
            }
            Query::SubscribersOf(target, tx) => {
                let _ = tx.send(
                    self.watchers
                        .get(&target)
                        .map(|s| s.iter().cloned().collect())
                        .unwrap_or_default(),
                );
            }
            Query::Barrier(tx) => {
                let _ = tx.send(());
            }
        }
    }

    // ── Update ─────────────────────────────────────────────────────

    fn update(&mut self, record: InstanceRecord, force: bool, source: UpdateSource, route_only: bool) {
        let id = record.instance_id.clone();
        if !force && !self.instances.contains_key(&id) {
            if let Some(exited) = self.exited.get(&id) {
                if record.version <= exited {
                    debug!(
                        instance_id = %id,
                        exited,
                        received = record.version,
                        ?source,
                        "update for exited instance ignored"
                    );
                    return;
                }
            }
        }
        let previous = match self.instances.get(&id) {
            Some(held) if !force && !self.accepts(held, &record, source, route_only) => {
                debug!(
                    instance_id = %id,
                    held = held.record.version,
                    received = record.version,
                    ?source,
                    "stale instance update ignored"
                );
                return;
            }
            Some(held) => Some(held.record.clone()),
            None => None,
        };
        if let Some(previous) = &previous {
            if !force && previous.version == record.version && previous.state == record.state {
                // Same version re-delivered: adopt the copy without re-notifying.
                debug!(instance_id = %id, ?source, "equal-version update adopted");
                self.store(&id, record, source, route_only);
                return;
            }
        }
        let previous = previous.unwrap_or_else(|| record.clone());

        self.subscribe_parent(&record);

        let state = record.state;
        debug!(
            instance_id = %id,
            %state,
            owner = %record.function_proxy_id,
            version = record.version,
            ?source,
            "routing directory update"
        );
        match state {
            InstanceState::New
            | InstanceState::Scheduling
            | InstanceState::Failed
            | InstanceState::Exiting
            | InstanceState::ScheduleFailed => self.ready_status_changed(&previous, &record),
            InstanceState::Creating => {
                self.spawn_proxy(&record);
                self.ready_status_changed(&previous, &record);
            }
            InstanceState::Running => {
                self.spawn_proxy(&record);
                self.notify_ready(&record);
            }
            InstanceState::Evicting | InstanceState::SubHealth => self.reject(&record),
            InstanceState::Fatal | InstanceState::Evicted => self.fatal(&record),
            InstanceState::Exited => {
                self.delete(&id);
                self.exited.insert(&id, record.version);
                return;
            }
        }
        self.store(&id, record, source, route_only);
    }

    /// Newer versions always win. On equal versions the meta-store copy
    /// replaces a fast-path one, never the reverse; a route-only projection
    /// never replaces a full record of the same version.
    fn accepts(&self, held: &Held, record: &InstanceRecord, source: UpdateSource, route_only: bool) -> bool {
        if record.version != held.record.version {
            return record.version > held.record.version;
        }
        if route_only && !held.route_only {
            return false;
        }
        !(source == UpdateSource::Fast && held.source == UpdateSource::MetaStore)
    }

    fn store(&mut self, id: &str, record: InstanceRecord, source: UpdateSource, route_only: bool) {
        self.instances.insert(
            id.to_string(),
            Held {
                record,
                source,
                route_only,
            },
        );
    }

    /// A child whose parent is local is watched on the parent's behalf.
    fn subscribe_parent(&mut self, record: &InstanceRecord) {
        let parent = &record.parent_id;
        let Some(parent_proxy) = self.local.get(parent).cloned() else {
            return;
        };
        let id = &record.instance_id;
        let already = self
            .watchers
            .get(id)
            .is_some_and(|subscribers| subscribers.contains(parent));
        if !already {
            parent_proxy.notify_changed(id, RoutingEntry::from_record(record, &self.node_id));
        }
        self.watchers
            .entry(id.clone())
            .or_default()
            .insert(parent.clone());
        self.watching
            .entry(parent.clone())
            .or_default()
            .insert(id.clone());
    }

    fn spawn_proxy(&mut self, record: &InstanceRecord) {
        if record.function_proxy_id != self.node_id || self.local.contains_key(&record.instance_id) {
            return;
        }
        info!(instance_id = %record.instance_id, "routing directory adds local instance");
        let proxy = InstanceProxyHandle::spawn(&record.instance_id, &record.tenant_id, self.events.clone());
        self.local.insert(record.instance_id.clone(), proxy);
    }

    fn subscribers(&self, target: &str) -> Vec<InstanceProxyHandle> {
        self.watchers
            .get(target)
            .into_iter()
            .flatten()
            .filter_map(|subscriber| self.local.get(subscriber).cloned())
            .collect()
    }

    fn ready_status_changed(&mut self, previous: &InstanceRecord, record: &InstanceRecord) {
        if !previous.state.is_ready() {
            return;
        }
        let entry = RoutingEntry::from_record(record, &self.node_id);
        for proxy in self.subscribers(&record.instance_id) {
            self.notify_changed(&proxy, &record.instance_id, &record.function_proxy_id, entry.clone());
        }
        if let Some(own) = self.local.get(&record.instance_id).cloned() {
            self.notify_changed(&own, &record.instance_id, &record.function_proxy_id, entry);
        }
    }

    fn notify_ready(&mut self, record: &InstanceRecord) {
        if record.function_proxy_id == self.node_id {
            if let Some(own) = self.local.get(&record.instance_id).cloned() {
                let mut entry = RoutingEntry::from_record(record, &self.node_id);
                entry.remote = record.runtime_address.clone();
                own.notify_changed(&record.instance_id, entry);
            }
        }
        self.notify_subscriber_instance_ready(record);
    }

    /// Subscribers see the target as remote so a request already queued for
    /// it is not lost if ownership moves.
    fn notify_subscriber_instance_ready(&mut self, record: &InstanceRecord) {
        let mut entry = RoutingEntry::from_record(record, &self.node_id);
        entry.is_local = false;
        for proxy in self.subscribers(&record.instance_id) {
            self.notify_changed(&proxy, &record.instance_id, &record.function_proxy_id, entry.clone());
        }
        if record.function_proxy_id == self.node_id {
            return;
        }
        if let Some(own) = self.local.get(&record.instance_id).cloned() {
            self.notify_changed(&own, &record.instance_id, &record.function_proxy_id, entry);
        }
    }

    /// Deliver directly when the owner is this node or already connected;
    /// otherwise park until the owner's connection comes up.
    fn notify_changed(
        &mut self,
        proxy: &InstanceProxyHandle,
        target: &str,
        owner: &str,
        mut entry: RoutingEntry,
    ) {
        let subscriber = proxy.instance_id();
        self.purge_deferred(|d| d.target == target && d.proxy.instance_id() == subscriber);
        if owner.is_empty() || owner == self.node_id {
            entry.remote = self.node_id.clone();
            proxy.notify_changed(target, entry);
            return;
        }
        match self.peers.get(owner) {
            Some(address) => {
                entry.remote = address.clone();
                proxy.notify_changed(target, entry);
            }
            None => {
                debug!(%target, %owner, "owner not connected, deferring notification");
                let queue = self.deferred.entry(owner.to_string()).or_default();
                if queue.len() >= DEFERRED_CAPACITY {
                    let dropped = queue.remove(0);
                    warn!(%owner, target = %dropped.target, "deferred notifications full, dropping oldest");
                }
                queue.push(Deferred {
                    proxy: proxy.clone(),
                    target: target.to_string(),
                    entry,
                });
            }
        }
    }

    /// Drop parked notifications matching `stale`.
    fn purge_deferred(&mut self, stale: impl Fn(&Deferred) -> bool) {
        self.deferred.retain(|_, queue| {
            queue.retain(|d| !stale(d));
            !queue.is_empty()
        });
    }

    fn fatal(&mut self, record: &InstanceRecord) {
        let id = &record.instance_id;
        self.purge_deferred(|d| &d.target == id);
        let code = record.status.err_code;
        let msg = &record.status.msg;
        info!(
            instance_id = %record.instance_id,
            owner = %record.function_proxy_id,
            %code,
            %msg,
            "instance is fatal"
        );
        if let Some(own) = self.local.get(&record.instance_id) {
            own.fatal(&record.instance_id, code, msg);
        }
        for proxy in self.subscribers(&record.instance_id) {
            proxy.fatal(&record.instance_id, code, msg);
        }
    }

    fn reject(&mut self, record: &InstanceRecord) {
        self.spawn_proxy(record);
        let id = &record.instance_id;
        self.purge_deferred(|d| &d.target == id);
        let code = record.status.err_code;
        let msg = &record.status.msg;
        info!(instance_id = %record.instance_id, %code, %msg, "instance set to reject requests");
        if let Some(own) = self.local.get(&record.instance_id) {
            own.reject(&record.instance_id, code, msg);
        }
        for proxy in self.subscribers(&record.instance_id) {
            proxy.reject(&record.instance_id, code, msg);
        }
    }

    // ── Delete / subscribe ─────────────────────────────────────────

    fn delete(&mut self, id: &str) {
        debug!(instance_id = %id, "routing directory delete");
        if let Some(held) = self.instances.remove(id) {
            if held.record.state.is_terminal() {
                self.exited.insert(id, held.record.version);
            }
        }
        self.purge_deferred(|d| d.target == id || d.proxy.instance_id() == id);
        if let Some(proxy) = self.local.remove(id) {
            tokio::spawn(async move {
                proxy.delete().await;
                proxy.terminate();
            });
        }

        if let Some(targets) = self.watching.remove(id) {
            for target in targets {
                if let Some(subscribers) = self.watchers.get_mut(&target) {
                    subscribers.remove(id);
                }
            }
        }

        if let Some(subscribers) = self.watchers.remove(id) {
            for subscriber in subscribers {
                if let Some(proxy) = self.local.get(&subscriber) {
                    proxy.delete_remote_dispatcher(id);
                }
                if let Some(targets) = self.watching.get_mut(&subscriber) {
                    targets.remove(id);
                }
            }
        }
    }

    fn subscribe(&mut self, subscriber: &str, target: &str, ignore_non_exist: bool) -> Result<(), RoutingError> {
        if self
            .watching
            .get(subscriber)
            .is_some_and(|targets| targets.contains(target))
        {
            return Ok(());
        }
        let Some(held) = self.instances.get(target) else {
            warn!(%subscriber, %target, "subscribe target not found");
            if !ignore_non_exist {
                if let Some(proxy) = self.local.get(subscriber) {
                    proxy.not_exist(target);
                }
            }
            return Ok(());
        };
        if !self.instances.contains_key(subscriber) {
            warn!(%subscriber, %target, "subscriber already deleted, subscribe ignored");
            return Err(RoutingError::SubscriberExited(subscriber.to_string()));
        }
        let record = held.record.clone();
        info!(%subscriber, %target, "instance subscribes target");
        self.watchers
            .entry(target.to_string())
            .or_default()
            .insert(subscriber.to_string());
        self.watching
            .entry(subscriber.to_string())
            .or_default()
            .insert(target.to_string());

        // Only the new subscriber learns the current resolution.
        let Some(proxy) = self.local.get(subscriber).cloned() else {
            return Ok(());
        };
        let code = record.status.err_code;
        match record.state {
            InstanceState::Running => {
                let mut entry = RoutingEntry::from_record(&record, &self.node_id);
                entry.is_local = false;
                self.notify_changed(&proxy, target, &record.function_proxy_id, entry);
            }
            InstanceState::SubHealth | InstanceState::Evicting => {
                proxy.reject(target, code, &record.status.msg);
            }
            InstanceState::Fatal | InstanceState::Evicted => {
                warn!(%subscriber, %target, state = %record.state, "subscribed target already failed");
                proxy.fatal(target, code, &record.status.msg);
            }
            _ => {}
        }
        Ok(())
    }

    fn terminate_migrated_instance_proxy(&mut self, id: &str) {
        let Some(proxy) = self.local.remove(id) else {
            return;
        };
        self.purge_deferred(|d| d.proxy.instance_id() == id);
        info!(instance_id = %id, in_flight = proxy.in_flight(), "terminating migrated instance proxy");
        tokio::spawn(async move {
            proxy.drain(None).await;
            proxy.terminate();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::TargetRoute;
    use funcgrid_core::StatusCode;

    const NODE: &str = "node-a";

    fn record(id: &str, state: InstanceState, version: u64) -> InstanceRecord {
        InstanceRecord {
            instance_id: id.into(),
            request_id: format!("r-{id}"),
            function_key: "fn".into(),
            function_proxy_id: NODE.into(),
            runtime_address: format!("{id}.local:9000"),
            state,
            version,
            ..Default::default()
        }
    }

    async fn next_for(
        events: &mut broadcast::Receiver<ProxyEvent>,
        proxy: &str,
    ) -> ProxyEvent {
        loop {
            let event = events.recv().await.unwrap();
            if event.proxy() == proxy {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn higher_version_wins_regardless_of_order() {
        let dir = RoutingDirectory::spawn(NODE);
        dir.update(record("i1", InstanceState::Running, 5), false, UpdateSource::MetaStore);
        dir.update(record("i1", InstanceState::Creating, 3), false, UpdateSource::MetaStore);
        let held = dir.record("i1").await.unwrap();
        assert_eq!(held.version, 5);
        assert_eq!(held.state, InstanceState::Running);
        assert!(dir.is_ready("i1").await);
    }

    #[tokio::test]
    async fn force_overrides_version_check() {
        let dir = RoutingDirectory::spawn(NODE);
        dir.update(record("i1", InstanceState::Running, 5), false, UpdateSource::Fast);
        dir.update(record("i1", InstanceState::Failed, 2), true, UpdateSource::Fast);
        assert_eq!(dir.record("i1").await.unwrap().state, InstanceState::Failed);
    }

    #[tokio::test]
    async fn equal_version_prefers_meta_store() {
        let dir = RoutingDirectory::spawn(NODE);
        let mut from_store = record("i1", InstanceState::Running, 4);
        from_store.mod_revision = 40;
        dir.update(from_store, false, UpdateSource::MetaStore);

        let mut fast = record("i1", InstanceState::Failed, 4);
        fast.mod_revision = 0;
        dir.update(fast, false, UpdateSource::Fast);
        let held = dir.record("i1").await.unwrap();
        assert_eq!(held.state, InstanceState::Running);
        assert_eq!(held.mod_revision, 40);

        let dir = RoutingDirectory::spawn(NODE);
        dir.update(record("i2", InstanceState::Failed, 4), false, UpdateSource::Fast);
        dir.update(record("i2", InstanceState::Running, 4), false, UpdateSource::MetaStore);
        assert_eq!(dir.record("i2").await.unwrap().state, InstanceState::Running);
    }

    #[tokio::test]
    async fn local_instances_get_proxies() {
        let dir = RoutingDirectory::spawn(NODE);
        dir.update(record("local", InstanceState::Creating, 1), false, UpdateSource::Fast);
        let mut remote = record("remote", InstanceState::Running, 1);
        remote.function_proxy_id = "node-b".into();
        dir.update(remote, false, UpdateSource::MetaStore);

        assert_eq!(dir.local_instances().await, vec!["local".to_string()]);
        assert!(dir.proxy("remote").await.is_none());
        let entry = dir.entry("remote").await.unwrap();
        assert!(!entry.is_local);
        assert!(entry.is_ready);
    }

    #[tokio::test]
    async fn late_subscriber_to_running_target_gets_ready() {
        let dir = RoutingDirectory::spawn(NODE);
        let mut events = dir.events();
        dir.update(record("caller", InstanceState::Running, 1), false, UpdateSource::Fast);
        dir.update(record("callee", InstanceState::Running, 1), false, UpdateSource::Fast);

        dir.subscribe_instance_event("caller", "callee", false).await.unwrap();
        loop {
            if let ProxyEvent::Ready { target, entry, .. } = next_for(&mut events, "caller").await {
                if target == "callee" {
                    assert!(!entry.is_local);
                    assert_eq!(entry.remote, NODE);
                    break;
                }
            }
        }
        let route = dir.resolve("caller", "callee").await.unwrap();
        assert_eq!(route.instance_id, "callee");
    }

    #[tokio::test]
    async fn late_subscriber_to_fatal_target_gets_original_error() {
        let dir = RoutingDirectory::spawn(NODE);
        let mut events = dir.events();
        dir.update(record("caller", InstanceState::Running, 1), false, UpdateSource::Fast);
        let mut dead = record("callee", InstanceState::Fatal, 3);
        dead.status.err_code = StatusCode::ErrUserFunctionException;
        dead.status.msg = "division by zero".into();
        dir.update(dead, false, UpdateSource::Fast);

        dir.subscribe_instance_event("caller", "callee", false).await.unwrap();
        loop {
            if let ProxyEvent::Fatal { target, code, message, .. } = next_for(&mut events, "caller").await {
                if target == "callee" {
                    assert_eq!(code, StatusCode::ErrUserFunctionException);
                    assert_eq!(message, "division by zero");
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn subscribe_unknown_target_reports_not_found() {
        let dir = RoutingDirectory::spawn(NODE);
        let mut events = dir.events();
        dir.update(record("caller", InstanceState::Running, 1), false, UpdateSource::Fast);
        dir.subscribe_instance_event("caller", "ghost", false).await.unwrap();
        loop {
            if let ProxyEvent::NotExist { target, .. } = next_for(&mut events, "caller").await {
                assert_eq!(target, "ghost");
                break;
            }
        }
        assert!(dir.subscribers_of("ghost").await.is_empty());
        let err = dir.resolve("caller", "ghost").await.unwrap_err();
        assert_eq!(err.code(), StatusCode::ErrInstanceNotFound);
    }

    #[tokio::test]
    async fn subscribe_from_unknown_subscriber_fails() {
        let dir = RoutingDirectory::spawn(NODE);
        dir.update(record("callee", InstanceState::Running, 1), false, UpdateSource::Fast);
        let err = dir
            .subscribe_instance_event("gone", "callee", false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::ErrInstanceExited);
    }

    #[tokio::test]
    async fn fatal_update_notifies_current_subscribers() {
        let dir = RoutingDirectory::spawn(NODE);
        let mut events = dir.events();
        dir.update(record("caller", InstanceState::Running, 1), false, UpdateSource::Fast);
        dir.update(record("callee", InstanceState::Creating, 1), false, UpdateSource::Fast);
        dir.subscribe_instance_event("caller", "callee", false).await.unwrap();

        let mut dead = record("callee", InstanceState::Fatal, 2);
        dead.status.err_code = StatusCode::ErrInstanceExited;
        dead.status.msg = "killed".into();
        dir.update(dead, false, UpdateSource::Fast);

        loop {
            if let ProxyEvent::Fatal { target, code, message, .. } = next_for(&mut events, "caller").await {
                assert_eq!(target, "callee");
                assert_eq!(code, StatusCode::ErrInstanceExited);
                assert_eq!(message, "killed");
                break;
            }
        }
        assert!(!dir.ready_instances().await.contains(&"callee".to_string()));
    }

    #[tokio::test]
    async fn child_of_local_parent_is_subscribed_lazily() {
        let dir = RoutingDirectory::spawn(NODE);
        dir.update(record("parent", InstanceState::Running, 1), false, UpdateSource::Fast);
        let mut child = record("child", InstanceState::Scheduling, 1);
        child.parent_id = "parent".into();
        child.function_proxy_id = "node-b".into();
        dir.update(child, false, UpdateSource::MetaStore);
        assert_eq!(dir.subscribers_of("child").await, vec!["parent".to_string()]);
    }

    #[tokio::test]
    async fn remote_ready_notification_waits_for_peer_connection() {
        let dir = RoutingDirectory::spawn(NODE);
        let mut events = dir.events();
        dir.update(record("caller", InstanceState::Running, 1), false, UpdateSource::Fast);
        let mut remote = record("callee", InstanceState::Running, 1);
        remote.function_proxy_id = "node-b".into();
        dir.update(remote, false, UpdateSource::MetaStore);
        dir.subscribe_instance_event("caller", "callee", false).await.unwrap();
        dir.flush().await;

        let proxy = dir.proxy("caller").await.unwrap();
        assert!(!proxy.snapshot().await.contains_key("callee"));

        dir.peer_connected("node-b", "10.0.0.2:7000");
        loop {
            if let ProxyEvent::Ready { target, entry, .. } = next_for(&mut events, "caller").await {
                if target == "callee" {
                    assert_eq!(entry.remote, "10.0.0.2:7000");
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn delete_tears_down_proxy_and_subscriptions() {
        let dir = RoutingDirectory::spawn(NODE);
        let mut events = dir.events();
        dir.update(record("caller", InstanceState::Running, 1), false, UpdateSource::Fast);
        dir.update(record("callee", InstanceState::Running, 1), false, UpdateSource::Fast);
        dir.subscribe_instance_event("caller", "callee", false).await.unwrap();

        dir.delete("callee");
        dir.flush().await;
        assert!(dir.record("callee").await.is_none());
        assert!(dir.proxy("callee").await.is_none());
        assert!(dir.subscribers_of("callee").await.is_empty());

        loop {
            if let ProxyEvent::Terminated { proxy } = events.recv().await.unwrap() {
                assert_eq!(proxy, "callee");
                break;
            }
        }
    }

    #[tokio::test]
    async fn migrating_instance_proxy_drains_before_terminating() {
        let dir = RoutingDirectory::spawn(NODE);
        dir.update(record("mover", InstanceState::Running, 1), false, UpdateSource::Fast);
        let proxy = dir.proxy("mover").await.unwrap();
        let token = proxy.begin_response();

        dir.notify_migrating_request("mover");
        dir.flush().await;
        assert!(dir.proxy("mover").await.is_none());
        tokio::task::yield_now().await;
        assert!(!proxy.is_terminated());

        drop(token);
        for _ in 0..100 {
            if proxy.is_terminated() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(proxy.is_terminated());
    }

    #[tokio::test]
    async fn exited_update_deletes_instance() {
        let dir = RoutingDirectory::spawn(NODE);
        dir.update(record("i1", InstanceState::Running, 1), false, UpdateSource::Fast);
        dir.update(record("i1", InstanceState::Exited, 2), false, UpdateSource::Fast);
        assert!(dir.record("i1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_reports_timeouts() {
        let dir = RoutingDirectory::spawn(NODE);
        dir.update(record("a", InstanceState::Running, 1), false, UpdateSource::Fast);
        dir.update(record("b", InstanceState::Running, 1), false, UpdateSource::Fast);
        let stuck = dir.proxy("b").await.unwrap();
        let _token = stuck.begin_response();
        let stats = dir.drain(Duration::from_millis(100)).await;
        assert_eq!(stats, DrainStats { drained: 1, timed_out: 1 });
    }
    fn remote(id: &str, state: InstanceState, version: u64) -> InstanceRecord {
        let mut r = record(id, state, version);
        r.function_proxy_id = "node-b".into();
        r
    }

    /// Events emitted for `proxy` so far. The snapshot round-trip makes sure
    /// the proxy has applied everything sent to it before.
    async fn applied_events(
        dir: &RoutingDirectory,
        events: &mut broadcast::Receiver<ProxyEvent>,
        proxy: &str,
    ) -> Vec<ProxyEvent> {
        dir.flush().await;
        dir.proxy(proxy).await.unwrap().snapshot().await;
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.proxy() == proxy {
                seen.push(event);
            }
        }
        seen
    }

    #[tokio::test]
    async fn fatal_supersedes_a_ready_waiting_for_the_owner() {
        let dir = RoutingDirectory::spawn(NODE);
        let mut events = dir.events();
        dir.update(record("caller", InstanceState::Running, 1), false, UpdateSource::Fast);
        dir.update(remote("callee", InstanceState::Creating, 1), false, UpdateSource::MetaStore);
        dir.subscribe_instance_event("caller", "callee", false).await.unwrap();
        dir.update(remote("callee", InstanceState::Running, 2), false, UpdateSource::MetaStore);
        let mut dead = remote("callee", InstanceState::Fatal, 3);
        dead.status.err_code = StatusCode::ErrUserFunctionException;
        dead.status.msg = "boom".into();
        dir.update(dead, false, UpdateSource::MetaStore);
        dir.peer_connected("node-b", "10.0.0.2:7000");

        let seen = applied_events(&dir, &mut events, "caller").await;
        assert!(
            !seen.iter().any(|e| matches!(e, ProxyEvent::Ready { target, .. } if target == "callee")),
            "{seen:?}"
        );
        let proxy = dir.proxy("caller").await.unwrap();
        assert!(matches!(
            proxy.snapshot().await.get("callee"),
            Some(TargetRoute::Failed { code: StatusCode::ErrUserFunctionException, .. })
        ));
    }

    #[tokio::test]
    async fn newer_ready_replaces_a_parked_one() {
        let dir = RoutingDirectory::spawn(NODE);
        let mut events = dir.events();
        dir.update(record("caller", InstanceState::Running, 1), false, UpdateSource::Fast);
        dir.update(remote("callee", InstanceState::Running, 1), false, UpdateSource::MetaStore);
        dir.subscribe_instance_event("caller", "callee", false).await.unwrap();
        dir.update(remote("callee", InstanceState::Running, 2), false, UpdateSource::MetaStore);
        dir.peer_connected("node-b", "10.0.0.2:7000");

        let ready: Vec<u64> = applied_events(&dir, &mut events, "caller")
            .await
            .into_iter()
            .filter_map(|e| match e {
                ProxyEvent::Ready { target, entry, .. } if target == "callee" => Some(entry.version),
                _ => None,
            })
            .collect();
        assert_eq!(ready, vec![2]);
    }

    #[tokio::test]
    async fn deleted_subscriber_loses_its_parked_notifications() {
        let dir = RoutingDirectory::spawn(NODE);
        let mut events = dir.events();
        dir.update(record("caller", InstanceState::Running, 1), false, UpdateSource::Fast);
        dir.update(record("other", InstanceState::Running, 1), false, UpdateSource::Fast);
        dir.update(remote("callee", InstanceState::Running, 1), false, UpdateSource::MetaStore);
        dir.subscribe_instance_event("caller", "callee", false).await.unwrap();
        dir.subscribe_instance_event("other", "callee", false).await.unwrap();
        dir.delete("caller");
        dir.peer_connected("node-b", "10.0.0.2:7000");

        let seen = applied_events(&dir, &mut events, "other").await;
        assert!(seen.iter().any(|e| matches!(e, ProxyEvent::Ready { .. })));
        let mut caller_ready = false;
        while let Ok(event) = events.try_recv() {
            caller_ready |= matches!(event, ProxyEvent::Ready { ref proxy, .. } if proxy == "caller");
        }
        assert!(!caller_ready);
    }

    #[tokio::test]
    async fn stale_update_after_exit_is_ignored() {
        let dir = RoutingDirectory::spawn(NODE);
        dir.update(record("i1", InstanceState::Running, 4), false, UpdateSource::Fast);
        dir.update(record("i1", InstanceState::Exited, 6), false, UpdateSource::Fast);
        dir.update(record("i1", InstanceState::Running, 4), false, UpdateSource::MetaStore);
        dir.flush().await;
        assert!(dir.record("i1").await.is_none());
        assert!(!dir.is_ready("i1").await);
        assert!(dir.local_instances().await.is_empty());

        dir.update(record("i1", InstanceState::Running, 7), false, UpdateSource::MetaStore);
        assert_eq!(dir.record("i1").await.unwrap().version, 7);
    }

    #[tokio::test]
    async fn late_subscriber_to_sub_health_target_is_rejected() {
        let dir = RoutingDirectory::spawn(NODE);
        let mut events = dir.events();
        dir.update(record("caller", InstanceState::Running, 1), false, UpdateSource::Fast);
        let mut sick = record("callee", InstanceState::SubHealth, 2);
        sick.status.err_code = StatusCode::ErrInstanceSubHealth;
        sick.status.msg = "degraded".into();
        dir.update(sick, false, UpdateSource::Fast);

        dir.subscribe_instance_event("caller", "callee", false).await.unwrap();
        let seen = applied_events(&dir, &mut events, "caller").await;
        assert!(seen.iter().any(|e| matches!(
            e,
            ProxyEvent::Rejected { target, code: StatusCode::ErrInstanceSubHealth, .. } if target == "callee"
        )));
    }

    #[tokio::test]
    async fn new_subscription_notifies_only_the_new_subscriber() {
        let dir = RoutingDirectory::spawn(NODE);
        let mut events = dir.events();
        dir.update(record("first", InstanceState::Running, 1), false, UpdateSource::Fast);
        dir.update(record("second", InstanceState::Running, 1), false, UpdateSource::Fast);
        dir.update(record("callee", InstanceState::Running, 1), false, UpdateSource::Fast);
        dir.subscribe_instance_event("first", "callee", false).await.unwrap();
        dir.subscribe_instance_event("second", "callee", false).await.unwrap();

        let ready_for_first = applied_events(&dir, &mut events, "first")
            .await
            .into_iter()
            .filter(|e| matches!(e, ProxyEvent::Ready { target, .. } if target == "callee"))
            .count();
        assert_eq!(ready_for_first, 1);
    }
}

//! MetaStore — redb-backed durable instance store with a change feed.
//!
//! Every write transaction bumps the store revision, stamps it into the
//! written record as `mod_revision`, and publishes a [`WatchEvent`] after
//! commit. Instance writes are version-checked.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const WATCH_CAPACITY: usize = 1024;

/// Change notification published after a committed write.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    InstancePut(InstanceRecord),
    InstanceDelete {
        instance_id: String,
        mod_revision: u64,
    },
    RoutePut(RouteRecord),
    RouteDelete {
        instance_id: String,
        mod_revision: u64,
    },
    GroupPut(GroupRecord),
}

impl WatchEvent {
    pub fn mod_revision(&self) -> u64 {
        match self {
            WatchEvent::InstancePut(r) => r.mod_revision,
            WatchEvent::RoutePut(r) => r.mod_revision,
            WatchEvent::GroupPut(g) => g.mod_revision,
            WatchEvent::InstanceDelete { mod_revision, .. }
            | WatchEvent::RouteDelete { mod_revision, .. } => *mod_revision,
        }
    }
}

/// Thread-safe meta-store backed by redb.
#[derive(Clone)]
pub struct MetaStore {
    db: Arc<Database>,
    events: broadcast::Sender<WatchEvent>,
}

impl MetaStore {
    /// Open (or create) a persistent meta-store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_db(db);
        store.ensure_tables()?;
        debug!(?path, "meta-store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory meta-store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_db(db);
        store.ensure_tables()?;
        debug!("in-memory meta-store opened");
        Ok(store)
    }

    fn with_db(db: Database) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            db: Arc::new(db),
            events,
        }
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(INSTANCE_KEYS).map_err(map_err!(Table))?;
        txn.open_table(ROUTES).map_err(map_err!(Table))?;
        txn.open_table(GROUPS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Subscribe to the change feed. Only events committed after the call
    /// are delivered.
    pub fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    /// Current store revision.
    pub fn revision(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(META).map_err(map_err!(Table))?;
        let rev = table
            .get(REVISION_KEY)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0);
        Ok(rev)
    }

    fn next_revision(txn: &WriteTransaction) -> StateResult<u64> {
        let mut table = txn.open_table(META).map_err(map_err!(Table))?;
        let current = table
            .get(REVISION_KEY)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0);
        let next = current + 1;
        table.insert(REVISION_KEY, next).map_err(map_err!(Write))?;
        Ok(next)
    }

    fn publish(&self, events: Vec<WatchEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Write an instance record, optionally with its routing projection.
    ///
    /// `create` requires the key to be absent. Otherwise the incoming
    /// `version` must be strictly newer than the stored one. Returns the
    /// new `mod_revision`.
    pub fn put_instance(
        &self,
        record: &InstanceRecord,
        with_route: bool,
        create: bool,
    ) -> StateResult<u64> {
        let key = record.instance_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let revision;
        let mut stored_record = record.clone();
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let existing: Option<InstanceRecord> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            if let Some(existing) = existing {
                if create || existing.version >= record.version {
                    return Err(StateError::VersionConflict {
                        key,
                        stored: existing.version,
                        incoming: record.version,
                    });
                }
            }

            revision = Self::next_revision(&txn)?;
            stored_record.mod_revision = revision;
            let value = serde_json::to_vec(&stored_record).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            let mut index = txn.open_table(INSTANCE_KEYS).map_err(map_err!(Table))?;
            index
                .insert(record.instance_id.as_str(), key.as_str())
                .map_err(map_err!(Write))?;
        }

        let mut events = vec![WatchEvent::InstancePut(stored_record.clone())];
        if with_route {
            let route = RouteRecord::from_instance(&stored_record);
            Self::write_route(&txn, &route)?;
            events.push(WatchEvent::RoutePut(route));
        }
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(
            %key,
            state = %record.state,
            version = record.version,
            revision,
            with_route,
            "instance stored"
        );
        self.publish(events);
        Ok(revision)
    }

    /// Get an instance record by instance id.
    pub fn get_instance(&self, instance_id: &str) -> StateResult<Option<InstanceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn.open_table(INSTANCE_KEYS).map_err(map_err!(Table))?;
        let key = match index.get(instance_id).map_err(map_err!(Read))? {
            Some(guard) => guard.value().to_string(),
            None => return Ok(None),
        };
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: InstanceRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all instance records.
    pub fn list_instances(&self) -> StateResult<Vec<InstanceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: InstanceRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Instances owned by the given node.
    pub fn list_instances_for_owner(&self, node_id: &str) -> StateResult<Vec<InstanceRecord>> {
        Ok(self
            .list_instances()?
            .into_iter()
            .filter(|r| r.is_owned_by(node_id))
            .collect())
    }

    /// Delete an instance record and its route. Returns true if it existed.
    pub fn delete_instance(&self, instance_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        let revision;
        {
            let mut index = txn.open_table(INSTANCE_KEYS).map_err(map_err!(Table))?;
            let key = index
                .remove(instance_id)
                .map_err(map_err!(Write))?
                .map(|g| g.value().to_string());
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            existed = match key {
                Some(key) => table.remove(key.as_str()).map_err(map_err!(Write))?.is_some(),
                None => false,
            };
            let mut routes = txn.open_table(ROUTES).map_err(map_err!(Table))?;
            routes
                .remove(route_key(instance_id).as_str())
                .map_err(map_err!(Write))?;
            revision = Self::next_revision(&txn)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%instance_id, existed, revision, "instance deleted");
        if existed {
            self.publish(vec![
                WatchEvent::InstanceDelete {
                    instance_id: instance_id.to_string(),
                    mod_revision: revision,
                },
                WatchEvent::RouteDelete {
                    instance_id: instance_id.to_string(),
                    mod_revision: revision,
                },
            ]);
        }
        Ok(existed)
    }

    // ── Routes ─────────────────────────────────────────────────────

    fn write_route(txn: &WriteTransaction, route: &RouteRecord) -> StateResult<()> {
        let key = route_key(&route.instance_id);
        let value = serde_json::to_vec(route).map_err(map_err!(Serialize))?;
        let mut table = txn.open_table(ROUTES).map_err(map_err!(Table))?;
        table
            .insert(key.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Write a routing projection on its own. Returns the new revision.
    pub fn put_route(&self, route: &RouteRecord) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let revision = Self::next_revision(&txn)?;
        let mut stored = route.clone();
        stored.mod_revision = revision;
        Self::write_route(&txn, &stored)?;
        txn.commit().map_err(map_err!(Transaction))?;
        self.publish(vec![WatchEvent::RoutePut(stored)]);
        Ok(revision)
    }

    pub fn get_route(&self, instance_id: &str) -> StateResult<Option<RouteRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROUTES).map_err(map_err!(Table))?;
        match table
            .get(route_key(instance_id).as_str())
            .map_err(map_err!(Read))?
        {
            Some(guard) => {
                let route: RouteRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(route))
            }
            None => Ok(None),
        }
    }

    pub fn list_routes(&self) -> StateResult<Vec<RouteRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROUTES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let route: RouteRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(route);
        }
        Ok(results)
    }

    /// Delete a routing projection. Returns true if it existed.
    pub fn delete_route(&self, instance_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        let revision;
        {
            let mut table = txn.open_table(ROUTES).map_err(map_err!(Table))?;
            existed = table
                .remove(route_key(instance_id).as_str())
                .map_err(map_err!(Write))?
                .is_some();
            revision = Self::next_revision(&txn)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if existed {
            self.publish(vec![WatchEvent::RouteDelete {
                instance_id: instance_id.to_string(),
                mod_revision: revision,
            }]);
        }
        Ok(existed)
    }

    // ── Groups ─────────────────────────────────────────────────────

    /// Insert or update a group record. Returns the new revision.
    pub fn put_group(&self, group: &GroupRecord) -> StateResult<u64> {
        let key = group.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let revision = Self::next_revision(&txn)?;
        let mut stored = group.clone();
        stored.mod_revision = revision;
        let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
        {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, state = ?group.state, revision, "group stored");
        self.publish(vec![WatchEvent::GroupPut(stored)]);
        Ok(revision)
    }

    pub fn get_group(&self, group_id: &str) -> StateResult<Option<GroupRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        match table
            .get(group_key(group_id).as_str())
            .map_err(map_err!(Read))?
        {
            Some(guard) => {
                let group: GroupRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(group))
            }
            None => Ok(None),
        }
    }

    pub fn list_groups(&self) -> StateResult<Vec<GroupRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let group: GroupRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(group);
        }
        Ok(results)
    }

    pub fn delete_group(&self, group_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            existed = table
                .remove(group_key(group_id).as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}

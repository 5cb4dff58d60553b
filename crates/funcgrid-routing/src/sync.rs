//! Meta-store watch feeding the routing directory.

use funcgrid_state::{MetaStore, WatchEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::directory::{RoutingDirectory, UpdateSource};

/// Apply the meta-store change feed to `directory` until the store is
/// dropped. A lagging receiver falls back to a full resync.
pub fn watch_meta_store(directory: RoutingDirectory, store: MetaStore) -> JoinHandle<()> {
    let mut rx = store.watch();
    tokio::spawn(async move {
        resync(&directory, &store);
        loop {
            match rx.recv().await {
                Ok(event) => apply(&directory, event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "meta-store watch lagged, resyncing");
                    resync(&directory, &store);
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("meta-store watch stopped");
    })
}

fn apply(directory: &RoutingDirectory, event: WatchEvent) {
    debug!(revision = event.mod_revision(), "meta-store event");
    match event {
        WatchEvent::InstancePut(record) => directory.update(record, false, UpdateSource::MetaStore),
        WatchEvent::RoutePut(route) => directory.update_route(&route, UpdateSource::MetaStore),
        WatchEvent::InstanceDelete { instance_id, .. } => directory.delete(&instance_id),
        WatchEvent::RouteDelete { .. } | WatchEvent::GroupPut(_) => {}
    }
}

fn resync(directory: &RoutingDirectory, store: &MetaStore) {
    match store.list_instances() {
        Ok(records) => {
            debug!(count = records.len(), "resyncing routing directory");
            for record in records {
                directory.update(record, false, UpdateSource::MetaStore);
            }
        }
        Err(e) => warn!(error = %e, "meta-store resync failed"),
    }
}

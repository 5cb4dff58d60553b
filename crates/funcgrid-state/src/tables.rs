//! redb table definitions for the meta-store.

use redb::TableDefinition;

/// Instance records keyed by `/instance/{function}/{request_id}/{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Instance id to instance key.
pub const INSTANCE_KEYS: TableDefinition<&str, &str> = TableDefinition::new("instance_keys");

/// Routing projections keyed by `/route/{instance_id}`.
pub const ROUTES: TableDefinition<&str, &[u8]> = TableDefinition::new("routes");

/// Group records keyed by `/group/{group_id}`.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");

/// Store-wide counters. Holds the revision under [`REVISION_KEY`].
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const REVISION_KEY: &str = "revision";

//! funcgrid-state — instance data model and durable meta-store.
//!
//! Backed by [redb](https://docs.rs/redb). Holds the authoritative
//! instance records, their routing projections, and group records.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Instance records live under `/instance/{function}/{request_id}/{instance_id}`
//! with a secondary index by instance id; routing projections live under
//! `/route/{instance_id}`. Every write transaction bumps a global revision
//! that is stamped into the written record as `mod_revision` and carried on
//! the change feed returned by [`MetaStore::watch`].
//!
//! Writes are version-checked: an update whose `version` is not strictly
//! newer than the stored one is rejected with [`StateError::VersionConflict`].

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{MetaStore, WatchEvent};
pub use types::*;

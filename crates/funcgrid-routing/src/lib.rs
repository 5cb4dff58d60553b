//! funcgrid-routing — the routing directory.
//!
//! The [`RoutingDirectory`] is a message-driven actor holding every known
//! instance (local and remote), one [`InstanceProxy`](proxy::InstanceProxyHandle)
//! task per locally owned instance, and the subscriber relationships
//! between instances. Updates arrive from two paths, the orchestrator's
//! local fast channel and the meta-store watch ([`sync::watch_meta_store`]),
//! and are reconciled by version.

pub mod directory;
pub mod entry;
pub mod error;
pub mod proxy;
pub mod sync;

pub use directory::{DrainStats, RoutingDirectory, UpdateSource};
pub use entry::RoutingEntry;
pub use error::RoutingError;
pub use proxy::{InstanceProxyHandle, ProxyEvent, TargetRoute};

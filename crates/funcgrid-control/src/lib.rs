//! funcgrid-control — the instance orchestrator.
//!
//! [`InstanceCtrl`] owns the lifecycle of every instance placed on this
//! node: admission and placement, deployment with bounded retries, the
//! create handshake, kill and eviction, runtime failure handling and
//! recovery after restarts. It talks to the outside world only through
//! the collaborator traits in [`traits`].
//!
//! # Architecture
//!
//! ```text
//! InstanceCtrl
//!   ├── InstanceStateMachine per instance (funcgrid-lifecycle)
//!   ├── MetaStoreClient   (persist per transition)
//!   ├── RoutingDirectory  (fast-path updates, subscribers)
//!   ├── HeartbeatMonitor  (probe loops -> HeartbeatEvent)
//!   └── Scheduler / AgentClient / RuntimeClient / ClusterClient
//! GroupCtrl
//!   └── follows InstanceCtrl transitions for group members
//! ```

pub mod ctrl;
pub mod error;
pub mod group;
pub mod heartbeat;
pub mod traits;

pub use ctrl::InstanceCtrl;
pub use error::{ControlError, ControlResult};
pub use group::{GroupCtrl, GroupScheduleRequest, GroupScheduleResponse};
pub use heartbeat::{HeartbeatEvent, HeartbeatMonitor, HeartbeatSettings};
pub use traits::*;

//! funcgrid-lifecycle — instance lifecycle state machine.
//!
//! [`table`] holds the pure transition function and the persistence policy;
//! [`machine`] wraps one [`InstanceRecord`](funcgrid_state::InstanceRecord)
//! with version bookkeeping, state-change callbacks, and the per-instance
//! cancel signal.

pub mod error;
pub mod machine;
pub mod table;

pub use error::{LifecycleError, LifecycleResult};
pub use machine::{InstanceStateMachine, TransContext, TransitionResult};
pub use table::{Persistence, TransitionOutcome, need_route_update, persistence_for, settle, transition};

use funcgrid_state::InstanceState;
use thiserror::Error;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: InstanceState,
        to: InstanceState,
    },

    #[error("instance {0} state machine is locally abnormal")]
    Abnormal(String),
}

//! Orchestrator error types.

use funcgrid_core::{Status, StatusCode};
use funcgrid_lifecycle::LifecycleError;
use funcgrid_routing::RoutingError;
use funcgrid_state::StateError;
use thiserror::Error;

/// Errors raised inside the orchestrator and by its collaborators.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid request: {0}")]
    InvalidParam(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("instance {0} already exists")]
    Duplicated(String),

    #[error("instance {id} exited: {reason}")]
    Exited { id: String, reason: String },

    #[error("function meta not found: {0}")]
    FunctionMetaNotFound(String),

    #[error("authorization failed: {0}")]
    Unauthorized(String),

    #[error("schedule canceled: {0}")]
    Canceled(String),

    #[error("{0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("meta-store: {0}")]
    MetaStore(String),

    #[error("routing: {0}")]
    Routing(#[from] RoutingError),

    #[error("rpc to {target} failed: {reason}")]
    Rpc { target: String, reason: String },

    #[error("{what} timed out")]
    Timeout { what: String },

    #[error("instance control is abnormal")]
    Abnormal,

    #[error("instance control is shutting down")]
    ShuttingDown,

    /// An error reported by a collaborator with its own code.
    #[error("{0}")]
    Status(Status),
}

pub type ControlResult<T> = Result<T, ControlError>;

impl ControlError {
    pub fn rpc(target: impl Into<String>, reason: impl ToString) -> Self {
        ControlError::Rpc {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        ControlError::Timeout { what: what.into() }
    }

    /// Stable code surfaced to callers.
    pub fn code(&self) -> StatusCode {
        match self {
            ControlError::InvalidParam(_) => StatusCode::ErrParamInvalid,
            ControlError::InstanceNotFound(_) => StatusCode::ErrInstanceNotFound,
            ControlError::Duplicated(_) => StatusCode::ErrInstanceDuplicated,
            ControlError::Exited { .. } => StatusCode::ErrInstanceExited,
            ControlError::FunctionMetaNotFound(_) => StatusCode::ErrFunctionMetaNotFound,
            ControlError::Unauthorized(_) => StatusCode::ErrAuthorizeFailed,
            ControlError::Canceled(_) => StatusCode::ErrScheduleCanceled,
            ControlError::MetaStore(_) => StatusCode::ErrMetaStoreOperation,
            ControlError::Routing(e) => e.code(),
            ControlError::Rpc { .. } | ControlError::Timeout { .. } => {
                StatusCode::ErrInnerCommunication
            }
            ControlError::Lifecycle(_) | ControlError::Abnormal | ControlError::ShuttingDown => {
                StatusCode::ErrInnerSystemError
            }
            ControlError::Status(status) => status.code,
        }
    }

    pub fn to_status(&self) -> Status {
        match self {
            ControlError::Status(status) => status.clone(),
            other => Status::error(other.code(), other.to_string()),
        }
    }
}

impl From<StateError> for ControlError {
    fn from(e: StateError) -> Self {
        ControlError::MetaStore(e.to_string())
    }
}

impl From<Status> for ControlError {
    fn from(status: Status) -> Self {
        ControlError::Status(status)
    }
}

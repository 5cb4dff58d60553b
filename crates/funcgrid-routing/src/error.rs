use funcgrid_core::StatusCode;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("instance {target} failed: {message}")]
    InstanceFatal {
        target: String,
        code: StatusCode,
        message: String,
    },

    #[error("instance {target} rejects requests: {message}")]
    Rejected {
        target: String,
        code: StatusCode,
        message: String,
    },

    #[error("route to {0} was removed")]
    TargetRemoved(String),

    #[error("proxy of {0} terminated")]
    ProxyTerminated(String),

    #[error("subscriber {0} does not exist")]
    SubscriberExited(String),

    #[error("routing directory stopped")]
    Stopped,
}

impl RoutingError {
    pub fn code(&self) -> StatusCode {
        match self {
            RoutingError::InstanceNotFound(_) => StatusCode::ErrInstanceNotFound,
            RoutingError::InstanceFatal { code, .. } | RoutingError::Rejected { code, .. } => *code,
            RoutingError::TargetRemoved(_) | RoutingError::SubscriberExited(_) => {
                StatusCode::ErrInstanceExited
            }
            RoutingError::ProxyTerminated(_) | RoutingError::Stopped => {
                StatusCode::ErrInnerSystemError
            }
        }
    }
}

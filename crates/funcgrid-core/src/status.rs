//! Stable numeric status codes surfaced to callers.

use serde::{Deserialize, Serialize};

/// Status code carried by every response. The numeric values are part of
/// the external contract and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StatusCode {
    #[default]
    Ok,
    Failed,
    ErrParamInvalid,
    ErrResourceNotEnough,
    ErrInstanceNotFound,
    ErrInstanceDuplicated,
    ErrInstanceExited,
    ErrInstanceSubHealth,
    ErrGroupScheduleFailed,
    ErrGroupExitTogether,
    ErrScheduleCanceled,
    ErrInstanceEvicted,
    ErrFunctionMetaNotFound,
    ErrAuthorizeFailed,
    ErrUserCodeLoad,
    ErrUserFunctionException,
    ErrRequestBetweenRuntimeBus,
    ErrInnerCommunication,
    ErrInnerSystemError,
    ErrMetaStoreOperation,
    LsRequestNotFound,
    LsDeployInstanceFailed,
    LsSyncInstanceFail,
    LsAgentNotFound,
}

const CODES: &[(StatusCode, i32)] = &[
    (StatusCode::Ok, 0),
    (StatusCode::Failed, 1),
    (StatusCode::ErrParamInvalid, 1001),
    (StatusCode::ErrResourceNotEnough, 1002),
    (StatusCode::ErrInstanceNotFound, 1003),
    (StatusCode::ErrInstanceDuplicated, 1004),
    (StatusCode::ErrInstanceExited, 1007),
    (StatusCode::ErrInstanceSubHealth, 1009),
    (StatusCode::ErrGroupScheduleFailed, 1010),
    (StatusCode::ErrGroupExitTogether, 1011),
    (StatusCode::ErrScheduleCanceled, 1012),
    (StatusCode::ErrInstanceEvicted, 1013),
    (StatusCode::ErrFunctionMetaNotFound, 1014),
    (StatusCode::ErrAuthorizeFailed, 1015),
    (StatusCode::ErrUserCodeLoad, 2001),
    (StatusCode::ErrUserFunctionException, 2002),
    (StatusCode::ErrRequestBetweenRuntimeBus, 3001),
    (StatusCode::ErrInnerCommunication, 3002),
    (StatusCode::ErrInnerSystemError, 3003),
    (StatusCode::ErrMetaStoreOperation, 3005),
    (StatusCode::LsRequestNotFound, 5001),
    (StatusCode::LsDeployInstanceFailed, 5002),
    (StatusCode::LsSyncInstanceFail, 5003),
    (StatusCode::LsAgentNotFound, 5004),
];

impl StatusCode {
    pub fn as_i32(self) -> i32 {
        CODES
            .iter()
            .find(|(code, _)| *code == self)
            .map(|(_, value)| *value)
            .unwrap_or(1)
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        CODES.iter().find(|(_, v)| *v == value).map(|(code, _)| *code)
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }

    /// User-code failures are reported but never retried automatically.
    pub fn is_user_error(self) -> bool {
        matches!(
            self,
            StatusCode::ErrUserCodeLoad | StatusCode::ErrUserFunctionException
        )
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.as_i32())
    }
}

/// A code plus human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Fold another status into this one. The first failure's code wins;
    /// messages accumulate.
    pub fn append(&mut self, other: &Status) {
        if other.is_ok() {
            return;
        }
        if self.is_ok() {
            self.code = other.code;
        }
        if !self.message.is_empty() {
            self.message.push_str("; ");
        }
        self.message.push_str(&other.message);
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

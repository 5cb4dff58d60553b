//! Kill-signal numbers understood by the orchestrator.

use serde::{Deserialize, Serialize};

pub const MIN_SIGNAL_NUM: i32 = 1;
pub const MAX_SIGNAL_NUM: i32 = 1024;
/// User-defined signals start here; everything below is reserved.
pub const MIN_USER_SIGNAL_NUM: i32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    ShutDown,
    ShutDownAll,
    ShutDownSync,
    ShutDownGroup,
    GroupExit,
    FamilyExit,
    AppStop,
    Subscribe,
    Notify,
    Unsubscribe,
    User(i32),
}

impl Signal {
    /// Decode a raw signal number. Returns `None` outside the accepted
    /// range, including the reserved band below the user signals.
    pub fn from_raw(value: i32) -> Option<Self> {
        let signal = match value {
            1 => Signal::ShutDown,
            2 => Signal::ShutDownAll,
            3 => Signal::ShutDownSync,
            4 => Signal::ShutDownGroup,
            5 => Signal::GroupExit,
            6 => Signal::FamilyExit,
            7 => Signal::AppStop,
            8 => Signal::Subscribe,
            9 => Signal::Notify,
            10 => Signal::Unsubscribe,
            v if (MIN_USER_SIGNAL_NUM..=MAX_SIGNAL_NUM).contains(&v) => Signal::User(v),
            _ => return None,
        };
        Some(signal)
    }

    pub fn as_raw(self) -> i32 {
        match self {
            Signal::ShutDown => 1,
            Signal::ShutDownAll => 2,
            Signal::ShutDownSync => 3,
            Signal::ShutDownGroup => 4,
            Signal::GroupExit => 5,
            Signal::FamilyExit => 6,
            Signal::AppStop => 7,
            Signal::Subscribe => 8,
            Signal::Notify => 9,
            Signal::Unsubscribe => 10,
            Signal::User(v) => v,
        }
    }

    /// Signals that end with the target instance gone.
    pub fn is_shutdown(self) -> bool {
        matches!(
            self,
            Signal::ShutDown
                | Signal::ShutDownSync
                | Signal::GroupExit
                | Signal::FamilyExit
                | Signal::AppStop
        )
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

//! Transition table and persistence policy.

use funcgrid_state::InstanceState;
use funcgrid_state::InstanceState::*;

/// Result of asking the table for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub state: InstanceState,
    pub accepted: bool,
}

fn allowed(from: InstanceState) -> &'static [InstanceState] {
    match from {
        New => &[Scheduling],
        Scheduling => &[Creating, Failed, Fatal, Exiting, ScheduleFailed],
        Creating => &[Running, Failed, Exiting, Fatal],
        Running => &[Failed, Exiting, Fatal, Evicting, SubHealth],
        SubHealth => &[Running, Failed, Exiting, Fatal, Evicting],
        Failed => &[Scheduling, Exiting, Fatal],
        ScheduleFailed => &[Scheduling, Exiting],
        Exiting | Fatal | Exited | Evicting | Evicted => &[],
    }
}

/// Pure transition function. Terminal sources are absorbing; a request for
/// the current (non-terminal) state is an accepted no-op.
pub fn transition(current: InstanceState, target: InstanceState) -> TransitionOutcome {
    let accepted = if current.is_terminal() {
        false
    } else {
        current == target || allowed(current).contains(&target)
    };
    TransitionOutcome {
        state: if accepted { target } else { current },
        accepted,
    }
}

/// Completion steps the orchestrator may take out of a terminal state.
pub fn settle(current: InstanceState, target: InstanceState) -> TransitionOutcome {
    let accepted = matches!(
        (current, target),
        (Exiting, Exited) | (Exiting, Fatal) | (Evicting, Evicted) | (Evicting, Fatal) | (Fatal, Exited) | (Evicted, Exited)
    );
    TransitionOutcome {
        state: if accepted { target } else { current },
        accepted,
    }
}

/// What to write to the meta-store for an accepted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    None,
    InstanceOnly,
    All,
}

/// CREATING never advertises a route; with the meta-store SCHEDULING
/// doesn't either.
pub fn need_route_update(state: InstanceState, meta_store_enabled: bool) -> bool {
    match state {
        Creating => false,
        Scheduling => !meta_store_enabled,
        _ => true,
    }
}

pub fn persistence_for(
    low_reliability: bool,
    target: InstanceState,
    meta_store_enabled: bool,
) -> Persistence {
    let route = need_route_update(target, meta_store_enabled);
    if low_reliability {
        return if route { Persistence::All } else { Persistence::None };
    }
    if route || !meta_store_enabled {
        Persistence::All
    } else {
        Persistence::InstanceOnly
    }
}

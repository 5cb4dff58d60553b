//! Per-instance state machine.

use std::collections::HashSet;

use funcgrid_core::{CancelSignal, ExitType, StatusCode};
use funcgrid_state::{InstanceRecord, InstanceState, epoch_secs};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{LifecycleError, LifecycleResult};
use crate::table::{Persistence, persistence_for, settle, transition};

type RecordUpdate = Box<dyn FnOnce(&mut InstanceRecord) + Send>;

/// A requested state change plus the status details recorded with it.
pub struct TransContext {
    pub target: InstanceState,
    pub err_code: StatusCode,
    pub exit_code: i32,
    pub msg: String,
    pub exit_type: ExitType,
    update: Option<RecordUpdate>,
}

impl TransContext {
    pub fn new(target: InstanceState) -> Self {
        Self {
            target,
            err_code: StatusCode::Ok,
            exit_code: 0,
            msg: String::new(),
            exit_type: ExitType::NoneExit,
            update: None,
        }
    }

    pub fn code(mut self, code: StatusCode) -> Self {
        self.err_code = code;
        self
    }

    pub fn msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = msg.into();
        self
    }

    pub fn exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn exit_type(mut self, exit_type: ExitType) -> Self {
        self.exit_type = exit_type;
        self
    }

    /// Extra record mutation applied together with the state change.
    pub fn update(mut self, f: impl FnOnce(&mut InstanceRecord) + Send + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for TransContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransContext")
            .field("target", &self.target)
            .field("err_code", &self.err_code)
            .field("msg", &self.msg)
            .finish()
    }
}

/// Outcome of an applied transition.
#[derive(Debug, Clone)]
pub struct TransitionResult {
    pub previous: InstanceRecord,
    pub current: InstanceRecord,
    pub persistence: Persistence,
    /// False for same-state no-ops.
    pub changed: bool,
}

impl TransitionResult {
    pub fn previous_state(&self) -> InstanceState {
        self.previous.state
    }

    /// First write of this instance goes through a create.
    pub fn is_create(&self) -> bool {
        self.previous.state == InstanceState::New
    }
}

struct StateCallback {
    key: String,
    states: HashSet<InstanceState>,
    tx: oneshot::Sender<InstanceRecord>,
}

/// Owns one instance record and guards every change to it.
pub struct InstanceStateMachine {
    record: InstanceRecord,
    meta_store_enabled: bool,
    callbacks: Vec<StateCallback>,
    cancel: CancelSignal,
    local_abnormal: bool,
    exit_times: u32,
}

impl InstanceStateMachine {
    pub fn new(record: InstanceRecord, meta_store_enabled: bool) -> Self {
        Self {
            record,
            meta_store_enabled,
            callbacks: Vec::new(),
            cancel: CancelSignal::new(),
            local_abnormal: false,
            exit_times: 0,
        }
    }

    pub fn record(&self) -> &InstanceRecord {
        &self.record
    }

    pub fn state(&self) -> InstanceState {
        self.record.state
    }

    pub fn instance_id(&self) -> &str {
        &self.record.instance_id
    }

    pub fn version(&self) -> u64 {
        self.record.version
    }

    /// Apply a table transition. Bumps `version` when the state changes.
    pub fn transition_to(&mut self, ctx: TransContext) -> LifecycleResult<TransitionResult> {
        let outcome = transition(self.record.state, ctx.target);
        self.apply(ctx, outcome.accepted)
    }

    /// Apply an orchestrator completion step out of a terminal state.
    pub fn settle_to(&mut self, ctx: TransContext) -> LifecycleResult<TransitionResult> {
        let outcome = settle(self.record.state, ctx.target);
        self.apply(ctx, outcome.accepted)
    }

    fn apply(&mut self, ctx: TransContext, accepted: bool) -> LifecycleResult<TransitionResult> {
        if self.local_abnormal {
            return Err(LifecycleError::Abnormal(self.record.instance_id.clone()));
        }
        let from = self.record.state;
        if !accepted {
            warn!(
                instance_id = %self.record.instance_id,
                %from,
                to = %ctx.target,
                "illegal transition rejected"
            );
            return Err(LifecycleError::IllegalTransition {
                from,
                to: ctx.target,
            });
        }

        let previous = self.record.clone();
        if from == ctx.target {
            return Ok(TransitionResult {
                current: previous.clone(),
                previous,
                persistence: Persistence::None,
                changed: false,
            });
        }

        let record = &mut self.record;
        record.state = ctx.target;
        record.status.code = ctx.target.code();
        record.status.err_code = ctx.err_code;
        record.status.exit_code = ctx.exit_code;
        record.status.msg = ctx.msg;
        record.status.exit_type = ctx.exit_type;
        record.version += 1;
        record.updated_at = epoch_secs();
        if let Some(update) = ctx.update {
            update(&mut *record);
        }

        let persistence =
            persistence_for(record.low_reliability, ctx.target, self.meta_store_enabled);
        debug!(
            instance_id = %record.instance_id,
            %from,
            to = %ctx.target,
            version = record.version,
            ?persistence,
            "instance state changed"
        );
        Ok(TransitionResult {
            previous,
            current: record.clone(),
            persistence,
            changed: true,
        })
    }

    /// Restore the record held before a transition whose persistence failed.
    pub fn rollback(&mut self, previous: InstanceRecord) {
        warn!(
            instance_id = %self.record.instance_id,
            from = %self.record.state,
            to = %previous.state,
            "rolling back state change"
        );
        self.record = previous;
    }

    pub fn set_mod_revision(&mut self, revision: u64) {
        self.record.mod_revision = revision;
    }

    /// Mutate non-state fields. Written with the next persisted transition.
    pub fn update_record(&mut self, f: impl FnOnce(&mut InstanceRecord)) {
        f(&mut self.record);
    }

    // ── Callbacks ──────────────────────────────────────────────────

    /// Register interest in the machine reaching any of `states`. Fires
    /// immediately when already there.
    pub fn add_state_change_callback(
        &mut self,
        states: &[InstanceState],
        key: impl Into<String>,
    ) -> oneshot::Receiver<InstanceRecord> {
        let (tx, rx) = oneshot::channel();
        let states: HashSet<InstanceState> = states.iter().copied().collect();
        if states.contains(&self.record.state) {
            let _ = tx.send(self.record.clone());
        } else {
            self.callbacks.push(StateCallback {
                key: key.into(),
                states,
                tx,
            });
        }
        rx
    }

    pub fn remove_state_change_callback(&mut self, key: &str) {
        self.callbacks.retain(|cb| cb.key != key);
    }

    /// Deliver the current record to every callback concerned with the
    /// current state. Call after the transition is durable.
    pub fn publish(&mut self) {
        let state = self.record.state;
        let (fire, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.callbacks)
            .into_iter()
            .partition(|cb| cb.states.contains(&state));
        self.callbacks = keep;
        for cb in fire {
            let _ = cb.tx.send(self.record.clone());
        }
    }

    // ── Cancel / abnormal ──────────────────────────────────────────

    /// Resolve the cancel signal. Returns false if already cancelled.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.cancel.resolve(reason.into())
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_resolved()
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.cancel.peek()
    }

    pub fn set_local_abnormal(&mut self) {
        self.local_abnormal = true;
    }

    pub fn is_local_abnormal(&self) -> bool {
        self.local_abnormal
    }

    pub fn increment_exit_times(&mut self) -> u32 {
        self.exit_times += 1;
        self.exit_times
    }

    pub fn exit_times(&self) -> u32 {
        self.exit_times
    }

    /// The runtime may be recovered in place or redeployed.
    pub fn is_runtime_recover_enabled(&self) -> bool {
        self.record.recover_retry_times > 0 && !self.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(state: InstanceState) -> InstanceStateMachine {
        let record = InstanceRecord {
            instance_id: "i-1".into(),
            request_id: "r-1".into(),
            function_key: "fn".into(),
            state,
            version: 1,
            recover_retry_times: 1,
            ..Default::default()
        };
        InstanceStateMachine::new(record, true)
    }

    #[test]
    fn transition_bumps_version_and_records_status() {
        let mut m = machine(InstanceState::Running);
        let result = m
            .transition_to(
                TransContext::new(InstanceState::Fatal)
                    .code(StatusCode::ErrUserFunctionException)
                    .msg("boom")
                    .exit_code(137)
                    .exit_type(ExitType::Exception),
            )
            .unwrap();
        assert!(result.changed);
        assert_eq!(result.previous_state(), InstanceState::Running);
        assert_eq!(m.version(), 2);
        let status = &m.record().status;
        assert_eq!(status.err_code, StatusCode::ErrUserFunctionException);
        assert_eq!(status.msg, "boom");
        assert_eq!(status.exit_code, 137);
        assert_eq!(status.code, InstanceState::Fatal.code());
        assert_eq!(result.persistence, Persistence::All);
    }

    #[test]
    fn same_state_does_not_bump_version() {
        let mut m = machine(InstanceState::Running);
        let result = m.transition_to(TransContext::new(InstanceState::Running)).unwrap();
        assert!(!result.changed);
        assert_eq!(result.persistence, Persistence::None);
        assert_eq!(m.version(), 1);
    }

    #[test]
    fn terminal_rejects_and_settle_completes() {
        let mut m = machine(InstanceState::Exiting);
        let err = m.transition_to(TransContext::new(InstanceState::Running)).unwrap_err();
        assert_eq!(
            err,
            LifecycleError::IllegalTransition {
                from: InstanceState::Exiting,
                to: InstanceState::Running
            }
        );
        assert_eq!(m.version(), 1);
        m.settle_to(TransContext::new(InstanceState::Exited)).unwrap();
        assert_eq!(m.state(), InstanceState::Exited);
    }

    #[test]
    fn update_is_applied_with_transition() {
        let mut m = machine(InstanceState::Scheduling);
        let result = m
            .transition_to(TransContext::new(InstanceState::Creating).update(|r| {
                r.unit_id = "agent-3".into();
            }))
            .unwrap();
        assert_eq!(result.current.unit_id, "agent-3");
        assert_eq!(result.persistence, Persistence::InstanceOnly);
    }

    #[test]
    fn rollback_restores_previous_record() {
        let mut m = machine(InstanceState::Creating);
        let result = m.transition_to(TransContext::new(InstanceState::Running)).unwrap();
        m.rollback(result.previous);
        assert_eq!(m.state(), InstanceState::Creating);
        assert_eq!(m.version(), 1);
    }

    #[test]
    fn abnormal_machine_rejects_everything() {
        let mut m = machine(InstanceState::Running);
        m.set_local_abnormal();
        assert!(matches!(
            m.transition_to(TransContext::new(InstanceState::Exiting)),
            Err(LifecycleError::Abnormal(_))
        ));
    }

    #[tokio::test]
    async fn callbacks_fire_on_concerned_state() {
        let mut m = machine(InstanceState::Creating);
        let mut rx = m.add_state_change_callback(
            &[InstanceState::Running, InstanceState::Fatal],
            "wait-ready",
        );
        m.transition_to(TransContext::new(InstanceState::Running)).unwrap();
        assert!(rx.try_recv().is_err());
        m.publish();
        let record = rx.await.unwrap();
        assert_eq!(record.state, InstanceState::Running);
    }

    #[tokio::test]
    async fn callback_fires_immediately_when_already_there() {
        let mut m = machine(InstanceState::Fatal);
        let rx = m.add_state_change_callback(&[InstanceState::Fatal], "late");
        assert_eq!(rx.await.unwrap().state, InstanceState::Fatal);
    }

    #[test]
    fn removed_callback_never_fires() {
        let mut m = machine(InstanceState::Creating);
        let mut rx = m.add_state_change_callback(&[InstanceState::Running], "k");
        m.remove_state_change_callback("k");
        m.transition_to(TransContext::new(InstanceState::Running)).unwrap();
        m.publish();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cancel_disables_recovery() {
        let m = machine(InstanceState::Running);
        assert!(m.is_runtime_recover_enabled());
        assert!(m.cancel("stop"));
        assert!(!m.cancel("again"));
        assert_eq!(m.cancel_reason().as_deref(), Some("stop"));
        assert!(!m.is_runtime_recover_enabled());
    }
}

use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::suspension::SuspensionState;
use crate::lifecycle::states::{LifecycleAction, LifecycleEvent, TransitionOutcome};

pub trait TransitionDefinition {
    fn initial_state(&self) -> SuspensionState;
    fn transition(
        &self,
        current: &SuspensionState,
        event: &LifecycleEvent,
    ) -> Result<TransitionOutcome, SuspensionTransitionError>;
}

/// Running -> Suspended -> Resumed -> Sent | Cancelled.
#[derive(Clone, Debug, Default)]
pub struct HumanApprovalFlow;

impl TransitionDefinition for HumanApprovalFlow {
    fn initial_state(&self) -> SuspensionState {
        SuspensionState::Running
    }

    fn transition(
        &self,
        current: &SuspensionState,
        event: &LifecycleEvent,
    ) -> Result<TransitionOutcome, SuspensionTransitionError> {
        transition_human_approval(current, event)
    }
}

pub struct SuspensionLifecycle<F> {
    flow: F,
}

impl<F> SuspensionLifecycle<F>
where
    F: TransitionDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn initial_state(&self) -> SuspensionState {
        self.flow.initial_state()
    }

    pub fn apply(
        &self,
        current: &SuspensionState,
        event: &LifecycleEvent,
    ) -> Result<TransitionOutcome, SuspensionTransitionError> {
        self.flow.transition(current, event)
    }

    pub fn apply_with_audit<S>(
        &self,
        current: &SuspensionState,
        event: &LifecycleEvent,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, SuspensionTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(current, event);
        match &result {
            Ok(outcome) => {
                sink.emit(
                    AuditEvent::new(
                        audit,
                        "suspension.transition_applied",
                        AuditCategory::Suspension,
                        AuditOutcome::Success,
                    )
                    .with_metadata("from", outcome.from.as_str())
                    .with_metadata("to", outcome.to.as_str())
                    .with_metadata("event", outcome.event.as_str()),
                );
            }
            Err(error) => {
                sink.emit(
                    AuditEvent::new(
                        audit,
                        "suspension.transition_rejected",
                        AuditCategory::Suspension,
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}

impl Default for SuspensionLifecycle<HumanApprovalFlow> {
    fn default() -> Self {
        Self::new(HumanApprovalFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SuspensionTransitionError {
    #[error("invalid suspension transition from {state:?} using event {event:?}")]
    InvalidTransition { state: SuspensionState, event: LifecycleEvent },
}

fn transition_human_approval(
    current: &SuspensionState,
    event: &LifecycleEvent,
) -> Result<TransitionOutcome, SuspensionTransitionError> {
    use LifecycleAction::{EmitDecisionRequest, ExecuteAction, PersistCheckpoint, RecordOutcome};
    use LifecycleEvent::{
        ActionExecuted, ActionRejected, DecisionSubmitted, ExecutionFailed, SensitiveActionReached,
    };
    use SuspensionState::{Cancelled, Resumed, Running, Sent, Suspended};

    let (to, actions) = match (current, event) {
        (Running, SensitiveActionReached) => (Suspended, vec![PersistCheckpoint, EmitDecisionRequest]),
        (Suspended, DecisionSubmitted) => (Resumed, vec![ExecuteAction]),
        (Resumed, ActionExecuted) => (Sent, vec![RecordOutcome]),
        (Resumed, ActionRejected) | (Resumed, ExecutionFailed) => (Cancelled, vec![RecordOutcome]),
        _ => {
            return Err(SuspensionTransitionError::InvalidTransition {
                state: *current,
                event: event.clone(),
            });
        }
    };

    Ok(TransitionOutcome { from: *current, to, event: event.clone(), actions })
}

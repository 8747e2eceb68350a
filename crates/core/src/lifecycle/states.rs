use serde::{Deserialize, Serialize};

use crate::domain::suspension::SuspensionState;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    SensitiveActionReached,
    DecisionSubmitted,
    ActionExecuted,
    ActionRejected,
    ExecutionFailed,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SensitiveActionReached => "sensitive_action_reached",
            Self::DecisionSubmitted => "decision_submitted",
            Self::ActionExecuted => "action_executed",
            Self::ActionRejected => "action_rejected",
            Self::ExecutionFailed => "execution_failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleAction {
    PersistCheckpoint,
    EmitDecisionRequest,
    ExecuteAction,
    RecordOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: SuspensionState,
    pub to: SuspensionState,
    pub event: LifecycleEvent,
    pub actions: Vec<LifecycleAction>,
}

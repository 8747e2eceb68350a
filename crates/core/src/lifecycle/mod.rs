pub mod engine;
pub mod states;

pub use engine::{
    HumanApprovalFlow, SuspensionLifecycle, SuspensionTransitionError, TransitionDefinition,
};
pub use states::{LifecycleAction, LifecycleEvent, TransitionOutcome};

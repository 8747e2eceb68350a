pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod lifecycle;

pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
pub use domain::message::{ConversationState, Message, MessageId, MessageRole, SessionId, UserId};
pub use domain::summary::{Provenance, RetrievedContext, Summary, SummaryId, SUMMARY_PREFIX};
pub use domain::suspension::{
    ActionEdits, DecisionKind, DecisionRequest, DecisionSubmission, EmailDraft, PendingDecision,
    SensitiveAction, SuspensionId, SuspensionRecord, SuspensionState,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use lifecycle::{LifecycleEvent, SuspensionLifecycle, SuspensionTransitionError};

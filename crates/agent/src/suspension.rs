use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use steward_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use steward_core::domain::message::{SessionId, UserId};
use steward_core::domain::suspension::{
    DecisionKind, DecisionRequest, PendingDecision, SensitiveAction, SuspensionId,
    SuspensionRecord, DEFAULT_REJECT_REASON,
};
use steward_core::errors::{ApplicationError, DomainError};
use steward_core::lifecycle::{HumanApprovalFlow, LifecycleEvent, SuspensionLifecycle};
use steward_db::repositories::{RepositoryError, SuspensionRepository};

const ACTOR: &str = "suspension-controller";
const OUTCOME_WRITE_ATTEMPTS: u32 = 3;

/// Performs the side effect of an approved action; returns a short outcome text.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &SensitiveAction) -> Result<String>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub record: SuspensionRecord,
    /// Text returned to the model as the result of the frozen tool call.
    pub message: String,
}

pub struct SuspensionController {
    repository: Arc<dyn SuspensionRepository>,
    executor: Arc<dyn ActionExecutor>,
    audit: Arc<dyn AuditSink>,
    lifecycle: SuspensionLifecycle<HumanApprovalFlow>,
}

impl SuspensionController {
    pub fn new(
        repository: Arc<dyn SuspensionRepository>,
        executor: Arc<dyn ActionExecutor>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { repository, executor, audit, lifecycle: SuspensionLifecycle::default() }
    }

    /// Freezes `action` before it runs and returns what the human is asked.
    pub async fn suspend(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        tool_call_id: &str,
        action: SensitiveAction,
        correlation_id: &str,
    ) -> Result<DecisionRequest, ApplicationError> {
        let audit = self.audit_context(session_id, Some(user_id), correlation_id);
        let outcome = self
            .lifecycle
            .apply_with_audit(
                &self.lifecycle.initial_state(),
                &LifecycleEvent::SensitiveActionReached,
                self.audit.as_ref(),
                &audit,
            )
            .map_err(|error| ApplicationError::from(DomainError::from(error)))?;

        let now = Utc::now();
        let record = SuspensionRecord {
            id: SuspensionId::generate(),
            session_id: session_id.clone(),
            user_id: user_id.clone(),
            tool_call_id: tool_call_id.to_string(),
            action,
            state: outcome.to,
            decision: None,
            outcome_message: None,
            state_version: 1,
            created_at: now,
            updated_at: now,
        };
        self.repository.insert(&record).await.map_err(persistence_error)?;

        info!(
            event_name = "agent.suspension.suspended",
            session_id = %session_id.0,
            suspension_id = %record.id.0,
            correlation_id,
            action_kind = record.action.kind(),
            "execution suspended pending human decision"
        );
        Ok(DecisionRequest::for_record(&record))
    }

    pub async fn open_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SuspensionRecord>, ApplicationError> {
        self.repository.find_open_for_session(session_id).await.map_err(persistence_error)
    }

    /// Applies `decision` to the suspended record owned by `user_id`. Only one
    /// caller can win the suspended -> resumed swap; everyone else gets
    /// `InvalidResumeTarget`.
    pub async fn resume(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        suspension_id: Option<&SuspensionId>,
        decision: PendingDecision,
        correlation_id: &str,
    ) -> Result<Resolution, ApplicationError> {
        let record = match suspension_id {
            Some(id) => self.repository.find_by_id(id).await,
            None => self.repository.find_open_for_session(session_id).await,
        }
        .map_err(persistence_error)?
        .filter(|record| &record.session_id == session_id && &record.user_id == user_id)
        .ok_or_else(|| invalid_target(session_id, "no suspension found for session"))?;

        let audit = self.audit_context(session_id, Some(user_id), correlation_id);
        let resumed = self
            .lifecycle
            .apply_with_audit(
                &record.state,
                &LifecycleEvent::DecisionSubmitted,
                self.audit.as_ref(),
                &audit,
            )
            .map_err(|_| {
                invalid_target(
                    session_id,
                    &format!("suspension `{}` is already {}", record.id.0, record.state.as_str()),
                )
            })?;

        let claimed = SuspensionRecord {
            state: resumed.to,
            decision: Some(decision.clone()),
            state_version: record.state_version + 1,
            updated_at: Utc::now(),
            ..record.clone()
        };
        let won = self
            .repository
            .compare_and_swap(&claimed, record.state_version)
            .await
            .map_err(persistence_error)?;
        if !won {
            return Err(invalid_target(
                session_id,
                &format!("suspension `{}` was resolved concurrently", record.id.0),
            ));
        }

        let (event, action, message) = match decision.kind {
            DecisionKind::Approve => {
                self.execute(session_id, &claimed, claimed.action.clone(), correlation_id).await
            }
            DecisionKind::Edit => {
                let edited = claimed.action.with_edits(&decision.edits);
                self.execute(session_id, &claimed, edited, correlation_id).await
            }
            DecisionKind::Reject => {
                let reason = decision.reason.as_deref().unwrap_or(DEFAULT_REJECT_REASON);
                (
                    LifecycleEvent::ActionRejected,
                    claimed.action.clone(),
                    format!("Email cancelled. Reason: {reason}"),
                )
            }
        };

        let finished = self
            .lifecycle
            .apply_with_audit(&claimed.state, &event, self.audit.as_ref(), &audit)
            .map_err(|error| ApplicationError::from(DomainError::from(error)))?;
        let resolved = SuspensionRecord {
            action,
            state: finished.to,
            outcome_message: Some(message.clone()),
            state_version: claimed.state_version + 1,
            updated_at: Utc::now(),
            ..claimed.clone()
        };
        let resolved = self.record_outcome(resolved, &audit).await;

        info!(
            event_name = "agent.suspension.resolved",
            session_id = %session_id.0,
            suspension_id = %resolved.id.0,
            correlation_id,
            decision = decision.kind.as_str(),
            state = resolved.state.as_str(),
            "suspension resolved"
        );
        Ok(Resolution { record: resolved, message })
    }

    async fn execute(
        &self,
        session_id: &SessionId,
        claimed: &SuspensionRecord,
        action: SensitiveAction,
        correlation_id: &str,
    ) -> (LifecycleEvent, SensitiveAction, String) {
        match self.executor.execute(&action).await {
            Ok(outcome) => (LifecycleEvent::ActionExecuted, action, outcome),
            Err(error) => {
                warn!(
                    event_name = "agent.suspension.execution_failed",
                    session_id = %session_id.0,
                    suspension_id = %claimed.id.0,
                    correlation_id,
                    error = %error,
                    "approved action failed to execute"
                );
                let message = format!("Email sending failed: {error}");
                (LifecycleEvent::ExecutionFailed, action, message)
            }
        }
    }

    /// Writes the final state after the side effect has happened.
    ///
    /// A failed or lost swap is retried against the stored version. When every
    /// attempt fails the record stays resumed: it no longer counts as open and
    /// cannot be resumed a second time.
    async fn record_outcome(
        &self,
        resolved: SuspensionRecord,
        audit: &AuditContext,
    ) -> SuspensionRecord {
        let mut expected_version = resolved.state_version.saturating_sub(1);
        for attempt in 1..=OUTCOME_WRITE_ATTEMPTS {
            let candidate =
                SuspensionRecord { state_version: expected_version + 1, ..resolved.clone() };
            let swapped = self.repository.compare_and_swap(&candidate, expected_version).await;
            let failure = match swapped {
                Ok(true) => return candidate,
                Ok(false) => "stored version moved".to_string(),
                Err(error) => error.to_string(),
            };
            warn!(
                event_name = "agent.suspension.outcome_write_failed",
                session_id = %resolved.session_id.0,
                suspension_id = %resolved.id.0,
                correlation_id = %audit.correlation_id,
                attempt,
                error = %failure,
                "could not record suspension outcome"
            );

            match self.repository.find_by_id(&resolved.id).await {
                Ok(Some(current)) if current.state.is_terminal() => return current,
                Ok(Some(current)) => expected_version = current.state_version,
                Ok(None) | Err(_) => {}
            }
        }

        self.audit.emit(
            AuditEvent::new(
                audit,
                "suspension.outcome_unrecorded",
                AuditCategory::Suspension,
                AuditOutcome::Failed,
            )
            .with_metadata("suspension_id", resolved.id.0.clone())
            .with_metadata("state", resolved.state.as_str()),
        );
        resolved
    }

    fn audit_context(
        &self,
        session_id: &SessionId,
        user_id: Option<&UserId>,
        correlation_id: &str,
    ) -> AuditContext {
        AuditContext::new(
            Some(session_id.clone()),
            user_id.map(|user| user.0.clone()),
            correlation_id,
            ACTOR,
        )
    }
}

fn persistence_error(error: RepositoryError) -> ApplicationError {
    ApplicationError::Persistence(error.to_string())
}

fn invalid_target(session_id: &SessionId, reason: &str) -> ApplicationError {
    ApplicationError::InvalidResumeTarget {
        session_id: session_id.0.clone(),
        reason: reason.to_string(),
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::message::{SessionId, UserId};

pub const DEFAULT_REJECT_REASON: &str = "cancelled by user";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SuspensionId(pub String);

impl SuspensionId {
    pub fn generate() -> Self {
        Self(format!("susp-{}", Uuid::new_v4()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailDraft {
    pub to: String,
    pub cc: Option<String>,
    pub subject: String,
    pub body: String,
    pub email_type: String,
    pub related_order_id: Option<i64>,
}

/// A side effect that needs a human decision before it runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensitiveAction {
    SendEmail(EmailDraft),
}

impl SensitiveAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendEmail(_) => "send_email",
        }
    }

    /// Overrides only the recognized fields; everything else stays as frozen.
    pub fn with_edits(&self, edits: &ActionEdits) -> Self {
        match self {
            Self::SendEmail(draft) => {
                let mut edited = draft.clone();
                if let Some(recipient) = &edits.recipient {
                    edited.to = recipient.clone();
                }
                if let Some(subject) = &edits.subject {
                    edited.subject = subject.clone();
                }
                if let Some(body) = &edits.body {
                    edited.body = body.clone();
                }
                Self::SendEmail(edited)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Approve,
    Reject,
    Edit,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Edit => "edit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            "edit" => Some(Self::Edit),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEdits {
    pub recipient: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDecision {
    pub kind: DecisionKind,
    pub reason: Option<String>,
    pub edits: ActionEdits,
}

/// What a human submits to resume a suspended action.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionSubmission {
    pub session_id: String,
    pub suspension_id: Option<String>,
    pub decision: String,
    pub reason: Option<String>,
    pub edited_recipient: Option<String>,
    pub edited_subject: Option<String>,
    pub edited_body: Option<String>,
}

impl DecisionSubmission {
    /// Unrecognized decision values resolve to a reject with the default reason.
    /// Edited fields are kept only for an edit; approve sends the draft as frozen.
    pub fn into_decision(self) -> PendingDecision {
        match DecisionKind::parse(&self.decision) {
            Some(DecisionKind::Edit) => PendingDecision {
                kind: DecisionKind::Edit,
                reason: self.reason,
                edits: ActionEdits {
                    recipient: self.edited_recipient,
                    subject: self.edited_subject,
                    body: self.edited_body,
                },
            },
            Some(kind) => PendingDecision { kind, reason: self.reason, edits: ActionEdits::default() },
            None => PendingDecision {
                kind: DecisionKind::Reject,
                reason: Some(self.reason.unwrap_or_else(|| DEFAULT_REJECT_REASON.to_string())),
                edits: ActionEdits::default(),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionState {
    Running,
    Suspended,
    Resumed,
    Sent,
    Cancelled,
}

impl SuspensionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Resumed => "resumed",
            Self::Sent => "sent",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "running" => Some(Self::Running),
            "suspended" => Some(Self::Suspended),
            "resumed" => Some(Self::Resumed),
            "sent" => Some(Self::Sent),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Cancelled)
    }
}

/// Durable record of one suspension point.
///
/// `tool_call_id` ties the record back to the model's pending tool call so the
/// conversation continues exactly where it stopped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspensionRecord {
    pub id: SuspensionId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub tool_call_id: String,
    pub action: SensitiveAction,
    pub state: SuspensionState,
    pub decision: Option<PendingDecision>,
    pub outcome_message: Option<String>,
    pub state_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionOption {
    pub action: DecisionKind,
    pub label: String,
}

/// Payload handed back to the caller when execution freezes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub suspension_id: SuspensionId,
    pub session_id: SessionId,
    pub interrupt_type: String,
    pub title: String,
    pub preview: SensitiveAction,
    pub available_actions: Vec<DecisionOption>,
}

impl DecisionRequest {
    pub fn for_record(record: &SuspensionRecord) -> Self {
        let (interrupt_type, title) = match &record.action {
            SensitiveAction::SendEmail(_) => ("email_confirmation", "Confirm email dispatch"),
        };
        Self {
            suspension_id: record.id.clone(),
            session_id: record.session_id.clone(),
            interrupt_type: interrupt_type.to_string(),
            title: title.to_string(),
            preview: record.action.clone(),
            available_actions: vec![
                DecisionOption { action: DecisionKind::Approve, label: "Send".to_string() },
                DecisionOption { action: DecisionKind::Reject, label: "Cancel".to_string() },
                DecisionOption { action: DecisionKind::Edit, label: "Edit and send".to_string() },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ActionEdits, DecisionKind, DecisionSubmission, EmailDraft, SensitiveAction,
        SuspensionState, DEFAULT_REJECT_REASON,
    };

    fn draft() -> EmailDraft {
        EmailDraft {
            to: "buyer@example.com".to_string(),
            cc: Some("ops@example.com".to_string()),
            subject: "Shipping delay".to_string(),
            body: "Your order ORD1 is delayed.".to_string(),
            email_type: "SHIPPING_DELAY".to_string(),
            related_order_id: Some(1),
        }
    }

    #[test]
    fn suspension_state_round_trips_from_storage_encoding() {
        for state in [
            SuspensionState::Running,
            SuspensionState::Suspended,
            SuspensionState::Resumed,
            SuspensionState::Sent,
            SuspensionState::Cancelled,
        ] {
            assert_eq!(SuspensionState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn edits_override_only_recognized_fields() {
        let action = SensitiveAction::SendEmail(draft());
        let edited = action.with_edits(&ActionEdits {
            recipient: Some("other@example.com".to_string()),
            subject: None,
            body: Some("Updated body".to_string()),
        });

        let SensitiveAction::SendEmail(edited) = edited;
        assert_eq!(edited.to, "other@example.com");
        assert_eq!(edited.subject, "Shipping delay");
        assert_eq!(edited.body, "Updated body");
        assert_eq!(edited.cc.as_deref(), Some("ops@example.com"));
        assert_eq!(edited.email_type, "SHIPPING_DELAY");
    }

    #[test]
    fn unrecognized_decision_becomes_reject_with_default_reason() {
        let decision = DecisionSubmission {
            session_id: "s-1".to_string(),
            decision: "maybe".to_string(),
            edited_subject: Some("ignored".to_string()),
            ..DecisionSubmission::default()
        }
        .into_decision();

        assert_eq!(decision.kind, DecisionKind::Reject);
        assert_eq!(decision.reason.as_deref(), Some(DEFAULT_REJECT_REASON));
        assert_eq!(decision.edits, ActionEdits::default());
    }

    #[test]
    fn edited_fields_survive_only_for_edit_decisions() {
        let submission = DecisionSubmission {
            session_id: "s-1".to_string(),
            decision: "approve".to_string(),
            edited_recipient: Some("other@example.com".to_string()),
            edited_body: Some("Changed body".to_string()),
            ..DecisionSubmission::default()
        };

        let approve = submission.clone().into_decision();
        assert_eq!(approve.kind, DecisionKind::Approve);
        assert_eq!(approve.edits, ActionEdits::default());

        let edit = DecisionSubmission { decision: "edit".to_string(), ..submission }.into_decision();
        assert_eq!(edit.kind, DecisionKind::Edit);
        assert_eq!(edit.edits.recipient.as_deref(), Some("other@example.com"));
        assert_eq!(edit.edits.body.as_deref(), Some("Changed body"));
    }

    #[test]
    fn decision_kind_parsing_is_case_insensitive() {
        assert_eq!(DecisionKind::parse(" Approve "), Some(DecisionKind::Approve));
        assert_eq!(DecisionKind::parse("EDIT"), Some(DecisionKind::Edit));
    }
}

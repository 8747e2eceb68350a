use serde_json::Value;

use steward_core::domain::suspension::{EmailDraft, SensitiveAction};

use crate::llm::ToolCall;

pub const SEND_EMAIL_TOOL: &str = "send_email_notification";
const DEFAULT_EMAIL_TYPE: &str = "GENERAL";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    RequireApproval(SensitiveAction),
    Deny { reason_code: &'static str, user_message: String },
}

/// Decides, per tool call, whether it may run, must wait for a human, or is refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardrailPolicy {
    pub email_actions_enabled: bool,
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        Self { email_actions_enabled: true }
    }
}

impl GuardrailPolicy {
    pub fn evaluate(&self, call: &ToolCall) -> GuardrailDecision {
        if call.name != SEND_EMAIL_TOOL {
            return GuardrailDecision::Allow;
        }
        if !self.email_actions_enabled {
            return GuardrailDecision::Deny {
                reason_code: "email_actions_disabled",
                user_message: "Sending email is currently disabled.".to_string(),
            };
        }
        match email_draft(&call.arguments) {
            Some(draft) => GuardrailDecision::RequireApproval(SensitiveAction::SendEmail(draft)),
            None => GuardrailDecision::Deny {
                reason_code: "email_arguments_invalid",
                user_message:
                    "The email request is missing a recipient, subject or body.".to_string(),
            },
        }
    }
}

fn email_draft(arguments: &Value) -> Option<EmailDraft> {
    let text = |key: &str| {
        arguments
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    Some(EmailDraft {
        to: text("to_email")?,
        cc: text("cc_email"),
        subject: text("subject")?,
        body: text("content")?,
        email_type: text("email_type").unwrap_or_else(|| DEFAULT_EMAIL_TYPE.to_string()),
        related_order_id: arguments.get("related_order_id").and_then(Value::as_i64),
    })
}

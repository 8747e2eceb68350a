use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::message::{Message, MessageId, MessageRole, SessionId, UserId};

pub const SUMMARY_PREFIX: &str = "[Conversation summary]";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SummaryId(pub String);

impl SummaryId {
    pub fn generate() -> Self {
        Self(format!("summary-{}", Uuid::new_v4()))
    }
}

/// A generated digest standing in for the messages `range_start..=range_end`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub id: SummaryId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub range_start: MessageId,
    pub range_end: MessageId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Summary {
    pub fn as_message(&self) -> Message {
        Message {
            id: MessageId(self.id.0.clone()),
            role: MessageRole::Summary,
            content: format!("{SUMMARY_PREFIX}\n{}", self.content),
            payload: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    CurrentSession,
    CrossSession,
}

impl Provenance {
    pub fn label(&self) -> &'static str {
        match self {
            Self::CurrentSession => "current session",
            Self::CrossSession => "earlier session",
        }
    }
}

/// A prior summary surfaced for one turn. Never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    pub text: String,
    pub session_id: Option<SessionId>,
    pub score: f64,
    pub provenance: Provenance,
}

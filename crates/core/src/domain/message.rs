use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", Uuid::new_v4()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    Summary,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::Summary => "summary",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" | "human" => Some(Self::User),
            "assistant" | "ai" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            "summary" => Some(Self::Summary),
            _ => None,
        }
    }
}

/// One entry of a session's conversation.
///
/// `payload` carries structured data next to the text: tool calls on assistant
/// messages and the `tool_call_id` on tool results.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    pub payload: Option<Value>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(role.as_str()),
            role,
            content: content.into(),
            payload: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn tool_result(tool_call_id: &str, content: impl Into<String>) -> Self {
        Self::new(MessageRole::Tool, content)
            .with_payload(serde_json::json!({ "tool_call_id": tool_call_id }))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = MessageId(id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn is_tool_result(&self) -> bool {
        self.role == MessageRole::Tool
    }

    /// Messages the turn store keeps; summary messages live in their own table.
    pub fn is_persistable(&self) -> bool {
        self.role != MessageRole::Summary
    }
}

/// The live message buffer of one session, owned by the turn holding its lock.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConversationState {
    messages: Vec<Message>,
}

impl ConversationState {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Swaps the whole buffer in one step.
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::User)
            .map(|message| message.content.as_str())
    }
}

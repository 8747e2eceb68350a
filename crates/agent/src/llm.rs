use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use steward_core::domain::message::{Message, SessionId};

/// Plain text completion; used for conversation summaries.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// The end-user model: ordered messages plus instructions in, text and/or tool calls out.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
}

impl ModelRequest {
    pub fn new(system_prompt: impl Into<String>, messages: Vec<Message>) -> Self {
        Self { system_prompt: system_prompt.into(), messages }
    }

    /// Same request with `directive` appended to the system instructions.
    pub fn with_directive(&self, directive: &str) -> Self {
        Self {
            system_prompt: format!("{}\n\n{}", self.system_prompt, directive),
            messages: self.messages.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Self::default() }
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    /// Text the quality rules can score; `None` for a pure tool call.
    pub fn extractable_text(&self) -> Option<&str> {
        if self.text.trim().is_empty() && !self.tool_calls.is_empty() {
            None
        } else {
            Some(self.text.as_str())
        }
    }

    pub fn to_message(&self) -> Message {
        let message = Message::assistant(self.text.clone());
        if self.tool_calls.is_empty() {
            message
        } else {
            message.with_payload(serde_json::json!({ "tool_calls": self.tool_calls }))
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cached_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl TokenUsage {
    /// Input cost relative to an uncached request: creation bills at 125%, hits at 10%.
    pub fn cost_ratio(&self) -> Option<f64> {
        if self.prompt_tokens == 0 {
            return None;
        }
        let prompt = self.prompt_tokens as f64;
        let cached = self.cached_tokens as f64;
        let creation = self.cache_creation_tokens as f64;
        let uncached = (prompt - cached - creation).max(0.0);
        Some((uncached + creation * 1.25 + cached * 0.1) / prompt)
    }

    pub fn cache_hit_ratio(&self) -> Option<f64> {
        (self.prompt_tokens > 0).then(|| self.cached_tokens as f64 / self.prompt_tokens as f64)
    }

    pub fn log(&self, session_id: &SessionId, correlation_id: &str) {
        let Some(cost_ratio) = self.cost_ratio() else {
            return;
        };
        info!(
            event_name = "agent.model.token_usage",
            session_id = %session_id.0,
            correlation_id,
            prompt_tokens = self.prompt_tokens,
            completion_tokens = self.completion_tokens,
            cached_tokens = self.cached_tokens,
            cache_creation_tokens = self.cache_creation_tokens,
            cache_hit_ratio = self.cache_hit_ratio().unwrap_or(0.0),
            cost_ratio,
            "model token usage"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{ModelRequest, ModelResponse, TokenUsage, ToolCall};
    use steward_core::domain::message::Message;

    #[test]
    fn cost_ratio_weights_cache_creation_and_hits() {
        let usage = TokenUsage {
            prompt_tokens: 1000,
            completion_tokens: 50,
            cached_tokens: 500,
            cache_creation_tokens: 200,
        };

        let ratio = usage.cost_ratio().expect("ratio");
        assert!((ratio - (300.0 + 250.0 + 50.0) / 1000.0).abs() < 1e-9);
        assert_eq!(usage.cache_hit_ratio(), Some(0.5));
        assert_eq!(TokenUsage::default().cost_ratio(), None);
    }

    #[test]
    fn pure_tool_call_has_no_extractable_text() {
        let response = ModelResponse::default().with_tool_call(ToolCall {
            id: "call-1".to_string(),
            name: "query_order_status".to_string(),
            arguments: serde_json::json!({ "order_no": "ORD1" }),
        });

        assert_eq!(response.extractable_text(), None);
        let message = response.to_message();
        assert!(message.payload.is_some());
        assert_eq!(ModelResponse::default().extractable_text(), Some(""));
    }

    #[test]
    fn directive_is_appended_without_touching_messages() {
        let request = ModelRequest::new("base", vec![Message::user("hi")]);
        let retried = request.with_directive("be concise");

        assert_eq!(retried.system_prompt, "base\n\nbe concise");
        assert_eq!(retried.messages, request.messages);
    }
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use steward_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use steward_core::config::AppConfig;
use steward_core::domain::message::{ConversationState, Message, SessionId, UserId};
use steward_core::domain::summary::RetrievedContext;
use steward_core::domain::suspension::{
    DecisionRequest, DecisionSubmission, SuspensionId, SuspensionState,
};
use steward_core::errors::ApplicationError;
use steward_db::repositories::{SuspensionRepository, TurnStore};

use crate::context::ContextWindowManager;
use crate::guardrails::{GuardrailDecision, GuardrailPolicy};
use crate::llm::{ChatModel, LlmClient, ModelRequest, ModelResponse, TokenUsage, ToolCall};
use crate::prompts::PromptRenderer;
use crate::quality::QualityGuard;
use crate::registry::SessionRegistry;
use crate::retrieval::RelevanceIndex;
use crate::suspension::{ActionExecutor, SuspensionController};
use crate::tokens::{CharRatioEstimator, TokenEstimator};
use crate::tools::ToolRegistry;

const ACTOR: &str = "agent-runtime";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are the customer service assistant of an online \
store. Answer order, shipping and after-sales questions using the available tools. Never \
disclose phone numbers, card numbers or other private data.";

/// External services the runtime talks to.
pub struct Collaborators {
    pub model: Arc<dyn ChatModel>,
    pub summarizer: Arc<dyn LlmClient>,
    pub index: Arc<dyn RelevanceIndex>,
    pub executor: Arc<dyn ActionExecutor>,
    pub tools: ToolRegistry,
    pub audit: Arc<dyn AuditSink>,
    /// Falls back to the character-ratio estimator from `memory.chars_per_token`.
    pub estimator: Option<Arc<dyn TokenEstimator>>,
}

#[derive(Debug, Error)]
pub enum RuntimeInitError {
    #[error("invalid quality pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("invalid prompt template: {0}")]
    Template(#[from] tera::Error),
}

#[derive(Clone, Debug, PartialEq)]
pub enum TurnOutcome {
    Reply { text: String, usage: Option<TokenUsage> },
    AwaitingDecision(DecisionRequest),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResumeOutcome {
    pub suspension_id: SuspensionId,
    pub state: SuspensionState,
    pub message: String,
}

/// Turn pipeline: recovery, retrieval, compaction check, model call under the
/// quality gate, tool execution or suspension, persistence.
pub struct AgentRuntime {
    registry: SessionRegistry,
    context: ContextWindowManager,
    quality: QualityGuard,
    suspensions: SuspensionController,
    store: Arc<dyn TurnStore>,
    model: Arc<dyn ChatModel>,
    tools: ToolRegistry,
    guardrails: GuardrailPolicy,
    audit: Arc<dyn AuditSink>,
    prompts: Arc<PromptRenderer>,
    system_prompt: String,
    model_timeout: Duration,
    model_retries: u32,
    max_tool_rounds: u32,
}

impl AgentRuntime {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn TurnStore>,
        suspension_repository: Arc<dyn SuspensionRepository>,
        collaborators: Collaborators,
    ) -> Result<Self, RuntimeInitError> {
        let Collaborators { model, summarizer, index, executor, tools, audit, estimator } =
            collaborators;
        let prompts = Arc::new(PromptRenderer::new()?);
        let estimator: Arc<dyn TokenEstimator> = match estimator {
            Some(estimator) => estimator,
            None => Arc::new(CharRatioEstimator::new(config.memory.chars_per_token)),
        };
        let model_timeout = Duration::from_secs(config.llm.timeout_secs);

        Ok(Self {
            registry: SessionRegistry::default(),
            context: ContextWindowManager::new(
                Arc::clone(&store),
                index,
                summarizer,
                estimator,
                Arc::clone(&prompts),
                config.memory.clone(),
                model_timeout,
            ),
            quality: QualityGuard::new(config.quality.clone(), Arc::clone(&prompts))?,
            suspensions: SuspensionController::new(
                suspension_repository,
                executor,
                Arc::clone(&audit),
            ),
            store,
            model,
            tools,
            guardrails: GuardrailPolicy::default(),
            audit,
            prompts,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            model_timeout,
            model_retries: config.llm.max_retries,
            max_tool_rounds: config.session.max_tool_rounds,
        })
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn with_guardrails(mut self, guardrails: GuardrailPolicy) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub async fn handle_turn(
        &self,
        user_id: &UserId,
        session_id: &SessionId,
        text: &str,
    ) -> Result<TurnOutcome, ApplicationError> {
        let correlation_id = Uuid::new_v4().to_string();
        let handle = self.registry.acquire(user_id, session_id);
        let mut live = handle.lock().await;

        if let Some(open) = self.suspensions.open_for_session(session_id).await? {
            return Err(ApplicationError::SessionAwaitingDecision {
                session_id: session_id.0.clone(),
                suspension_id: open.id.0,
            });
        }

        // Work on a copy; the live buffer only changes once the turn settles.
        let mut state = live.clone();
        let inbound = Message::user(text);
        state.push(inbound.clone());
        let mut pending = vec![inbound];

        self.context.recover(session_id, &mut state).await;
        let retrieved = self.context.retrieve(session_id, text).await;
        let instructions = self.instructions(session_id, &retrieved);

        for round in 0..=self.max_tool_rounds {
            let durable_len = state.len() - pending.len();
            if let Some(outcome) =
                self.context.maybe_compact(session_id, user_id, &mut state, durable_len).await
            {
                self.audit.emit(
                    AuditEvent::new(
                        &self.audit_context(session_id, user_id, &correlation_id),
                        "memory.compacted",
                        AuditCategory::Memory,
                        AuditOutcome::Success,
                    )
                    .with_metadata("summary_id", outcome.summary.id.0.clone())
                    .with_metadata("range_start", outcome.summary.range_start.0.clone())
                    .with_metadata("range_end", outcome.summary.range_end.0.clone()),
                );
            }

            let request = ModelRequest::new(instructions.clone(), state.messages().to_vec());
            let guarded = self
                .quality
                .run(session_id, request, |request| self.call_model(request))
                .await
                .map_err(|error| ApplicationError::Model(error.to_string()))?;
            if !guarded.accepted {
                let score = guarded.verdict.as_ref().map_or(0.0, |verdict| verdict.score);
                self.audit.emit(
                    AuditEvent::new(
                        &self.audit_context(session_id, user_id, &correlation_id),
                        "quality.fallback_returned",
                        AuditCategory::Quality,
                        AuditOutcome::Failed,
                    )
                    .with_metadata("attempts", guarded.attempts.to_string())
                    .with_metadata("score", format!("{score:.2}")),
                );
            }

            let response = guarded.response;
            if let Some(usage) = &response.usage {
                usage.log(session_id, &correlation_id);
            }

            if response.tool_calls.is_empty() {
                if !response.text.trim().is_empty() {
                    let reply = response.to_message();
                    state.push(reply.clone());
                    pending.push(reply);
                }
                *live = state;
                self.persist(session_id, user_id, &pending, &correlation_id).await;
                info!(
                    event_name = "agent.turn.completed",
                    session_id = %session_id.0,
                    correlation_id = %correlation_id,
                    tool_rounds = round,
                    "turn completed"
                );
                return Ok(TurnOutcome::Reply { text: response.text, usage: response.usage });
            }

            if round == self.max_tool_rounds {
                break;
            }

            let call_message = response.to_message();
            state.push(call_message.clone());
            pending.push(call_message);

            let decision_request = self
                .run_tool_calls(
                    session_id,
                    user_id,
                    &response.tool_calls,
                    &correlation_id,
                    &mut state,
                    &mut pending,
                )
                .await?;
            if let Some(decision_request) = decision_request {
                *live = state;
                self.persist(session_id, user_id, &pending, &correlation_id).await;
                return Ok(TurnOutcome::AwaitingDecision(decision_request));
            }
        }

        warn!(
            event_name = "agent.turn.tool_rounds_exhausted",
            session_id = %session_id.0,
            correlation_id = %correlation_id,
            max_tool_rounds = self.max_tool_rounds,
            "model kept requesting tools; turn abandoned"
        );
        Err(ApplicationError::Model(format!(
            "model requested tools beyond {} rounds",
            self.max_tool_rounds
        )))
    }

    /// Runs every call of one assistant message. The first sensitive call
    /// suspends the turn; the rest still get their results so the transcript
    /// stays well-formed.
    async fn run_tool_calls(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        calls: &[ToolCall],
        correlation_id: &str,
        state: &mut ConversationState,
        pending: &mut Vec<Message>,
    ) -> Result<Option<DecisionRequest>, ApplicationError> {
        let mut decision_request = None;
        for call in calls {
            let content = match self.guardrails.evaluate(call) {
                GuardrailDecision::Allow => match self.tools.execute(call).await {
                    Ok(output) => output.to_string(),
                    Err(error) => {
                        warn!(
                            event_name = "agent.tool.failed",
                            session_id = %session_id.0,
                            correlation_id,
                            tool = %call.name,
                            error = %error,
                            "tool call failed"
                        );
                        serde_json::json!({ "error": error.to_string() }).to_string()
                    }
                },
                GuardrailDecision::RequireApproval(action) if decision_request.is_none() => {
                    decision_request = Some(
                        self.suspensions
                            .suspend(session_id, user_id, &call.id, action, correlation_id)
                            .await?,
                    );
                    continue;
                }
                GuardrailDecision::RequireApproval(_) => serde_json::json!({
                    "error": "only one action needing approval can run per reply"
                })
                .to_string(),
                GuardrailDecision::Deny { reason_code, user_message } => {
                    serde_json::json!({ "error": user_message, "reason_code": reason_code })
                        .to_string()
                }
            };
            let result = Message::tool_result(&call.id, content);
            state.push(result.clone());
            pending.push(result);
        }
        Ok(decision_request)
    }

    /// Applies a human decision to the session's open suspension and records
    /// the outcome as the frozen tool call's result.
    pub async fn resume(
        &self,
        user_id: &UserId,
        submission: DecisionSubmission,
    ) -> Result<ResumeOutcome, ApplicationError> {
        let correlation_id = Uuid::new_v4().to_string();
        let session_id = SessionId(submission.session_id.clone());
        let suspension_id = submission.suspension_id.clone().map(SuspensionId);
        let decision = submission.into_decision();

        let handle = self.registry.acquire(user_id, &session_id);
        let mut live = handle.lock().await;

        let resolution = self
            .suspensions
            .resume(&session_id, user_id, suspension_id.as_ref(), decision, &correlation_id)
            .await?;

        let mut state = live.clone();
        self.context.recover(&session_id, &mut state).await;
        let pending = vec![
            Message::tool_result(&resolution.record.tool_call_id, resolution.message.clone()),
            Message::assistant(resolution.message.clone()),
        ];
        for message in &pending {
            state.push(message.clone());
        }
        *live = state;
        self.persist(&session_id, user_id, &pending, &correlation_id).await;

        Ok(ResumeOutcome {
            suspension_id: resolution.record.id,
            state: resolution.record.state,
            message: resolution.message,
        })
    }

    /// One logical model call: retried up to `llm.max_retries` times on error
    /// or timeout before the last failure is returned.
    async fn call_model(&self, request: ModelRequest) -> anyhow::Result<ModelResponse> {
        let mut attempt = 0;
        loop {
            let error =
                match tokio::time::timeout(self.model_timeout, self.model.generate(&request)).await {
                    Ok(Ok(response)) => return Ok(response),
                    Ok(Err(error)) => error,
                    Err(_) => {
                        anyhow!("model call timed out after {}s", self.model_timeout.as_secs())
                    }
                };
            if attempt >= self.model_retries {
                return Err(error);
            }
            attempt += 1;
            warn!(
                event_name = "agent.model.call_retried",
                attempt,
                max_retries = self.model_retries,
                error = %error,
                "model call failed; retrying"
            );
        }
    }

    fn instructions(&self, session_id: &SessionId, retrieved: &[RetrievedContext]) -> String {
        match self.prompts.retrieved_context(retrieved) {
            Ok(section) if section.is_empty() => self.system_prompt.clone(),
            Ok(section) => format!("{}\n\n{}", self.system_prompt, section),
            Err(error) => {
                warn!(
                    event_name = "agent.memory.context_render_failed",
                    session_id = %session_id.0,
                    error = %error,
                    "could not render retrieved context"
                );
                self.system_prompt.clone()
            }
        }
    }

    /// Appends the turn's new messages in order, stopping at the first failure.
    async fn persist(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        messages: &[Message],
        correlation_id: &str,
    ) {
        for message in messages {
            if let Err(error) = self.store.append_message(session_id, user_id, message).await {
                warn!(
                    event_name = "agent.persistence.append_failed",
                    session_id = %session_id.0,
                    correlation_id,
                    message_id = %message.id.0,
                    error = %error,
                    "failed to persist message"
                );
                self.audit.emit(
                    AuditEvent::new(
                        &self.audit_context(session_id, user_id, correlation_id),
                        "persistence.message_append_failed",
                        AuditCategory::Persistence,
                        AuditOutcome::Failed,
                    )
                    .with_metadata("message_id", message.id.0.clone())
                    .with_metadata("error", error.to_string()),
                );
                return;
            }
        }
    }

    fn audit_context(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        correlation_id: &str,
    ) -> AuditContext {
        AuditContext::new(Some(session_id.clone()), Some(user_id.0.clone()), correlation_id, ACTOR)
    }
}

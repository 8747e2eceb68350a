use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use steward_core::config::MemoryConfig;
use steward_core::domain::message::{ConversationState, Message, SessionId, UserId};
use steward_core::domain::summary::{RetrievedContext, Summary, SummaryId};
use steward_db::repositories::TurnStore;

use crate::llm::LlmClient;
use crate::prompts::PromptRenderer;
use crate::retrieval::{merge_hits, RelevanceIndex};
use crate::tokens::TokenEstimator;

/// Result of one successful compaction.
///
/// `persistence` completes once the summary is stored and indexed; the turn
/// never waits on it.
pub struct CompactionOutcome {
    pub summary: Summary,
    pub persistence: JoinHandle<()>,
}

/// Keeps a session's live buffer bounded: replays persisted history into a
/// fresh buffer, surfaces relevant past summaries, and folds old messages
/// into a generated summary once the buffer grows past its thresholds.
///
/// Every stage degrades to "do nothing" when a collaborator fails.
pub struct ContextWindowManager {
    store: Arc<dyn TurnStore>,
    index: Arc<dyn RelevanceIndex>,
    summarizer: Arc<dyn LlmClient>,
    estimator: Arc<dyn TokenEstimator>,
    prompts: Arc<PromptRenderer>,
    config: MemoryConfig,
    summary_timeout: Duration,
}

impl ContextWindowManager {
    pub fn new(
        store: Arc<dyn TurnStore>,
        index: Arc<dyn RelevanceIndex>,
        summarizer: Arc<dyn LlmClient>,
        estimator: Arc<dyn TokenEstimator>,
        prompts: Arc<PromptRenderer>,
        config: MemoryConfig,
        summary_timeout: Duration,
    ) -> Self {
        Self { store, index, summarizer, estimator, prompts, config, summary_timeout }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Seeds a buffer that holds at most the just-arrived message.
    ///
    /// With a stored summary the seed is the summary plus everything persisted
    /// after its covered range; otherwise the last `messages_to_keep`
    /// messages. The arrived message stays last. Returns whether the buffer
    /// was replaced.
    pub async fn recover(&self, session_id: &SessionId, state: &mut ConversationState) -> bool {
        if !self.config.recovery_enabled || state.len() > 1 {
            return false;
        }

        let seeded = match self.load_history(session_id).await {
            Ok(seeded) => seeded,
            Err(error) => {
                warn!(
                    event_name = "agent.memory.recovery_failed",
                    session_id = %session_id.0,
                    error = %error,
                    "history recovery failed; continuing with current buffer"
                );
                return false;
            }
        };
        if seeded.is_empty() {
            return false;
        }

        let seeded_count = seeded.len();
        let mut messages = seeded;
        messages.extend(state.messages().iter().cloned());
        state.replace(messages);
        info!(
            event_name = "agent.memory.recovered",
            session_id = %session_id.0,
            seeded_count,
            "recovered persisted history"
        );
        true
    }

    async fn load_history(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<Message>, steward_db::repositories::RepositoryError> {
        let Some(summary) = self.store.latest_summary(session_id).await? else {
            return self.recent_window(session_id).await;
        };

        let mut seeded = vec![summary.as_message()];
        let after = self.store.messages_after(session_id, &summary.range_end).await?;
        if !after.is_empty() {
            seeded.extend(after);
            return Ok(seeded);
        }

        // Nothing after `range_end` either means the summary covers the whole
        // log or `range_end` never reached the store.
        let recent = self.recent_window(session_id).await?;
        if !recent.iter().any(|message| message.id == summary.range_end) {
            warn!(
                event_name = "agent.memory.summary_anchor_missing",
                session_id = %session_id.0,
                summary_id = %summary.id.0,
                range_end = %summary.range_end.0,
                "summary range end is not persisted; seeding the recent window after it"
            );
            seeded.extend(recent);
        }
        Ok(seeded)
    }

    async fn recent_window(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<Message>, steward_db::repositories::RepositoryError> {
        let mut recent =
            self.store.recent_messages(session_id, self.config.messages_to_keep).await?;
        // A window cut between a tool call and its result would start with an orphan.
        let orphans = recent.iter().take_while(|message| message.is_tool_result()).count();
        recent.drain(..orphans);
        Ok(recent)
    }

    /// Past summaries relevant to `query`, from this session and others.
    pub async fn retrieve(&self, session_id: &SessionId, query: &str) -> Vec<RetrievedContext> {
        let query = query.trim();
        if !self.config.retrieval_enabled || query.chars().count() < self.config.min_query_chars {
            return Vec::new();
        }

        let top_k = self.config.max_retrieved;
        let timeout = Duration::from_secs(self.config.retrieval_timeout_secs);
        let searches = async {
            tokio::join!(
                self.index.search(query, Some(session_id), top_k),
                self.index.search(query, None, top_k),
            )
        };

        match tokio::time::timeout(timeout, searches).await {
            Ok((Ok(scoped), Ok(unscoped))) => {
                let merged = merge_hits(
                    session_id,
                    scoped,
                    unscoped,
                    self.config.min_retrieval_score,
                    self.config.max_retrieved,
                );
                debug!(
                    event_name = "agent.memory.retrieved",
                    session_id = %session_id.0,
                    result_count = merged.len(),
                    "retrieved relevant summaries"
                );
                merged
            }
            Ok((scoped, unscoped)) => {
                let error = scoped.err().or(unscoped.err()).map(|error| error.to_string());
                warn!(
                    event_name = "agent.memory.retrieval_failed",
                    session_id = %session_id.0,
                    error = error.as_deref().unwrap_or("unknown"),
                    "relevance search failed; continuing without retrieved context"
                );
                Vec::new()
            }
            Err(_) => {
                warn!(
                    event_name = "agent.memory.retrieval_timeout",
                    session_id = %session_id.0,
                    timeout_secs = self.config.retrieval_timeout_secs,
                    "relevance search timed out; continuing without retrieved context"
                );
                Vec::new()
            }
        }
    }

    pub fn should_compact(&self, messages: &[Message]) -> bool {
        messages.len() >= self.config.max_messages_trigger
            || self.estimator.estimate(messages) >= self.config.max_tokens_trigger
    }

    /// Compacts when enabled and a threshold is crossed.
    ///
    /// Only the first `durable_len` messages of the buffer may be folded into
    /// the summary; later ones have not reached the turn store yet.
    pub async fn maybe_compact(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        state: &mut ConversationState,
        durable_len: usize,
    ) -> Option<CompactionOutcome> {
        if !self.config.summarization_enabled || !self.should_compact(state.messages()) {
            return None;
        }
        self.compact(session_id, user_id, state, durable_len).await
    }

    pub async fn compact(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        state: &mut ConversationState,
        durable_len: usize,
    ) -> Option<CompactionOutcome> {
        let messages = state.messages();
        let split = split_point(messages, self.config.messages_to_keep, durable_len);
        if split == 0 {
            return None;
        }
        let (prefix, kept) = messages.split_at(split);

        let mut covered = prefix.iter().filter(|message| message.is_persistable());
        let range_start = covered.next()?.id.clone();
        let range_end =
            covered.last().map_or_else(|| range_start.clone(), |message| message.id.clone());

        let content = self.summarize(session_id, prefix).await?;
        let summary = Summary {
            id: SummaryId::generate(),
            session_id: session_id.clone(),
            user_id: user_id.clone(),
            range_start,
            range_end,
            content,
            created_at: Utc::now(),
        };

        let mut compacted = Vec::with_capacity(kept.len() + 1);
        compacted.push(summary.as_message());
        compacted.extend(kept.iter().cloned());
        let compacted_count = prefix.len();
        state.replace(compacted);

        info!(
            event_name = "agent.memory.compacted",
            session_id = %session_id.0,
            summary_id = %summary.id.0,
            range_start = %summary.range_start.0,
            range_end = %summary.range_end.0,
            compacted_count,
            kept_count = state.len() - 1,
            "compacted conversation buffer"
        );

        let persistence = self.spawn_persistence(summary.clone());
        Some(CompactionOutcome { summary, persistence })
    }

    async fn summarize(&self, session_id: &SessionId, prefix: &[Message]) -> Option<String> {
        let prompt = match self.prompts.summary_prompt(prefix) {
            Ok(prompt) => prompt,
            Err(error) => {
                warn!(
                    event_name = "agent.memory.summary_failed",
                    session_id = %session_id.0,
                    error = %error,
                    "could not render summary prompt; skipping compaction"
                );
                return None;
            }
        };

        let outcome =
            tokio::time::timeout(self.summary_timeout, self.summarizer.complete(&prompt)).await;
        let failure = match outcome {
            Ok(Ok(text)) if !text.trim().is_empty() => return Some(text.trim().to_string()),
            Ok(Ok(_)) => "summary model returned empty text".to_string(),
            Ok(Err(error)) => error.to_string(),
            Err(_) => "summary model timed out".to_string(),
        };
        warn!(
            event_name = "agent.memory.summary_failed",
            session_id = %session_id.0,
            error = %failure,
            "summarization failed; skipping compaction"
        );
        None
    }

    fn spawn_persistence(&self, summary: Summary) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let index = Arc::clone(&self.index);
        tokio::spawn(async move {
            if let Err(error) = store.append_summary(&summary).await {
                warn!(
                    event_name = "agent.memory.summary_persist_failed",
                    session_id = %summary.session_id.0,
                    summary_id = %summary.id.0,
                    error = %error,
                    "failed to persist summary"
                );
                return;
            }
            if let Err(error) = index.index_summary(&summary).await {
                warn!(
                    event_name = "agent.memory.summary_index_failed",
                    session_id = %summary.session_id.0,
                    summary_id = %summary.id.0,
                    error = %error,
                    "summary persisted but not indexed"
                );
            }
        })
    }
}

/// Index of the first kept message.
///
/// Keeps the trailing `keep` messages, never folds messages at or past
/// `durable_len`, and moves the split back so a tool result is never the
/// oldest kept message while its call sits in the prefix.
pub fn split_point(messages: &[Message], keep: usize, durable_len: usize) -> usize {
    let mut split = messages.len().saturating_sub(keep).min(durable_len);
    while split > 0 && messages.get(split).is_some_and(Message::is_tool_result) {
        split -= 1;
    }
    split
}

use std::collections::HashMap;

use tokio::sync::RwLock;

use steward_core::domain::message::{Message, MessageId, SessionId, UserId};
use steward_core::domain::summary::Summary;
use steward_core::domain::suspension::{SuspensionId, SuspensionRecord, SuspensionState};

use super::{reject_summary_message, RepositoryError, SuspensionRepository, TurnStore};

#[derive(Default)]
pub struct InMemoryTurnStore {
    messages: RwLock<HashMap<String, Vec<Message>>>,
    summaries: RwLock<HashMap<String, Vec<Summary>>>,
}

impl InMemoryTurnStore {
    /// All persisted messages of a session, oldest first.
    pub async fn messages(&self, session_id: &SessionId) -> Vec<Message> {
        let messages = self.messages.read().await;
        messages.get(&session_id.0).cloned().unwrap_or_default()
    }

    pub async fn summaries(&self, session_id: &SessionId) -> Vec<Summary> {
        let summaries = self.summaries.read().await;
        summaries.get(&session_id.0).cloned().unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl TurnStore for InMemoryTurnStore {
    async fn append_message(
        &self,
        session_id: &SessionId,
        _user_id: &UserId,
        message: &Message,
    ) -> Result<(), RepositoryError> {
        reject_summary_message(message)?;
        let mut messages = self.messages.write().await;
        messages.entry(session_id.0.clone()).or_default().push(message.clone());
        Ok(())
    }

    async fn append_summary(&self, summary: &Summary) -> Result<(), RepositoryError> {
        let mut summaries = self.summaries.write().await;
        summaries.entry(summary.session_id.0.clone()).or_default().push(summary.clone());
        Ok(())
    }

    async fn latest_summary(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<Summary>, RepositoryError> {
        let summaries = self.summaries.read().await;
        Ok(summaries.get(&session_id.0).and_then(|entries| entries.last().cloned()))
    }

    async fn messages_after(
        &self,
        session_id: &SessionId,
        after: &MessageId,
    ) -> Result<Vec<Message>, RepositoryError> {
        let messages = self.messages.read().await;
        let Some(entries) = messages.get(&session_id.0) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .iter()
            .position(|message| &message.id == after)
            .map(|index| entries[index + 1..].to_vec())
            .unwrap_or_default())
    }

    async fn recent_messages(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        let messages = self.messages.read().await;
        let Some(entries) = messages.get(&session_id.0) else {
            return Ok(Vec::new());
        };
        let start = entries.len().saturating_sub(limit);
        Ok(entries[start..].to_vec())
    }
}

#[derive(Default)]
pub struct InMemorySuspensionRepository {
    records: RwLock<HashMap<String, SuspensionRecord>>,
}

#[async_trait::async_trait]
impl SuspensionRepository for InMemorySuspensionRepository {
    async fn insert(&self, record: &SuspensionRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id.0) {
            return Err(RepositoryError::Rejected(format!(
                "suspension `{}` already exists",
                record.id.0
            )));
        }
        records.insert(record.id.0.clone(), record.clone());
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &SuspensionId,
    ) -> Result<Option<SuspensionRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.get(&id.0).cloned())
    }

    async fn find_open_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SuspensionRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|record| {
                &record.session_id == session_id && record.state == SuspensionState::Suspended
            })
            .max_by_key(|record| record.created_at)
            .cloned())
    }

    async fn compare_and_swap(
        &self,
        record: &SuspensionRecord,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.id.0) {
            Some(stored) if stored.state_version == expected_version => {
                *stored = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

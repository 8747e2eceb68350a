use async_trait::async_trait;
use thiserror::Error;

use steward_core::domain::message::{Message, MessageId, SessionId, UserId};
use steward_core::domain::summary::Summary;
use steward_core::domain::suspension::{SuspensionId, SuspensionRecord};

pub mod memory;
pub mod suspension;
pub mod turn_store;

pub use memory::{InMemorySuspensionRepository, InMemoryTurnStore};
pub use suspension::SqlSuspensionRepository;
pub use turn_store::SqlTurnStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("rejected write: {0}")]
    Rejected(String),
}

/// Durable, ordered log of a session's messages and summaries.
///
/// Message order is arrival order. Summary messages are never appended here;
/// summaries go through `append_summary`.
#[async_trait]
pub trait TurnStore: Send + Sync {
    async fn append_message(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        message: &Message,
    ) -> Result<(), RepositoryError>;

    async fn append_summary(&self, summary: &Summary) -> Result<(), RepositoryError>;

    async fn latest_summary(&self, session_id: &SessionId)
        -> Result<Option<Summary>, RepositoryError>;

    /// Messages persisted strictly after `after`, oldest first. Empty when
    /// `after` is not part of the session.
    async fn messages_after(
        &self,
        session_id: &SessionId,
        after: &MessageId,
    ) -> Result<Vec<Message>, RepositoryError>;

    /// The last `limit` messages, oldest first.
    async fn recent_messages(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError>;
}

#[async_trait]
pub trait SuspensionRepository: Send + Sync {
    async fn insert(&self, record: &SuspensionRecord) -> Result<(), RepositoryError>;

    async fn find_by_id(
        &self,
        id: &SuspensionId,
    ) -> Result<Option<SuspensionRecord>, RepositoryError>;

    /// The record of a session still awaiting a human decision, if any.
    ///
    /// A resumed record already carries its decision and never counts as open,
    /// even when its outcome was not recorded.
    async fn find_open_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SuspensionRecord>, RepositoryError>;

    /// Writes `record` only if the stored version still equals
    /// `expected_version`. Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        record: &SuspensionRecord,
        expected_version: u32,
    ) -> Result<bool, RepositoryError>;
}

pub(crate) fn reject_summary_message(message: &Message) -> Result<(), RepositoryError> {
    if message.is_persistable() {
        Ok(())
    } else {
        Err(RepositoryError::Rejected(format!(
            "summary message `{}` must be stored through append_summary",
            message.id.0
        )))
    }
}

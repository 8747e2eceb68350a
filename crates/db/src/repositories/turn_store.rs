use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use steward_core::domain::message::{Message, MessageId, MessageRole, SessionId, UserId};
use steward_core::domain::summary::{Summary, SummaryId};

use super::{reject_summary_message, RepositoryError, TurnStore};
use crate::DbPool;

pub struct SqlTurnStore {
    pool: DbPool,
}

impl SqlTurnStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TurnStore for SqlTurnStore {
    async fn append_message(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        message: &Message,
    ) -> Result<(), RepositoryError> {
        reject_summary_message(message)?;
        let payload_json = message
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        sqlx::query(
            "INSERT INTO chat_message (msg_id, session_id, user_id, role, content, payload_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id.0)
        .bind(&session_id.0)
        .bind(&user_id.0)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(payload_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_summary(&self, summary: &Summary) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO chat_summary (
                id,
                session_id,
                user_id,
                range_start_msg_id,
                range_end_msg_id,
                content,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&summary.id.0)
        .bind(&summary.session_id.0)
        .bind(&summary.user_id.0)
        .bind(&summary.range_start.0)
        .bind(&summary.range_end.0)
        .bind(&summary.content)
        .bind(summary.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn latest_summary(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<Summary>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, session_id, user_id, range_start_msg_id, range_end_msg_id, content, created_at
             FROM chat_summary
             WHERE session_id = ?
             ORDER BY seq DESC
             LIMIT 1",
        )
        .bind(&session_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(summary_from_row).transpose()
    }

    async fn messages_after(
        &self,
        session_id: &SessionId,
        after: &MessageId,
    ) -> Result<Vec<Message>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT msg_id, role, content, payload_json
             FROM chat_message
             WHERE session_id = ?
               AND seq > (SELECT seq FROM chat_message WHERE session_id = ? AND msg_id = ?)
             ORDER BY seq ASC",
        )
        .bind(&session_id.0)
        .bind(&session_id.0)
        .bind(&after.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }

    async fn recent_messages(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT msg_id, role, content, payload_json FROM (
                SELECT seq, msg_id, role, content, payload_json
                FROM chat_message
                WHERE session_id = ?
                ORDER BY seq DESC
                LIMIT ?
             ) ORDER BY seq ASC",
        )
        .bind(&session_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }
}

fn message_from_row(row: SqliteRow) -> Result<Message, RepositoryError> {
    let role_raw = row.try_get::<String, _>("role")?;
    let role = MessageRole::parse(&role_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown message role `{role_raw}`")))?;
    let payload = row
        .try_get::<Option<String>, _>("payload_json")?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|error| RepositoryError::Decode(format!("invalid payload_json: {error}")))?;

    Ok(Message {
        id: MessageId(row.try_get("msg_id")?),
        role,
        content: row.try_get("content")?,
        payload,
    })
}

fn summary_from_row(row: SqliteRow) -> Result<Summary, RepositoryError> {
    Ok(Summary {
        id: SummaryId(row.try_get("id")?),
        session_id: SessionId(row.try_get("session_id")?),
        user_id: UserId(row.try_get("user_id")?),
        range_start: MessageId(row.try_get("range_start_msg_id")?),
        range_end: MessageId(row.try_get("range_end_msg_id")?),
        content: row.try_get("content")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

pub(crate) fn parse_timestamp(
    column: &str,
    value: String,
) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

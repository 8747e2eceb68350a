use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use steward_core::domain::message::{SessionId, UserId};
use steward_core::domain::suspension::{
    PendingDecision, SensitiveAction, SuspensionId, SuspensionRecord, SuspensionState,
};

use super::turn_store::parse_timestamp;
use super::{RepositoryError, SuspensionRepository};
use crate::DbPool;

const SELECT_COLUMNS: &str = "SELECT
    id,
    session_id,
    user_id,
    tool_call_id,
    action_json,
    state,
    decision_json,
    outcome_message,
    state_version,
    created_at,
    updated_at
 FROM suspension";

pub struct SqlSuspensionRepository {
    pool: DbPool,
}

impl SqlSuspensionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SuspensionRepository for SqlSuspensionRepository {
    async fn insert(&self, record: &SuspensionRecord) -> Result<(), RepositoryError> {
        let action_json = encode_json(&record.action)?;
        let decision_json = record.decision.as_ref().map(encode_json).transpose()?;

        sqlx::query(
            "INSERT INTO suspension (
                id,
                session_id,
                user_id,
                tool_call_id,
                action_json,
                state,
                decision_json,
                outcome_message,
                state_version,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id.0)
        .bind(&record.session_id.0)
        .bind(&record.user_id.0)
        .bind(&record.tool_call_id)
        .bind(action_json)
        .bind(record.state.as_str())
        .bind(decision_json)
        .bind(record.outcome_message.as_deref())
        .bind(i64::from(record.state_version))
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &SuspensionId,
    ) -> Result<Option<SuspensionRecord>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(record_from_row).transpose()
    }

    async fn find_open_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SuspensionRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS}
             WHERE session_id = ? AND state = 'suspended'
             ORDER BY created_at DESC
             LIMIT 1"
        ))
        .bind(&session_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    async fn compare_and_swap(
        &self,
        record: &SuspensionRecord,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let action_json = encode_json(&record.action)?;
        let decision_json = record.decision.as_ref().map(encode_json).transpose()?;

        let result = sqlx::query(
            "UPDATE suspension SET
                action_json = ?,
                state = ?,
                decision_json = ?,
                outcome_message = ?,
                state_version = ?,
                updated_at = ?
             WHERE id = ? AND state_version = ?",
        )
        .bind(action_json)
        .bind(record.state.as_str())
        .bind(decision_json)
        .bind(record.outcome_message.as_deref())
        .bind(i64::from(record.state_version))
        .bind(record.updated_at.to_rfc3339())
        .bind(&record.id.0)
        .bind(i64::from(expected_version))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|error| RepositoryError::Decode(error.to_string()))
}

fn record_from_row(row: SqliteRow) -> Result<SuspensionRecord, RepositoryError> {
    let state_raw = row.try_get::<String, _>("state")?;
    let state = SuspensionState::parse(&state_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown suspension state `{state_raw}`")))?;

    let action_raw = row.try_get::<String, _>("action_json")?;
    let action = serde_json::from_str::<SensitiveAction>(&action_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid action_json: {error}")))?;

    let decision = row
        .try_get::<Option<String>, _>("decision_json")?
        .map(|raw| serde_json::from_str::<PendingDecision>(&raw))
        .transpose()
        .map_err(|error| RepositoryError::Decode(format!("invalid decision_json: {error}")))?;

    let state_version = row.try_get::<i64, _>("state_version")?;
    let state_version = u32::try_from(state_version).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `state_version` (expected non-negative u32): {state_version}"
        ))
    })?;

    Ok(SuspensionRecord {
        id: SuspensionId(row.try_get("id")?),
        session_id: SessionId(row.try_get("session_id")?),
        user_id: UserId(row.try_get("user_id")?),
        tool_call_id: row.try_get("tool_call_id")?,
        action,
        state,
        decision,
        outcome_message: row.try_get("outcome_message")?,
        state_version,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

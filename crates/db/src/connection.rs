use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::debug;

pub type DbPool = sqlx::SqlitePool;

/// Opens the conversation store, creating the database file when missing.
///
/// An in-memory database lives inside a single connection, so the pool is
/// capped at one there; otherwise every connection would see its own empty
/// schema.
pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
    let journal_mode =
        if in_memory { SqliteJournalMode::Memory } else { SqliteJournalMode::Wal };
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(journal_mode)
        .busy_timeout(Duration::from_secs(5));
    let max_connections = if in_memory { 1 } else { max_connections.max(1) };

    debug!(
        event_name = "db.pool.connecting",
        in_memory,
        max_connections,
        timeout_secs,
        "opening sqlite pool"
    );

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .connect_with(options)
        .await
}

#[cfg(test)]
mod tests {
    use super::connect_with_settings;

    #[tokio::test]
    async fn in_memory_pool_is_capped_to_one_connection() {
        let pool = connect_with_settings("sqlite::memory:", 8, 30).await.expect("connect");

        sqlx::query("CREATE TABLE scratch (id INTEGER)").execute(&pool).await.expect("create");
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE name = 'scratch'")
                .fetch_one(&pool)
                .await
                .expect("count");

        assert_eq!(count, 1);
        assert_eq!(pool.options().get_max_connections(), 1);
    }

    #[tokio::test]
    async fn file_database_is_created_with_foreign_keys_enabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("store.db").display());
        let pool = connect_with_settings(&url, 2, 30).await.expect("connect");

        let (enabled,): (i64,) =
            sqlx::query_as("PRAGMA foreign_keys").fetch_one(&pool).await.expect("pragma");

        assert_eq!(enabled, 1);
        assert!(dir.path().join("store.db").exists());
        pool.close().await;
    }
}

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use steward_core::config::{AppConfig, ConfigError, LoadOptions, LoggingConfig};
use steward_db::repositories::{SqlSuspensionRepository, SqlTurnStore};
use steward_db::{connect_with_settings, migrations, DbPool};

use crate::runtime::{AgentRuntime, Collaborators, RuntimeInitError};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: AgentRuntime,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("runtime assembly failed: {0}")]
    Runtime(#[from] RuntimeInitError),
}

/// Installs the global subscriber. A second call is a no-op.
pub fn init_logging(config: &LoggingConfig) {
    use steward_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.level.parse::<Level>().unwrap_or(Level::INFO);

    let installed = match config.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().try_init()
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().try_init()
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().try_init()
        }
    };
    if let Err(error) = installed {
        debug!(
            event_name = "system.logging.already_initialized",
            error = %error,
            "global subscriber already installed; keeping it"
        );
    }
}

pub async fn bootstrap(
    options: LoadOptions,
    collaborators: Collaborators,
) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config, collaborators).await
}

pub async fn bootstrap_with_config(
    config: AppConfig,
    collaborators: Collaborators,
) -> Result<Application, BootstrapError> {
    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let runtime = AgentRuntime::new(
        &config,
        Arc::new(SqlTurnStore::new(db_pool.clone())),
        Arc::new(SqlSuspensionRepository::new(db_pool.clone())),
        collaborators,
    )?;
    info!(
        event_name = "system.bootstrap.runtime_ready",
        correlation_id = "bootstrap",
        max_tool_rounds = config.session.max_tool_rounds,
        quality_enabled = config.quality.enabled,
        "agent runtime assembled"
    );

    Ok(Application { config, db_pool, runtime })
}

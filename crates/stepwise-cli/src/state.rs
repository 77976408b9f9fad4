//! Application state wiring the engine to its SQLite store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use stepwise_core::workflow::capability::{handler_fn, Capabilities, HandlerRegistry, HandlerRequest};
use stepwise_core::workflow::WorkflowEngine;
use stepwise_infra::config::{load_engine_config, resolve_data_dir};
use stepwise_infra::sqlite::{database_url, DatabasePool, SqliteRepository};
use stepwise_types::config::EngineConfig;

/// Engine pinned to the SQLite repository.
pub type Engine = WorkflowEngine<SqliteRepository>;

pub struct AppState {
    pub engine: Arc<Engine>,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Resolve the data directory, load `config.toml`, open the database and
    /// build the engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let pool = DatabasePool::new(&database_url(&data_dir))
            .await
            .context("failed to open the stepwise database")?;

        let engine = WorkflowEngine::new(SqliteRepository::new(pool), config.clone())
            .with_capabilities(Capabilities::new(host_handlers()));

        tracing::debug!(data_dir = %data_dir.display(), "engine ready");
        Ok(Self {
            engine: Arc::new(engine),
            config,
            data_dir,
        })
    }
}

/// Handlers the CLI host provides. Notifications and escalations are written
/// to the log; there is no delivery channel.
fn host_handlers() -> HandlerRegistry {
    let log = handler_fn(|req: HandlerRequest| async move {
        tracing::info!(
            execution_id = %req.execution_id,
            step_id = %req.step_id,
            handler = %req.handler,
            parameters = %req.parameters,
            "notification"
        );
        Ok(json!({ "logged": true }))
    });
    HandlerRegistry::new()
        .with("notify", log.clone())
        .with("escalation", log)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_handlers_cover_notifications() {
        let registry = host_handlers();
        assert_eq!(registry.tags(), vec!["escalation", "notify"]);
    }
}

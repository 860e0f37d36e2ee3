pub mod api;
pub mod cache_item;
pub mod cache_table;
pub mod change_detector;
pub mod config;
pub mod cursor;
pub mod disk_cache;
pub mod dump;
pub mod engine;
pub mod fingerprint;
pub mod gray_rule;
pub mod history;
pub mod metrics_defs;
pub mod query_chain;
pub mod repository;
pub mod snapshot;
pub mod types;

#[cfg(test)]
mod testutils;

use crate::api::ConfigApiError;
use crate::config::Config;
use crate::engine::{ConfigEngine, EngineError};
use crate::repository::{ConfigRepository, ConfigWriter, TableSnapshot};
use shared::admin_service::{AdminService, Readiness};
use shared::http::run_http_service;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("API error: {0}")]
    Api(#[from] ConfigApiError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Starts the engine, the config API and the admin listener, and runs until
/// one of the listeners fails.
pub async fn run<R>(config: Config, repo: Arc<R>) -> Result<(), RunError>
where
    R: ConfigRepository + TableSnapshot + ConfigWriter + 'static,
{
    let engine = ConfigEngine::new(&config, repo.clone())?;

    let admin_engine = engine.clone();
    let admin_service = AdminService::<_, RunError>::new(move || {
        if admin_engine.is_ready() {
            Readiness::Ready
        } else if admin_engine.is_failed() {
            Readiness::Failed
        } else {
            Readiness::Starting
        }
    });
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );
    let api_task = async {
        api::serve(config.listener.clone(), engine.clone(), repo).await?;
        Ok::<(), RunError>(())
    };

    let result = tokio::try_join!(api_task, admin_task).map(|_| ());
    engine.shutdown().await;
    result
}

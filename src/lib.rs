pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod repositories;
pub(crate) mod schemas;
pub(crate) mod services;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::Context;

use crate::core::config::{Settings, StorageBackend};
use crate::core::{shutdown, state::AppState, telemetry};
use crate::repositories::{GradingStore, MemoryStore, PgStore};
use crate::services::judgment::LlmJudge;
use crate::services::llm_client::LlmClient;
use crate::services::ocr::VisionOcr;

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let store: Arc<dyn GradingStore> = match settings.database().backend {
        StorageBackend::Postgres => {
            let db_pool = db::init_pool(&settings).await?;
            db::run_migrations(&db_pool).await?;
            tracing::info!("Postgres store ready");
            Arc::new(PgStore::new(db_pool))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory store; grading data is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let upload_dir = &settings.storage().upload_dir;
    tokio::fs::create_dir_all(upload_dir)
        .await
        .with_context(|| format!("Failed to create upload dir {}", upload_dir.display()))?;

    let client = LlmClient::from_settings(&settings)?;
    let ocr = Arc::new(VisionOcr::new(client.clone(), settings.ai().ocr_model.clone()));
    let judge = Arc::new(LlmJudge::new(client, settings.ai().judge_model.clone()));

    let cancel = shutdown::shutdown_channel();
    let state = AppState::new(settings, store, ocr, judge, cancel.clone());

    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        environment = %state.settings().runtime().environment.as_str(),
        concurrency = state.settings().grading().concurrency,
        merge_policy = state.settings().grading().merge_policy.as_str(),
        "Exam grader listening"
    );

    axum::serve(listener, app).with_graceful_shutdown(shutdown::wait_for_cancel(cancel)).await?;

    tracing::info!("Exam grader stopped");
    Ok(())
}

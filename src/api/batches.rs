use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::schemas::batch::{BatchEntryResponse, BatchResponse, BatchStatusResponse};
use crate::services::report::BatchReport;
use crate::tasks::grading::batch::{self, BatchOptions};

#[derive(Debug, Default, Deserialize)]
pub(crate) struct BatchListQuery {
    #[serde(default)]
    pub(crate) exam_id: Option<String>,
}

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_batches))
        .route("/:batch_id", get(get_batch))
        .route("/:batch_id/grade", post(grade_batch))
        .route("/:batch_id/report", get(get_report))
        .route("/:batch_id/export.csv", get(export_csv))
}

async fn list_batches(
    Query(query): Query<BatchListQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<BatchResponse>>, ApiError> {
    let batches = state.store().list_batches().await?;
    let items = batches
        .into_iter()
        .filter(|batch| query.exam_id.as_deref().map_or(true, |exam_id| batch.exam_id == exam_id))
        .map(|batch| {
            let running = state.active_runs().is_running(&batch.id);
            BatchResponse::new(batch, running)
        })
        .collect();
    Ok(Json(items))
}

async fn get_batch(
    Path(batch_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<BatchStatusResponse>, ApiError> {
    let (found, entries) = batch::batch_status(&state, &batch_id).await?;
    let running = state.active_runs().is_running(&batch_id);
    Ok(Json(BatchStatusResponse {
        batch: BatchResponse::new(found, running),
        entries: entries.into_iter().map(BatchEntryResponse::from).collect(),
    }))
}

/// Runs the grading pool to completion and returns the report. `retry_failed`, `regrade`
/// and `reset_overrides` come from the query string. The run is detached from the request,
/// so a client that disconnects early does not stop it.
async fn grade_batch(
    Path(batch_id): Path<String>,
    Query(options): Query<BatchOptions>,
    State(state): State<AppState>,
) -> Result<Json<BatchReport>, ApiError> {
    let report = batch::spawn_batch_run(state, batch_id, options)
        .await
        .map_err(|err| ApiError::internal(err, "Batch run aborted"))??;
    Ok(Json(report))
}

async fn get_report(
    Path(batch_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<BatchReport>, ApiError> {
    Ok(Json(batch::batch_report(&state, &batch_id).await?))
}

async fn export_csv(
    Path(batch_id): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let csv = batch::export_csv(&state, &batch_id).await?;
    let disposition = format!("attachment; filename=\"batch-{batch_id}.csv\"");
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        csv,
    ))
}

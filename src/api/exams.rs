use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::validation::{read_multipart, validate_archive_upload, validate_image_upload};
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::schemas::batch::BatchResponse;
use crate::schemas::exam::{build_exam, ExamCreate, ExamDraftResponse, ExamResponse};
use crate::schemas::submission::SubmissionResponse;
use crate::services::answer_key::draft_exam;
use crate::services::ingest::validate_student_id;
use crate::services::page_store::PageImage;
use crate::tasks::grading::batch;
use crate::tasks::grading::submission::{self, UploadedPage};

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_exam).get(list_exams))
        .route("/auto-configure", post(auto_configure))
        .route("/:exam_id", get(get_exam))
        .route("/:exam_id/submissions", post(upload_submission).get(list_submissions))
        .route("/:exam_id/batches", post(upload_batch))
}

async fn create_exam(
    State(state): State<AppState>,
    Json(payload): Json<ExamCreate>,
) -> Result<(StatusCode, Json<ExamResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let exam = build_exam(payload, primitive_now_utc()).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    if state.store().load_exam(&exam.id).await?.is_some() {
        return Err(ApiError::Conflict(format!("exam {} already exists", exam.id)));
    }
    state.store().save_exam(&exam).await?;

    tracing::info!(exam_id = %exam.id, questions = exam.questions.len(), total_marks = exam.total_marks, "Exam created");
    Ok((StatusCode::CREATED, Json(exam.into())))
}

/// Drafts an answer key from answer-key images: `name` plus one or more `pages` files.
/// Nothing is stored; the reviewed draft is posted back to create the exam.
async fn auto_configure(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ExamDraftResponse>, ApiError> {
    let storage = state.settings().storage();
    let form = read_multipart(&mut multipart, storage.max_upload_size_mb * 1024 * 1024).await?;

    let name = form
        .text("name")
        .or_else(|| form.text("exam_name"))
        .ok_or_else(|| ApiError::BadRequest("name is required".to_string()))?
        .to_string();

    let mut pages = Vec::new();
    for file in form
        .files
        .into_iter()
        .filter(|file| matches!(file.field.as_str(), "pages" | "files" | "file"))
    {
        validate_image_upload(&file, &storage.allowed_image_extensions)?;
        pages.push(PageImage { label: file.file_name, bytes: file.bytes });
    }
    if pages.is_empty() {
        return Err(ApiError::BadRequest("At least one answer-key image is required".to_string()));
    }

    let (raw, mut warnings) = state
        .extractor()
        .read_answer_key(&pages)
        .await
        .map_err(|err| ApiError::Unprocessable(err.to_string()))?;
    let (exam, skipped) = draft_exam(&name, &raw);
    warnings.extend(skipped);
    if exam.questions.is_empty() {
        return Err(ApiError::Unprocessable(format!(
            "No usable questions found in the answer key: {}",
            warnings.join("; ")
        )));
    }

    metrics::counter!("answer_key_drafts_total").increment(1);
    tracing::info!(pages = pages.len(), questions = exam.questions.len(), warnings = warnings.len(), "Answer key drafted");
    Ok(Json(ExamDraftResponse { exam, warnings }))
}

async fn list_exams(State(state): State<AppState>) -> Result<Json<Vec<ExamResponse>>, ApiError> {
    let exams = state.store().list_exams().await?;
    Ok(Json(exams.into_iter().map(ExamResponse::from).collect()))
}

async fn get_exam(
    Path(exam_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ExamResponse>, ApiError> {
    let exam = state
        .store()
        .load_exam(&exam_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("exam {exam_id} not found")))?;
    Ok(Json(exam.into()))
}

/// Single-paper upload: `student_id`, optional `resubmit`, one or more `pages` files.
async fn upload_submission(
    Path(exam_id): Path<String>,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmissionResponse>), ApiError> {
    let storage = state.settings().storage();
    let form = read_multipart(&mut multipart, storage.max_upload_size_mb * 1024 * 1024).await?;

    let student_id = form
        .text("student_id")
        .ok_or_else(|| ApiError::BadRequest("student_id is required".to_string()))?
        .to_string();
    validate_student_id(&student_id).map_err(ApiError::BadRequest)?;
    let resubmit = form.flag("resubmit");

    let mut pages = Vec::new();
    for file in form.files.into_iter().filter(|file| file.field == "pages" || file.field == "file") {
        validate_image_upload(&file, &storage.allowed_image_extensions)?;
        pages.push(UploadedPage { file_name: file.file_name, bytes: file.bytes });
    }
    if pages.is_empty() {
        return Err(ApiError::BadRequest("At least one page image is required".to_string()));
    }

    let created =
        submission::create_submission(&state, &exam_id, &student_id, pages, resubmit).await?;
    Ok((StatusCode::CREATED, Json(created.into())))
}

async fn list_submissions(
    Path(exam_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<SubmissionResponse>>, ApiError> {
    if state.store().load_exam(&exam_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("exam {exam_id} not found")));
    }
    let submissions = state.store().list_submissions(&exam_id).await?;
    Ok(Json(submissions.into_iter().map(SubmissionResponse::from).collect()))
}

/// Batch upload: one `archive` file laid out as `<student_id>/<page images>`.
async fn upload_batch(
    Path(exam_id): Path<String>,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<BatchResponse>), ApiError> {
    let max_bytes = state.settings().storage().max_upload_size_mb * 1024 * 1024;
    let form = read_multipart(&mut multipart, max_bytes).await?;

    let archive = form
        .files
        .into_iter()
        .find(|file| file.field == "archive" || file.field == "file")
        .ok_or_else(|| ApiError::BadRequest("archive file is required".to_string()))?;
    validate_archive_upload(&archive)?;

    let created = batch::ingest_batch(&state, &exam_id, &archive.bytes).await?;
    Ok((StatusCode::CREATED, Json(BatchResponse::new(created, false))))
}

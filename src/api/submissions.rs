use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::schemas::submission::{
    GradeEditRequest, GradeEditResponse, GradingResultResponse, SubmissionDetailResponse,
};
use crate::tasks::grading::submission::{self, GradeOptions};

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/:submission_id", get(get_submission))
        .route("/:submission_id/grade", post(grade_submission))
        .route("/:submission_id/results/:question_id", put(edit_result))
        .route("/:submission_id/edits", get(list_edits))
}

async fn detail(state: &AppState, submission_id: &str) -> Result<SubmissionDetailResponse, ApiError> {
    let (found, _) = submission::load_with_exam(state, submission_id).await?;
    let results = state.store().load_grading_results(submission_id).await?;
    Ok(SubmissionDetailResponse {
        submission: found.into(),
        results: results.into_iter().map(GradingResultResponse::from).collect(),
    })
}

async fn get_submission(
    Path(submission_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<SubmissionDetailResponse>, ApiError> {
    Ok(Json(detail(&state, &submission_id).await?))
}

/// Extracts (when needed) and grades one submission; `?reset_overrides=true` drops overrides.
async fn grade_submission(
    Path(submission_id): Path<String>,
    Query(options): Query<GradeOptions>,
    State(state): State<AppState>,
) -> Result<Json<SubmissionDetailResponse>, ApiError> {
    let (mut found, exam) = submission::load_with_exam(&state, &submission_id).await?;
    submission::process(&state, &mut found, &exam, options).await?;
    Ok(Json(detail(&state, &submission_id).await?))
}

async fn edit_result(
    Path((submission_id, question_id)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(payload): Json<GradeEditRequest>,
) -> Result<Json<GradingResultResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let updated = submission::edit_grade(
        &state,
        &submission_id,
        &question_id,
        payload.score,
        payload.comment.filter(|comment| !comment.trim().is_empty()),
    )
    .await?;
    Ok(Json(updated.into()))
}

async fn list_edits(
    Path(submission_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<GradeEditResponse>>, ApiError> {
    if state.store().load_submission(&submission_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("submission {submission_id} not found")));
    }
    let edits = state.store().list_grade_edits(&submission_id).await?;
    Ok(Json(edits.into_iter().map(GradeEditResponse::from).collect()))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;

    use crate::test_support::{
        json_request, multipart_request, read_json, sample_exam, setup_test_context_with,
        ScriptedJudge, ScriptedOcr,
    };

    #[tokio::test]
    async fn grade_review_and_override_over_http() {
        let ctx = setup_test_context_with(
            ScriptedOcr::default().with_page("p1", &[("Q1", "C"), ("Q3", "C, B, A")]),
            ScriptedJudge::default(),
        )
        .await;
        ctx.state.store().save_exam(&sample_exam()).await.expect("exam");

        let upload = ctx
            .app
            .clone()
            .oneshot(multipart_request(
                "/api/v1/exams/exam-1/submissions",
                &[("student_id", "S1")],
                &[("pages", "p1.jpg", &[0xFF_u8, 0xD8, 0xFF][..])],
            ))
            .await
            .expect("upload");
        assert_eq!(upload.status(), StatusCode::CREATED);
        let submission_id = read_json(upload).await["id"].as_str().expect("id").to_string();

        let graded = ctx
            .app
            .clone()
            .oneshot(json_request(Method::POST, &format!("/api/v1/submissions/{submission_id}/grade"), None))
            .await
            .expect("grade");
        assert_eq!(graded.status(), StatusCode::OK);
        let body = read_json(graded).await;
        assert_eq!(body["status"], "graded");
        assert_eq!(body["results"].as_array().map(Vec::len), Some(4));
        assert_eq!(body["results"][2]["ai_score"], 1.0);
        assert_eq!(body["results"][1]["reasoning"], "no answer extracted");

        let edit = ctx
            .app
            .clone()
            .oneshot(json_request(
                Method::PUT,
                &format!("/api/v1/submissions/{submission_id}/results/Q1"),
                Some(json!({"score": 1.0, "comment": "accepted alternative"})),
            ))
            .await
            .expect("edit");
        assert_eq!(edit.status(), StatusCode::OK);
        let body = read_json(edit).await;
        assert_eq!(body["effective_score"], 1.0);
        assert_eq!(body["ai_score"], 0.0);
        assert_eq!(body["teacher_override"]["comment"], "accepted alternative");

        let too_high = ctx
            .app
            .clone()
            .oneshot(json_request(
                Method::PUT,
                &format!("/api/v1/submissions/{submission_id}/results/Q1"),
                Some(json!({"score": 5.0})),
            ))
            .await
            .expect("edit");
        assert_eq!(too_high.status(), StatusCode::BAD_REQUEST);

        let edits = ctx
            .app
            .clone()
            .oneshot(json_request(Method::GET, &format!("/api/v1/submissions/{submission_id}/edits"), None))
            .await
            .expect("edits");
        assert_eq!(read_json(edits).await.as_array().map(Vec::len), Some(1));

        let detail = ctx
            .app
            .clone()
            .oneshot(json_request(Method::GET, &format!("/api/v1/submissions/{submission_id}"), None))
            .await
            .expect("detail");
        assert_eq!(read_json(detail).await["total_score"], 2.0);
    }

    #[tokio::test]
    async fn unknown_submission_is_404() {
        let ctx = setup_test_context_with(ScriptedOcr::default(), ScriptedJudge::default()).await;
        let response = ctx
            .app
            .clone()
            .oneshot(json_request(Method::POST, "/api/v1/submissions/missing/grade", None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

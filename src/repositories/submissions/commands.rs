use sqlx::types::Json;
use sqlx::PgPool;

use crate::db::models::Submission;

pub(crate) async fn upsert(pool: &PgPool, submission: &Submission) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO submissions (
            id, exam_id, student_id, page_paths, extracted_answers, extraction_report,
            status, total_score, total_max, error_message, created_at, graded_at
         )
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
         ON CONFLICT (id) DO UPDATE
         SET page_paths = EXCLUDED.page_paths,
             extracted_answers = EXCLUDED.extracted_answers,
             extraction_report = EXCLUDED.extraction_report,
             status = EXCLUDED.status,
             total_score = EXCLUDED.total_score,
             total_max = EXCLUDED.total_max,
             error_message = EXCLUDED.error_message,
             graded_at = EXCLUDED.graded_at",
    )
    .bind(&submission.id)
    .bind(&submission.exam_id)
    .bind(&submission.student_id)
    .bind(Json(&submission.page_paths.0))
    .bind(Json(&submission.extracted_answers.0))
    .bind(submission.extraction_report.as_ref().map(|report| Json(&report.0)))
    .bind(submission.status)
    .bind(submission.total_score)
    .bind(submission.total_max)
    .bind(&submission.error_message)
    .bind(submission.created_at)
    .bind(submission.graded_at)
    .execute(pool)
    .await?;

    Ok(())
}

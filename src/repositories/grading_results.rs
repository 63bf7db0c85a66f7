use sqlx::types::Json;
use sqlx::PgPool;

use crate::db::models::GradingResult;

pub(crate) const COLUMNS: &str = "\
    submission_id, question_id, position, question_type, max_marks, ai_score, reasoning, \
    breakdown, teacher_override, graded_at";

/// Replaces every result of a submission inside one transaction.
pub(crate) async fn replace_for_submission(
    pool: &PgPool,
    submission_id: &str,
    results: &[GradingResult],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM grading_results WHERE submission_id = $1")
        .bind(submission_id)
        .execute(&mut *tx)
        .await?;

    for result in results {
        sqlx::query(
            "INSERT INTO grading_results (
                submission_id, question_id, position, question_type, max_marks, ai_score,
                reasoning, breakdown, teacher_override, graded_at
             )
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(submission_id)
        .bind(&result.question_id)
        .bind(result.position)
        .bind(result.question_type)
        .bind(result.max_marks)
        .bind(result.ai_score)
        .bind(&result.reasoning)
        .bind(Json(&result.breakdown.0))
        .bind(result.teacher_override.as_ref().map(|item| Json(&item.0)))
        .bind(result.graded_at)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub(crate) async fn list_by_submission(
    pool: &PgPool,
    submission_id: &str,
) -> Result<Vec<GradingResult>, sqlx::Error> {
    sqlx::query_as::<_, GradingResult>(&format!(
        "SELECT {COLUMNS}
         FROM grading_results
         WHERE submission_id = $1
         ORDER BY position"
    ))
    .bind(submission_id)
    .fetch_all(pool)
    .await
}

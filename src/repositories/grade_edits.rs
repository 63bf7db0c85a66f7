use sqlx::PgPool;

use crate::db::models::GradeEdit;

pub(crate) const COLUMNS: &str =
    "id, submission_id, question_id, previous_score, new_score, comment, edited_at";

pub(crate) async fn insert(pool: &PgPool, edit: &GradeEdit) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO grade_edits (
            id, submission_id, question_id, previous_score, new_score, comment, edited_at
         )
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(&edit.id)
    .bind(&edit.submission_id)
    .bind(&edit.question_id)
    .bind(edit.previous_score)
    .bind(edit.new_score)
    .bind(&edit.comment)
    .bind(edit.edited_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn list_by_submission(
    pool: &PgPool,
    submission_id: &str,
) -> Result<Vec<GradeEdit>, sqlx::Error> {
    sqlx::query_as::<_, GradeEdit>(&format!(
        "SELECT {COLUMNS} FROM grade_edits WHERE submission_id = $1 ORDER BY edited_at"
    ))
    .bind(submission_id)
    .fetch_all(pool)
    .await
}

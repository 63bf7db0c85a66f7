use sqlx::types::Json;
use sqlx::PgPool;

use crate::db::models::{BatchEntry, BatchJob};

pub(crate) const COLUMNS: &str = "\
    id, exam_id, status, total_students, successful, failed, error_message, created_at, \
    completed_at";

pub(crate) const ENTRY_COLUMNS: &str = "\
    batch_id, student_id, position, page_paths, submission_id, status, total_score, \
    error_message, processed_at";

pub(crate) async fn upsert(pool: &PgPool, batch: &BatchJob) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO batch_jobs (
            id, exam_id, status, total_students, successful, failed, error_message,
            created_at, completed_at
         )
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         ON CONFLICT (id) DO UPDATE
         SET status = EXCLUDED.status,
             total_students = EXCLUDED.total_students,
             successful = EXCLUDED.successful,
             failed = EXCLUDED.failed,
             error_message = EXCLUDED.error_message,
             completed_at = EXCLUDED.completed_at",
    )
    .bind(&batch.id)
    .bind(&batch.exam_id)
    .bind(batch.status)
    .bind(batch.total_students)
    .bind(batch.successful)
    .bind(batch.failed)
    .bind(&batch.error_message)
    .bind(batch.created_at)
    .bind(batch.completed_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<BatchJob>, sqlx::Error> {
    sqlx::query_as::<_, BatchJob>(&format!("SELECT {COLUMNS} FROM batch_jobs WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub(crate) async fn list(pool: &PgPool) -> Result<Vec<BatchJob>, sqlx::Error> {
    sqlx::query_as::<_, BatchJob>(&format!(
        "SELECT {COLUMNS} FROM batch_jobs ORDER BY created_at DESC"
    ))
    .fetch_all(pool)
    .await
}

pub(crate) async fn upsert_entry(pool: &PgPool, entry: &BatchEntry) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO batch_entries (
            batch_id, student_id, position, page_paths, submission_id, status, total_score,
            error_message, processed_at
         )
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         ON CONFLICT (batch_id, student_id) DO UPDATE
         SET submission_id = EXCLUDED.submission_id,
             status = EXCLUDED.status,
             total_score = EXCLUDED.total_score,
             error_message = EXCLUDED.error_message,
             processed_at = EXCLUDED.processed_at",
    )
    .bind(&entry.batch_id)
    .bind(&entry.student_id)
    .bind(entry.position)
    .bind(Json(&entry.page_paths.0))
    .bind(&entry.submission_id)
    .bind(entry.status)
    .bind(entry.total_score)
    .bind(&entry.error_message)
    .bind(entry.processed_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn list_entries(
    pool: &PgPool,
    batch_id: &str,
) -> Result<Vec<BatchEntry>, sqlx::Error> {
    sqlx::query_as::<_, BatchEntry>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM batch_entries WHERE batch_id = $1 ORDER BY position"
    ))
    .bind(batch_id)
    .fetch_all(pool)
    .await
}

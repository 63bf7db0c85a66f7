use sqlx::types::Json;
use sqlx::PgPool;

use crate::db::models::Exam;

pub(crate) const COLUMNS: &str = "id, name, total_marks, questions, created_at";

pub(crate) async fn insert(pool: &PgPool, exam: &Exam) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO exams (id, name, total_marks, questions, created_at)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (id) DO UPDATE
         SET name = EXCLUDED.name,
             total_marks = EXCLUDED.total_marks,
             questions = EXCLUDED.questions",
    )
    .bind(&exam.id)
    .bind(&exam.name)
    .bind(exam.total_marks)
    .bind(Json(&exam.questions.0))
    .bind(exam.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<Exam>, sqlx::Error> {
    sqlx::query_as::<_, Exam>(&format!("SELECT {COLUMNS} FROM exams WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub(crate) async fn list(pool: &PgPool) -> Result<Vec<Exam>, sqlx::Error> {
    sqlx::query_as::<_, Exam>(&format!("SELECT {COLUMNS} FROM exams ORDER BY created_at DESC"))
        .fetch_all(pool)
        .await
}

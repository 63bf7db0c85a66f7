use async_trait::async_trait;
use sqlx::PgPool;

use crate::core::errors::PersistenceError;
use crate::db::models::{BatchEntry, BatchJob, Exam, GradeEdit, GradingResult, Submission};

use super::{batches, exams, grade_edits, grading_results, health, submissions};

/// Persistence collaborator for the grading pipeline.
///
/// Writes are keyed so that every call is an upsert; `save_grading_results` replaces the
/// whole result group of a submission at once.
#[async_trait]
pub(crate) trait GradingStore: Send + Sync {
    async fn ping(&self) -> Result<(), PersistenceError>;

    async fn save_exam(&self, exam: &Exam) -> Result<(), PersistenceError>;
    async fn load_exam(&self, exam_id: &str) -> Result<Option<Exam>, PersistenceError>;
    async fn list_exams(&self) -> Result<Vec<Exam>, PersistenceError>;

    async fn save_submission(&self, submission: &Submission) -> Result<(), PersistenceError>;
    async fn load_submission(
        &self,
        submission_id: &str,
    ) -> Result<Option<Submission>, PersistenceError>;
    async fn find_submission_for_student(
        &self,
        exam_id: &str,
        student_id: &str,
    ) -> Result<Option<Submission>, PersistenceError>;
    async fn list_submissions(&self, exam_id: &str) -> Result<Vec<Submission>, PersistenceError>;

    async fn save_grading_results(
        &self,
        submission_id: &str,
        results: &[GradingResult],
    ) -> Result<(), PersistenceError>;
    async fn load_grading_results(
        &self,
        submission_id: &str,
    ) -> Result<Vec<GradingResult>, PersistenceError>;

    async fn save_grade_edit(&self, edit: &GradeEdit) -> Result<(), PersistenceError>;
    async fn list_grade_edits(&self, submission_id: &str)
        -> Result<Vec<GradeEdit>, PersistenceError>;

    async fn save_batch(&self, batch: &BatchJob) -> Result<(), PersistenceError>;
    async fn load_batch(&self, batch_id: &str) -> Result<Option<BatchJob>, PersistenceError>;
    async fn list_batches(&self) -> Result<Vec<BatchJob>, PersistenceError>;
    async fn save_batch_entry_status(&self, entry: &BatchEntry) -> Result<(), PersistenceError>;
    async fn list_batch_entries(&self, batch_id: &str)
        -> Result<Vec<BatchEntry>, PersistenceError>;
}

#[derive(Clone)]
pub(crate) struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GradingStore for PgStore {
    async fn ping(&self) -> Result<(), PersistenceError> {
        Ok(health::ping(&self.pool).await?)
    }

    async fn save_exam(&self, exam: &Exam) -> Result<(), PersistenceError> {
        Ok(exams::insert(&self.pool, exam).await?)
    }

    async fn load_exam(&self, exam_id: &str) -> Result<Option<Exam>, PersistenceError> {
        Ok(exams::find_by_id(&self.pool, exam_id).await?)
    }

    async fn list_exams(&self) -> Result<Vec<Exam>, PersistenceError> {
        Ok(exams::list(&self.pool).await?)
    }

    async fn save_submission(&self, submission: &Submission) -> Result<(), PersistenceError> {
        Ok(submissions::upsert(&self.pool, submission).await?)
    }

    async fn load_submission(
        &self,
        submission_id: &str,
    ) -> Result<Option<Submission>, PersistenceError> {
        Ok(submissions::find_by_id(&self.pool, submission_id).await?)
    }

    async fn find_submission_for_student(
        &self,
        exam_id: &str,
        student_id: &str,
    ) -> Result<Option<Submission>, PersistenceError> {
        Ok(submissions::find_latest_for_student(&self.pool, exam_id, student_id).await?)
    }

    async fn list_submissions(&self, exam_id: &str) -> Result<Vec<Submission>, PersistenceError> {
        Ok(submissions::list_by_exam(&self.pool, exam_id).await?)
    }

    async fn save_grading_results(
        &self,
        submission_id: &str,
        results: &[GradingResult],
    ) -> Result<(), PersistenceError> {
        Ok(grading_results::replace_for_submission(&self.pool, submission_id, results).await?)
    }

    async fn load_grading_results(
        &self,
        submission_id: &str,
    ) -> Result<Vec<GradingResult>, PersistenceError> {
        Ok(grading_results::list_by_submission(&self.pool, submission_id).await?)
    }

    async fn save_grade_edit(&self, edit: &GradeEdit) -> Result<(), PersistenceError> {
        Ok(grade_edits::insert(&self.pool, edit).await?)
    }

    async fn list_grade_edits(
        &self,
        submission_id: &str,
    ) -> Result<Vec<GradeEdit>, PersistenceError> {
        Ok(grade_edits::list_by_submission(&self.pool, submission_id).await?)
    }

    async fn save_batch(&self, batch: &BatchJob) -> Result<(), PersistenceError> {
        Ok(batches::upsert(&self.pool, batch).await?)
    }

    async fn load_batch(&self, batch_id: &str) -> Result<Option<BatchJob>, PersistenceError> {
        Ok(batches::find_by_id(&self.pool, batch_id).await?)
    }

    async fn list_batches(&self) -> Result<Vec<BatchJob>, PersistenceError> {
        Ok(batches::list(&self.pool).await?)
    }

    async fn save_batch_entry_status(&self, entry: &BatchEntry) -> Result<(), PersistenceError> {
        Ok(batches::upsert_entry(&self.pool, entry).await?)
    }

    async fn list_batch_entries(
        &self,
        batch_id: &str,
    ) -> Result<Vec<BatchEntry>, PersistenceError> {
        Ok(batches::list_entries(&self.pool, batch_id).await?)
    }
}

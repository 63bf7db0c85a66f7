use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::errors::PersistenceError;
use crate::db::models::{BatchEntry, BatchJob, Exam, GradeEdit, GradingResult, Submission};

use super::store::GradingStore;

/// Process-local store used for `STORAGE_BACKEND=memory` and in tests.
#[derive(Default)]
pub(crate) struct MemoryStore {
    exams: RwLock<Vec<Exam>>,
    submissions: RwLock<Vec<Submission>>,
    results: RwLock<HashMap<String, Vec<GradingResult>>>,
    edits: RwLock<Vec<GradeEdit>>,
    batches: RwLock<Vec<BatchJob>>,
    entries: RwLock<HashMap<String, Vec<BatchEntry>>>,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

fn upsert_by<T: Clone>(items: &mut Vec<T>, item: &T, same: impl Fn(&T) -> bool) {
    match items.iter_mut().find(|existing| same(existing)) {
        Some(existing) => *existing = item.clone(),
        None => items.push(item.clone()),
    }
}

#[async_trait]
impl GradingStore for MemoryStore {
    async fn ping(&self) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn save_exam(&self, exam: &Exam) -> Result<(), PersistenceError> {
        let mut exams = self.exams.write().await;
        upsert_by(&mut exams, exam, |existing| existing.id == exam.id);
        Ok(())
    }

    async fn load_exam(&self, exam_id: &str) -> Result<Option<Exam>, PersistenceError> {
        Ok(self.exams.read().await.iter().find(|exam| exam.id == exam_id).cloned())
    }

    async fn list_exams(&self) -> Result<Vec<Exam>, PersistenceError> {
        Ok(self.exams.read().await.iter().rev().cloned().collect())
    }

    async fn save_submission(&self, submission: &Submission) -> Result<(), PersistenceError> {
        let mut submissions = self.submissions.write().await;
        upsert_by(&mut submissions, submission, |existing| existing.id == submission.id);
        Ok(())
    }

    async fn load_submission(
        &self,
        submission_id: &str,
    ) -> Result<Option<Submission>, PersistenceError> {
        Ok(self.submissions.read().await.iter().find(|item| item.id == submission_id).cloned())
    }

    async fn find_submission_for_student(
        &self,
        exam_id: &str,
        student_id: &str,
    ) -> Result<Option<Submission>, PersistenceError> {
        Ok(self
            .submissions
            .read()
            .await
            .iter()
            .rev()
            .find(|item| item.exam_id == exam_id && item.student_id == student_id)
            .cloned())
    }

    async fn list_submissions(&self, exam_id: &str) -> Result<Vec<Submission>, PersistenceError> {
        Ok(self
            .submissions
            .read()
            .await
            .iter()
            .filter(|item| item.exam_id == exam_id)
            .cloned()
            .collect())
    }

    async fn save_grading_results(
        &self,
        submission_id: &str,
        results: &[GradingResult],
    ) -> Result<(), PersistenceError> {
        let mut sorted = results.to_vec();
        sorted.sort_by_key(|result| result.position);
        self.results.write().await.insert(submission_id.to_string(), sorted);
        Ok(())
    }

    async fn load_grading_results(
        &self,
        submission_id: &str,
    ) -> Result<Vec<GradingResult>, PersistenceError> {
        Ok(self.results.read().await.get(submission_id).cloned().unwrap_or_default())
    }

    async fn save_grade_edit(&self, edit: &GradeEdit) -> Result<(), PersistenceError> {
        self.edits.write().await.push(edit.clone());
        Ok(())
    }

    async fn list_grade_edits(
        &self,
        submission_id: &str,
    ) -> Result<Vec<GradeEdit>, PersistenceError> {
        Ok(self
            .edits
            .read()
            .await
            .iter()
            .filter(|edit| edit.submission_id == submission_id)
            .cloned()
            .collect())
    }

    async fn save_batch(&self, batch: &BatchJob) -> Result<(), PersistenceError> {
        let mut batches = self.batches.write().await;
        upsert_by(&mut batches, batch, |existing| existing.id == batch.id);
        Ok(())
    }

    async fn load_batch(&self, batch_id: &str) -> Result<Option<BatchJob>, PersistenceError> {
        Ok(self.batches.read().await.iter().find(|batch| batch.id == batch_id).cloned())
    }

    async fn list_batches(&self) -> Result<Vec<BatchJob>, PersistenceError> {
        Ok(self.batches.read().await.iter().rev().cloned().collect())
    }

    async fn save_batch_entry_status(&self, entry: &BatchEntry) -> Result<(), PersistenceError> {
        let mut entries = self.entries.write().await;
        let batch_entries = entries.entry(entry.batch_id.clone()).or_default();
        upsert_by(batch_entries, entry, |existing| existing.student_id == entry.student_id);
        batch_entries.sort_by_key(|item| item.position);
        Ok(())
    }

    async fn list_batch_entries(
        &self,
        batch_id: &str,
    ) -> Result<Vec<BatchEntry>, PersistenceError> {
        Ok(self.entries.read().await.get(batch_id).cloned().unwrap_or_default())
    }
}

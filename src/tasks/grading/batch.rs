//! Batch orchestration: ZIP ingestion, the per-student grading pool, the batch report and
//! the CSV export.
//!
//! Every entry moves through its own state machine and is persisted after each transition,
//! so one student's failure never touches a sibling and an interrupted run can resume.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use sqlx::types::Json;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

use crate::core::errors::{GradingError, PersistenceError, ValidationError};
use crate::core::shutdown::wait_for_cancel;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::models::{BatchCounts, BatchEntry, BatchJob, Exam, Submission};
use crate::db::types::{BatchStatus, EntryStatus};
use crate::services::csv_export::{render_csv, ExportRow};
use crate::services::ingest::{read_archive, IngestError};
use crate::services::report::{build_report, BatchReport};

use super::submission::{self, GradeOptions};

/// Archives may expand to this multiple of the upload limit.
const UNCOMPRESSED_FACTOR: u64 = 4;

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub(crate) struct BatchOptions {
    #[serde(default)]
    pub(crate) retry_failed: bool,
    #[serde(default)]
    pub(crate) regrade: bool,
    #[serde(default)]
    pub(crate) reset_overrides: bool,
}

/// Batch ids with a grading run in progress inside this process.
#[derive(Default)]
pub(crate) struct ActiveRuns {
    running: Mutex<HashSet<String>>,
}

impl ActiveRuns {
    fn try_acquire(&self, batch_id: &str) -> Option<RunGuard<'_>> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        running.insert(batch_id.to_string()).then(|| RunGuard { runs: self, batch_id: batch_id.to_string() })
    }

    pub(crate) fn is_running(&self, batch_id: &str) -> bool {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).contains(batch_id)
    }
}

struct RunGuard<'a> {
    runs: &'a ActiveRuns,
    batch_id: String,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.runs.running.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.batch_id);
    }
}

/// Unpacks a `<student_id>/<pages>` archive into a new batch. Student folders that cannot
/// be used become failed entries; a batch without a single usable student is failed.
pub(crate) async fn ingest_batch(
    state: &AppState,
    exam_id: &str,
    archive: &[u8],
) -> Result<BatchJob, GradingError> {
    let exam = state
        .store()
        .load_exam(exam_id)
        .await?
        .ok_or_else(|| PersistenceError::not_found("exam", exam_id))?;

    let storage = state.settings().storage();
    let max_uncompressed =
        storage.max_upload_size_mb.saturating_mul(1024 * 1024).saturating_mul(UNCOMPRESSED_FACTOR);

    let now = primitive_now_utc();
    let mut batch = BatchJob {
        id: uuid::Uuid::new_v4().to_string(),
        exam_id: exam.id.clone(),
        status: BatchStatus::Uploaded,
        total_students: 0,
        successful: 0,
        failed: 0,
        error_message: None,
        created_at: now,
        completed_at: None,
    };

    let students = match read_archive(archive, &storage.allowed_image_extensions, max_uncompressed) {
        Ok(students) => students,
        Err(IngestError::NoStudents) => {
            batch.status = BatchStatus::Failed;
            batch.error_message = Some(IngestError::NoStudents.to_string());
            batch.completed_at = Some(now);
            state.store().save_batch(&batch).await?;
            tracing::warn!(batch_id = %batch.id, exam_id, "Batch archive contained no students");
            return Ok(batch);
        }
        Err(err) => return Err(ValidationError::Invalid(err.to_string()).into()),
    };

    let mut entries = Vec::with_capacity(students.len());
    for (position, student) in students.into_iter().enumerate() {
        let mut entry = BatchEntry {
            batch_id: batch.id.clone(),
            student_id: student.student_id.clone(),
            position: position as i32,
            page_paths: Json(Vec::new()),
            submission_id: None,
            status: EntryStatus::Pending,
            total_score: None,
            error_message: None,
            processed_at: None,
        };

        if let Some(problem) = student.problem {
            tracing::warn!(batch_id = %batch.id, student_id = %entry.student_id, problem = %problem, "Student pre-failed at ingestion");
            entry.status = EntryStatus::Failed;
            entry.error_message = Some(problem);
            entry.processed_at = Some(now);
        } else {
            for (index, page) in student.pages.iter().enumerate() {
                let path = state
                    .pages()
                    .save_page(&batch.id, &student.student_id, index, &page.file_name, &page.bytes)
                    .await?;
                entry.page_paths.push(path);
            }
        }
        entries.push(entry);
    }

    batch.apply_counts(BatchCounts::from_entries(&entries));
    if entries.iter().all(|entry| entry.status == EntryStatus::Failed) {
        batch.status = BatchStatus::Failed;
        batch.error_message = Some("no valid student folders in archive".to_string());
        batch.completed_at = Some(now);
    }

    state.store().save_batch(&batch).await?;
    for entry in &entries {
        state.store().save_batch_entry_status(entry).await?;
    }

    tracing::info!(
        batch_id = %batch.id,
        exam_id,
        students = entries.len(),
        pre_failed = batch.failed,
        "Batch ingested"
    );
    Ok(batch)
}

/// Grades every selected entry of a batch on a bounded pool and returns the batch report.
pub(crate) async fn grade_batch(
    state: &AppState,
    batch_id: &str,
    options: BatchOptions,
) -> Result<BatchReport, GradingError> {
    let Some(_run) = state.active_runs().try_acquire(batch_id) else {
        return Err(GradingError::Conflict(format!("batch {batch_id} is already being graded")));
    };

    let mut batch = load_batch(state, batch_id).await?;
    if batch.status == BatchStatus::Failed && batch.total_students == batch.failed {
        return Err(GradingError::InvalidState(format!(
            "batch {batch_id} failed during setup: {}",
            batch.error_message.as_deref().unwrap_or("unknown error")
        )));
    }

    let Some(exam) = state.store().load_exam(&batch.exam_id).await? else {
        batch.status = BatchStatus::Failed;
        batch.error_message = Some(format!("exam {} not found", batch.exam_id));
        batch.completed_at = Some(primitive_now_utc());
        state.store().save_batch(&batch).await?;
        tracing::error!(batch_id, exam_id = %batch.exam_id, "Batch exam missing");
        return batch_report(state, batch_id).await;
    };
    let exam = Arc::new(exam);

    let mut selected = Vec::new();
    for mut entry in state.store().list_batch_entries(batch_id).await? {
        if let Some(resumed) = resume_status(entry.status) {
            tracing::info!(batch_id, student_id = %entry.student_id, from = entry.status.as_str(), "Resuming interrupted entry");
            entry.status = resumed;
            state.store().save_batch_entry_status(&entry).await?;
        }
        if should_process(&entry, options) {
            selected.push(entry);
        }
    }

    batch.status = BatchStatus::Grading;
    batch.error_message = None;
    batch.completed_at = None;
    state.store().save_batch(&batch).await?;
    tracing::info!(batch_id, selected = selected.len(), "Batch grading started");

    let semaphore = Arc::new(Semaphore::new(state.settings().grading().concurrency));
    let cancel = state.cancel_signal();
    let grade_options = GradeOptions { reset_overrides: options.reset_overrides };
    let mut workers = JoinSet::new();

    for entry in selected {
        if *cancel.borrow() {
            tracing::warn!(batch_id, "Batch run cancelled before all entries started");
            break;
        }
        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = wait_for_cancel(cancel.clone()) => {
                tracing::warn!(batch_id, "Batch run cancelled before all entries started");
                break;
            }
        };

        let state = state.clone();
        let exam = exam.clone();
        workers.spawn(async move {
            let _permit = permit;
            run_isolated(state, exam, entry, grade_options).await;
        });
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            tracing::error!(batch_id, error = %err, "Batch worker aborted");
        }
    }

    finalize(state, &mut batch).await?;
    batch_report(state, batch_id).await
}

/// Starts a batch run on its own task, so the run reaches its final bookkeeping even when
/// the caller stops waiting for it.
pub(crate) fn spawn_batch_run(
    state: AppState,
    batch_id: String,
    options: BatchOptions,
) -> JoinHandle<Result<BatchReport, GradingError>> {
    tokio::spawn(async move { grade_batch(&state, &batch_id, options).await })
}

/// Runs one entry in its own task so that a panic is recorded on that entry alone.
async fn run_isolated(state: AppState, exam: Arc<Exam>, entry: BatchEntry, options: GradeOptions) {
    let fallback = entry.clone();
    let inner_state = state.clone();
    let handle = tokio::spawn(async move { process_entry(&inner_state, &exam, entry, options).await });

    let outcome = match handle.await {
        Ok(outcome) => outcome,
        Err(err) => {
            let cause = if err.is_panic() { "worker panicked".to_string() } else { err.to_string() };
            let mut failed = fallback.clone();
            fail_entry(&mut failed, cause);
            let saved = state.store().save_batch_entry_status(&failed).await;
            saved.map(|()| failed)
        }
    };

    match outcome {
        Ok(entry) => {
            metrics::counter!("batch_entries_total", "status" => entry.status.as_str()).increment(1);
        }
        Err(err) => {
            tracing::error!(
                batch_id = %fallback.batch_id,
                student_id = %fallback.student_id,
                error = %err,
                "Failed to persist batch entry state"
            );
            mark_failed_after_store_error(&state, fallback, &err).await;
        }
    }
}

/// Best effort: an entry left in an in-flight state would keep the whole batch open.
async fn mark_failed_after_store_error(state: &AppState, fallback: BatchEntry, err: &PersistenceError) {
    let latest = match state.store().list_batch_entries(&fallback.batch_id).await {
        Ok(entries) => entries.into_iter().find(|entry| entry.student_id == fallback.student_id),
        Err(_) => None,
    };
    let mut entry = latest.unwrap_or(fallback);
    if entry.status.is_terminal() {
        return;
    }

    fail_entry(&mut entry, format!("could not record grading progress: {err}"));
    match state.store().save_batch_entry_status(&entry).await {
        Ok(()) => {
            metrics::counter!("batch_entries_total", "status" => entry.status.as_str()).increment(1);
        }
        Err(err) => {
            tracing::error!(
                batch_id = %entry.batch_id,
                student_id = %entry.student_id,
                error = %err,
                "Could not mark batch entry failed"
            );
        }
    }
}

async fn process_entry(
    state: &AppState,
    exam: &Exam,
    mut entry: BatchEntry,
    options: GradeOptions,
) -> Result<BatchEntry, PersistenceError> {
    let mut submission = match load_entry_submission(state, &entry).await? {
        Some(submission) => submission,
        None => {
            let submission = Submission::new(
                exam,
                &entry.student_id,
                entry.page_paths.0.clone(),
                primitive_now_utc(),
            );
            state.store().save_submission(&submission).await?;
            entry.submission_id = Some(submission.id.clone());
            submission
        }
    };

    if submission::needs_extraction(&submission) {
        transition(state, &mut entry, EntryStatus::Extracting).await?;
        if let Err(err) = submission::extract(state, &mut submission, exam).await {
            return finish_failed(state, entry, err).await;
        }
        transition(state, &mut entry, EntryStatus::Extracted).await?;
    }

    transition(state, &mut entry, EntryStatus::Grading).await?;
    match submission::grade(state, &mut submission, exam, options).await {
        Ok(graded) => {
            entry.status = EntryStatus::Graded;
            entry.total_score = Some(graded.total_score);
            entry.error_message = None;
            entry.processed_at = Some(primitive_now_utc());
            state.store().save_batch_entry_status(&entry).await?;
            tracing::info!(
                batch_id = %entry.batch_id,
                student_id = %entry.student_id,
                total_score = graded.total_score,
                "Batch entry graded"
            );
            Ok(entry)
        }
        Err(err) => finish_failed(state, entry, err).await,
    }
}

async fn load_entry_submission(
    state: &AppState,
    entry: &BatchEntry,
) -> Result<Option<Submission>, PersistenceError> {
    match &entry.submission_id {
        Some(submission_id) => state.store().load_submission(submission_id).await,
        None => Ok(None),
    }
}

async fn transition(
    state: &AppState,
    entry: &mut BatchEntry,
    status: EntryStatus,
) -> Result<(), PersistenceError> {
    tracing::debug!(batch_id = %entry.batch_id, student_id = %entry.student_id, to = status.as_str(), "Entry transition");
    entry.status = status;
    state.store().save_batch_entry_status(entry).await
}

async fn finish_failed(
    state: &AppState,
    mut entry: BatchEntry,
    err: GradingError,
) -> Result<BatchEntry, PersistenceError> {
    tracing::error!(
        batch_id = %entry.batch_id,
        student_id = %entry.student_id,
        error = %err,
        "Batch entry failed"
    );
    fail_entry(&mut entry, err.to_string());
    state.store().save_batch_entry_status(&entry).await?;
    Ok(entry)
}

fn fail_entry(entry: &mut BatchEntry, cause: String) {
    entry.status = EntryStatus::Failed;
    entry.total_score = None;
    entry.error_message = Some(cause);
    entry.processed_at = Some(primitive_now_utc());
}

/// Stale in-flight states left by an interrupted run.
fn resume_status(status: EntryStatus) -> Option<EntryStatus> {
    match status {
        EntryStatus::Extracting => Some(EntryStatus::Pending),
        EntryStatus::Grading => Some(EntryStatus::Extracted),
        _ => None,
    }
}

fn should_process(entry: &BatchEntry, options: BatchOptions) -> bool {
    match entry.status {
        EntryStatus::Pending | EntryStatus::Extracted => true,
        // Folders rejected at ingestion have no pages to retry with.
        EntryStatus::Failed => options.retry_failed && !entry.page_paths.is_empty(),
        EntryStatus::Graded => options.regrade,
        EntryStatus::Extracting | EntryStatus::Grading => false,
    }
}

async fn finalize(state: &AppState, batch: &mut BatchJob) -> Result<(), PersistenceError> {
    let entries = state.store().list_batch_entries(&batch.id).await?;
    batch.apply_counts(BatchCounts::from_entries(&entries));

    if entries.iter().all(|entry| entry.status.is_terminal()) {
        batch.status = BatchStatus::Completed;
        batch.completed_at = Some(primitive_now_utc());
        metrics::counter!("batch_runs_total", "status" => "completed").increment(1);
    } else {
        metrics::counter!("batch_runs_total", "status" => "interrupted").increment(1);
    }
    state.store().save_batch(batch).await?;

    tracing::info!(
        batch_id = %batch.id,
        status = batch.status.as_str(),
        total = batch.total_students,
        successful = batch.successful,
        failed = batch.failed,
        "Batch grading finished"
    );
    Ok(())
}

/// Copies a submission's override-aware total onto the graded batch entries that own it.
pub(crate) async fn sync_entry_totals(
    state: &AppState,
    submission: &Submission,
) -> Result<(), PersistenceError> {
    for batch in state.store().list_batches().await? {
        if batch.exam_id != submission.exam_id {
            continue;
        }
        for mut entry in state.store().list_batch_entries(&batch.id).await? {
            let owned = entry.submission_id.as_deref() == Some(submission.id.as_str());
            if owned && entry.status == EntryStatus::Graded {
                entry.total_score = submission.total_score;
                state.store().save_batch_entry_status(&entry).await?;
            }
        }
    }
    Ok(())
}

async fn load_batch(state: &AppState, batch_id: &str) -> Result<BatchJob, PersistenceError> {
    state
        .store()
        .load_batch(batch_id)
        .await?
        .ok_or_else(|| PersistenceError::not_found("batch", batch_id))
}

pub(crate) async fn batch_status(
    state: &AppState,
    batch_id: &str,
) -> Result<(BatchJob, Vec<BatchEntry>), GradingError> {
    let batch = load_batch(state, batch_id).await?;
    let entries = state.store().list_batch_entries(batch_id).await?;
    Ok((batch, entries))
}

pub(crate) async fn batch_report(
    state: &AppState,
    batch_id: &str,
) -> Result<BatchReport, GradingError> {
    let (batch, entries) = batch_status(state, batch_id).await?;

    let mut effective_totals = HashMap::new();
    for entry in entries.iter().filter(|entry| entry.status == EntryStatus::Graded) {
        if let Some(submission) = load_entry_submission(state, entry).await? {
            if let Some(total) = submission.total_score {
                effective_totals.insert(entry.student_id.clone(), total);
            }
        }
    }

    Ok(build_report(&batch, &entries, &effective_totals))
}

/// One CSV row per entry, using effective (override-aware) scores.
pub(crate) async fn export_csv(state: &AppState, batch_id: &str) -> Result<String, GradingError> {
    let (batch, entries) = batch_status(state, batch_id).await?;
    let exam = state
        .store()
        .load_exam(&batch.exam_id)
        .await?
        .ok_or_else(|| PersistenceError::not_found("exam", &batch.exam_id))?;

    let mut rows = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut row = ExportRow {
            student_id: entry.student_id.clone(),
            status: entry.status,
            total_score: None,
            total_max: None,
            question_scores: HashMap::new(),
            submission_id: entry.submission_id.clone(),
            error: entry.error_message.clone(),
        };

        if entry.status == EntryStatus::Graded {
            if let Some(submission_id) = &entry.submission_id {
                let results = state.store().load_grading_results(submission_id).await?;
                row.total_score = Some(results.iter().map(|result| result.effective_score()).sum());
                row.total_max = Some(results.iter().map(|result| result.max_marks).sum());
                row.question_scores = results
                    .iter()
                    .map(|result| (result.question_id.clone(), result.effective_score()))
                    .collect();
            }
        }
        rows.push(row);
    }

    metrics::counter!("csv_exports_total").increment(1);
    Ok(render_csv(&exam.question_ids(), &rows))
}

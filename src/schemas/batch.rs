use serde::Serialize;

use crate::core::time::{format_optional, format_primitive};
use crate::db::models::{BatchEntry, BatchJob};
use crate::db::types::{BatchStatus, EntryStatus};

#[derive(Debug, Serialize)]
pub(crate) struct BatchResponse {
    pub(crate) id: String,
    pub(crate) exam_id: String,
    pub(crate) status: BatchStatus,
    pub(crate) total_students: i32,
    pub(crate) successful: i32,
    pub(crate) failed: i32,
    pub(crate) error_message: Option<String>,
    pub(crate) running: bool,
    pub(crate) created_at: String,
    pub(crate) completed_at: Option<String>,
}

impl BatchResponse {
    pub(crate) fn new(batch: BatchJob, running: bool) -> Self {
        Self {
            id: batch.id,
            exam_id: batch.exam_id,
            status: batch.status,
            total_students: batch.total_students,
            successful: batch.successful,
            failed: batch.failed,
            error_message: batch.error_message,
            running,
            created_at: format_primitive(batch.created_at),
            completed_at: format_optional(batch.completed_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct BatchEntryResponse {
    pub(crate) student_id: String,
    pub(crate) status: EntryStatus,
    pub(crate) page_count: usize,
    pub(crate) submission_id: Option<String>,
    pub(crate) total_score: Option<f64>,
    pub(crate) error_message: Option<String>,
    pub(crate) processed_at: Option<String>,
}

impl From<BatchEntry> for BatchEntryResponse {
    fn from(entry: BatchEntry) -> Self {
        Self {
            student_id: entry.student_id,
            status: entry.status,
            page_count: entry.page_paths.len(),
            submission_id: entry.submission_id,
            total_score: entry.total_score,
            error_message: entry.error_message,
            processed_at: format_optional(entry.processed_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct BatchStatusResponse {
    #[serde(flatten)]
    pub(crate) batch: BatchResponse,
    pub(crate) entries: Vec<BatchEntryResponse>,
}

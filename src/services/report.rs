use std::collections::HashMap;

use serde::Serialize;

use crate::db::models::{BatchCounts, BatchEntry, BatchJob};
use crate::db::types::{BatchStatus, EntryStatus};

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ScoreStatistics {
    pub(crate) average_score: f64,
    pub(crate) highest_score: f64,
    pub(crate) lowest_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct FailedStudent {
    pub(crate) student_id: String,
    pub(crate) error: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct BatchReport {
    pub(crate) batch_id: String,
    pub(crate) exam_id: String,
    pub(crate) status: BatchStatus,
    pub(crate) total: usize,
    pub(crate) successful: usize,
    pub(crate) failed: usize,
    pub(crate) pending: usize,
    pub(crate) success_rate: f64,
    pub(crate) statistics: Option<ScoreStatistics>,
    pub(crate) failed_students: Vec<FailedStudent>,
}

/// Reduces entries into the batch report. `effective_totals` maps student id to the current
/// total (teacher overrides applied); graded students without one fall back to the entry total.
pub(crate) fn build_report(
    batch: &BatchJob,
    entries: &[BatchEntry],
    effective_totals: &HashMap<String, f64>,
) -> BatchReport {
    let counts = BatchCounts::from_entries(entries);

    let scores: Vec<f64> = entries
        .iter()
        .filter(|entry| entry.status == EntryStatus::Graded)
        .filter_map(|entry| {
            effective_totals.get(&entry.student_id).copied().or(entry.total_score)
        })
        .collect();

    let statistics = (!scores.is_empty()).then(|| ScoreStatistics {
        average_score: round2(scores.iter().sum::<f64>() / scores.len() as f64),
        highest_score: scores.iter().copied().fold(f64::MIN, f64::max),
        lowest_score: scores.iter().copied().fold(f64::MAX, f64::min),
    });

    let failed_students = entries
        .iter()
        .filter(|entry| entry.status == EntryStatus::Failed)
        .map(|entry| FailedStudent {
            student_id: entry.student_id.clone(),
            error: entry.error_message.clone().unwrap_or_else(|| "unknown error".to_string()),
        })
        .collect();

    let success_rate = if counts.total == 0 {
        0.0
    } else {
        round2(counts.successful as f64 / counts.total as f64 * 100.0)
    };

    BatchReport {
        batch_id: batch.id.clone(),
        exam_id: batch.exam_id.clone(),
        status: batch.status,
        total: counts.total,
        successful: counts.successful,
        failed: counts.failed,
        pending: counts.total - counts.successful - counts.failed,
        success_rate,
        statistics,
        failed_students,
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

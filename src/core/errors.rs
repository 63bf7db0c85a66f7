//! Error taxonomy shared by the grading pipeline.
//!
//! `ExtractionError` and `JudgmentError` are contained at the per-student and
//! per-question boundary respectively; `ValidationError` is raised while an exam
//! is being configured; `PersistenceError` is surfaced to the caller unchanged.

use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum ExtractionError {
    #[error("failed to read page {page}: {reason}")]
    PageUnreadable { page: String, reason: String },
    #[error("OCR call failed for page {page}: {reason}")]
    Call { page: String, reason: String },
    #[error("OCR returned no parseable answers for page {page}")]
    Unparseable { page: String },
    #[error("OCR call timed out for page {page} after {seconds}s")]
    Timeout { page: String, seconds: u64 },
    #[error("submission has no pages to extract")]
    NoPages,
}

#[derive(Debug, Error)]
pub(crate) enum JudgmentError {
    #[error("judgment call failed: {0}")]
    Call(String),
    #[error("judgment call timed out after {0}s")]
    Timeout(u64),
    #[error("unparseable judgment: {0}")]
    Unparseable(String),
    #[error("score {score} outside [0, {max}]")]
    OutOfBounds { score: f64, max: f64 },
    #[error("criterion '{0}' missing from judgment breakdown")]
    MissingCriterion(String),
    #[error("criterion '{name}' scored {value}, expected a fraction in [0, 1]")]
    CriterionOutOfBounds { name: String, value: f64 },
    #[error("reported total {reported} does not reconcile with breakdown sum {computed}")]
    Unreconciled { reported: f64, computed: f64 },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub(crate) enum ValidationError {
    #[error("exam must contain at least one question")]
    EmptyExam,
    #[error("exam name must not be empty")]
    EmptyExamName,
    #[error("question id must not be empty")]
    EmptyQuestionId,
    #[error("{question_id}: {message}")]
    Question { question_id: String, message: String },
    #[error("declared total marks {declared} does not equal the sum of question marks {computed}")]
    TotalMarksMismatch { declared: f64, computed: f64 },
    #[error("{question_id}: score {score} must lie within [0, {max}]")]
    ScoreOutOfRange { question_id: String, score: f64, max: f64 },
    #[error("{0}")]
    Invalid(String),
}

impl ValidationError {
    pub(crate) fn question(question_id: &str, message: impl Into<String>) -> Self {
        Self::Question { question_id: question_id.to_string(), message: message.into() }
    }
}

#[derive(Debug, Error)]
pub(crate) enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode record: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("page store error: {0}")]
    Io(#[from] std::io::Error),
}

impl PersistenceError {
    pub(crate) fn not_found(entity: &'static str, id: &str) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }
}

/// Errors surfaced by the grading entry points (single paper, batch, edits).
#[derive(Debug, Error)]
pub(crate) enum GradingError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    InvalidState(String),
}

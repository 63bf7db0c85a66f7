use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::db::types::{BatchStatus, EntryStatus, QuestionType, SubmissionStatus};

/// Named, weighted sub-component of a question's grading scheme. Weights are percentages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct RubricCriterion {
    pub(crate) name: String,
    pub(crate) weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) description: Option<String>,
}

impl RubricCriterion {
    pub(crate) fn new(name: &str, weight: f64) -> Self {
        Self { name: name.to_string(), weight, description: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TestCase {
    pub(crate) input: String,
    pub(crate) expected_output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum GroundTruth {
    #[serde(alias = "mcq")]
    MultipleChoice {
        correct_answer: String,
    },
    #[serde(alias = "fill_in_the_blank")]
    FillInBlank {
        correct_answers: Vec<String>,
    },
    Descriptive {
        model_answer: String,
        #[serde(default)]
        key_concepts: Vec<String>,
    },
    #[serde(alias = "sequence")]
    Ordering {
        correct_sequence: Vec<String>,
    },
    Programming {
        #[serde(default)]
        expected_output: String,
        #[serde(default)]
        test_cases: Vec<TestCase>,
    },
    Mathematical {
        correct_answer: String,
        #[serde(default)]
        solution_steps: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tolerance: Option<f64>,
    },
}

impl GroundTruth {
    pub(crate) fn question_type(&self) -> QuestionType {
        match self {
            Self::MultipleChoice { .. } => QuestionType::MultipleChoice,
            Self::FillInBlank { .. } => QuestionType::FillInBlank,
            Self::Descriptive { .. } => QuestionType::Descriptive,
            Self::Ordering { .. } => QuestionType::Ordering,
            Self::Programming { .. } => QuestionType::Programming,
            Self::Mathematical { .. } => QuestionType::Mathematical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct QuestionSpec {
    pub(crate) id: String,
    pub(crate) max_marks: f64,
    #[serde(default)]
    pub(crate) question_text: String,
    pub(crate) ground_truth: GroundTruth,
    #[serde(default)]
    pub(crate) criteria: Vec<RubricCriterion>,
}

impl QuestionSpec {
    pub(crate) fn question_type(&self) -> QuestionType {
        self.ground_truth.question_type()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Exam {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) total_marks: f64,
    pub(crate) questions: Json<Vec<QuestionSpec>>,
    pub(crate) created_at: PrimitiveDateTime,
}

impl Exam {
    pub(crate) fn question(&self, question_id: &str) -> Option<&QuestionSpec> {
        self.questions.iter().find(|question| question.id == question_id)
    }

    pub(crate) fn question_ids(&self) -> Vec<String> {
        self.questions.iter().map(|question| question.id.clone()).collect()
    }
}

/// Comparison of extracted keys against the exam's expected question ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct ExtractionReport {
    pub(crate) expected: usize,
    pub(crate) answered: usize,
    pub(crate) missing: Vec<String>,
    pub(crate) empty: Vec<String>,
    pub(crate) extra: Vec<String>,
    pub(crate) match_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Submission {
    pub(crate) id: String,
    pub(crate) exam_id: String,
    pub(crate) student_id: String,
    pub(crate) page_paths: Json<Vec<String>>,
    pub(crate) extracted_answers: Json<BTreeMap<String, String>>,
    pub(crate) extraction_report: Option<Json<ExtractionReport>>,
    pub(crate) status: SubmissionStatus,
    pub(crate) total_score: Option<f64>,
    pub(crate) total_max: f64,
    pub(crate) error_message: Option<String>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) graded_at: Option<PrimitiveDateTime>,
}

impl Submission {
    pub(crate) fn new(
        exam: &Exam,
        student_id: &str,
        page_paths: Vec<String>,
        now: PrimitiveDateTime,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            exam_id: exam.id.clone(),
            student_id: student_id.to_string(),
            page_paths: Json(page_paths),
            extracted_answers: Json(BTreeMap::new()),
            extraction_report: None,
            status: SubmissionStatus::Uploaded,
            total_score: None,
            total_max: exam.total_marks,
            error_message: None,
            created_at: now,
            graded_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct CriterionScore {
    pub(crate) name: String,
    pub(crate) weight: f64,
    /// Portion of the criterion earned, in [0, 1].
    pub(crate) fraction: f64,
    /// `fraction * weight / 100 * max_marks`.
    pub(crate) contribution: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) feedback: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum Breakdown {
    Choice {
        expected: String,
        selected: Option<String>,
        correct: bool,
    },
    Blank {
        accepted: Vec<String>,
        submitted: String,
        correct: bool,
    },
    Criteria {
        criteria: Vec<CriterionScore>,
    },
    Sequence {
        expected: Vec<String>,
        submitted: Vec<String>,
        matching_positions: usize,
        total_positions: usize,
    },
    Unanswered,
    Failed {
        cause: String,
    },
}

impl Breakdown {
    #[cfg(test)]
    pub(crate) fn contribution_sum(&self) -> Option<f64> {
        match self {
            Self::Criteria { criteria } => {
                Some(criteria.iter().map(|criterion| criterion.contribution).sum())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TeacherOverride {
    pub(crate) score: f64,
    #[serde(default)]
    pub(crate) comment: Option<String>,
    pub(crate) overridden_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct GradingResult {
    pub(crate) submission_id: String,
    pub(crate) question_id: String,
    pub(crate) position: i32,
    pub(crate) question_type: QuestionType,
    pub(crate) max_marks: f64,
    pub(crate) ai_score: f64,
    pub(crate) reasoning: String,
    pub(crate) breakdown: Json<Breakdown>,
    pub(crate) teacher_override: Option<Json<TeacherOverride>>,
    pub(crate) graded_at: PrimitiveDateTime,
}

impl GradingResult {
    pub(crate) fn effective_score(&self) -> f64 {
        match &self.teacher_override {
            Some(item) => item.score,
            None => self.ai_score,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct GradeEdit {
    pub(crate) id: String,
    pub(crate) submission_id: String,
    pub(crate) question_id: String,
    pub(crate) previous_score: f64,
    pub(crate) new_score: f64,
    pub(crate) comment: Option<String>,
    pub(crate) edited_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct BatchJob {
    pub(crate) id: String,
    pub(crate) exam_id: String,
    pub(crate) status: BatchStatus,
    pub(crate) total_students: i32,
    pub(crate) successful: i32,
    pub(crate) failed: i32,
    pub(crate) error_message: Option<String>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) completed_at: Option<PrimitiveDateTime>,
}

impl BatchJob {
    pub(crate) fn apply_counts(&mut self, counts: BatchCounts) {
        self.total_students = counts.total as i32;
        self.successful = counts.successful as i32;
        self.failed = counts.failed as i32;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct BatchEntry {
    pub(crate) batch_id: String,
    pub(crate) student_id: String,
    pub(crate) position: i32,
    pub(crate) page_paths: Json<Vec<String>>,
    pub(crate) submission_id: Option<String>,
    pub(crate) status: EntryStatus,
    pub(crate) total_score: Option<f64>,
    pub(crate) error_message: Option<String>,
    pub(crate) processed_at: Option<PrimitiveDateTime>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct BatchCounts {
    pub(crate) total: usize,
    pub(crate) successful: usize,
    pub(crate) failed: usize,
}

impl BatchCounts {
    pub(crate) fn from_entries(entries: &[BatchEntry]) -> Self {
        entries.iter().fold(Self { total: entries.len(), ..Self::default() }, |mut acc, entry| {
            match entry.status {
                EntryStatus::Graded => acc.successful += 1,
                EntryStatus::Failed => acc.failed += 1,
                _ => {}
            }
            acc
        })
    }
}

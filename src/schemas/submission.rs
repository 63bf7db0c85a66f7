use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::{format_optional, format_primitive};
use crate::db::models::{
    Breakdown, ExtractionReport, GradeEdit, GradingResult, Submission, TeacherOverride,
};
use crate::db::types::{QuestionType, SubmissionStatus};

#[derive(Debug, Serialize)]
pub(crate) struct SubmissionResponse {
    pub(crate) id: String,
    pub(crate) exam_id: String,
    pub(crate) student_id: String,
    pub(crate) status: SubmissionStatus,
    pub(crate) page_count: usize,
    pub(crate) extracted_answers: BTreeMap<String, String>,
    pub(crate) extraction_report: Option<ExtractionReport>,
    pub(crate) total_score: Option<f64>,
    pub(crate) total_max: f64,
    pub(crate) percentage: Option<f64>,
    pub(crate) error_message: Option<String>,
    pub(crate) created_at: String,
    pub(crate) graded_at: Option<String>,
}

impl From<Submission> for SubmissionResponse {
    fn from(submission: Submission) -> Self {
        let percentage = submission
            .total_score
            .filter(|_| submission.total_max > 0.0)
            .map(|score| crate::services::report::round2(score / submission.total_max * 100.0));
        Self {
            id: submission.id,
            exam_id: submission.exam_id,
            student_id: submission.student_id,
            status: submission.status,
            page_count: submission.page_paths.len(),
            extracted_answers: submission.extracted_answers.0,
            extraction_report: submission.extraction_report.map(|report| report.0),
            total_score: submission.total_score,
            total_max: submission.total_max,
            percentage,
            error_message: submission.error_message,
            created_at: format_primitive(submission.created_at),
            graded_at: format_optional(submission.graded_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct OverrideResponse {
    pub(crate) score: f64,
    pub(crate) comment: Option<String>,
    pub(crate) overridden_at: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct GradingResultResponse {
    pub(crate) question_id: String,
    pub(crate) question_type: QuestionType,
    pub(crate) max_marks: f64,
    pub(crate) ai_score: f64,
    pub(crate) effective_score: f64,
    pub(crate) reasoning: String,
    pub(crate) breakdown: Breakdown,
    pub(crate) teacher_override: Option<OverrideResponse>,
    pub(crate) graded_at: String,
}

impl From<GradingResult> for GradingResultResponse {
    fn from(result: GradingResult) -> Self {
        let effective_score = result.effective_score();
        Self {
            question_id: result.question_id,
            question_type: result.question_type,
            max_marks: result.max_marks,
            ai_score: result.ai_score,
            effective_score,
            reasoning: result.reasoning,
            breakdown: result.breakdown.0,
            teacher_override: result.teacher_override.map(|item| {
                let TeacherOverride { score, comment, overridden_at } = item.0;
                OverrideResponse { score, comment, overridden_at: format_primitive(overridden_at) }
            }),
            graded_at: format_primitive(result.graded_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct SubmissionDetailResponse {
    #[serde(flatten)]
    pub(crate) submission: SubmissionResponse,
    pub(crate) results: Vec<GradingResultResponse>,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct GradeEditRequest {
    pub(crate) score: f64,
    #[serde(default)]
    #[validate(length(max = 2000, message = "comment must be at most 2000 characters"))]
    pub(crate) comment: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct GradeEditResponse {
    pub(crate) id: String,
    pub(crate) question_id: String,
    pub(crate) previous_score: f64,
    pub(crate) new_score: f64,
    pub(crate) comment: Option<String>,
    pub(crate) edited_at: String,
}

impl From<GradeEdit> for GradeEditResponse {
    fn from(edit: GradeEdit) -> Self {
        Self {
            id: edit.id,
            question_id: edit.question_id,
            previous_score: edit.previous_score,
            new_score: edit.new_score,
            comment: edit.comment,
            edited_at: format_primitive(edit.edited_at),
        }
    }
}

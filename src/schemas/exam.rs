use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use time::PrimitiveDateTime;
use validator::Validate;

use crate::core::errors::ValidationError;
use crate::core::time::format_primitive;
use crate::db::models::{Exam, GroundTruth, QuestionSpec, RubricCriterion};
use crate::services::rubric::criteria::{default_criteria, validate_criteria};

const MARKS_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub(crate) struct CriterionPayload {
    #[validate(length(min = 1, message = "criterion name must not be empty"))]
    pub(crate) name: String,
    pub(crate) weight: f64,
    #[serde(default)]
    pub(crate) description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub(crate) struct QuestionPayload {
    pub(crate) id: String,
    #[serde(alias = "maxMarks", alias = "marks")]
    pub(crate) max_marks: f64,
    #[serde(default, alias = "questionText")]
    pub(crate) question_text: String,
    #[serde(alias = "groundTruth")]
    pub(crate) ground_truth: GroundTruth,
    #[serde(default, alias = "rubricCriteria")]
    #[validate(nested)]
    pub(crate) criteria: Vec<CriterionPayload>,
}

/// Answer-key upload. Questions keep their upload order.
#[derive(Debug, Serialize, Deserialize, Validate)]
pub(crate) struct ExamCreate {
    #[serde(default)]
    pub(crate) id: Option<String>,
    #[validate(length(max = 200, message = "name must be at most 200 characters"))]
    pub(crate) name: String,
    #[serde(default, alias = "totalMarks")]
    pub(crate) total_marks: Option<f64>,
    #[validate(nested)]
    pub(crate) questions: Vec<QuestionPayload>,
}

/// An answer key read from images, ready to be reviewed and posted back as an [`ExamCreate`].
#[derive(Debug, Serialize)]
pub(crate) struct ExamDraftResponse {
    pub(crate) exam: ExamCreate,
    pub(crate) warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ExamResponse {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) total_marks: f64,
    pub(crate) question_count: usize,
    pub(crate) questions: Vec<QuestionSpec>,
    pub(crate) created_at: String,
}

impl From<Exam> for ExamResponse {
    fn from(exam: Exam) -> Self {
        Self {
            id: exam.id,
            name: exam.name,
            total_marks: exam.total_marks,
            question_count: exam.questions.len(),
            questions: exam.questions.0,
            created_at: format_primitive(exam.created_at),
        }
    }
}

/// Turns an answer-key payload into an exam, rejecting malformed ground truth with the
/// offending question id.
pub(crate) fn build_exam(payload: ExamCreate, now: PrimitiveDateTime) -> Result<Exam, ValidationError> {
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(ValidationError::EmptyExamName);
    }
    if payload.questions.is_empty() {
        return Err(ValidationError::EmptyExam);
    }

    let mut seen = HashSet::new();
    let mut questions = Vec::with_capacity(payload.questions.len());
    for item in payload.questions {
        let question = build_question(item)?;
        if !seen.insert(question.id.clone()) {
            return Err(ValidationError::question(&question.id, "duplicate question id"));
        }
        questions.push(question);
    }

    let computed: f64 = questions.iter().map(|question| question.max_marks).sum();
    if let Some(declared) = payload.total_marks {
        if !declared.is_finite() || (declared - computed).abs() > MARKS_TOLERANCE {
            return Err(ValidationError::TotalMarksMismatch { declared, computed });
        }
    }

    let id = payload
        .id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    Ok(Exam { id, name, total_marks: computed, questions: Json(questions), created_at: now })
}

fn build_question(payload: QuestionPayload) -> Result<QuestionSpec, ValidationError> {
    let id = payload.id.trim().to_string();
    if id.is_empty() {
        return Err(ValidationError::EmptyQuestionId);
    }
    if !payload.max_marks.is_finite() || payload.max_marks <= 0.0 {
        return Err(ValidationError::question(
            &id,
            format!("max_marks must be positive, got {}", payload.max_marks),
        ));
    }
    validate_ground_truth(&id, &payload.ground_truth)?;

    let question_type = payload.ground_truth.question_type();
    let criteria: Vec<RubricCriterion> = payload
        .criteria
        .into_iter()
        .map(|criterion| RubricCriterion {
            name: criterion.name.trim().to_string(),
            weight: criterion.weight,
            description: criterion.description,
        })
        .collect();

    let criteria = if question_type.uses_criteria() {
        if criteria.is_empty() {
            default_criteria(question_type)
        } else {
            validate_criteria(&id, &criteria)?;
            criteria
        }
    } else if criteria.is_empty() {
        criteria
    } else {
        return Err(ValidationError::question(
            &id,
            format!("rubric criteria are not used by {} questions", question_type.as_str()),
        ));
    };

    Ok(QuestionSpec {
        id,
        max_marks: payload.max_marks,
        question_text: payload.question_text,
        ground_truth: payload.ground_truth,
        criteria,
    })
}

pub(crate) fn validate_ground_truth(id: &str, ground_truth: &GroundTruth) -> Result<(), ValidationError> {
    let blank = |value: &str| value.trim().is_empty();

    match ground_truth {
        GroundTruth::MultipleChoice { correct_answer } if blank(correct_answer) => {
            Err(ValidationError::question(id, "correct_answer must not be empty"))
        }
        GroundTruth::FillInBlank { correct_answers }
            if correct_answers.is_empty() || correct_answers.iter().any(|answer| blank(answer)) =>
        {
            Err(ValidationError::question(id, "correct_answers must list non-empty answers"))
        }
        GroundTruth::Descriptive { model_answer, .. } if blank(model_answer) => {
            Err(ValidationError::question(id, "model_answer must not be empty"))
        }
        GroundTruth::Ordering { correct_sequence }
            if correct_sequence.is_empty() || correct_sequence.iter().any(|item| blank(item)) =>
        {
            Err(ValidationError::question(id, "correct_sequence must be a non-empty list"))
        }
        GroundTruth::Programming { expected_output, test_cases }
            if blank(expected_output) && test_cases.is_empty() =>
        {
            Err(ValidationError::question(id, "expected_output or test_cases is required"))
        }
        GroundTruth::Mathematical { correct_answer, .. } if blank(correct_answer) => {
            Err(ValidationError::question(id, "correct_answer must not be empty"))
        }
        GroundTruth::Mathematical { tolerance: Some(tolerance), .. }
            if !tolerance.is_finite() || *tolerance < 0.0 =>
        {
            Err(ValidationError::question(id, "tolerance must be a non-negative number"))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::primitive_now_utc;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> ExamCreate {
        serde_json::from_value(value).expect("payload")
    }

    fn descriptive(weights: &[f64]) -> serde_json::Value {
        let criteria: Vec<_> = weights
            .iter()
            .enumerate()
            .map(|(index, weight)| json!({"name": format!("C{index}"), "weight": weight}))
            .collect();
        json!({
            "name": "Physics",
            "questions": [{
                "id": "Q1",
                "max_marks": 5,
                "ground_truth": {"type": "descriptive", "model_answer": "F = ma"},
                "criteria": criteria
            }]
        })
    }

    #[test]
    fn fills_default_criteria_and_totals() {
        let exam = build_exam(
            payload(json!({
                "name": "Mixed",
                "total_marks": 7,
                "questions": [
                    {"id": "Q1", "max_marks": 2, "ground_truth": {"type": "mcq", "correct_answer": "B"}},
                    {"id": "Q2", "max_marks": 5, "ground_truth": {"type": "mathematical", "correct_answer": "42"}}
                ]
            })),
            primitive_now_utc(),
        )
        .expect("valid");

        assert_eq!(exam.total_marks, 7.0);
        assert_eq!(exam.question_ids(), vec!["Q1".to_string(), "Q2".to_string()]);
        assert!(exam.questions[0].criteria.is_empty());
        assert_eq!(exam.questions[1].criteria.len(), 4);
    }

    #[test]
    fn rejects_zero_marks_with_question_id() {
        let err = build_exam(
            payload(json!({
                "name": "Bad",
                "questions": [{"id": "Q7", "max_marks": 0, "ground_truth": {"type": "multiple_choice", "correct_answer": "A"}}]
            })),
            primitive_now_utc(),
        )
        .expect_err("zero marks");
        assert!(err.to_string().starts_with("Q7: "));
    }

    #[test]
    fn rejects_weights_off_by_one() {
        for weights in [[50.0, 49.0], [50.0, 51.0]] {
            let err = build_exam(payload(descriptive(&weights)), primitive_now_utc())
                .expect_err("weights must sum to 100");
            assert!(matches!(err, ValidationError::Question { ref question_id, .. } if question_id == "Q1"));
        }
        assert!(build_exam(payload(descriptive(&[60.0, 40.0])), primitive_now_utc()).is_ok());
    }

    #[test]
    fn rejects_structural_problems() {
        let empty = build_exam(payload(json!({"name": "X", "questions": []})), primitive_now_utc());
        assert_eq!(empty.expect_err("empty"), ValidationError::EmptyExam);

        let mismatch = build_exam(
            payload(json!({
                "name": "X",
                "total_marks": 10,
                "questions": [{"id": "Q1", "max_marks": 2, "ground_truth": {"type": "ordering", "correct_sequence": ["a", "b"]}}]
            })),
            primitive_now_utc(),
        );
        assert!(matches!(mismatch, Err(ValidationError::TotalMarksMismatch { .. })));

        let duplicate = build_exam(
            payload(json!({
                "name": "X",
                "questions": [
                    {"id": "Q1", "max_marks": 1, "ground_truth": {"type": "multiple_choice", "correct_answer": "A"}},
                    {"id": "Q1", "max_marks": 1, "ground_truth": {"type": "multiple_choice", "correct_answer": "B"}}
                ]
            })),
            primitive_now_utc(),
        );
        assert!(duplicate.is_err());

        let stray_criteria = build_exam(
            payload(json!({
                "name": "X",
                "questions": [{
                    "id": "Q1", "max_marks": 1,
                    "ground_truth": {"type": "fill_in_blank", "correct_answers": ["x"]},
                    "criteria": [{"name": "Accuracy", "weight": 100}]
                }]
            })),
            primitive_now_utc(),
        );
        assert!(stray_criteria.is_err());

        let empty_sequence = build_exam(
            payload(json!({
                "name": "X",
                "questions": [{"id": "Q3", "max_marks": 1, "ground_truth": {"type": "ordering", "correct_sequence": []}}]
            })),
            primitive_now_utc(),
        );
        assert!(empty_sequence.expect_err("empty").to_string().starts_with("Q3: "));
    }
}

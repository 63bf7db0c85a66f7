//! Turns what the vision model read off answer-key pages into a reviewable exam draft.

use serde_json::{Map, Value};

use crate::db::models::GroundTruth;
use crate::db::types::QuestionType;
use crate::schemas::exam::{validate_ground_truth, ExamCreate, QuestionPayload};

const SCALAR_FIELDS: &[&str] = &["correct_answer", "model_answer", "expected_output"];
const LIST_FIELDS: &[&str] = &["correct_answers", "correct_sequence", "key_concepts", "solution_steps"];

/// Builds a draft exam from per-question descriptions. Questions that cannot be turned into
/// a valid answer key are left out and reported as warnings.
pub(crate) fn draft_exam(name: &str, raw: &Map<String, Value>) -> (ExamCreate, Vec<String>) {
    let mut questions = Vec::with_capacity(raw.len());
    let mut warnings = Vec::new();

    for (id, entry) in raw {
        match draft_question(id, entry) {
            Ok(question) => questions.push(question),
            Err(reason) => warnings.push(reason),
        }
    }

    let total_marks = questions.iter().map(|question| question.max_marks).sum();
    let draft = ExamCreate {
        id: None,
        name: name.trim().to_string(),
        total_marks: Some(total_marks),
        questions,
    };
    (draft, warnings)
}

fn draft_question(id: &str, entry: &Value) -> Result<QuestionPayload, String> {
    let Some(entry) = entry.as_object() else {
        return Err(format!("{id}: not a question description"));
    };
    let max_marks = parse_marks(entry).ok_or_else(|| format!("{id}: marks missing or not positive"))?;
    let question_text = ["question_text", "questionText"]
        .iter()
        .find_map(|key| entry.get(*key).and_then(Value::as_str))
        .unwrap_or_default()
        .trim()
        .to_string();

    // Some replies put the ground-truth fields next to `type` and `marks`.
    let mut truth = match entry.get("ground_truth").or_else(|| entry.get("groundTruth")) {
        Some(Value::Object(inner)) => inner.clone(),
        _ => entry.clone(),
    };
    truth.remove("type");
    stringify_scalars(&mut truth);

    let declared = entry
        .get("type")
        .and_then(Value::as_str)
        .and_then(|name| serde_json::from_value(Value::String(name.trim().to_lowercase())).ok());
    let question_type = declared.unwrap_or_else(|| detect_question_type(&question_text, &truth));
    adapt_to_type(question_type, &mut truth);
    truth.insert("type".to_string(), Value::String(question_type.as_str().to_string()));

    let ground_truth: GroundTruth = serde_json::from_value(Value::Object(truth))
        .map_err(|err| format!("{id}: unusable {} answer key ({err})", question_type.as_str()))?;
    validate_ground_truth(id, &ground_truth).map_err(|err| err.to_string())?;

    Ok(QuestionPayload {
        id: id.to_string(),
        max_marks,
        question_text,
        ground_truth,
        criteria: Vec::new(),
    })
}

/// Guesses the type from the ground-truth fields first, then from the wording of the
/// question. Anything unrecognised is descriptive.
pub(crate) fn detect_question_type(question_text: &str, ground_truth: &Map<String, Value>) -> QuestionType {
    let single_letter = ground_truth
        .get("correct_answer")
        .and_then(Value::as_str)
        .map(str::trim)
        .is_some_and(|answer| {
            let mut chars = answer.chars();
            matches!((chars.next(), chars.next()), (Some(ch), None) if ('A'..='H').contains(&ch.to_ascii_uppercase()))
        });
    if single_letter {
        return QuestionType::MultipleChoice;
    }
    if ground_truth.contains_key("correct_sequence") {
        return QuestionType::Ordering;
    }
    if ground_truth.contains_key("correct_answers") {
        return QuestionType::FillInBlank;
    }
    if ground_truth.contains_key("test_cases") || ground_truth.contains_key("expected_output") {
        return QuestionType::Programming;
    }
    if ground_truth.contains_key("solution_steps") {
        return QuestionType::Mathematical;
    }

    let text = question_text.to_lowercase();
    let mentions = |words: &[&str]| words.iter().any(|word| text.contains(word));
    if mentions(&["arrange", "order", "sequence"]) {
        QuestionType::Ordering
    } else if mentions(&["explain", "describe", "discuss", "define"]) {
        QuestionType::Descriptive
    } else if mentions(&["calculate", "compute", "solve"]) {
        QuestionType::Mathematical
    } else {
        QuestionType::Descriptive
    }
}

fn parse_marks(entry: &Map<String, Value>) -> Option<f64> {
    let value = ["marks", "max_marks", "maxMarks"].iter().find_map(|key| entry.get(*key))?;
    let marks = match value {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => text.trim().parse().ok()?,
        _ => return None,
    };
    (marks.is_finite() && marks > 0.0).then_some(marks)
}

/// Numbers become strings so `"42"` and `42` read the same.
fn stringify_scalars(truth: &mut Map<String, Value>) {
    for key in SCALAR_FIELDS {
        if let Some(Value::Number(number)) = truth.get(*key) {
            let text = number.to_string();
            truth.insert((*key).to_string(), Value::String(text));
        }
    }
    for key in LIST_FIELDS {
        if let Some(Value::Array(items)) = truth.get_mut(*key) {
            for item in items.iter_mut() {
                if let Value::Number(number) = item {
                    *item = Value::String(number.to_string());
                }
            }
        }
    }
}

/// Moves a lone `correct_answer` into the field the chosen type expects.
fn adapt_to_type(question_type: QuestionType, truth: &mut Map<String, Value>) {
    let answer = truth.get("correct_answer").cloned();
    match (question_type, answer) {
        (QuestionType::MultipleChoice, Some(Value::String(letter))) => {
            truth.insert("correct_answer".to_string(), Value::String(letter.trim().to_uppercase()));
        }
        (QuestionType::Descriptive, Some(answer)) if !truth.contains_key("model_answer") => {
            truth.insert("model_answer".to_string(), answer);
        }
        (QuestionType::FillInBlank, Some(answer)) if !truth.contains_key("correct_answers") => {
            truth.insert("correct_answers".to_string(), Value::Array(vec![answer]));
        }
        _ => {}
    }
    if let Some(Value::String(single)) = truth.get("correct_answers").cloned() {
        truth.insert("correct_answers".to_string(), Value::Array(vec![Value::String(single)]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn detects_type_from_fields_then_wording() {
        let letter = object(json!({"correct_answer": "c"}));
        assert_eq!(detect_question_type("Pick one", &letter), QuestionType::MultipleChoice);

        let sequence = object(json!({"correct_sequence": ["B", "A"]}));
        assert_eq!(detect_question_type("", &sequence), QuestionType::Ordering);

        let answer = object(json!({"correct_answer": "42"}));
        assert_eq!(detect_question_type("Calculate the area", &answer), QuestionType::Mathematical);
        assert_eq!(detect_question_type("Explain osmosis", &answer), QuestionType::Descriptive);
        assert_eq!(detect_question_type("Arrange the steps", &Map::new()), QuestionType::Ordering);
        assert_eq!(detect_question_type("What is it?", &answer), QuestionType::Descriptive);
    }

    #[test]
    fn drafts_declared_and_detected_questions() {
        let raw = object(json!({
            "Q1": {"type": "MCQ", "marks": 2, "question_text": "Which gas?", "ground_truth": {"correct_answer": "b"}},
            "Q2": {"marks": "3", "question_text": "Solve for x", "ground_truth": {"correct_answer": 4, "solution_steps": ["2x = 8"]}},
            "Q3": {"type": "fill_in_the_blank", "marks": 1, "correct_answer": "mitochondria"}
        }));

        let (draft, warnings) = draft_exam(" Chemistry ", &raw);
        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(draft.name, "Chemistry");
        assert_eq!(draft.total_marks, Some(6.0));
        assert_eq!(
            draft.questions[0].ground_truth,
            GroundTruth::MultipleChoice { correct_answer: "B".into() }
        );
        assert!(matches!(
            &draft.questions[1].ground_truth,
            GroundTruth::Mathematical { correct_answer, .. } if correct_answer == "4"
        ));
        assert_eq!(
            draft.questions[2].ground_truth,
            GroundTruth::FillInBlank { correct_answers: vec!["mitochondria".into()] }
        );
    }

    #[test]
    fn unusable_questions_become_warnings() {
        let raw = object(json!({
            "Q1": {"type": "ordering", "marks": 2, "ground_truth": {}},
            "Q2": {"type": "mcq", "ground_truth": {"correct_answer": "A"}},
            "Q3": {"type": "descriptive", "marks": 4, "ground_truth": {"model_answer": "Light to energy"}}
        }));

        let (draft, warnings) = draft_exam("Biology", &raw);
        assert_eq!(draft.questions.len(), 1);
        assert_eq!(draft.questions[0].id, "Q3");
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].starts_with("Q1: "));
        assert_eq!(warnings[1], "Q2: marks missing or not positive");
    }
}

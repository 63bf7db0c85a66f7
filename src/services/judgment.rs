use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::errors::JudgmentError;
use crate::db::models::RubricCriterion;
use crate::db::types::QuestionType;
use crate::services::llm_client::{LlmClient, LlmError};

const JUDGE_SYSTEM_PROMPT: &str = "You are an experienced exam grader. You receive a question, \
its reference answer, the student's answer and preprocessing evidence. Grade strictly against \
the reference and reply with ONLY the JSON object requested.";

/// What the judge is asked to decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum JudgmentMode {
    /// A single correct/incorrect decision.
    Equivalence,
    /// A fraction in [0, 1] for every named criterion.
    Criteria,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct JudgmentRequest {
    pub(crate) question_id: String,
    pub(crate) question_type: QuestionType,
    pub(crate) question_text: String,
    pub(crate) max_marks: f64,
    pub(crate) ground_truth: Value,
    pub(crate) student_answer: String,
    pub(crate) criteria: Vec<RubricCriterion>,
    pub(crate) evidence: Value,
    pub(crate) instructions: String,
    pub(crate) mode: JudgmentMode,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub(crate) struct CriterionJudgment {
    pub(crate) name: String,
    pub(crate) fraction: f64,
    #[serde(default)]
    pub(crate) feedback: Option<String>,
}

/// Raw judge output. Nothing here is trusted until the rubric scorer has validated it.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Judgment {
    pub(crate) score: Option<f64>,
    pub(crate) reasoning: String,
    pub(crate) correct: Option<bool>,
    pub(crate) criteria: Vec<CriterionJudgment>,
    pub(crate) test_cases_passed: Option<u32>,
}

#[async_trait]
pub(crate) trait JudgmentCapability: Send + Sync {
    async fn judge(&self, request: &JudgmentRequest) -> Result<Judgment, JudgmentError>;
}

pub(crate) struct LlmJudge {
    client: LlmClient,
    model: String,
}

impl LlmJudge {
    pub(crate) fn new(client: LlmClient, model: String) -> Self {
        Self { client, model }
    }
}

#[async_trait]
impl JudgmentCapability for LlmJudge {
    async fn judge(&self, request: &JudgmentRequest) -> Result<Judgment, JudgmentError> {
        let messages = json!([
            {"role": "system", "content": JUDGE_SYSTEM_PROMPT},
            {"role": "user", "content": render_prompt(request)}
        ]);

        let reply = self.client.complete_json(&self.model, messages).await;
        let outcome = if reply.is_ok() { "ok" } else { "error" };
        metrics::counter!("judgment_calls_total", "status" => outcome).increment(1);

        let value = reply.map_err(|err| match err {
            LlmError::Timeout(seconds) => JudgmentError::Timeout(seconds),
            LlmError::Malformed(reason) => JudgmentError::Unparseable(reason),
            other => JudgmentError::Call(other.to_string()),
        })?;

        parse_judgment(&value)
    }
}

fn render_prompt(request: &JudgmentRequest) -> String {
    let schema = match request.mode {
        JudgmentMode::Equivalence => format!(
            "{{\"correct\": <true|false>, \"score\": <0 or {max}>, \"reasoning\": \"<why>\"}}",
            max = request.max_marks
        ),
        JudgmentMode::Criteria => {
            let names = request
                .criteria
                .iter()
                .map(|criterion| format!("\"{}\"", criterion.name))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "{{\"criteria\": [{{\"name\": <one of {names}>, \"score\": <fraction 0..1>, \
                 \"feedback\": \"<short>\"}}], \"score\": <total 0..{max}>, \
                 \"test_cases_passed\": <integer, programming only>, \"reasoning\": \"<why>\"}}",
                max = request.max_marks
            )
        }
    };

    let context = json!({
        "question_id": request.question_id,
        "question_type": request.question_type.as_str(),
        "question": request.question_text,
        "max_marks": request.max_marks,
        "reference": request.ground_truth,
        "rubric_criteria": request.criteria,
        "student_answer": request.student_answer,
        "evidence": request.evidence,
    });

    format!(
        "{instructions}\n\nContext:\n{context}\n\nRespond with JSON exactly like:\n{schema}",
        instructions = request.instructions,
        context = serde_json::to_string_pretty(&context).unwrap_or_default(),
    )
}

/// Reads the judge reply into a [`Judgment`], rejecting structurally broken replies.
pub(crate) fn parse_judgment(value: &Value) -> Result<Judgment, JudgmentError> {
    let object = value
        .as_object()
        .ok_or_else(|| JudgmentError::Unparseable("reply is not a JSON object".to_string()))?;

    let score = match object.get("score").or_else(|| object.get("total_score")) {
        None | Some(Value::Null) => None,
        Some(raw) => Some(number(raw).ok_or_else(|| {
            JudgmentError::Unparseable(format!("score is not a number: {raw}"))
        })?),
    };

    let reasoning = object
        .get("reasoning")
        .or_else(|| object.get("feedback"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let correct = match object.get("correct").or_else(|| object.get("is_correct")) {
        None | Some(Value::Null) => None,
        Some(Value::Bool(flag)) => Some(*flag),
        Some(raw) => {
            return Err(JudgmentError::Unparseable(format!("correct is not a boolean: {raw}")))
        }
    };

    let criteria = match object.get("criteria").or_else(|| object.get("breakdown")) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => {
            items.iter().map(parse_criterion).collect::<Result<Vec<_>, _>>()?
        }
        Some(Value::Object(map)) => map
            .iter()
            .map(|(name, raw)| {
                number(raw)
                    .map(|fraction| CriterionJudgment {
                        name: name.clone(),
                        fraction,
                        feedback: None,
                    })
                    .ok_or_else(|| {
                        JudgmentError::Unparseable(format!("criterion {name} is not a number"))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(raw) => {
            return Err(JudgmentError::Unparseable(format!("criteria has unexpected shape: {raw}")))
        }
    };

    let test_cases_passed =
        object.get("test_cases_passed").and_then(Value::as_f64).map(|value| value.max(0.0) as u32);

    Ok(Judgment { score, reasoning, correct, criteria, test_cases_passed })
}

fn parse_criterion(item: &Value) -> Result<CriterionJudgment, JudgmentError> {
    let name = item
        .get("name")
        .or_else(|| item.get("criterion"))
        .and_then(Value::as_str)
        .ok_or_else(|| JudgmentError::Unparseable("criterion without a name".to_string()))?;
    let fraction = item
        .get("score")
        .or_else(|| item.get("fraction"))
        .and_then(number)
        .ok_or_else(|| JudgmentError::Unparseable(format!("criterion {name} has no score")))?;
    let feedback = item.get("feedback").and_then(Value::as_str).map(str::to_string);
    Ok(CriterionJudgment { name: name.to_string(), fraction, feedback })
}

fn number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|value| value.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_judgment_reads_criteria_list() {
        let value = json!({
            "criteria": [
                {"name": "coverage", "score": 0.5, "feedback": "half"},
                {"name": "accuracy", "score": "1"}
            ],
            "score": 4.25,
            "reasoning": "ok"
        });
        let judgment = parse_judgment(&value).expect("judgment");
        assert_eq!(judgment.score, Some(4.25));
        assert_eq!(judgment.criteria.len(), 2);
        assert_eq!(judgment.criteria[1].fraction, 1.0);
        assert_eq!(judgment.criteria[0].feedback.as_deref(), Some("half"));
    }

    #[test]
    fn parse_judgment_accepts_criteria_map_and_flags() {
        let value = json!({"breakdown": {"logic": 0.2}, "correct": true, "test_cases_passed": 3});
        let judgment = parse_judgment(&value).expect("judgment");
        assert_eq!(judgment.correct, Some(true));
        assert_eq!(judgment.test_cases_passed, Some(3));
        assert_eq!(judgment.criteria[0].name, "logic");
        assert_eq!(judgment.score, None);
    }

    #[test]
    fn parse_judgment_rejects_garbage() {
        assert!(parse_judgment(&json!({"score": "lots"})).is_err());
        assert!(parse_judgment(&json!({"criteria": [{"score": 0.4}]})).is_err());
        assert!(parse_judgment(&json!({"correct": "maybe"})).is_err());
        assert!(parse_judgment(&json!("text")).is_err());
    }

    #[test]
    fn criteria_prompt_lists_names() {
        let request = JudgmentRequest {
            question_id: "Q2".to_string(),
            question_type: QuestionType::Descriptive,
            question_text: "Explain".to_string(),
            max_marks: 5.0,
            ground_truth: json!({"model_answer": "x"}),
            student_answer: "y".to_string(),
            criteria: vec![RubricCriterion::new("coverage", 60.0), RubricCriterion::new("clarity", 40.0)],
            evidence: json!({}),
            instructions: "Grade it".to_string(),
            mode: JudgmentMode::Criteria,
        };
        let prompt = render_prompt(&request);
        assert!(prompt.contains("\"coverage\", \"clarity\""));
        assert!(prompt.starts_with("Grade it"));
    }
}

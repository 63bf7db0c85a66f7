use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Map, Value};

use crate::core::errors::ExtractionError;
use crate::services::llm_client::{LlmClient, LlmError};
use crate::services::page_store::PageImage;

const OCR_PROMPT: &str = r#"You read handwritten and printed exam answer sheets.

Extract every answer the student wrote on this page:
- identify each question number (Q1, Q2, ...)
- for multiple-choice questions return the selected option letter
- for written answers return the full text exactly as written, without corrections
- if an answer is crossed out but still legible, extract it anyway

Return ONLY a JSON object of the form {"answers": {"Q1": "A", "Q2": "full text"}}."#;

const ANSWER_KEY_PROMPT: &str = r#"You read exam answer keys.

Extract every question on this page with:
- its number (Q1, Q2, ...)
- its type: mcq, fill_in_blank, descriptive, ordering, programming or mathematical
- its marks
- its question text, if printed
- its ground truth: the correct option letter for mcq, the accepted answers for
  fill_in_blank, a model answer and key concepts for descriptive, the correct sequence for
  ordering, the expected output for programming, the final answer and solution steps for
  mathematical

Return ONLY a JSON object of the form
{"Q1": {"type": "mcq", "marks": 2, "question_text": "...", "ground_truth": {"correct_answer": "A"}},
 "Q2": {"type": "descriptive", "marks": 5, "question_text": "...",
        "ground_truth": {"model_answer": "...", "key_concepts": ["..."]}},
 "Q3": {"type": "ordering", "marks": 3, "question_text": "...",
        "ground_truth": {"correct_sequence": ["A", "B", "C"]}}}"#;

/// Vision OCR over scanned pages.
#[async_trait]
pub(crate) trait OcrCapability: Send + Sync {
    /// One answer sheet page in, partial question-id → text mapping out.
    async fn extract_text(
        &self,
        page: &PageImage,
        expected_question_ids: &[String],
    ) -> Result<BTreeMap<String, String>, ExtractionError>;

    /// One answer-key page in, raw per-question descriptions (type, marks, text, ground
    /// truth) keyed by question id out.
    async fn extract_answer_key(&self, page: &PageImage) -> Result<Map<String, Value>, ExtractionError>;
}

pub(crate) struct VisionOcr {
    client: LlmClient,
    model: String,
}

impl VisionOcr {
    pub(crate) fn new(client: LlmClient, model: String) -> Self {
        Self { client, model }
    }

    async fn read_page(&self, prompt: &str, page: &PageImage) -> Result<Value, ExtractionError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&page.bytes);
        let messages = json!([{
            "role": "user",
            "content": [
                {"type": "text", "text": prompt},
                {
                    "type": "image_url",
                    "image_url": {
                        "url": format!("data:{};base64,{encoded}", page.mime_type()),
                        "detail": "high"
                    }
                }
            ]
        }]);

        let reply = self.client.complete_json(&self.model, messages).await;
        let outcome = if reply.is_ok() { "ok" } else { "error" };
        metrics::counter!("ocr_calls_total", "status" => outcome).increment(1);

        reply.map_err(|err| match err {
            LlmError::Timeout(seconds) => {
                ExtractionError::Timeout { page: page.label.clone(), seconds }
            }
            LlmError::Malformed(_) => ExtractionError::Unparseable { page: page.label.clone() },
            other => ExtractionError::Call { page: page.label.clone(), reason: other.to_string() },
        })
    }
}

#[async_trait]
impl OcrCapability for VisionOcr {
    async fn extract_text(
        &self,
        page: &PageImage,
        expected_question_ids: &[String],
    ) -> Result<BTreeMap<String, String>, ExtractionError> {
        let hint = if expected_question_ids.is_empty() {
            String::new()
        } else {
            format!("\nExpected question ids: {}.", expected_question_ids.join(", "))
        };

        let value = self.read_page(&format!("{OCR_PROMPT}{hint}"), page).await?;
        parse_answers(&value).ok_or_else(|| ExtractionError::Unparseable { page: page.label.clone() })
    }

    async fn extract_answer_key(&self, page: &PageImage) -> Result<Map<String, Value>, ExtractionError> {
        let value = self.read_page(ANSWER_KEY_PROMPT, page).await?;
        parse_answer_key(&value).ok_or_else(|| ExtractionError::Unparseable { page: page.label.clone() })
    }
}

/// Accepts `{"answers": {...}}` or a flat object; scalar and list values are stringified.
pub(crate) fn parse_answers(value: &Value) -> Option<BTreeMap<String, String>> {
    let object = match value.get("answers") {
        Some(Value::Object(inner)) => inner,
        _ => value.as_object()?,
    };

    let answers = object
        .iter()
        .filter_map(|(key, value)| answer_text(value).map(|text| (key.trim().to_string(), text)))
        .filter(|(key, _)| !key.is_empty())
        .collect();
    Some(answers)
}

/// Accepts `{"questions": {...}}` or a flat object and keeps only per-question objects.
pub(crate) fn parse_answer_key(value: &Value) -> Option<Map<String, Value>> {
    let object = match value.get("questions") {
        Some(Value::Object(inner)) => inner,
        _ => value.as_object()?,
    };

    let questions: Map<String, Value> = object
        .iter()
        .filter(|(key, value)| !key.trim().is_empty() && value.is_object())
        .map(|(key, value)| (key.trim().to_string(), value.clone()))
        .collect();
    (!questions.is_empty()).then_some(questions)
}

fn answer_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Array(items) => {
            Some(items.iter().filter_map(answer_text).collect::<Vec<_>>().join(", "))
        }
        Value::Object(inner) => inner.get("answer").and_then(answer_text),
        Value::Null => None,
    }
}

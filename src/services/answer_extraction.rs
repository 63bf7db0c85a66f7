use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::core::config::MergePolicy;
use crate::core::errors::ExtractionError;
use crate::db::models::ExtractionReport;
use crate::services::ocr::OcrCapability;
use crate::services::page_store::{PageImage, PageStore};

/// Runs OCR over every page of one student and merges the partial answers.
#[derive(Clone)]
pub(crate) struct AnswerExtractor {
    ocr: Arc<dyn OcrCapability>,
    pages: PageStore,
    merge_policy: MergePolicy,
    call_timeout: Duration,
}

impl AnswerExtractor {
    pub(crate) fn new(
        ocr: Arc<dyn OcrCapability>,
        pages: PageStore,
        merge_policy: MergePolicy,
        call_timeout: Duration,
    ) -> Self {
        Self { ocr, pages, merge_policy, call_timeout }
    }

    pub(crate) async fn extract(
        &self,
        page_paths: &[String],
        question_ids: &[String],
    ) -> Result<BTreeMap<String, String>, ExtractionError> {
        if page_paths.is_empty() {
            return Err(ExtractionError::NoPages);
        }

        let mut pages = Vec::with_capacity(page_paths.len());
        for path in page_paths {
            pages.push(self.pages.load_page(path).await?);
        }
        self.extract_pages(&pages, question_ids).await
    }

    pub(crate) async fn extract_pages(
        &self,
        pages: &[PageImage],
        question_ids: &[String],
    ) -> Result<BTreeMap<String, String>, ExtractionError> {
        if pages.is_empty() {
            return Err(ExtractionError::NoPages);
        }

        let mut merged = BTreeMap::new();
        for page in pages {
            let partial =
                tokio::time::timeout(self.call_timeout, self.ocr.extract_text(page, question_ids))
                    .await
                    .map_err(|_| ExtractionError::Timeout {
                        page: page.label.clone(),
                        seconds: self.call_timeout.as_secs(),
                    })??;

            tracing::debug!(page = %page.label, answers = partial.len(), "Page extracted");
            for (raw_key, text) in partial {
                let key = canonical_key(&raw_key, question_ids);
                merge_answer(&mut merged, key, text, self.merge_policy);
            }
        }

        Ok(merged)
    }

    /// Reads every answer-key page and merges the questions found; a later page wins for a
    /// repeated question id. Pages that fail are reported and skipped, unless all of them do.
    pub(crate) async fn read_answer_key(
        &self,
        pages: &[PageImage],
    ) -> Result<(Map<String, Value>, Vec<String>), ExtractionError> {
        if pages.is_empty() {
            return Err(ExtractionError::NoPages);
        }

        let mut merged = Map::new();
        let mut warnings = Vec::new();
        let mut last_error = None;
        for page in pages {
            let read = tokio::time::timeout(self.call_timeout, self.ocr.extract_answer_key(page))
                .await
                .map_err(|_| ExtractionError::Timeout {
                    page: page.label.clone(),
                    seconds: self.call_timeout.as_secs(),
                })
                .and_then(|read| read);

            match read {
                Ok(questions) => {
                    tracing::debug!(page = %page.label, questions = questions.len(), "Answer-key page read");
                    merged.extend(questions);
                }
                Err(err) => {
                    tracing::warn!(page = %page.label, error = %err, "Answer-key page skipped");
                    warnings.push(err.to_string());
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) if merged.is_empty() => Err(err),
            _ => Ok((merged, warnings)),
        }
    }
}

/// Maps an OCR key onto an expected question id: exact, then case-insensitive, then same
/// digit sequence (`q1`, `Question 1` → `Q1`). Unknown keys are kept verbatim.
pub(crate) fn canonical_key(raw: &str, expected: &[String]) -> String {
    let raw = raw.trim();
    if let Some(found) = find_matching_id(raw, expected.iter().map(String::as_str)) {
        return found.to_string();
    }
    raw.to_string()
}

fn find_matching_id<'a>(key: &str, candidates: impl Iterator<Item = &'a str> + Clone) -> Option<&'a str> {
    if let Some(found) = candidates.clone().find(|candidate| *candidate == key) {
        return Some(found);
    }
    if let Some(found) = candidates.clone().find(|candidate| candidate.eq_ignore_ascii_case(key)) {
        return Some(found);
    }
    let digits = digits_of(key);
    if digits.is_empty() {
        return None;
    }
    let mut matching = candidates.filter(|candidate| digits_of(candidate) == digits);
    let first = matching.next()?;
    // An ambiguous digit match (Q1a / Q1b) is not resolved.
    matching.next().is_none().then_some(first)
}

fn digits_of(value: &str) -> String {
    value.chars().filter(|ch| ch.is_ascii_digit()).collect()
}

pub(crate) fn merge_answer(
    merged: &mut BTreeMap<String, String>,
    key: String,
    text: String,
    policy: MergePolicy,
) {
    let text = text.trim().to_string();
    let Some(existing) = merged.get_mut(&key) else {
        merged.insert(key, text);
        return;
    };
    if text.is_empty() {
        return;
    }

    match policy {
        MergePolicy::LastNonEmpty => *existing = text,
        MergePolicy::FirstNonEmpty => {
            if existing.is_empty() {
                *existing = text;
            }
        }
        MergePolicy::Concatenate => {
            if existing.is_empty() {
                *existing = text;
            } else {
                existing.push('\n');
                existing.push_str(&text);
            }
        }
    }
}

/// Looks an answer up by question id with the same fallbacks used for canonical keys.
pub(crate) fn lookup_answer<'a>(
    answers: &'a BTreeMap<String, String>,
    question_id: &str,
) -> Option<&'a str> {
    if let Some(text) = answers.get(question_id) {
        return Some(text.as_str());
    }
    let key = answers
        .keys()
        .find(|key| key.eq_ignore_ascii_case(question_id))
        .or_else(|| {
            let digits = digits_of(question_id);
            if digits.is_empty() {
                return None;
            }
            let mut matching = answers.keys().filter(|key| digits_of(key) == digits);
            let first = matching.next()?;
            matching.next().is_none().then_some(first)
        })?;
    answers.get(key).map(String::as_str)
}

pub(crate) fn validation_report(
    expected: &[String],
    answers: &BTreeMap<String, String>,
) -> ExtractionReport {
    let expected_set: HashSet<&str> = expected.iter().map(String::as_str).collect();

    let missing: Vec<String> =
        expected.iter().filter(|id| !answers.contains_key(id.as_str())).cloned().collect();
    let empty: Vec<String> = expected
        .iter()
        .filter(|id| answers.get(id.as_str()).map(|text| text.trim().is_empty()).unwrap_or(false))
        .cloned()
        .collect();
    let extra: Vec<String> =
        answers.keys().filter(|key| !expected_set.contains(key.as_str())).cloned().collect();

    let answered = expected.len() - missing.len() - empty.len();
    let match_rate = if expected.is_empty() {
        0.0
    } else {
        (expected.len() - missing.len()) as f64 / expected.len() as f64
    };

    ExtractionReport { expected: expected.len(), answered, missing, empty, extra, match_rate }
}

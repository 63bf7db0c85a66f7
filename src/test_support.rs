use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request},
    Router,
};
use sqlx::types::Json;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::api;
use crate::core::config::Settings;
use crate::core::errors::{ExtractionError, JudgmentError};
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::models::{Exam, GroundTruth, QuestionSpec, RubricCriterion};
use crate::repositories::MemoryStore;
use crate::services::judgment::{
    CriterionJudgment, Judgment, JudgmentCapability, JudgmentMode, JudgmentRequest,
};
use crate::services::ocr::OcrCapability;
use crate::services::page_store::PageImage;
use crate::services::rubric::criteria::default_criteria;

pub(crate) struct TestContext {
    pub(crate) state: AppState,
    pub(crate) app: Router,
    pub(crate) cancel: watch::Sender<bool>,
    pub(crate) ocr: Arc<ScriptedOcr>,
    pub(crate) judge: Arc<ScriptedJudge>,
    _guard: OwnedMutexGuard<()>,
}

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

pub(crate) fn set_test_env() {
    let upload_dir =
        std::env::temp_dir().join("exam-grader-tests").join(uuid::Uuid::new_v4().to_string());

    std::env::set_var("GRADER_ENV", "test");
    std::env::set_var("GRADER_STRICT_CONFIG", "0");
    std::env::set_var("STORAGE_BACKEND", "memory");
    std::env::set_var("UPLOAD_DIR", upload_dir);
    std::env::set_var("PROMETHEUS_ENABLED", "0");
    std::env::set_var("GRADING_CONCURRENCY", "2");
    std::env::set_var("AI_REQUEST_TIMEOUT", "5");
    std::env::set_var("AI_MAX_RETRIES", "0");
    std::env::remove_var("ANSWER_MERGE_POLICY");
    std::env::remove_var("ALLOWED_IMAGE_EXTENSIONS");
    std::env::remove_var("MAX_UPLOAD_SIZE_MB");
    std::env::remove_var("DATABASE_URL");
    std::env::remove_var("GRADER_HOST");
    std::env::remove_var("GRADER_PORT");
    std::env::remove_var("OPENAI_API_KEY");
}

pub(crate) async fn setup_test_context() -> TestContext {
    setup_test_context_with(ScriptedOcr::default(), ScriptedJudge::default()).await
}

pub(crate) async fn setup_test_context_with(ocr: ScriptedOcr, judge: ScriptedJudge) -> TestContext {
    let guard = env_lock().await;
    set_test_env();

    let settings = Settings::load().expect("settings");
    let ocr = Arc::new(ocr);
    let judge = Arc::new(judge);
    let (cancel, cancel_rx) = watch::channel(false);

    let state = AppState::new(
        settings,
        Arc::new(MemoryStore::new()),
        ocr.clone(),
        judge.clone(),
        cancel_rx,
    );
    let app = api::router::router(state.clone());

    TestContext { state, app, cancel, ocr, judge, _guard: guard }
}

pub(crate) fn question(id: &str, max_marks: f64, ground_truth: GroundTruth) -> QuestionSpec {
    let criteria = if ground_truth.question_type().uses_criteria() {
        default_criteria(ground_truth.question_type())
    } else {
        Vec::<RubricCriterion>::new()
    };
    QuestionSpec {
        id: id.to_string(),
        max_marks,
        question_text: format!("Question {id}"),
        ground_truth,
        criteria,
    }
}

/// Q1 multiple choice (2), Q2 fill-in-blank (1), Q3 ordering (3), Q4 descriptive (4).
pub(crate) fn sample_exam() -> Exam {
    let questions = vec![
        question("Q1", 2.0, GroundTruth::MultipleChoice { correct_answer: "B".into() }),
        question(
            "Q2",
            1.0,
            GroundTruth::FillInBlank { correct_answers: vec!["mitochondria".into()] },
        ),
        question(
            "Q3",
            3.0,
            GroundTruth::Ordering {
                correct_sequence: vec!["A".into(), "B".into(), "C".into()],
            },
        ),
        question(
            "Q4",
            4.0,
            GroundTruth::Descriptive {
                model_answer: "Plants convert light into chemical energy.".into(),
                key_concepts: vec!["light".into(), "energy".into()],
            },
        ),
    ];
    Exam {
        id: "exam-1".to_string(),
        name: "Biology midterm".to_string(),
        total_marks: 10.0,
        questions: Json(questions),
        created_at: primitive_now_utc(),
    }
}

/// Answers that earn full marks on [`sample_exam`] with the default judge.
pub(crate) fn full_marks_answers() -> Vec<(&'static str, &'static str)> {
    vec![
        ("Q1", "B"),
        ("Q2", "Mitochondria"),
        ("Q3", "A, B, C"),
        ("Q4", "Light energy becomes chemical energy."),
    ]
}

pub(crate) fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for (name, bytes) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).expect("zip dir");
        } else {
            writer.start_file(*name, options).expect("zip entry");
            writer.write_all(bytes).expect("zip write");
        }
    }
    writer.finish().expect("zip finish").into_inner()
}

enum JudgeScript {
    Equivalence { correct: bool, reasoning: String },
    Fractions(Vec<(String, f64)>),
    Fail(String),
}

/// Judgment stub keyed by question id. Unscripted questions get full credit.
#[derive(Default)]
pub(crate) struct ScriptedJudge {
    scripts: HashMap<String, JudgeScript>,
    calls: AtomicUsize,
}

impl ScriptedJudge {
    pub(crate) fn with_equivalence(mut self, question_id: &str, correct: bool, reasoning: &str) -> Self {
        self.scripts.insert(
            question_id.to_string(),
            JudgeScript::Equivalence { correct, reasoning: reasoning.to_string() },
        );
        self
    }

    pub(crate) fn with_fractions(mut self, question_id: &str, fractions: &[(&str, f64)]) -> Self {
        let fractions = fractions.iter().map(|(name, value)| (name.to_string(), *value)).collect();
        self.scripts.insert(question_id.to_string(), JudgeScript::Fractions(fractions));
        self
    }

    pub(crate) fn failing(mut self, question_id: &str, cause: &str) -> Self {
        self.scripts.insert(question_id.to_string(), JudgeScript::Fail(cause.to_string()));
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JudgmentCapability for ScriptedJudge {
    async fn judge(&self, request: &JudgmentRequest) -> Result<Judgment, JudgmentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        match self.scripts.get(&request.question_id) {
            Some(JudgeScript::Fail(cause)) => Err(JudgmentError::Call(cause.clone())),
            Some(JudgeScript::Equivalence { correct, reasoning }) => Ok(Judgment {
                correct: Some(*correct),
                reasoning: reasoning.clone(),
                ..Judgment::default()
            }),
            Some(JudgeScript::Fractions(fractions)) => Ok(Judgment {
                reasoning: "scripted criteria".to_string(),
                criteria: fractions
                    .iter()
                    .map(|(name, fraction)| CriterionJudgment {
                        name: name.clone(),
                        fraction: *fraction,
                        feedback: None,
                    })
                    .collect(),
                ..Judgment::default()
            }),
            None => Ok(match request.mode {
                JudgmentMode::Equivalence => Judgment {
                    correct: Some(true),
                    reasoning: "equivalent".to_string(),
                    ..Judgment::default()
                },
                JudgmentMode::Criteria => Judgment {
                    reasoning: "meets every criterion".to_string(),
                    criteria: request
                        .criteria
                        .iter()
                        .map(|criterion| CriterionJudgment {
                            name: criterion.name.clone(),
                            fraction: 1.0,
                            feedback: None,
                        })
                        .collect(),
                    ..Judgment::default()
                },
            }),
        }
    }
}

enum OcrScript {
    Answers(BTreeMap<String, String>),
    AnswerKey(serde_json::Map<String, serde_json::Value>),
    Fail,
}

/// OCR stub matching pages by a fragment of their label (stored path).
#[derive(Default)]
pub(crate) struct ScriptedOcr {
    scripts: Vec<(String, OcrScript)>,
    calls: AtomicUsize,
}

impl ScriptedOcr {
    pub(crate) fn with_page(mut self, label_fragment: &str, answers: &[(&str, &str)]) -> Self {
        let answers = answers.iter().map(|(key, text)| (key.to_string(), text.to_string())).collect();
        self.scripts.push((label_fragment.to_string(), OcrScript::Answers(answers)));
        self
    }

    /// `questions` is the per-question object the vision model would return for the page.
    pub(crate) fn with_answer_key(mut self, label_fragment: &str, questions: serde_json::Value) -> Self {
        let questions = questions.as_object().cloned().unwrap_or_default();
        self.scripts.push((label_fragment.to_string(), OcrScript::AnswerKey(questions)));
        self
    }

    pub(crate) fn failing_page(mut self, label_fragment: &str) -> Self {
        self.scripts.push((label_fragment.to_string(), OcrScript::Fail));
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrCapability for ScriptedOcr {
    async fn extract_text(
        &self,
        page: &PageImage,
        _expected_question_ids: &[String],
    ) -> Result<BTreeMap<String, String>, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let script = self.scripts.iter().find(|(fragment, _)| page.label.contains(fragment.as_str()));
        match script {
            Some((_, OcrScript::Answers(answers))) => Ok(answers.clone()),
            Some((_, OcrScript::Fail)) => Err(ExtractionError::Call {
                page: page.label.clone(),
                reason: "vision model unavailable".to_string(),
            }),
            Some((_, OcrScript::AnswerKey(_))) | None => Ok(BTreeMap::new()),
        }
    }

    async fn extract_answer_key(
        &self,
        page: &PageImage,
    ) -> Result<serde_json::Map<String, serde_json::Value>, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let script = self.scripts.iter().find(|(fragment, _)| page.label.contains(fragment.as_str()));
        match script {
            Some((_, OcrScript::AnswerKey(questions))) => Ok(questions.clone()),
            Some((_, OcrScript::Fail)) => Err(ExtractionError::Call {
                page: page.label.clone(),
                reason: "vision model unavailable".to_string(),
            }),
            Some((_, OcrScript::Answers(_))) | None => {
                Err(ExtractionError::Unparseable { page: page.label.clone() })
            }
        }
    }
}

pub(crate) fn json_request(
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);

    if let Some(body) = body {
        let bytes = serde_json::to_vec(&body).expect("serialize body");
        builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .expect("request body")
    } else {
        builder.body(Body::empty()).expect("request body")
    }
}

pub(crate) fn multipart_request(
    uri: &str,
    fields: &[(&str, &str)],
    files: &[(&str, &str, &[u8])],
) -> Request<Body> {
    const BOUNDARY: &str = "grader-test-boundary";
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    for (name, file_name, bytes) in files {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; \
                 filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .expect("multipart body")
}

pub(crate) async fn read_json(response: axum::response::Response<Body>) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("response body");
    serde_json::from_slice(&body).unwrap_or_else(|err| {
        let body_text = String::from_utf8_lossy(&body);
        panic!("json parse: {err}; body: {body_text}");
    })
}

pub(crate) async fn read_text(response: axum::response::Response<Body>) -> String {
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("response body");
    String::from_utf8_lossy(&body).into_owned()
}

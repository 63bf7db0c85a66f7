use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::core::config::Settings;
use crate::repositories::GradingStore;
use crate::services::answer_extraction::AnswerExtractor;
use crate::services::judgment::JudgmentCapability;
use crate::services::llm_client::retry_backoff_total;
use crate::services::ocr::OcrCapability;
use crate::services::page_store::PageStore;
use crate::services::rubric::RubricScorer;
use crate::tasks::grading::batch::ActiveRuns;

/// Slack added on top of the client's own per-attempt timeout and retries.
const CALL_TIMEOUT_SLACK: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    store: Arc<dyn GradingStore>,
    pages: PageStore,
    extractor: AnswerExtractor,
    scorer: RubricScorer,
    active_runs: ActiveRuns,
    cancel: watch::Receiver<bool>,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        store: Arc<dyn GradingStore>,
        ocr: Arc<dyn OcrCapability>,
        judge: Arc<dyn JudgmentCapability>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let call_timeout = call_timeout(&settings);
        let pages = PageStore::new(settings.storage().upload_dir.clone());
        let extractor = AnswerExtractor::new(
            ocr,
            pages.clone(),
            settings.grading().merge_policy,
            call_timeout,
        );
        let scorer = RubricScorer::new(judge, call_timeout);

        Self {
            inner: Arc::new(InnerState {
                settings,
                store,
                pages,
                extractor,
                scorer,
                active_runs: ActiveRuns::default(),
                cancel,
            }),
        }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn store(&self) -> &dyn GradingStore {
        self.inner.store.as_ref()
    }

    pub(crate) fn pages(&self) -> &PageStore {
        &self.inner.pages
    }

    pub(crate) fn extractor(&self) -> &AnswerExtractor {
        &self.inner.extractor
    }

    pub(crate) fn scorer(&self) -> &RubricScorer {
        &self.inner.scorer
    }

    pub(crate) fn active_runs(&self) -> &ActiveRuns {
        &self.inner.active_runs
    }

    pub(crate) fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.inner.cancel.clone()
    }
}

/// Upper bound for one OCR or judgment call including the client's retries.
fn call_timeout(settings: &Settings) -> Duration {
    let ai = settings.ai();
    let attempts = u64::from(ai.max_retries) + 1;
    Duration::from_secs(ai.request_timeout_secs.saturating_mul(attempts))
        .saturating_add(retry_backoff_total(ai.max_retries))
        .saturating_add(CALL_TIMEOUT_SLACK)
}

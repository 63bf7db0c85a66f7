use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROM_HANDLE.set(handle);

    metrics::describe_counter!("grading_jobs_total", "Submissions graded, by outcome");
    metrics::describe_counter!("batch_entries_total", "Batch entries finished, by outcome");
    metrics::describe_counter!("judgment_calls_total", "Judgment capability calls, by outcome");
    metrics::describe_counter!("ocr_calls_total", "OCR capability calls, by outcome");
    metrics::describe_counter!("answer_key_drafts_total", "Answer keys drafted from images");
    metrics::describe_histogram!("grading_duration_seconds", "Per-submission grading latency");
    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}

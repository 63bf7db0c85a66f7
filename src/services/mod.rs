pub(crate) mod answer_extraction;
pub(crate) mod answer_key;
pub(crate) mod csv_export;
pub(crate) mod ingest;
pub(crate) mod judgment;
pub(crate) mod llm_client;
pub(crate) mod ocr;
pub(crate) mod page_store;
pub(crate) mod preprocess;
pub(crate) mod report;
pub(crate) mod rubric;

mod commands;
mod queries;

pub(crate) use commands::upsert;
pub(crate) use queries::{find_by_id, find_latest_for_student, list_by_exam};

pub(crate) const COLUMNS: &str = "\
    id, exam_id, student_id, page_paths, extracted_answers, extraction_report, status, \
    total_score, total_max, error_message, created_at, graded_at";

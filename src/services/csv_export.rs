use std::collections::HashMap;
use std::fmt::Write as _;

use crate::db::types::EntryStatus;
use crate::services::report::round2;

/// One export line; score fields are only filled for graded students.
#[derive(Debug, Clone)]
pub(crate) struct ExportRow {
    pub(crate) student_id: String,
    pub(crate) status: EntryStatus,
    pub(crate) total_score: Option<f64>,
    pub(crate) total_max: Option<f64>,
    pub(crate) question_scores: HashMap<String, f64>,
    pub(crate) submission_id: Option<String>,
    pub(crate) error: Option<String>,
}

pub(crate) fn render_csv(question_ids: &[String], rows: &[ExportRow]) -> String {
    let mut out = String::new();

    let mut header: Vec<String> = ["student_id", "status", "total_score", "total_max", "percentage", "letter_grade"]
        .iter()
        .map(|column| column.to_string())
        .collect();
    header.extend(question_ids.iter().cloned());
    header.push("submission_id".to_string());
    header.push("error".to_string());
    push_record(&mut out, &header);

    for row in rows {
        let graded = row.status == EntryStatus::Graded;
        let totals = match (graded, row.total_score, row.total_max) {
            (true, Some(score), Some(max)) => Some((score, max)),
            _ => None,
        };

        let mut record = vec![row.student_id.clone(), row.status.as_str().to_string()];
        match totals {
            Some((score, max)) => {
                let percentage = if max > 0.0 { round2(score / max * 100.0) } else { 0.0 };
                record.push(format_score(score));
                record.push(format_score(max));
                record.push(format_score(percentage));
                record.push(letter_grade(percentage).to_string());
            }
            None => record.extend(std::iter::repeat(String::new()).take(4)),
        }

        for question_id in question_ids {
            let cell = if graded {
                row.question_scores.get(question_id).map(|score| format_score(*score))
            } else {
                None
            };
            record.push(cell.unwrap_or_default());
        }

        record.push(row.submission_id.clone().unwrap_or_default());
        record.push(row.error.clone().unwrap_or_default());
        push_record(&mut out, &record);
    }

    out
}

pub(crate) fn letter_grade(percentage: f64) -> &'static str {
    const BANDS: &[(f64, &str)] = &[
        (90.0, "A+"),
        (85.0, "A"),
        (80.0, "A-"),
        (75.0, "B+"),
        (70.0, "B"),
        (65.0, "B-"),
        (60.0, "C+"),
        (55.0, "C"),
        (50.0, "C-"),
        (45.0, "D"),
    ];
    BANDS.iter().find(|(floor, _)| percentage >= *floor).map(|(_, grade)| *grade).unwrap_or("F")
}

/// Two decimals at most, trailing zeros dropped (`5.50` → `5.5`).
pub(crate) fn format_score(value: f64) -> String {
    let formatted = format!("{value:.2}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed == "-0" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

fn push_record(out: &mut String, fields: &[String]) {
    let line = fields.iter().map(|field| escape_field(field)).collect::<Vec<_>>().join(",");
    let _ = write!(out, "{line}\r\n");
}

fn escape_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

use crate::db::models::{Breakdown, QuestionSpec};
use crate::services::preprocess;

use super::ScoreOutcome;

/// Position-by-position comparison; missing or extra slots never match.
pub(super) fn score(question: &QuestionSpec, correct_sequence: &[String], answer: &str) -> ScoreOutcome {
    let mut submitted = preprocess::tokenize_sequence(answer);
    // Leftover numbering such as "1 Boil 2 Steep" is noise unless the key itself is numeric.
    if !correct_sequence.iter().any(|item| is_bare_number(item)) {
        submitted.retain(|item| !is_bare_number(item));
    }
    let total_positions = correct_sequence.len();

    let matching_positions = correct_sequence
        .iter()
        .zip(submitted.iter())
        .filter(|(expected, given)| {
            preprocess::normalize_text(expected) == preprocess::normalize_text(given)
        })
        .count();

    let score = if total_positions == 0 {
        0.0
    } else {
        matching_positions as f64 / total_positions as f64 * question.max_marks
    };

    let mut reasoning = format!(
        "{matching_positions} of {total_positions} positions match the expected order ({}).",
        correct_sequence.join(" -> ")
    );
    if submitted.len() != total_positions {
        reasoning.push_str(&format!(
            " The answer lists {} items instead of {total_positions}.",
            submitted.len()
        ));
    }

    ScoreOutcome {
        score,
        reasoning,
        breakdown: Breakdown::Sequence {
            expected: correct_sequence.to_vec(),
            submitted,
            matching_positions,
            total_positions,
        },
    }
}

fn is_bare_number(item: &str) -> bool {
    let item = item.trim();
    !item.is_empty() && item.chars().all(|ch| ch.is_ascii_digit())
}

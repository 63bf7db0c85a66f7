use crate::core::errors::JudgmentError;
use crate::db::models::{Breakdown, QuestionSpec};
use crate::services::judgment::{Judgment, JudgmentMode};
use crate::services::preprocess;

use super::{RubricScorer, ScoreOutcome};

const CHOICE_INSTRUCTIONS: &str = "Grade this multiple-choice answer. The OCR text did not \
contain a single unambiguous option letter (it may name several letters or use the article \
\"a\"); decide which option the student selected and whether it is the correct one. Full marks \
or zero.";

const BLANK_INSTRUCTIONS: &str = "Grade this fill-in-the-blank answer. Decide whether the \
student's answer is semantically equivalent to any acceptable answer, allowing synonyms, \
equivalent units and minor spelling mistakes. Full marks or zero.";

pub(super) async fn score_choice(
    scorer: &RubricScorer,
    question: &QuestionSpec,
    correct_answer: &str,
    answer: &str,
) -> Result<ScoreOutcome, JudgmentError> {
    let expected_raw = correct_answer.trim().to_uppercase();
    let expected = preprocess::extract_option(&expected_raw).unwrap_or(expected_raw);
    let evidence = preprocess::choice(answer);

    if let Some(selected) = evidence.extracted_option.clone() {
        let correct = selected == expected;
        let reasoning = if correct {
            format!("Selected option {selected} matches the correct option.")
        } else {
            format!("Selected option {selected}; the correct option is {expected}.")
        };
        return Ok(all_or_nothing(
            question.max_marks,
            correct,
            reasoning,
            Breakdown::Choice { expected, selected: Some(selected), correct },
        ));
    }

    let evidence = serde_json::to_value(&evidence).unwrap_or_default();
    let request =
        scorer.request(question, answer, evidence, CHOICE_INSTRUCTIONS, JudgmentMode::Equivalence);
    let judgment = scorer.judge(&request).await?;
    let correct = decide_equivalence(&judgment, question.max_marks)?;

    Ok(all_or_nothing(
        question.max_marks,
        correct,
        judgment.reasoning,
        Breakdown::Choice { expected, selected: None, correct },
    ))
}

pub(super) async fn score_blank(
    scorer: &RubricScorer,
    question: &QuestionSpec,
    correct_answers: &[String],
    answer: &str,
) -> Result<ScoreOutcome, JudgmentError> {
    let normalized = preprocess::normalize_text(answer);
    let exact = correct_answers
        .iter()
        .find(|accepted| preprocess::normalize_text(accepted) == normalized);

    if let Some(accepted) = exact {
        return Ok(all_or_nothing(
            question.max_marks,
            true,
            format!("Answer matches the accepted answer '{accepted}'."),
            Breakdown::Blank {
                accepted: correct_answers.to_vec(),
                submitted: answer.trim().to_string(),
                correct: true,
            },
        ));
    }

    let evidence = serde_json::to_value(preprocess::blank(answer)).unwrap_or_default();
    let request =
        scorer.request(question, answer, evidence, BLANK_INSTRUCTIONS, JudgmentMode::Equivalence);
    let judgment = scorer.judge(&request).await?;
    let correct = decide_equivalence(&judgment, question.max_marks)?;

    Ok(all_or_nothing(
        question.max_marks,
        correct,
        judgment.reasoning,
        Breakdown::Blank {
            accepted: correct_answers.to_vec(),
            submitted: answer.trim().to_string(),
            correct,
        },
    ))
}

/// The explicit `correct` flag wins; otherwise a reported score of at least half marks counts.
pub(super) fn decide_equivalence(judgment: &Judgment, max_marks: f64) -> Result<bool, JudgmentError> {
    if let Some(correct) = judgment.correct {
        return Ok(correct);
    }
    match judgment.score {
        Some(score) if (0.0..=max_marks).contains(&score) => Ok(score >= max_marks / 2.0),
        Some(score) => Err(JudgmentError::OutOfBounds { score, max: max_marks }),
        None => Err(JudgmentError::Unparseable("judgment has neither a verdict nor a score".to_string())),
    }
}

fn all_or_nothing(
    max_marks: f64,
    correct: bool,
    reasoning: String,
    breakdown: Breakdown,
) -> ScoreOutcome {
    ScoreOutcome { score: if correct { max_marks } else { 0.0 }, reasoning, breakdown }
}

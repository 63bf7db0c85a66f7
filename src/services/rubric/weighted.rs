use std::collections::HashMap;

use crate::core::errors::JudgmentError;
use crate::db::models::{Breakdown, CriterionScore, GroundTruth, QuestionSpec, RubricCriterion};
use crate::services::judgment::{CriterionJudgment, Judgment, JudgmentMode};
use crate::services::preprocess;

use super::criteria::{criterion_key, default_criteria};
use super::{RubricScorer, ScoreOutcome};

const DEFAULT_MATH_TOLERANCE: f64 = 1e-6;
const FRACTION_EPSILON: f64 = 1e-9;

const DESCRIPTIVE_INSTRUCTIONS: &str = "Grade this descriptive answer against the model answer \
and the required key concepts. Score every rubric criterion independently as a fraction between \
0 and 1 of that criterion.";

const PROGRAMMING_INSTRUCTIONS: &str = "Grade this program. Trace its logic against every \
declared test case and report how many pass as test_cases_passed. Score every rubric criterion \
independently as a fraction between 0 and 1 of that criterion.";

const MATH_INSTRUCTIONS: &str = "Grade this mathematical solution. Judge the final answer by \
mathematical equivalence, never by string equality, then judge method, steps and notation. Score \
every rubric criterion independently as a fraction between 0 and 1 of that criterion.";

/// A criterion fraction fixed without the judge.
struct LocalDecision {
    key: String,
    fraction: f64,
    note: String,
}

pub(super) async fn score(
    scorer: &RubricScorer,
    question: &QuestionSpec,
    answer: &str,
) -> Result<ScoreOutcome, JudgmentError> {
    let criteria = if question.criteria.is_empty() {
        default_criteria(question.question_type())
    } else {
        question.criteria.clone()
    };

    let instructions = match question.ground_truth {
        GroundTruth::Programming { .. } => PROGRAMMING_INSTRUCTIONS,
        GroundTruth::Mathematical { .. } => MATH_INSTRUCTIONS,
        _ => DESCRIPTIVE_INSTRUCTIONS,
    };

    let evidence = preprocess::evidence(&question.ground_truth, answer);
    let mut request =
        scorer.request(question, answer, evidence, instructions, JudgmentMode::Criteria);
    request.criteria = criteria.clone();

    let judgment = scorer.judge(&request).await?;
    let local = local_decisions(question, &criteria, &judgment, answer);
    reconcile(question.max_marks, &criteria, &judgment, &local)
}

/// Validates the judge's breakdown and turns it into the authoritative weighted sum.
fn reconcile(
    max_marks: f64,
    criteria: &[RubricCriterion],
    judgment: &Judgment,
    local: &[LocalDecision],
) -> Result<ScoreOutcome, JudgmentError> {
    let judged: HashMap<String, &CriterionJudgment> =
        judgment.criteria.iter().map(|item| (criterion_key(&item.name), item)).collect();

    let mut scores = Vec::with_capacity(criteria.len());
    let mut judge_total = 0.0;
    let mut judge_complete = true;

    for criterion in criteria {
        let key = criterion_key(&criterion.name);
        let from_judge = judged.get(&key).copied();
        let local_decision = local.iter().find(|decision| decision.key == key);

        if let Some(item) = from_judge {
            if !item.fraction.is_finite()
                || item.fraction < -FRACTION_EPSILON
                || item.fraction > 1.0 + FRACTION_EPSILON
            {
                return Err(JudgmentError::CriterionOutOfBounds {
                    name: criterion.name.clone(),
                    value: item.fraction,
                });
            }
            judge_total += contribution(item.fraction.clamp(0.0, 1.0), criterion.weight, max_marks);
        } else {
            judge_complete = false;
        }

        let (fraction, feedback) = match (local_decision, from_judge) {
            (Some(decision), item) => (
                decision.fraction,
                Some(match item.and_then(|item| item.feedback.clone()) {
                    Some(feedback) => format!("{} {feedback}", decision.note),
                    None => decision.note.clone(),
                }),
            ),
            (None, Some(item)) => (item.fraction.clamp(0.0, 1.0), item.feedback.clone()),
            (None, None) => return Err(JudgmentError::MissingCriterion(criterion.name.clone())),
        };

        scores.push(CriterionScore {
            name: criterion.name.clone(),
            weight: criterion.weight,
            fraction,
            contribution: contribution(fraction, criterion.weight, max_marks),
            feedback,
        });
    }

    if let Some(reported) = judgment.score {
        let tolerance = reconciliation_tolerance(max_marks);
        if reported < -tolerance || reported > max_marks + tolerance {
            return Err(JudgmentError::OutOfBounds { score: reported, max: max_marks });
        }
        if judge_complete && (reported - judge_total).abs() > tolerance {
            return Err(JudgmentError::Unreconciled { reported, computed: judge_total });
        }
    }

    let score: f64 = scores.iter().map(|item| item.contribution).sum();
    let reasoning = compose_reasoning(&judgment.reasoning, &scores, local);

    Ok(ScoreOutcome { score, reasoning, breakdown: Breakdown::Criteria { criteria: scores } })
}

fn contribution(fraction: f64, weight: f64, max_marks: f64) -> f64 {
    fraction * weight / 100.0 * max_marks
}

/// LLM totals are usually rounded; one percent of the question is accepted as drift.
pub(super) fn reconciliation_tolerance(max_marks: f64) -> f64 {
    (max_marks * 0.01).max(1e-6)
}

fn local_decisions(
    question: &QuestionSpec,
    criteria: &[RubricCriterion],
    judgment: &Judgment,
    answer: &str,
) -> Vec<LocalDecision> {
    match &question.ground_truth {
        GroundTruth::Programming { test_cases, .. } => {
            programming_correctness(criteria, test_cases.len(), judgment.test_cases_passed)
                .into_iter()
                .collect()
        }
        GroundTruth::Mathematical { correct_answer, tolerance, .. } => math_final_answer(
            criteria,
            correct_answer,
            tolerance.unwrap_or(DEFAULT_MATH_TOLERANCE),
            answer,
        )
        .into_iter()
        .collect(),
        _ => Vec::new(),
    }
}

fn programming_correctness(
    criteria: &[RubricCriterion],
    declared: usize,
    passed: Option<u32>,
) -> Option<LocalDecision> {
    let passed = passed? as usize;
    if declared == 0 {
        return None;
    }
    let key = criteria
        .iter()
        .map(|criterion| criterion_key(&criterion.name))
        .find(|key| key == "correctness")?;
    let passed = passed.min(declared);

    Some(LocalDecision {
        key,
        fraction: passed as f64 / declared as f64,
        note: format!("{passed} of {declared} test cases pass."),
    })
}

fn math_final_answer(
    criteria: &[RubricCriterion],
    correct_answer: &str,
    tolerance: f64,
    answer: &str,
) -> Option<LocalDecision> {
    let key = criteria
        .iter()
        .map(|criterion| criterion_key(&criterion.name))
        .find(|key| key.contains("final"))?;

    let expected = preprocess::parse_number(correct_answer)?;
    let given_text = preprocess::final_answer(answer)?;
    let given = preprocess::parse_number(&given_text)?;
    let equivalent = preprocess::numbers_equivalent(given, expected, tolerance);

    let note = if equivalent {
        format!("Final answer {given_text} is numerically equivalent to {correct_answer}.")
    } else {
        format!("Final answer {given_text} differs from {correct_answer}.")
    };
    Some(LocalDecision { key, fraction: if equivalent { 1.0 } else { 0.0 }, note })
}

fn compose_reasoning(judge: &str, scores: &[CriterionScore], local: &[LocalDecision]) -> String {
    let mut parts = Vec::new();
    if !judge.trim().is_empty() {
        parts.push(judge.trim().to_string());
    }
    parts.extend(local.iter().map(|decision| decision.note.clone()));
    let summary = scores
        .iter()
        .map(|item| format!("{} {:.0}%", item.name, item.fraction * 100.0))
        .collect::<Vec<_>>()
        .join(", ");
    parts.push(format!("Criteria: {summary}."));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Vec<RubricCriterion> {
        default_criteria(crate::db::types::QuestionType::Descriptive)
    }

    fn judged(fractions: &[(&str, f64)], score: Option<f64>) -> Judgment {
        Judgment {
            score,
            reasoning: "fine".to_string(),
            criteria: fractions
                .iter()
                .map(|(name, fraction)| CriterionJudgment {
                    name: name.to_string(),
                    fraction: *fraction,
                    feedback: None,
                })
                .collect(),
            ..Judgment::default()
        }
    }

    #[test]
    fn weighted_sum_reconciles_with_breakdown() {
        let judgment = judged(
            &[("Concept Coverage", 0.5), ("accuracy", 1.0), ("completeness", 0.25), ("Clarity", 0.0)],
            Some(5.5),
        );
        let outcome = reconcile(10.0, &defaults(), &judgment, &[]).expect("reconciled");
        // 0.5*40 + 1*30 + 0.25*20 + 0 = 55% of 10
        assert!((outcome.score - 5.5).abs() < 1e-9);
        let sum = outcome.breakdown.contribution_sum().expect("criteria breakdown");
        assert!((sum - outcome.score).abs() < 1e-6);
    }

    #[test]
    fn reported_total_must_reconcile() {
        let judgment = judged(
            &[("Concept Coverage", 1.0), ("Accuracy", 1.0), ("Completeness", 1.0), ("Clarity", 1.0)],
            Some(6.0),
        );
        let err = reconcile(10.0, &defaults(), &judgment, &[]).expect_err("unreconciled");
        assert!(matches!(err, JudgmentError::Unreconciled { .. }));
    }

    #[test]
    fn missing_or_out_of_range_criteria_fail() {
        let missing = judged(&[("Concept Coverage", 1.0)], None);
        assert!(matches!(
            reconcile(5.0, &defaults(), &missing, &[]),
            Err(JudgmentError::MissingCriterion(_))
        ));

        let out_of_range = judged(
            &[("Concept Coverage", 1.4), ("Accuracy", 1.0), ("Completeness", 1.0), ("Clarity", 1.0)],
            None,
        );
        assert!(matches!(
            reconcile(5.0, &defaults(), &out_of_range, &[]),
            Err(JudgmentError::CriterionOutOfBounds { .. })
        ));

        let total_out_of_range = judged(
            &[("Concept Coverage", 1.0), ("Accuracy", 1.0), ("Completeness", 1.0), ("Clarity", 1.0)],
            Some(7.0),
        );
        assert!(matches!(
            reconcile(5.0, &defaults(), &total_out_of_range, &[]),
            Err(JudgmentError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn math_final_answer_is_decided_numerically() {
        let criteria = default_criteria(crate::db::types::QuestionType::Mathematical);
        let decision =
            math_final_answer(&criteria, "3/4", 1e-6, "x = 6/8\nx = 0.75").expect("numeric");
        assert_eq!(decision.fraction, 1.0);
        assert_eq!(decision.key, "finalanswer");

        let wrong = math_final_answer(&criteria, "3/4", 1e-6, "x = 0.7").expect("numeric");
        assert_eq!(wrong.fraction, 0.0);

        assert!(math_final_answer(&criteria, "sqrt(2)", 1e-6, "x = 1.41").is_none());
    }

    #[test]
    fn local_decision_overrides_judge_fraction() {
        let criteria = default_criteria(crate::db::types::QuestionType::Mathematical);
        let judgment = judged(
            &[("Final Answer", 0.0), ("Method", 1.0), ("Steps", 1.0), ("Notation", 1.0)],
            Some(6.0),
        );
        let local = vec![LocalDecision {
            key: "finalanswer".to_string(),
            fraction: 1.0,
            note: "equal".to_string(),
        }];
        let outcome = reconcile(10.0, &criteria, &judgment, &local).expect("reconciled");
        assert!((outcome.score - 10.0).abs() < 1e-9);
    }

    #[test]
    fn programming_correctness_uses_pass_ratio() {
        let criteria = default_criteria(crate::db::types::QuestionType::Programming);
        let decision = programming_correctness(&criteria, 4, Some(3)).expect("decision");
        assert_eq!(decision.fraction, 0.75);
        assert!(programming_correctness(&criteria, 0, Some(3)).is_none());
        assert!(programming_correctness(&criteria, 4, None).is_none());
        assert_eq!(programming_correctness(&criteria, 2, Some(5)).map(|d| d.fraction), Some(1.0));
    }
}

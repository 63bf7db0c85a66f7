//! Rubric scorer: one strategy per question type, dispatched over the closed
//! [`GroundTruth`] union.
//!
//! Multiple-choice, exact fill-in-blank matches and ordering are decided locally; the
//! remaining decisions go to the judgment capability and are validated before use.

mod choice;
pub(crate) mod criteria;
mod ordering;
mod weighted;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::core::errors::JudgmentError;
use crate::db::models::{Breakdown, GroundTruth, QuestionSpec};
use crate::services::judgment::{Judgment, JudgmentCapability, JudgmentMode, JudgmentRequest};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ScoreOutcome {
    pub(crate) score: f64,
    pub(crate) reasoning: String,
    pub(crate) breakdown: Breakdown,
}

impl ScoreOutcome {
    pub(crate) fn unanswered() -> Self {
        Self { score: 0.0, reasoning: "no answer extracted".to_string(), breakdown: Breakdown::Unanswered }
    }

    pub(crate) fn failed(err: &JudgmentError) -> Self {
        let cause = err.to_string();
        Self {
            score: 0.0,
            reasoning: format!("grading failed: {cause}"),
            breakdown: Breakdown::Failed { cause },
        }
    }

    fn clamped(mut self, max_marks: f64) -> Self {
        self.score = if self.score.is_finite() { self.score.clamp(0.0, max_marks) } else { 0.0 };
        self
    }
}

#[derive(Clone)]
pub(crate) struct RubricScorer {
    judge: Arc<dyn JudgmentCapability>,
    call_timeout: Duration,
}

impl RubricScorer {
    pub(crate) fn new(judge: Arc<dyn JudgmentCapability>, call_timeout: Duration) -> Self {
        Self { judge, call_timeout }
    }

    /// Scores one answer. The returned score always lies in `[0, max_marks]`.
    pub(crate) async fn score(
        &self,
        question: &QuestionSpec,
        answer: &str,
    ) -> Result<ScoreOutcome, JudgmentError> {
        if answer.trim().is_empty() {
            return Ok(ScoreOutcome::unanswered());
        }

        let outcome = match &question.ground_truth {
            GroundTruth::MultipleChoice { correct_answer } => {
                choice::score_choice(self, question, correct_answer, answer).await?
            }
            GroundTruth::FillInBlank { correct_answers } => {
                choice::score_blank(self, question, correct_answers, answer).await?
            }
            GroundTruth::Ordering { correct_sequence } => {
                ordering::score(question, correct_sequence, answer)
            }
            GroundTruth::Descriptive { .. }
            | GroundTruth::Programming { .. }
            | GroundTruth::Mathematical { .. } => weighted::score(self, question, answer).await?,
        };

        Ok(outcome.clamped(question.max_marks))
    }

    fn request(
        &self,
        question: &QuestionSpec,
        answer: &str,
        evidence: Value,
        instructions: &str,
        mode: JudgmentMode,
    ) -> JudgmentRequest {
        JudgmentRequest {
            question_id: question.id.clone(),
            question_type: question.question_type(),
            question_text: question.question_text.clone(),
            max_marks: question.max_marks,
            ground_truth: serde_json::to_value(&question.ground_truth).unwrap_or_default(),
            student_answer: answer.to_string(),
            criteria: question.criteria.clone(),
            evidence,
            instructions: instructions.to_string(),
            mode,
        }
    }

    async fn judge(&self, request: &JudgmentRequest) -> Result<Judgment, JudgmentError> {
        tokio::time::timeout(self.call_timeout, self.judge.judge(request))
            .await
            .map_err(|_| JudgmentError::Timeout(self.call_timeout.as_secs()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{RubricCriterion, TestCase};
    use crate::test_support::{question, ScriptedJudge};

    fn scorer(judge: ScriptedJudge) -> (RubricScorer, Arc<ScriptedJudge>) {
        let judge = Arc::new(judge);
        (RubricScorer::new(judge.clone(), Duration::from_secs(5)), judge)
    }

    #[tokio::test]
    async fn multiple_choice_is_decided_locally() {
        let (scorer, judge) = scorer(ScriptedJudge::default());
        let spec = question("Q1", 2.0, GroundTruth::MultipleChoice { correct_answer: "B".into() });

        let right = scorer.score(&spec, "(b)").await.expect("scored");
        assert_eq!(right.score, 2.0);
        let wrong = scorer.score(&spec, "I chose C").await.expect("scored");
        assert_eq!(wrong.score, 0.0);
        assert_eq!(judge.calls(), 0);
    }

    #[tokio::test]
    async fn multiple_choice_without_letter_asks_the_judge() {
        let (scorer, judge) =
            scorer(ScriptedJudge::default().with_equivalence("Q1", true, "second option"));
        let spec = question("Q1", 2.0, GroundTruth::MultipleChoice { correct_answer: "B".into() });

        let outcome = scorer.score(&spec, "the second one").await.expect("scored");
        assert_eq!(outcome.score, 2.0);
        assert_eq!(outcome.reasoning, "second option");
        assert_eq!(judge.calls(), 1);
    }

    #[tokio::test]
    async fn article_before_the_option_goes_to_the_judge() {
        let (scorer, judge) =
            scorer(ScriptedJudge::default().with_equivalence("Q1", true, "student picked C"));
        let spec = question("Q1", 2.0, GroundTruth::MultipleChoice { correct_answer: "C".into() });

        let outcome = scorer.score(&spec, "It is a C").await.expect("scored");
        assert_eq!(outcome.score, 2.0);
        assert_eq!(outcome.reasoning, "student picked C");
        assert_eq!(judge.calls(), 1);
    }

    #[tokio::test]
    async fn fill_in_blank_exact_match_skips_judge() {
        let (scorer, judge) = scorer(ScriptedJudge::default().with_equivalence("Q2", false, "no"));
        let spec = question(
            "Q2",
            1.0,
            GroundTruth::FillInBlank {
                correct_answers: vec!["Mitochondria".into(), "mitochondrion".into()],
            },
        );

        assert_eq!(scorer.score(&spec, "  mitochondria.").await.expect("exact").score, 1.0);
        assert_eq!(judge.calls(), 0);
        assert_eq!(scorer.score(&spec, "nucleus").await.expect("judged").score, 0.0);
        assert_eq!(judge.calls(), 1);
    }

    #[tokio::test]
    async fn weighted_types_stay_within_bounds_and_reconcile() {
        let (scorer, _) = scorer(ScriptedJudge::default().with_fractions(
            "Q4",
            &[("Correctness", 0.2), ("Logic", 1.0), ("Quality", 0.5), ("Efficiency", 0.5)],
        ));
        let mut spec = question(
            "Q4",
            8.0,
            GroundTruth::Programming {
                expected_output: "3".into(),
                test_cases: vec![
                    TestCase { input: "1 2".into(), expected_output: "3".into() },
                    TestCase { input: "2 2".into(), expected_output: "4".into() },
                ],
            },
        );
        spec.criteria = vec![
            RubricCriterion::new("Correctness", 50.0),
            RubricCriterion::new("Logic", 20.0),
            RubricCriterion::new("Quality", 15.0),
            RubricCriterion::new("Efficiency", 15.0),
        ];

        let outcome = scorer.score(&spec, "def add(a, b): return a + b").await.expect("scored");
        let sum = outcome.breakdown.contribution_sum().expect("criteria");
        assert!((sum - outcome.score).abs() < 1e-6);
        assert!((0.0..=8.0).contains(&outcome.score));
    }

    #[tokio::test]
    async fn judge_failure_surfaces_as_judgment_error() {
        let (scorer, _) = scorer(ScriptedJudge::default().failing("Q5", "model offline"));
        let spec = question(
            "Q5",
            5.0,
            GroundTruth::Descriptive { model_answer: "x".into(), key_concepts: Vec::new() },
        );
        let err = scorer.score(&spec, "something").await.expect_err("judge failed");
        let failed = ScoreOutcome::failed(&err);
        assert_eq!(failed.score, 0.0);
        assert!(failed.reasoning.starts_with("grading failed: "));
        assert!(failed.reasoning.contains("model offline"));
    }

    #[tokio::test]
    async fn blank_answers_score_zero_without_judge() {
        let (scorer, judge) = scorer(ScriptedJudge::default());
        let spec = question(
            "Q6",
            4.0,
            GroundTruth::Mathematical {
                correct_answer: "2".into(),
                solution_steps: Vec::new(),
                tolerance: None,
            },
        );
        let outcome = scorer.score(&spec, "   ").await.expect("scored");
        assert_eq!(outcome, ScoreOutcome::unanswered());
        assert_eq!(judge.calls(), 0);
    }
}

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use serde::Deserialize;
use sqlx::types::Json;

use crate::core::errors::{GradingError, PersistenceError, ValidationError};
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::models::{Exam, GradeEdit, GradingResult, Submission, TeacherOverride};
use crate::db::types::SubmissionStatus;
use crate::services::answer_extraction::{lookup_answer, validation_report};
use crate::services::rubric::{RubricScorer, ScoreOutcome};

use super::batch;

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub(crate) struct GradeOptions {
    /// Drops existing teacher overrides instead of carrying them onto the new results.
    #[serde(default)]
    pub(crate) reset_overrides: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct SubmissionGrade {
    pub(crate) results: Vec<GradingResult>,
    pub(crate) total_score: f64,
    pub(crate) total_max: f64,
}

impl SubmissionGrade {
    fn from_results(results: Vec<GradingResult>) -> Self {
        let total_score = results.iter().map(GradingResult::effective_score).sum();
        let total_max = results.iter().map(|result| result.max_marks).sum();
        Self { results, total_score, total_max }
    }
}

/// A page as received from an upload, before it is written to the page store.
#[derive(Debug, Clone)]
pub(crate) struct UploadedPage {
    pub(crate) file_name: String,
    pub(crate) bytes: Vec<u8>,
}

/// Single-paper upload. A second submission for the same student is rejected unless
/// `resubmit` is set.
pub(crate) async fn create_submission(
    state: &AppState,
    exam_id: &str,
    student_id: &str,
    pages: Vec<UploadedPage>,
    resubmit: bool,
) -> Result<Submission, GradingError> {
    let exam = state
        .store()
        .load_exam(exam_id)
        .await?
        .ok_or_else(|| PersistenceError::not_found("exam", exam_id))?;

    if pages.is_empty() {
        return Err(ValidationError::Invalid("at least one page image is required".into()).into());
    }

    if !resubmit {
        if let Some(existing) = state.store().find_submission_for_student(exam_id, student_id).await? {
            return Err(GradingError::Conflict(format!(
                "student {student_id} already has submission {} for exam {exam_id}",
                existing.id
            )));
        }
    }

    let mut submission = Submission::new(&exam, student_id, Vec::new(), primitive_now_utc());
    let mut page_paths = Vec::with_capacity(pages.len());
    for (index, page) in pages.iter().enumerate() {
        let path = state
            .pages()
            .save_page(&submission.id, student_id, index, &page.file_name, &page.bytes)
            .await?;
        page_paths.push(path);
    }
    submission.page_paths = Json(page_paths);
    state.store().save_submission(&submission).await?;

    tracing::info!(
        submission_id = %submission.id,
        exam_id,
        student_id,
        pages = submission.page_paths.len(),
        "Submission uploaded"
    );
    Ok(submission)
}

/// Runs OCR over the submission's pages and stores the merged answers.
///
/// On failure the submission is marked failed with the cause before the error is returned.
pub(crate) async fn extract(
    state: &AppState,
    submission: &mut Submission,
    exam: &Exam,
) -> Result<(), GradingError> {
    let question_ids = exam.question_ids();

    match state.extractor().extract(&submission.page_paths, &question_ids).await {
        Ok(answers) => {
            let report = validation_report(&question_ids, &answers);
            if !report.missing.is_empty() || !report.extra.is_empty() {
                tracing::warn!(
                    submission_id = %submission.id,
                    missing = ?report.missing,
                    extra = ?report.extra,
                    "Extracted answers do not line up with the answer key"
                );
            }
            submission.extracted_answers = Json(answers);
            submission.extraction_report = Some(Json(report));
            submission.status = SubmissionStatus::Extracted;
            submission.error_message = None;
            state.store().save_submission(submission).await?;
            metrics::counter!("extraction_jobs_total", "status" => "success").increment(1);
            Ok(())
        }
        Err(err) => {
            tracing::error!(submission_id = %submission.id, error = %err, "Answer extraction failed");
            metrics::counter!("extraction_jobs_total", "status" => "failed").increment(1);
            submission.status = SubmissionStatus::Failed;
            submission.error_message = Some(err.to_string());
            state.store().save_submission(submission).await?;
            Err(err.into())
        }
    }
}

/// Scores every exam question in exam order. Never fails: a judgment failure becomes a
/// zero-score row carrying the cause.
pub(crate) async fn score_questions(
    scorer: &RubricScorer,
    exam: &Exam,
    submission_id: &str,
    answers: &BTreeMap<String, String>,
    previous: &[GradingResult],
    options: GradeOptions,
) -> SubmissionGrade {
    let previous: HashMap<&str, &GradingResult> =
        previous.iter().map(|result| (result.question_id.as_str(), result)).collect();

    let mut results = Vec::with_capacity(exam.questions.len());
    for (position, question) in exam.questions.iter().enumerate() {
        let outcome = match lookup_answer(answers, &question.id) {
            None => ScoreOutcome::unanswered(),
            Some(answer) => match scorer.score(question, answer).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!(
                        submission_id,
                        question_id = %question.id,
                        error = %err,
                        "Question scored zero after judgment failure"
                    );
                    ScoreOutcome::failed(&err)
                }
            },
        };

        let teacher_override = if options.reset_overrides {
            None
        } else {
            previous.get(question.id.as_str()).and_then(|result| result.teacher_override.clone())
        };

        results.push(GradingResult {
            submission_id: submission_id.to_string(),
            question_id: question.id.clone(),
            position: position as i32,
            question_type: question.question_type(),
            max_marks: question.max_marks,
            ai_score: outcome.score,
            reasoning: outcome.reasoning,
            breakdown: Json(outcome.breakdown),
            teacher_override,
            graded_at: primitive_now_utc(),
        });
    }

    SubmissionGrade::from_results(results)
}

/// Grades an extracted submission and persists the result group before marking it graded.
pub(crate) async fn grade(
    state: &AppState,
    submission: &mut Submission,
    exam: &Exam,
    options: GradeOptions,
) -> Result<SubmissionGrade, GradingError> {
    if !matches!(submission.status, SubmissionStatus::Extracted | SubmissionStatus::Graded) {
        return Err(GradingError::InvalidState(format!(
            "submission {} has no extracted answers",
            submission.id
        )));
    }

    let started = Instant::now();
    let previous = state.store().load_grading_results(&submission.id).await?;
    let graded = score_questions(
        state.scorer(),
        exam,
        &submission.id,
        &submission.extracted_answers,
        &previous,
        options,
    )
    .await;

    state.store().save_grading_results(&submission.id, &graded.results).await?;

    submission.status = SubmissionStatus::Graded;
    submission.total_score = Some(graded.total_score);
    submission.total_max = graded.total_max;
    submission.error_message = None;
    submission.graded_at = Some(primitive_now_utc());
    state.store().save_submission(submission).await?;

    metrics::counter!("grading_jobs_total", "status" => "success").increment(1);
    metrics::histogram!("grading_duration_seconds").record(started.elapsed().as_secs_f64());
    tracing::info!(
        submission_id = %submission.id,
        student_id = %submission.student_id,
        total_score = graded.total_score,
        total_max = graded.total_max,
        "Submission graded"
    );

    Ok(graded)
}

/// Extracts when no answers are stored yet, then grades.
pub(crate) async fn process(
    state: &AppState,
    submission: &mut Submission,
    exam: &Exam,
    options: GradeOptions,
) -> Result<SubmissionGrade, GradingError> {
    if needs_extraction(submission) {
        extract(state, submission, exam).await?;
    }
    grade(state, submission, exam, options).await
}

pub(crate) fn needs_extraction(submission: &Submission) -> bool {
    matches!(submission.status, SubmissionStatus::Uploaded | SubmissionStatus::Failed)
}

pub(crate) async fn load_with_exam(
    state: &AppState,
    submission_id: &str,
) -> Result<(Submission, Exam), GradingError> {
    let submission = state
        .store()
        .load_submission(submission_id)
        .await?
        .ok_or_else(|| PersistenceError::not_found("submission", submission_id))?;
    let exam = state
        .store()
        .load_exam(&submission.exam_id)
        .await?
        .ok_or_else(|| PersistenceError::not_found("exam", &submission.exam_id))?;
    Ok((submission, exam))
}

/// Sets a teacher override on one question. The AI score and reasoning stay on the row and
/// every edit is appended to the audit trail.
pub(crate) async fn edit_grade(
    state: &AppState,
    submission_id: &str,
    question_id: &str,
    new_score: f64,
    comment: Option<String>,
) -> Result<GradingResult, GradingError> {
    let (mut submission, _) = load_with_exam(state, submission_id).await?;
    let mut results = state.store().load_grading_results(submission_id).await?;

    let Some(result) = results.iter_mut().find(|result| result.question_id == question_id) else {
        return Err(PersistenceError::not_found("grading result", question_id).into());
    };

    if !new_score.is_finite() || new_score < 0.0 || new_score > result.max_marks {
        return Err(ValidationError::ScoreOutOfRange {
            question_id: question_id.to_string(),
            score: new_score,
            max: result.max_marks,
        }
        .into());
    }

    let now = primitive_now_utc();
    let previous_score = result.effective_score();
    result.teacher_override =
        Some(Json(TeacherOverride { score: new_score, comment: comment.clone(), overridden_at: now }));
    let updated = result.clone();

    state.store().save_grading_results(submission_id, &results).await?;

    let totals = SubmissionGrade::from_results(results);
    submission.total_score = Some(totals.total_score);
    state.store().save_submission(&submission).await?;
    batch::sync_entry_totals(state, &submission).await?;

    state
        .store()
        .save_grade_edit(&GradeEdit {
            id: uuid::Uuid::new_v4().to_string(),
            submission_id: submission_id.to_string(),
            question_id: question_id.to_string(),
            previous_score,
            new_score,
            comment,
            edited_at: now,
        })
        .await?;

    tracing::info!(submission_id, question_id, previous_score, new_score, "Grade overridden");
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Breakdown;
    use crate::test_support::{full_marks_answers, sample_exam, setup_test_context_with, ScriptedJudge, ScriptedOcr};

    fn pages(count: usize) -> Vec<UploadedPage> {
        (1..=count)
            .map(|index| UploadedPage { file_name: format!("p{index}.jpg"), bytes: vec![0xFF, 0xD8, 0xFF] })
            .collect()
    }

    #[tokio::test]
    async fn single_paper_flow_grades_every_question() {
        let ctx = setup_test_context_with(
            ScriptedOcr::default().with_page("p1", &full_marks_answers()),
            ScriptedJudge::default(),
        )
        .await;
        let exam = sample_exam();
        ctx.state.store().save_exam(&exam).await.expect("exam");

        let mut submission =
            create_submission(&ctx.state, &exam.id, "S1", pages(1), false).await.expect("created");
        let graded = process(&ctx.state, &mut submission, &exam, GradeOptions::default())
            .await
            .expect("graded");

        assert_eq!(graded.results.len(), 4);
        assert!((graded.total_score - 10.0).abs() < 1e-9);
        assert_eq!(graded.total_max, 10.0);
        let ids: Vec<&str> = graded.results.iter().map(|r| r.question_id.as_str()).collect();
        assert_eq!(ids, vec!["Q1", "Q2", "Q3", "Q4"]);

        let stored = ctx.state.store().load_submission(&submission.id).await.expect("load").expect("some");
        assert_eq!(stored.status, SubmissionStatus::Graded);
        assert!((stored.total_score.unwrap_or_default() - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn duplicate_upload_requires_resubmit() {
        let ctx = setup_test_context_with(ScriptedOcr::default(), ScriptedJudge::default()).await;
        let exam = sample_exam();
        ctx.state.store().save_exam(&exam).await.expect("exam");

        create_submission(&ctx.state, &exam.id, "S1", pages(1), false).await.expect("first");
        let duplicate = create_submission(&ctx.state, &exam.id, "S1", pages(1), false).await;
        assert!(matches!(duplicate, Err(GradingError::Conflict(_))));
        create_submission(&ctx.state, &exam.id, "S1", pages(2), true).await.expect("resubmit");
    }

    #[tokio::test]
    async fn missing_answers_and_judge_failures_score_zero() {
        let ctx = setup_test_context_with(
            ScriptedOcr::default().with_page("p1", &[("Q1", "B"), ("Q4", "light")]),
            ScriptedJudge::default().failing("Q4", "model offline"),
        )
        .await;
        let exam = sample_exam();
        ctx.state.store().save_exam(&exam).await.expect("exam");

        let mut submission =
            create_submission(&ctx.state, &exam.id, "S1", pages(1), false).await.expect("created");
        let graded = process(&ctx.state, &mut submission, &exam, GradeOptions::default())
            .await
            .expect("graded");

        let q2 = &graded.results[1];
        assert_eq!(q2.ai_score, 0.0);
        assert_eq!(q2.reasoning, "no answer extracted");
        let q4 = &graded.results[3];
        assert_eq!(q4.ai_score, 0.0);
        assert!(q4.reasoning.contains("model offline"));
        assert!(matches!(q4.breakdown.0, Breakdown::Failed { .. }));
        assert_eq!(graded.total_score, 2.0);

        let report = submission.extraction_report.as_ref().expect("report");
        assert_eq!(report.missing, vec!["Q2".to_string(), "Q3".to_string()]);
    }

    #[tokio::test]
    async fn override_survives_regrade_unless_reset() {
        let ctx = setup_test_context_with(
            ScriptedOcr::default().with_page("p1", &[("Q1", "C")]),
            ScriptedJudge::default(),
        )
        .await;
        let exam = sample_exam();
        ctx.state.store().save_exam(&exam).await.expect("exam");

        let mut submission =
            create_submission(&ctx.state, &exam.id, "S1", pages(1), false).await.expect("created");
        process(&ctx.state, &mut submission, &exam, GradeOptions::default()).await.expect("graded");

        let edited = edit_grade(&ctx.state, &submission.id, "Q1", 1.5, Some("partial".into()))
            .await
            .expect("edited");
        assert_eq!(edited.effective_score(), 1.5);
        assert_eq!(edited.ai_score, 0.0);
        assert!(!edited.reasoning.is_empty());

        let edits = ctx.state.store().list_grade_edits(&submission.id).await.expect("edits");
        assert_eq!(edits.len(), 1);
        assert_eq!((edits[0].previous_score, edits[0].new_score), (0.0, 1.5));

        let (mut reloaded, _) = load_with_exam(&ctx.state, &submission.id).await.expect("reload");
        assert_eq!(reloaded.total_score, Some(1.5));
        let regraded = grade(&ctx.state, &mut reloaded, &exam, GradeOptions::default())
            .await
            .expect("regraded");
        assert_eq!(regraded.results[0].effective_score(), 1.5);
        assert_eq!(regraded.total_score, 1.5);

        let reset = grade(&ctx.state, &mut reloaded, &exam, GradeOptions { reset_overrides: true })
            .await
            .expect("reset");
        assert!(reset.results[0].teacher_override.is_none());
        assert_eq!(reset.total_score, 0.0);
    }

    #[tokio::test]
    async fn edit_grade_rejects_out_of_range_scores() {
        let ctx = setup_test_context_with(
            ScriptedOcr::default().with_page("p1", &[("Q1", "B")]),
            ScriptedJudge::default(),
        )
        .await;
        let exam = sample_exam();
        ctx.state.store().save_exam(&exam).await.expect("exam");
        let mut submission =
            create_submission(&ctx.state, &exam.id, "S1", pages(1), false).await.expect("created");
        process(&ctx.state, &mut submission, &exam, GradeOptions::default()).await.expect("graded");

        let too_high = edit_grade(&ctx.state, &submission.id, "Q1", 2.5, None).await;
        assert!(matches!(
            too_high,
            Err(GradingError::Validation(ValidationError::ScoreOutOfRange { .. }))
        ));
        let negative = edit_grade(&ctx.state, &submission.id, "Q1", -1.0, None).await;
        assert!(negative.is_err());
        let unknown = edit_grade(&ctx.state, &submission.id, "Q9", 1.0, None).await;
        assert!(matches!(unknown, Err(GradingError::Persistence(PersistenceError::NotFound { .. }))));
    }

    #[tokio::test]
    async fn extraction_failure_marks_submission_failed() {
        let ctx = setup_test_context_with(
            ScriptedOcr::default().failing_page("p1"),
            ScriptedJudge::default(),
        )
        .await;
        let exam = sample_exam();
        ctx.state.store().save_exam(&exam).await.expect("exam");
        let mut submission =
            create_submission(&ctx.state, &exam.id, "S1", pages(1), false).await.expect("created");

        let result = process(&ctx.state, &mut submission, &exam, GradeOptions::default()).await;
        assert!(matches!(result, Err(GradingError::Extraction(_))));
        let stored = ctx.state.store().load_submission(&submission.id).await.expect("load").expect("some");
        assert_eq!(stored.status, SubmissionStatus::Failed);
        assert!(stored.error_message.unwrap_or_default().contains("vision model unavailable"));
    }
}

use serde::{Deserialize, Serialize};
use sqlx::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "questiontype", rename_all = "snake_case")]
pub(crate) enum QuestionType {
    #[serde(alias = "mcq")]
    MultipleChoice,
    #[serde(alias = "fill_in_the_blank")]
    FillInBlank,
    Descriptive,
    #[serde(alias = "sequence")]
    Ordering,
    Programming,
    Mathematical,
}

impl QuestionType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::MultipleChoice => "multiple_choice",
            Self::FillInBlank => "fill_in_blank",
            Self::Descriptive => "descriptive",
            Self::Ordering => "ordering",
            Self::Programming => "programming",
            Self::Mathematical => "mathematical",
        }
    }

    /// Types graded as a weighted sum over named rubric criteria.
    pub(crate) fn uses_criteria(self) -> bool {
        matches!(self, Self::Descriptive | Self::Programming | Self::Mathematical)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "submissionstatus", rename_all = "lowercase")]
pub(crate) enum SubmissionStatus {
    Uploaded,
    Extracted,
    Graded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "batchstatus", rename_all = "lowercase")]
pub(crate) enum BatchStatus {
    Uploaded,
    Grading,
    Completed,
    Failed,
}

impl BatchStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Grading => "grading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "entrystatus", rename_all = "lowercase")]
pub(crate) enum EntryStatus {
    Pending,
    Extracting,
    Extracted,
    Grading,
    Graded,
    Failed,
}

impl EntryStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Extracting => "extracting",
            Self::Extracted => "extracted",
            Self::Grading => "grading",
            Self::Graded => "graded",
            Self::Failed => "failed",
        }
    }

    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Graded | Self::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_type_accepts_legacy_aliases() {
        let mcq: QuestionType = serde_json::from_str("\"mcq\"").expect("mcq alias");
        assert_eq!(mcq, QuestionType::MultipleChoice);
        let sequence: QuestionType = serde_json::from_str("\"sequence\"").expect("sequence alias");
        assert_eq!(sequence, QuestionType::Ordering);
        assert_eq!(serde_json::to_string(&QuestionType::FillInBlank).unwrap(), "\"fill_in_blank\"");
    }

    #[test]
    fn only_graded_and_failed_are_terminal() {
        let terminal = [
            EntryStatus::Pending,
            EntryStatus::Extracting,
            EntryStatus::Extracted,
            EntryStatus::Grading,
            EntryStatus::Graded,
            EntryStatus::Failed,
        ]
        .into_iter()
        .filter(|status| status.is_terminal())
        .collect::<Vec<_>>();
        assert_eq!(terminal, vec![EntryStatus::Graded, EntryStatus::Failed]);
    }
}

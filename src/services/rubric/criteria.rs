use std::collections::HashSet;

use crate::core::errors::ValidationError;
use crate::db::models::RubricCriterion;
use crate::db::types::QuestionType;

pub(crate) const WEIGHT_TOTAL: f64 = 100.0;
pub(crate) const WEIGHT_TOLERANCE: f64 = 1e-6;

pub(crate) fn default_criteria(question_type: QuestionType) -> Vec<RubricCriterion> {
    let defaults: &[(&str, f64)] = match question_type {
        QuestionType::Descriptive => {
            &[("Concept Coverage", 40.0), ("Accuracy", 30.0), ("Completeness", 20.0), ("Clarity", 10.0)]
        }
        QuestionType::Programming => {
            &[("Correctness", 50.0), ("Logic", 20.0), ("Quality", 15.0), ("Efficiency", 15.0)]
        }
        QuestionType::Mathematical => {
            &[("Final Answer", 40.0), ("Method", 30.0), ("Steps", 20.0), ("Notation", 10.0)]
        }
        QuestionType::MultipleChoice | QuestionType::FillInBlank | QuestionType::Ordering => &[],
    };
    defaults.iter().map(|(name, weight)| RubricCriterion::new(name, *weight)).collect()
}

/// Case and punctuation insensitive key, so `final_answer` matches `Final Answer`.
pub(crate) fn criterion_key(name: &str) -> String {
    name.chars().filter(|ch| ch.is_alphanumeric()).flat_map(char::to_lowercase).collect()
}

pub(crate) fn validate_criteria(
    question_id: &str,
    criteria: &[RubricCriterion],
) -> Result<(), ValidationError> {
    if criteria.is_empty() {
        return Err(ValidationError::question(question_id, "rubric criteria must not be empty"));
    }

    let mut seen = HashSet::new();
    for criterion in criteria {
        let key = criterion_key(&criterion.name);
        if key.is_empty() {
            return Err(ValidationError::question(question_id, "criterion name must not be empty"));
        }
        if !seen.insert(key) {
            return Err(ValidationError::question(
                question_id,
                format!("duplicate criterion '{}'", criterion.name),
            ));
        }
        if !criterion.weight.is_finite() || criterion.weight < 0.0 {
            return Err(ValidationError::question(
                question_id,
                format!("criterion '{}' has invalid weight {}", criterion.name, criterion.weight),
            ));
        }
    }

    let total: f64 = criteria.iter().map(|criterion| criterion.weight).sum();
    if (total - WEIGHT_TOTAL).abs() > WEIGHT_TOLERANCE {
        return Err(ValidationError::question(
            question_id,
            format!("criteria weights must sum to 100, got {total}"),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_sum_to_one_hundred() {
        for question_type in
            [QuestionType::Descriptive, QuestionType::Programming, QuestionType::Mathematical]
        {
            let criteria = default_criteria(question_type);
            assert_eq!(criteria.len(), 4);
            assert!(validate_criteria("Q", &criteria).is_ok());
        }
        assert!(default_criteria(QuestionType::Ordering).is_empty());
    }

    #[test]
    fn weights_off_by_one_are_rejected() {
        for weights in [[40.0, 30.0, 20.0, 9.0], [40.0, 30.0, 20.0, 11.0]] {
            let criteria: Vec<_> = ["a", "b", "c", "d"]
                .iter()
                .zip(weights)
                .map(|(name, weight)| RubricCriterion::new(name, weight))
                .collect();
            let err = validate_criteria("Q7", &criteria).expect_err("weights rejected");
            assert!(err.to_string().starts_with("Q7:"));
        }
    }

    #[test]
    fn duplicate_and_negative_criteria_are_rejected() {
        let duplicate = vec![RubricCriterion::new("Logic", 50.0), RubricCriterion::new("logic", 50.0)];
        assert!(validate_criteria("Q", &duplicate).is_err());

        let negative = vec![RubricCriterion::new("a", 110.0), RubricCriterion::new("b", -10.0)];
        assert!(validate_criteria("Q", &negative).is_err());
    }

    #[test]
    fn criterion_key_ignores_case_and_separators() {
        assert_eq!(criterion_key("Final Answer"), criterion_key("final_answer"));
    }
}

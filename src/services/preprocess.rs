//! Per-type answer normalisation. The output doubles as local decision input for the rubric
//! scorer and as evidence attached to judgment prompts.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;

use crate::db::models::GroundTruth;

const STOPWORDS: &[&str] = &["a", "an", "the", "is", "are", "was", "were", "in", "on", "at", "to", "for"];

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ChoiceEvidence {
    pub(crate) raw_answer: String,
    pub(crate) extracted_option: Option<String>,
    pub(crate) confidence: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct BlankEvidence {
    pub(crate) cleaned_answer: String,
    pub(crate) key_words: Vec<String>,
    pub(crate) word_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct DescriptiveEvidence {
    pub(crate) word_count: usize,
    pub(crate) sentence_count: usize,
    pub(crate) avg_sentence_length: f64,
    pub(crate) key_terms: Vec<String>,
    pub(crate) answer_length: &'static str,
    pub(crate) concepts_found: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SequenceEvidence {
    pub(crate) extracted_sequence: Vec<String>,
    pub(crate) sequence_length: usize,
    pub(crate) has_duplicates: bool,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CodeEvidence {
    pub(crate) detected_language: &'static str,
    pub(crate) line_count: usize,
    pub(crate) functions_defined: Vec<String>,
    pub(crate) has_comments: bool,
    pub(crate) has_loops: bool,
    pub(crate) has_conditionals: bool,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct MathEvidence {
    pub(crate) final_answer: Option<String>,
    pub(crate) numbers_found: Vec<String>,
    pub(crate) operators_found: Vec<char>,
    pub(crate) has_equation: bool,
    pub(crate) steps_shown: usize,
}

pub(crate) fn evidence(ground_truth: &GroundTruth, answer: &str) -> Value {
    let value = match ground_truth {
        GroundTruth::MultipleChoice { .. } => serde_json::to_value(choice(answer)),
        GroundTruth::FillInBlank { .. } => serde_json::to_value(blank(answer)),
        GroundTruth::Descriptive { key_concepts, .. } => {
            serde_json::to_value(descriptive(answer, key_concepts))
        }
        GroundTruth::Ordering { .. } => serde_json::to_value(sequence(answer)),
        GroundTruth::Programming { .. } => serde_json::to_value(code(answer)),
        GroundTruth::Mathematical { .. } => serde_json::to_value(math(answer)),
    };
    value.unwrap_or(Value::Null)
}

pub(crate) fn choice(answer: &str) -> ChoiceEvidence {
    let raw_answer = answer.trim().to_uppercase();
    let extracted_option = extract_option(answer);
    let confidence = if extracted_option.is_some() { "high" } else { "low" };
    ChoiceEvidence { raw_answer, extracted_option, confidence }
}

/// The standalone option letter A-H, e.g. `"(b)"` or `"Option C"`.
///
/// Returns `None` when the text names more than one distinct letter or when the only
/// candidate is a lowercase `a` sitting between other words, which reads as an article.
pub(crate) fn extract_option(answer: &str) -> Option<String> {
    let tokens: Vec<&str> =
        answer.split(|ch: char| !ch.is_alphanumeric()).filter(|token| !token.is_empty()).collect();

    let candidates: Vec<(usize, char)> = tokens
        .iter()
        .enumerate()
        .filter_map(|(idx, token)| {
            let mut chars = token.chars();
            match (chars.next(), chars.next()) {
                (Some(ch), None) if ('A'..='H').contains(&ch.to_ascii_uppercase()) => Some((idx, ch)),
                _ => None,
            }
        })
        .collect();

    let distinct: HashSet<char> = candidates.iter().map(|(_, ch)| ch.to_ascii_uppercase()).collect();
    if distinct.len() != 1 {
        return None;
    }

    let article = candidates
        .iter()
        .all(|(idx, ch)| *ch == 'a' && *idx > 0 && *idx + 1 < tokens.len());
    if article {
        return None;
    }

    distinct.into_iter().next().map(String::from)
}

pub(crate) fn blank(answer: &str) -> BlankEvidence {
    let words: Vec<&str> = answer.split_whitespace().collect();
    let key_words = words
        .iter()
        .filter(|word| !STOPWORDS.contains(&word.to_lowercase().as_str()))
        .map(|word| word.to_string())
        .collect();
    BlankEvidence { cleaned_answer: normalize_text(answer), key_words, word_count: words.len() }
}

/// Lowercase, punctuation stripped, whitespace collapsed.
pub(crate) fn normalize_text(value: &str) -> String {
    value
        .chars()
        .filter(|ch| !ch.is_ascii_punctuation())
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn descriptive(answer: &str, key_concepts: &[String]) -> DescriptiveEvidence {
    let sentence_count = answer
        .split(['.', '!', '?'])
        .filter(|sentence| !sentence.trim().is_empty())
        .count();
    let lowered = answer.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();
    let word_count = words.len();

    let mut seen = HashSet::new();
    let key_terms = words
        .iter()
        .filter(|word| word.chars().count() > 4)
        .filter(|word| seen.insert(**word))
        .take(20)
        .map(|word| word.to_string())
        .collect();

    let answer_length = match word_count {
        0..=49 => "short",
        50..=149 => "medium",
        _ => "long",
    };

    let concepts_found = key_concepts
        .iter()
        .filter(|concept| !concept.trim().is_empty())
        .filter(|concept| lowered.contains(&concept.trim().to_lowercase()))
        .cloned()
        .collect();

    let avg_sentence_length = if sentence_count == 0 {
        0.0
    } else {
        ((word_count as f64 / sentence_count as f64) * 100.0).round() / 100.0
    };

    DescriptiveEvidence {
        word_count,
        sentence_count,
        avg_sentence_length,
        key_terms,
        answer_length,
        concepts_found,
    }
}

pub(crate) fn sequence(answer: &str) -> SequenceEvidence {
    let extracted_sequence = tokenize_sequence(answer);
    let unique: HashSet<String> =
        extracted_sequence.iter().map(|item| item.to_lowercase()).collect();
    SequenceEvidence {
        sequence_length: extracted_sequence.len(),
        has_duplicates: unique.len() != extracted_sequence.len(),
        extracted_sequence,
    }
}

/// Splits an ordering answer into items.
///
/// Explicit separators (`,` `;` `->` `→` `=>` `>` and newlines) take precedence; an answer
/// without any is split on whitespace. List markers such as `1.`, `2)` or `b)` are removed
/// when they label an item, and inline markers group the words that follow them.
/// Duplicates are kept so they count as positions.
pub(crate) fn tokenize_sequence(answer: &str) -> Vec<String> {
    let unified = answer.replace("->", ",").replace("=>", ",").replace(['→', '>', ';', '\n'], ",");
    let items: Vec<String> = if unified.contains(',') {
        unified.split(',').map(|part| strip_enumerator(part).to_string()).collect()
    } else {
        group_inline_items(&unified)
    };

    items
        .into_iter()
        .map(|item| item.trim_matches(|ch: char| !ch.is_alphanumeric()).to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// `1.`, `12)`, `(3)`, `a.` or `h)`.
fn is_enumerator(token: &str) -> bool {
    let token = token.strip_prefix('(').unwrap_or(token);
    let Some(label) = token.strip_suffix(['.', ')']) else {
        return false;
    };
    let numeric = !label.is_empty() && label.chars().all(|ch| ch.is_ascii_digit());
    let lettered = label.chars().count() == 1
        && label.chars().all(|ch| ('a'..='h').contains(&ch.to_ascii_lowercase()));
    numeric || lettered
}

fn strip_enumerator(item: &str) -> &str {
    let item = item.trim();
    match item.split_once(char::is_whitespace) {
        Some((head, rest)) if is_enumerator(head) && !rest.trim().is_empty() => rest.trim(),
        _ => item,
    }
}

/// A marker only counts when a plain word follows it, so `A. B. C.` stays three items.
fn group_inline_items(answer: &str) -> Vec<String> {
    let tokens: Vec<&str> = answer.split_whitespace().collect();
    let is_marker = |idx: usize| {
        is_enumerator(tokens[idx]) && tokens.get(idx + 1).is_some_and(|next| !is_enumerator(next))
    };

    if !(0..tokens.len()).any(|idx| is_marker(idx)) {
        return tokens.iter().map(|token| token.to_string()).collect();
    }

    let mut items = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for (idx, token) in tokens.iter().enumerate() {
        if is_marker(idx) {
            if !current.is_empty() {
                items.push(current.join(" "));
                current.clear();
            }
        } else {
            current.push(*token);
        }
    }
    if !current.is_empty() {
        items.push(current.join(" "));
    }
    items
}

pub(crate) fn code(answer: &str) -> CodeEvidence {
    let line_count = answer.lines().filter(|line| !line.trim().is_empty()).count();

    let detected_language = if answer.contains("def ") || answer.contains("import ") {
        "python"
    } else if answer.contains("fn ") && answer.contains("->") {
        "rust"
    } else if answer.contains("function ") || answer.contains("const ") || answer.contains("let ") {
        "javascript"
    } else if answer.contains("public class") || answer.contains("public static void") {
        "java"
    } else if answer.contains("#include") {
        "c/c++"
    } else {
        "unknown"
    };

    let functions_defined = ["def ", "function ", "fn "]
        .iter()
        .flat_map(|keyword| answer.match_indices(keyword).map(move |(idx, _)| idx + keyword.len()))
        .filter_map(|start| {
            let name: String = answer[start..]
                .chars()
                .take_while(|ch| ch.is_alphanumeric() || *ch == '_')
                .collect();
            (!name.is_empty()).then_some(name)
        })
        .collect();

    CodeEvidence {
        detected_language,
        line_count,
        functions_defined,
        has_comments: answer.contains('#') || answer.contains("//") || answer.contains("/*"),
        has_loops: ["for", "while", "loop"].iter().any(|keyword| answer.contains(keyword)),
        has_conditionals: ["if", "else", "elif", "switch", "match"]
            .iter()
            .any(|keyword| answer.contains(keyword)),
    }
}

pub(crate) fn math(answer: &str) -> MathEvidence {
    let steps_shown = answer.lines().filter(|line| line.contains('=')).count();
    MathEvidence {
        final_answer: final_answer(answer),
        numbers_found: numbers_in(answer),
        operators_found: answer.chars().filter(|ch| "+-*/=<>^".contains(*ch)).collect(),
        has_equation: answer.contains('='),
        steps_shown,
    }
}

/// The text after the last `=`, or the last non-empty line when there is no equation.
pub(crate) fn final_answer(answer: &str) -> Option<String> {
    let candidate = match answer.rfind('=') {
        Some(idx) => answer[idx + 1..].lines().next().unwrap_or_default(),
        None => answer.lines().rev().find(|line| !line.trim().is_empty()).unwrap_or_default(),
    };
    let trimmed = candidate.trim().trim_end_matches('.').trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Parses plain decimals, scientific notation and simple `a/b` fractions.
pub(crate) fn parse_number(value: &str) -> Option<f64> {
    let cleaned: String =
        value.trim().trim_matches('$').chars().filter(|ch| !ch.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }

    if let Some((numerator, denominator)) = cleaned.split_once('/') {
        let numerator = numerator.trim_start_matches('(').parse::<f64>().ok()?;
        let denominator = denominator.trim_end_matches(')').parse::<f64>().ok()?;
        if denominator == 0.0 {
            return None;
        }
        return Some(numerator / denominator).filter(|value| value.is_finite());
    }

    cleaned.parse::<f64>().ok().filter(|value| value.is_finite())
}

/// Relative comparison; two zeros are equal.
pub(crate) fn numbers_equivalent(left: f64, right: f64, tolerance: f64) -> bool {
    let scale = left.abs().max(right.abs());
    if scale == 0.0 {
        return true;
    }
    (left - right).abs() <= tolerance * scale
}

fn numbers_in(answer: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut current = String::new();
    let mut previous: Option<char> = None;

    for ch in answer.chars() {
        let starts_negative = ch == '-'
            && current.is_empty()
            && !previous.map(|prev| prev.is_alphanumeric()).unwrap_or(false);
        if ch.is_ascii_digit() || (ch == '.' && !current.is_empty()) || starts_negative {
            current.push(ch);
        } else if !current.is_empty() {
            push_number(&mut found, &mut current);
        }
        previous = Some(ch);
    }
    push_number(&mut found, &mut current);
    found
}

fn push_number(found: &mut Vec<String>, current: &mut String) {
    let candidate = current.trim_end_matches('.');
    if candidate.chars().any(|ch| ch.is_ascii_digit()) {
        found.push(candidate.to_string());
    }
    current.clear();
}

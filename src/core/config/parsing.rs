use std::env;
use std::str::FromStr;

use super::types::{ConfigError, Environment, MergePolicy, StorageBackend};

const LOCAL_CORS_ORIGINS: &[&str] =
    &["http://localhost:5173", "http://localhost:3000", "http://localhost:8080"];

const SUPPORTED_IMAGE_EXTENSIONS: &[&str] =
    &["jpg", "jpeg", "png", "webp", "gif", "bmp", "tiff"];

/// Trimmed value of `key`; unset and blank are both `None`.
pub(super) fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

pub(super) fn env_or_default(key: &str, default: &str) -> String {
    env_optional(key).unwrap_or_else(|| default.to_string())
}

/// Reads `key` as a number, falling back to `default` when unset.
pub(super) fn env_number<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env_optional(key) {
        Some(raw) => parse_number(key, raw),
        None => Ok(default),
    }
}

pub(super) fn parse_number<T: FromStr>(field: &'static str, value: String) -> Result<T, ConfigError> {
    value.parse::<T>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn env_flag(key: &str) -> bool {
    env_optional(key).is_some_and(|value| parse_bool(&value))
}

pub(super) fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Accepts a JSON array or a comma separated list; blank input means the local dev origins.
pub(super) fn parse_cors_origins(value: Option<String>) -> Result<Vec<String>, ConfigError> {
    let raw = value.unwrap_or_default();
    let origins: Vec<String> = if raw.trim_start().starts_with('[') {
        serde_json::from_str(&raw).map_err(|_| ConfigError::InvalidCors(raw.clone()))?
    } else {
        split_list(&raw).collect()
    };

    if origins.is_empty() {
        return Ok(LOCAL_CORS_ORIGINS.iter().map(|origin| origin.to_string()).collect());
    }
    Ok(origins)
}

/// Lower-cased extension list; a leading dot is dropped (`.JPG` → `jpg`).
pub(super) fn parse_extensions(value: Option<String>, defaults: &[&str]) -> Vec<String> {
    match value {
        Some(raw) => split_list(&raw)
            .map(|item| item.trim_start_matches('.').to_ascii_lowercase())
            .filter(|item| !item.is_empty())
            .collect(),
        None => defaults.iter().map(|item| item.to_string()).collect(),
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty()).map(str::to_string)
}

pub(super) fn parse_environment(value: Option<String>) -> Environment {
    match value.map(|item| item.to_ascii_lowercase()).as_deref() {
        Some("production" | "prod") => Environment::Production,
        Some("staging") => Environment::Staging,
        Some("test" | "testing") => Environment::Test,
        _ => Environment::Development,
    }
}

pub(super) fn parse_storage_backend(value: Option<String>) -> Result<StorageBackend, ConfigError> {
    match value.map(|item| item.to_ascii_lowercase()) {
        None => Ok(StorageBackend::Postgres),
        Some(val) => match val.as_str() {
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "memory" | "in-memory" => Ok(StorageBackend::Memory),
            _ => Err(ConfigError::InvalidValue { field: "STORAGE_BACKEND", value: val }),
        },
    }
}

pub(super) fn parse_merge_policy(value: Option<String>) -> Result<MergePolicy, ConfigError> {
    match value.map(|item| item.to_ascii_lowercase().replace('-', "_")) {
        None => Ok(MergePolicy::default()),
        Some(val) => match val.as_str() {
            "last_non_empty" | "last" => Ok(MergePolicy::LastNonEmpty),
            "first_non_empty" | "first" => Ok(MergePolicy::FirstNonEmpty),
            "concatenate" | "concat" => Ok(MergePolicy::Concatenate),
            _ => Err(ConfigError::InvalidValue { field: "ANSWER_MERGE_POLICY", value: val }),
        },
    }
}

pub(super) fn is_supported_image_extension(extension: &str) -> bool {
    SUPPORTED_IMAGE_EXTENSIONS.contains(&extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_origins_from_json_or_list() {
        let json = parse_cors_origins(Some("[\"http://a\",\"http://b\"]".to_string())).expect("json");
        assert_eq!(json, vec!["http://a".to_string(), "http://b".to_string()]);

        let list = parse_cors_origins(Some("http://a, http://b,".to_string())).expect("list");
        assert_eq!(list, json);

        let blank = parse_cors_origins(Some(" ".to_string())).expect("blank");
        assert_eq!(blank.len(), LOCAL_CORS_ORIGINS.len());
        assert!(parse_cors_origins(Some("[not json".to_string())).is_err());
    }

    #[test]
    fn numbers_and_flags() {
        assert_eq!(parse_number::<u16>("GRADER_PORT", "8000".to_string()).expect("port"), 8000);
        assert!(parse_number::<usize>("GRADING_CONCURRENCY", "-1".to_string()).is_err());
        assert!(parse_bool("YES"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("0"));
    }

    #[test]
    fn environment_aliases() {
        assert_eq!(parse_environment(Some("PROD".to_string())), Environment::Production);
        assert_eq!(parse_environment(Some("testing".to_string())), Environment::Test);
        assert_eq!(parse_environment(None), Environment::Development);
    }

    #[test]
    fn merge_policy_names() {
        assert_eq!(parse_merge_policy(None).expect("default"), MergePolicy::LastNonEmpty);
        assert_eq!(
            parse_merge_policy(Some("first-non-empty".to_string())).expect("first"),
            MergePolicy::FirstNonEmpty
        );
        assert_eq!(
            parse_merge_policy(Some("CONCATENATE".to_string())).expect("concat"),
            MergePolicy::Concatenate
        );
        assert!(parse_merge_policy(Some("random".to_string())).is_err());
    }

    #[test]
    fn storage_backend_names() {
        assert_eq!(parse_storage_backend(None).expect("default"), StorageBackend::Postgres);
        assert_eq!(
            parse_storage_backend(Some("Memory".to_string())).expect("memory"),
            StorageBackend::Memory
        );
        assert!(parse_storage_backend(Some("sqlite".to_string())).is_err());
    }

    #[test]
    fn extensions_drop_dots_and_case() {
        let parsed = parse_extensions(Some(".JPG, png ,".to_string()), &["jpg"]);
        assert_eq!(parsed, vec!["jpg".to_string(), "png".to_string()]);
        assert!(is_supported_image_extension("tiff"));
        assert!(!is_supported_image_extension("pdf"));
    }
}

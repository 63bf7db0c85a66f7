use std::path::PathBuf;

use super::parsing::{
    env_flag, env_number, env_optional, env_or_default, is_supported_image_extension,
    parse_cors_origins, parse_environment, parse_extensions, parse_merge_policy,
    parse_storage_backend,
};
use super::types::{
    AiSettings, ApiSettings, ConfigError, CorsSettings, DatabaseSettings, GradingSettings,
    RuntimeSettings, ServerSettings, Settings, StorageBackend, StorageSettings, TelemetrySettings,
};

const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "gif"];

const MAX_AI_RETRIES: u32 = 10;

impl Settings {
    /// Reads every setting from the environment and validates the result.
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let environment =
            parse_environment(env_optional("GRADER_ENV").or_else(|| env_optional("ENVIRONMENT")));
        let runtime = RuntimeSettings {
            environment,
            strict_config: env_flag("GRADER_STRICT_CONFIG") || environment.is_production(),
        };

        let server = ServerSettings {
            host: env_or_default("GRADER_HOST", "0.0.0.0"),
            port: env_number("GRADER_PORT", 8000_u16)?,
        };

        let api = ApiSettings {
            project_name: env_or_default("PROJECT_NAME", "Exam Grader API"),
            version: env_or_default("VERSION", env!("CARGO_PKG_VERSION")),
            api_v1_str: env_or_default("API_V1_STR", "/api/v1"),
        };

        let cors = CorsSettings { origins: parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))? };

        let database = DatabaseSettings {
            backend: parse_storage_backend(env_optional("STORAGE_BACKEND"))?,
            host: env_or_default("POSTGRES_SERVER", "localhost"),
            port: env_number("POSTGRES_PORT", 5432_u16)?,
            user: env_or_default("POSTGRES_USER", "grader"),
            password: env_or_default("POSTGRES_PASSWORD", ""),
            name: env_or_default("POSTGRES_DB", "exam_grader"),
            url: env_optional("DATABASE_URL"),
        };

        let ai = AiSettings {
            api_key: env_or_default("OPENAI_API_KEY", ""),
            base_url: env_or_default("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            ocr_model: env_or_default("OCR_MODEL", "gpt-4o"),
            judge_model: env_or_default("JUDGE_MODEL", "gpt-4o"),
            max_tokens: env_number("AI_MAX_TOKENS", 2000_u32)?,
            temperature: env_number("AI_TEMPERATURE", 0.2_f64)?,
            request_timeout_secs: env_number("AI_REQUEST_TIMEOUT", 120_u64)?,
            max_retries: env_number("AI_MAX_RETRIES", 2_u32)?,
        };

        let grading = GradingSettings {
            concurrency: env_number("GRADING_CONCURRENCY", 4_usize)?,
            merge_policy: parse_merge_policy(env_optional("ANSWER_MERGE_POLICY"))?,
        };

        let storage = StorageSettings {
            upload_dir: PathBuf::from(env_or_default("UPLOAD_DIR", "uploads")),
            max_upload_size_mb: env_number("MAX_UPLOAD_SIZE_MB", 200_u64)?,
            allowed_image_extensions: parse_extensions(
                env_optional("ALLOWED_IMAGE_EXTENSIONS"),
                DEFAULT_IMAGE_EXTENSIONS,
            ),
        };

        let telemetry = TelemetrySettings {
            log_level: env_or_default("LOG_LEVEL", "info"),
            log_json: env_flag("LOG_JSON"),
            prometheus_enabled: env_flag("PROMETHEUS_ENABLED"),
        };

        let settings =
            Self { server, runtime, api, cors, database, ai, grading, storage, telemetry };
        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port
    }

    pub(crate) fn api(&self) -> &ApiSettings {
        &self.api
    }

    pub(crate) fn cors(&self) -> &CorsSettings {
        &self.cors
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn ai(&self) -> &AiSettings {
        &self.ai
    }

    pub(crate) fn grading(&self) -> &GradingSettings {
        &self.grading
    }

    pub(crate) fn storage(&self) -> &StorageSettings {
        &self.storage
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.is_empty() {
            return Err(ConfigError::InvalidHost(self.server.host.clone()));
        }
        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort(self.server.port.to_string()));
        }

        if self.storage.allowed_image_extensions.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ALLOWED_IMAGE_EXTENSIONS",
                value: String::from("<empty>"),
            });
        }

        for extension in &self.storage.allowed_image_extensions {
            if !is_supported_image_extension(extension) {
                return Err(ConfigError::InvalidValue {
                    field: "ALLOWED_IMAGE_EXTENSIONS",
                    value: extension.clone(),
                });
            }
        }

        if self.grading.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_CONCURRENCY",
                value: self.grading.concurrency.to_string(),
            });
        }

        if !(0.0..=2.0).contains(&self.ai.temperature) {
            return Err(ConfigError::InvalidValue {
                field: "AI_TEMPERATURE",
                value: self.ai.temperature.to_string(),
            });
        }

        if self.ai.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "AI_REQUEST_TIMEOUT",
                value: String::from("0"),
            });
        }

        if self.ai.max_retries > MAX_AI_RETRIES {
            return Err(ConfigError::InvalidValue {
                field: "AI_MAX_RETRIES",
                value: self.ai.max_retries.to_string(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.database.backend == StorageBackend::Postgres
            && self.database.url.is_none()
            && self.database.password.is_empty()
        {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }

        if self.ai.api_key.is_empty() {
            return Err(ConfigError::MissingSecret("OPENAI_API_KEY"));
        }

        Ok(())
    }
}

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub quality: QualityConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Call budget shared by the primary and summary models.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LlmConfig {
    pub timeout_secs: u64,
    /// Extra attempts after a failed or timed-out primary model call.
    pub max_retries: u32,
}

/// Context-window thresholds and toggles.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryConfig {
    pub recovery_enabled: bool,
    pub retrieval_enabled: bool,
    pub summarization_enabled: bool,
    pub max_messages_trigger: usize,
    pub max_tokens_trigger: usize,
    pub messages_to_keep: usize,
    pub max_retrieved: usize,
    pub min_retrieval_score: f64,
    pub min_query_chars: usize,
    pub retrieval_timeout_secs: u64,
    pub chars_per_token: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QualityConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub pass_threshold: f64,
    pub min_length: usize,
    pub short_length: usize,
    pub target_language: TargetLanguage,
    pub min_language_ratio: f64,
    pub language_check_min_chars: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub max_tool_rounds: u32,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

/// Script the quality guard expects replies to be written in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetLanguage {
    Zh,
    En,
    Any,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_timeout_secs: Option<u64>,
    pub messages_to_keep: Option<usize>,
    pub max_messages_trigger: Option<usize>,
    pub quality_max_retries: Option<u32>,
    pub target_language: Option<TargetLanguage>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://steward.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig { timeout_secs: 30, max_retries: 1 },
            memory: MemoryConfig::default(),
            quality: QualityConfig::default(),
            session: SessionConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            recovery_enabled: true,
            retrieval_enabled: true,
            summarization_enabled: true,
            max_messages_trigger: 10,
            max_tokens_trigger: 4000,
            messages_to_keep: 4,
            max_retrieved: 3,
            min_retrieval_score: 0.3,
            min_query_chars: 5,
            retrieval_timeout_secs: 10,
            chars_per_token: 3,
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 2,
            pass_threshold: 0.6,
            min_length: 10,
            short_length: 30,
            target_language: TargetLanguage::Zh,
            min_language_ratio: 0.15,
            language_check_min_chars: 50,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { max_tool_rounds: 5 }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl std::str::FromStr for TargetLanguage {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "zh" => Ok(Self::Zh),
            "en" => Ok(Self::En),
            "any" => Ok(Self::Any),
            other => Err(ConfigError::Validation(format!(
                "unsupported target language `{other}` (expected zh|en|any)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("steward.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(memory) = patch.memory {
            let target = &mut self.memory;
            if let Some(value) = memory.recovery_enabled {
                target.recovery_enabled = value;
            }
            if let Some(value) = memory.retrieval_enabled {
                target.retrieval_enabled = value;
            }
            if let Some(value) = memory.summarization_enabled {
                target.summarization_enabled = value;
            }
            if let Some(value) = memory.max_messages_trigger {
                target.max_messages_trigger = value;
            }
            if let Some(value) = memory.max_tokens_trigger {
                target.max_tokens_trigger = value;
            }
            if let Some(value) = memory.messages_to_keep {
                target.messages_to_keep = value;
            }
            if let Some(value) = memory.max_retrieved {
                target.max_retrieved = value;
            }
            if let Some(value) = memory.min_retrieval_score {
                target.min_retrieval_score = value;
            }
            if let Some(value) = memory.min_query_chars {
                target.min_query_chars = value;
            }
            if let Some(value) = memory.retrieval_timeout_secs {
                target.retrieval_timeout_secs = value;
            }
            if let Some(value) = memory.chars_per_token {
                target.chars_per_token = value;
            }
        }

        if let Some(quality) = patch.quality {
            let target = &mut self.quality;
            if let Some(value) = quality.enabled {
                target.enabled = value;
            }
            if let Some(value) = quality.max_retries {
                target.max_retries = value;
            }
            if let Some(value) = quality.pass_threshold {
                target.pass_threshold = value;
            }
            if let Some(value) = quality.min_length {
                target.min_length = value;
            }
            if let Some(value) = quality.short_length {
                target.short_length = value;
            }
            if let Some(value) = quality.target_language {
                target.target_language = value;
            }
            if let Some(value) = quality.min_language_ratio {
                target.min_language_ratio = value;
            }
            if let Some(value) = quality.language_check_min_chars {
                target.language_check_min_chars = value;
            }
        }

        if let Some(session) = patch.session {
            if let Some(max_tool_rounds) = session.max_tool_rounds {
                self.session.max_tool_rounds = max_tool_rounds;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("STEWARD_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("STEWARD_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("STEWARD_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("STEWARD_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("STEWARD_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("STEWARD_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("STEWARD_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("STEWARD_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("STEWARD_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("STEWARD_MEMORY_RECOVERY_ENABLED") {
            self.memory.recovery_enabled = parse_bool("STEWARD_MEMORY_RECOVERY_ENABLED", &value)?;
        }
        if let Some(value) = read_env("STEWARD_MEMORY_RETRIEVAL_ENABLED") {
            self.memory.retrieval_enabled =
                parse_bool("STEWARD_MEMORY_RETRIEVAL_ENABLED", &value)?;
        }
        if let Some(value) = read_env("STEWARD_MEMORY_SUMMARIZATION_ENABLED") {
            self.memory.summarization_enabled =
                parse_bool("STEWARD_MEMORY_SUMMARIZATION_ENABLED", &value)?;
        }
        if let Some(value) = read_env("STEWARD_MEMORY_MAX_MESSAGES_TRIGGER") {
            self.memory.max_messages_trigger =
                parse_usize("STEWARD_MEMORY_MAX_MESSAGES_TRIGGER", &value)?;
        }
        if let Some(value) = read_env("STEWARD_MEMORY_MAX_TOKENS_TRIGGER") {
            self.memory.max_tokens_trigger =
                parse_usize("STEWARD_MEMORY_MAX_TOKENS_TRIGGER", &value)?;
        }
        if let Some(value) = read_env("STEWARD_MEMORY_MESSAGES_TO_KEEP") {
            self.memory.messages_to_keep = parse_usize("STEWARD_MEMORY_MESSAGES_TO_KEEP", &value)?;
        }
        if let Some(value) = read_env("STEWARD_MEMORY_MAX_RETRIEVED") {
            self.memory.max_retrieved = parse_usize("STEWARD_MEMORY_MAX_RETRIEVED", &value)?;
        }
        if let Some(value) = read_env("STEWARD_MEMORY_MIN_RETRIEVAL_SCORE") {
            self.memory.min_retrieval_score =
                parse_f64("STEWARD_MEMORY_MIN_RETRIEVAL_SCORE", &value)?;
        }
        if let Some(value) = read_env("STEWARD_MEMORY_RETRIEVAL_TIMEOUT_SECS") {
            self.memory.retrieval_timeout_secs =
                parse_u64("STEWARD_MEMORY_RETRIEVAL_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("STEWARD_QUALITY_ENABLED") {
            self.quality.enabled = parse_bool("STEWARD_QUALITY_ENABLED", &value)?;
        }
        if let Some(value) = read_env("STEWARD_QUALITY_MAX_RETRIES") {
            self.quality.max_retries = parse_u32("STEWARD_QUALITY_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("STEWARD_QUALITY_PASS_THRESHOLD") {
            self.quality.pass_threshold = parse_f64("STEWARD_QUALITY_PASS_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("STEWARD_QUALITY_TARGET_LANGUAGE") {
            self.quality.target_language = value.parse()?;
        }

        if let Some(value) = read_env("STEWARD_SESSION_MAX_TOOL_ROUNDS") {
            self.session.max_tool_rounds = parse_u32("STEWARD_SESSION_MAX_TOOL_ROUNDS", &value)?;
        }

        let log_level =
            read_env("STEWARD_LOGGING_LEVEL").or_else(|| read_env("STEWARD_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("STEWARD_LOGGING_FORMAT").or_else(|| read_env("STEWARD_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_timeout_secs) = overrides.llm_timeout_secs {
            self.llm.timeout_secs = llm_timeout_secs;
        }
        if let Some(messages_to_keep) = overrides.messages_to_keep {
            self.memory.messages_to_keep = messages_to_keep;
        }
        if let Some(max_messages_trigger) = overrides.max_messages_trigger {
            self.memory.max_messages_trigger = max_messages_trigger;
        }
        if let Some(max_retries) = overrides.quality_max_retries {
            self.quality.max_retries = max_retries;
        }
        if let Some(target_language) = overrides.target_language {
            self.quality.target_language = target_language;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_memory(&self.memory)?;
        validate_quality(&self.quality)?;
        validate_session(&self.session)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("steward.toml"), PathBuf::from("config/steward.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.max_retries > 5 {
        return Err(ConfigError::Validation("llm.max_retries must be at most 5".to_string()));
    }

    Ok(())
}

fn validate_memory(memory: &MemoryConfig) -> Result<(), ConfigError> {
    if memory.messages_to_keep == 0 {
        return Err(ConfigError::Validation(
            "memory.messages_to_keep must be greater than zero".to_string(),
        ));
    }

    if memory.max_messages_trigger <= memory.messages_to_keep {
        return Err(ConfigError::Validation(
            "memory.max_messages_trigger must be greater than memory.messages_to_keep".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&memory.min_retrieval_score) {
        return Err(ConfigError::Validation(
            "memory.min_retrieval_score must be in range 0.0..=1.0".to_string(),
        ));
    }

    if memory.retrieval_timeout_secs == 0 || memory.retrieval_timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "memory.retrieval_timeout_secs must be in range 1..=120".to_string(),
        ));
    }

    if memory.chars_per_token == 0 {
        return Err(ConfigError::Validation(
            "memory.chars_per_token must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_quality(quality: &QualityConfig) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&quality.pass_threshold) {
        return Err(ConfigError::Validation(
            "quality.pass_threshold must be in range 0.0..=1.0".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&quality.min_language_ratio) {
        return Err(ConfigError::Validation(
            "quality.min_language_ratio must be in range 0.0..=1.0".to_string(),
        ));
    }

    if quality.short_length < quality.min_length {
        return Err(ConfigError::Validation(
            "quality.short_length must not be below quality.min_length".to_string(),
        ));
    }

    Ok(())
}

fn validate_session(session: &SessionConfig) -> Result<(), ConfigError> {
    if session.max_tool_rounds == 0 {
        return Err(ConfigError::Validation(
            "session.max_tool_rounds must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.parse::<f64>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    memory: Option<MemoryPatch>,
    quality: Option<QualityPatch>,
    session: Option<SessionPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryPatch {
    recovery_enabled: Option<bool>,
    retrieval_enabled: Option<bool>,
    summarization_enabled: Option<bool>,
    max_messages_trigger: Option<usize>,
    max_tokens_trigger: Option<usize>,
    messages_to_keep: Option<usize>,
    max_retrieved: Option<usize>,
    min_retrieval_score: Option<f64>,
    min_query_chars: Option<usize>,
    retrieval_timeout_secs: Option<u64>,
    chars_per_token: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct QualityPatch {
    enabled: Option<bool>,
    max_retries: Option<u32>,
    pass_threshold: Option<f64>,
    min_length: Option<usize>,
    short_length: Option<usize>,
    target_language: Option<TargetLanguage>,
    min_language_ratio: Option<f64>,
    language_check_min_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionPatch {
    max_tool_rounds: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

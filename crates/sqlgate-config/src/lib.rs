use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub allowlist: Allowlist,
    #[serde(default)]
    pub validator: Validator,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub access: Access,
    #[serde(default)]
    pub synthesizer: Synthesizer,
    #[serde(default)]
    pub executor: Executor,
    pub audit: Audit,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allowlist {
    pub path: String,
    #[serde(default)]
    pub canonical_relation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validator {
    #[serde(default = "default_limit_policy")]
    pub limit_policy: String,
    #[serde(default = "default_default_limit")]
    pub default_limit: u64,
    #[serde(default = "default_max_limit")]
    pub max_limit: u64,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            limit_policy: default_limit_policy(),
            default_limit: default_default_limit(),
            max_limit: default_max_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default = "default_restricted_roles")]
    pub restricted_roles: Vec<String>,
    #[serde(default)]
    pub pii_terms: Option<Vec<String>>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            restricted_roles: default_restricted_roles(),
            pii_terms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessUser {
    pub name: String,
    pub role: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Access {
    #[serde(default)]
    pub users: BTreeMap<String, AccessUser>,
    #[serde(default)]
    pub matrix: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Synthesizer {
    #[serde(default = "default_synthesizer_mode")]
    pub mode: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_fallback_limit")]
    pub fallback_limit: u64,
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self {
            mode: default_synthesizer_mode(),
            endpoint: None,
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_ms: default_timeout_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            fallback_limit: default_fallback_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Executor {
    #[serde(default = "default_executor_kind")]
    pub kind: String,
    #[serde(default)]
    pub sqlite_path: Option<String>,
    #[serde(default = "default_max_preview_rows")]
    pub max_preview_rows: usize,
}

impl Default for Executor {
    fn default() -> Self {
        Self {
            kind: default_executor_kind(),
            sqlite_path: None,
            max_preview_rows: default_max_preview_rows(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub jsonl_path: String,
    #[serde(default)]
    pub immutable_mirror_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_limit_policy() -> String {
    "inject".to_string()
}

fn default_default_limit() -> u64 {
    200
}

fn default_max_limit() -> u64 {
    500
}

fn default_restricted_roles() -> Vec<String> {
    vec!["teller".to_string()]
}

fn default_synthesizer_mode() -> String {
    "template".to_string()
}

fn default_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_retry_max_attempts() -> usize {
    1
}

fn default_retry_backoff_ms() -> u64 {
    0
}

fn default_fallback_limit() -> u64 {
    20
}

fn default_executor_kind() -> String {
    "dry_run".to_string()
}

fn default_max_preview_rows() -> usize {
    20
}

fn default_log_filter() -> String {
    "info".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.allowlist.path.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "allowlist.path must not be empty".to_string(),
        ));
    }
    if cfg.validator.limit_policy != "inject" && cfg.validator.limit_policy != "ceiling" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "validator.limit_policy={} is not implemented; supported: inject, ceiling",
            cfg.validator.limit_policy
        )));
    }
    if cfg.validator.default_limit == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "validator.default_limit must be >= 1".to_string(),
        ));
    }
    if cfg.validator.limit_policy == "ceiling"
        && cfg.validator.default_limit > cfg.validator.max_limit
    {
        return Err(ConfigError::UnsupportedConfig(format!(
            "validator.default_limit={} exceeds validator.max_limit={}",
            cfg.validator.default_limit, cfg.validator.max_limit
        )));
    }
    if cfg.synthesizer.mode != "template" && cfg.synthesizer.mode != "http" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "synthesizer.mode={} is not implemented; supported: template, http",
            cfg.synthesizer.mode
        )));
    }
    if cfg.synthesizer.mode == "http"
        && cfg
            .synthesizer
            .endpoint
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "synthesizer.endpoint is required when synthesizer.mode=http".to_string(),
        ));
    }
    if cfg.synthesizer.retry_max_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "synthesizer.retry_max_attempts must be >= 1".to_string(),
        ));
    }
    if cfg.synthesizer.fallback_limit == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "synthesizer.fallback_limit must be >= 1".to_string(),
        ));
    }
    if cfg.executor.kind != "dry_run" && cfg.executor.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "executor.kind={} is not implemented; supported: dry_run, sqlite",
            cfg.executor.kind
        )));
    }
    if cfg.executor.kind == "dry_run" && cfg.executor.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "executor.sqlite_path is not supported when executor.kind=dry_run".to_string(),
        ));
    }
    if cfg.executor.kind == "sqlite"
        && cfg
            .executor
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "executor.sqlite_path is required when executor.kind=sqlite".to_string(),
        ));
    }
    for (role, resources) in &cfg.access.matrix {
        if resources.values().any(|actions| actions.is_empty()) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "access.matrix.{role} lists a resource with no actions"
            )));
        }
    }
    Ok(())
}

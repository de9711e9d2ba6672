//! Engine configuration.
//!
//! Looked up in order: an explicit path, `./promptflow.yaml`,
//! `<config_dir>/promptflow/config.yaml`, then built-in defaults.
//! String values may reference the environment as `${VAR}` or
//! `${VAR:-default}`.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const DEFAULT_MODEL: &str = "claude-3-opus-20240229";
pub const DEFAULT_MAX_TOKENS: u32 = 2048;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

static ENV_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").unwrap());

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Anthropic,
    Openai,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Anthropic,
            base_url: None,
            api_key: None,
            timeout_secs: 300,
        }
    }
}

impl LlmConfig {
    pub fn base_url(&self) -> &str {
        match (&self.base_url, self.provider) {
            (Some(url), _) => url,
            (None, LlmProvider::Anthropic) => "https://api.anthropic.com",
            (None, LlmProvider::Openai) => "https://api.openai.com/v1",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub default_model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub llm: LlmConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            llm: LlmConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration, falling back through the default locations.
    pub fn load(path: Option<&Path>) -> Result<Self, CoreError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match default_paths().into_iter().find(|p| p.is_file()) {
                Some(p) => Self::from_file(&p)?,
                None => Self::default(),
            },
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&content)?;
        tracing::info!("[Config] Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse YAML and expand `${VAR}` references in string fields.
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        let mut config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| CoreError::Config(format!("Failed to parse config YAML: {}", e)))?;
        config.default_model = resolve_env_vars(&config.default_model);
        config.llm.base_url = config.llm.base_url.as_deref().map(resolve_env_vars);
        config.llm.api_key = config.llm.api_key.as_deref().map(resolve_env_vars);
        Ok(config)
    }

    /// Fill fields the file left unset from well-known environment variables.
    fn apply_env(&mut self) {
        if is_unset(&self.llm.api_key) {
            self.llm.api_key = env_non_empty("PROMPTFLOW_API_KEY")
                .or_else(|| env_non_empty("ANTHROPIC_API_KEY"));
        }
        if is_unset(&self.llm.base_url) {
            self.llm.base_url = env_non_empty("PROMPTFLOW_BASE_URL");
        }
        if self.default_model == DEFAULT_MODEL {
            if let Some(model) = env_non_empty("PROMPTFLOW_MODEL") {
                self.default_model = model;
            }
        }
    }
}

fn default_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("promptflow.yaml")];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("promptflow").join("config.yaml"));
    }
    paths
}

fn is_unset(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.is_empty() || v.starts_with("${"))
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Resolve environment variable references in a string.
/// Supports `${ENV_VAR}` and `${ENV_VAR:-default}` syntax; unknown
/// variables without a default are left as written.
pub fn resolve_env_vars(input: &str) -> String {
    ENV_REF
        .replace_all(input, |caps: &regex::Captures| {
            let var_expr = &caps[1];
            if let Some(idx) = var_expr.find(":-") {
                let var_name = &var_expr[..idx];
                let default_val = &var_expr[idx + 2..];
                std::env::var(var_name).unwrap_or_else(|_| default_val.to_string())
            } else {
                std::env::var(var_expr).unwrap_or_else(|_| format!("${{{}}}", var_expr))
            }
        })
        .to_string()
}

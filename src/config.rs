//! Runtime configuration
//!
//! Values resolve in order: explicit override, process environment
//! (including anything `dotenv` loaded from `.env`), `env.yaml`, default.

use crate::error::OrchestrationError;
use crate::Result;
use secrecy::SecretString;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

pub const API_KEY_VAR: &str = "DEEPSEEK_API_KEY";
pub const BASE_URL_VAR: &str = "DEEPSEEK_BASE_URL";
pub const MODEL_VAR: &str = "DEEPSEEK_MODEL";
pub const TIMEOUT_VAR: &str = "LLM_TIMEOUT_SECS";

pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com/v1";
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:19420/";
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_ENV_YAML: &str = "env.yaml";

pub const TRANSPORT_VAR: &str = "MCP_TRANSPORT";

pub const BRIDGE_HOST_VAR: &str = "BRIDGE_HOST";
pub const BRIDGE_PORT_VAR: &str = "BRIDGE_PORT";
pub const BRIDGE_WEB_DIR_VAR: &str = "BRIDGE_WEB_DIR";
pub const DEFAULT_BRIDGE_HOST: &str = "127.0.0.1";
pub const DEFAULT_BRIDGE_PORT: u16 = 19500;
pub const DEFAULT_WEB_DIR: &str = "web";

/// Lookup over the process environment with an `env.yaml` fallback.
#[derive(Debug, Default, Clone)]
pub struct ConfigSource {
    yaml: HashMap<String, String>,
    use_process_env: bool,
}

impl ConfigSource {
    /// Read `env.yaml` if it exists. A missing or unreadable file is treated
    /// as empty.
    pub fn load(env_yaml: impl AsRef<Path>) -> Self {
        let path = env_yaml.as_ref();
        let yaml = match std::fs::read_to_string(path) {
            Ok(text) => parse_yaml_mapping(&text),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "env.yaml not loaded");
                HashMap::new()
            }
        };

        Self {
            yaml,
            use_process_env: true,
        }
    }

    /// A source backed only by the given YAML text.
    pub fn from_yaml_str(text: &str) -> Self {
        Self {
            yaml: parse_yaml_mapping(text),
            use_process_env: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if self.use_process_env {
            if let Some(v) = std::env::var(key).ok().and_then(non_blank) {
                return Some(v);
            }
        }
        self.yaml.get(key).cloned().and_then(non_blank)
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    pub fn model(&self, override_value: Option<&str>) -> String {
        pick(override_value, || self.get_or(MODEL_VAR, crate::models::DEFAULT_MODEL))
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn pick(override_value: Option<&str>, fallback: impl FnOnce() -> String) -> String {
    override_value
        .map(str::to_string)
        .and_then(non_blank)
        .unwrap_or_else(fallback)
}

fn parse_yaml_mapping(text: &str) -> HashMap<String, String> {
    let value: serde_yaml::Value = match serde_yaml::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "env.yaml is not valid YAML; ignoring");
            return HashMap::new();
        }
    };

    let Some(mapping) = value.as_mapping() else {
        return HashMap::new();
    };

    mapping
        .iter()
        .filter_map(|(k, v)| {
            let key = k.as_str()?.to_string();
            let value = match v {
                serde_yaml::Value::String(s) => s.clone(),
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((key, value))
        })
        .collect()
}

/// Command-line values that take precedence over every other source.
#[derive(Debug, Default, Clone)]
pub struct LlmOverrides {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Connection settings for the chat-completion endpoint.
#[derive(Debug)]
pub struct LlmSettings {
    pub api_key: SecretString,
    pub base_url: String,
    pub timeout: Duration,
}

impl LlmSettings {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: SecretString::from(api_key.into()),
            base_url: base_url.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Fails with a configuration error when no API key is found anywhere.
    pub fn resolve(overrides: &LlmOverrides, source: &ConfigSource) -> Result<Self> {
        let api_key = overrides
            .api_key
            .clone()
            .and_then(non_blank)
            .or_else(|| source.get(API_KEY_VAR))
            .ok_or_else(|| {
                OrchestrationError::Config(format!(
                    "missing {}: set the environment variable or add it to env.yaml",
                    API_KEY_VAR
                ))
            })?;

        let base_url = pick(overrides.base_url.as_deref(), || {
            source.get_or(BASE_URL_VAR, DEFAULT_BASE_URL)
        });

        let timeout_secs = match overrides.timeout_secs {
            Some(secs) => secs,
            None => match source.get(TIMEOUT_VAR) {
                Some(raw) => raw.parse().map_err(|_| {
                    OrchestrationError::Config(format!("{} must be an integer: {}", TIMEOUT_VAR, raw))
                })?,
                None => DEFAULT_TIMEOUT_SECS,
            },
        };

        Ok(Self {
            api_key: SecretString::from(api_key),
            base_url,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// Mask all but the last `keep_last` characters.
pub fn redact(secret: &str, keep_last: usize) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= keep_last {
        return "*".repeat(chars.len());
    }
    let visible: String = chars[chars.len() - keep_last..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - keep_last), visible)
}

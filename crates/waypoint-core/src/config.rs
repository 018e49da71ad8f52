//! Environment-driven configuration for the orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_GEMINI_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Base directory holding one subdirectory per workflow.
    pub definitions_dir: PathBuf,
    /// Path to the SQLite store file.
    pub db_path: PathBuf,
    /// Substitute the deterministic stub for the real AI client.
    pub use_stub_ai: bool,
    pub gemini_model: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_timeout: Duration,
}

impl OrchestratorConfig {
    /// Read the configuration from the environment. Model name and API
    /// key are only required when the stub client is not in use.
    pub fn from_env() -> Result<Self, ConfigError> {
        let definitions_dir = require("WORKFLOW_DEFINITIONS_DIR")?;
        let db_path = require("WORKFLOW_DB_PATH")?;

        let use_stub_ai = std::env::var("USE_STUB_AI_CLIENT")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let gemini_model = optional("GEMINI_MODEL_NAME");
        let gemini_api_key = optional("GEMINI_API_KEY");
        if !use_stub_ai {
            if gemini_model.is_none() {
                return Err(ConfigError::MissingVar("GEMINI_MODEL_NAME"));
            }
            if gemini_api_key.is_none() {
                return Err(ConfigError::MissingVar("GEMINI_API_KEY"));
            }
        }

        let gemini_timeout = match optional("GEMINI_REQUEST_TIMEOUT_SECONDS") {
            Some(raw) => {
                let secs: u64 = raw.parse().map_err(|_| ConfigError::InvalidVar {
                    var: "GEMINI_REQUEST_TIMEOUT_SECONDS",
                    message: format!("expected a number of seconds, got '{}'", raw),
                })?;
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_GEMINI_TIMEOUT_SECS),
        };

        Ok(Self {
            definitions_dir: PathBuf::from(definitions_dir),
            db_path: PathBuf::from(db_path),
            use_stub_ai,
            gemini_model,
            gemini_api_key,
            gemini_timeout,
        })
    }
}

fn require(var: &'static str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar(var)),
    }
}

fn optional(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

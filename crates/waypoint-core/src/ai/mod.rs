//! AI interaction contract: prompt assembly, the structured decision
//! schema, and the pluggable client implementations.
//!
//! The engine only sees the [`AiClient`] trait; the Gemini client and
//! the deterministic stub are interchangeable behind it.

pub mod gemini;
pub mod prompt;
pub mod stub;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AiError;
use crate::models::{HistoryEntry, InstanceStatus, StepReport, WorkflowInstance, FINISH_STEP};

pub use gemini::GeminiClient;
pub use stub::StubAiClient;

/// One context mutation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextUpdate {
    pub key: String,
    pub value: Value,
}

/// The validated structured answer from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiDecision {
    /// `FINISH` or a canonical step ID of the workflow.
    pub next_step_name: String,
    #[serde(default)]
    pub updated_context: Vec<ContextUpdate>,
    #[serde(default)]
    pub status_suggestion: Option<InstanceStatus>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl AiDecision {
    pub fn next(step: impl Into<String>) -> Self {
        Self {
            next_step_name: step.into(),
            updated_context: Vec::new(),
            status_suggestion: None,
            reasoning: None,
        }
    }

    pub fn with_update(mut self, key: impl Into<String>, value: Value) -> Self {
        self.updated_context.push(ContextUpdate {
            key: key.into(),
            value,
        });
        self
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status_suggestion = Some(status);
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// Capability contract for the LLM interaction. All three intents
/// produce an [`AiDecision`]; wire-level retries are the
/// implementation's concern and invisible to the engine.
#[async_trait]
pub trait AiClient: Send + Sync {
    /// Determine the very first step for a new workflow instance.
    async fn determine_first_step(&self, definition_blob: &str) -> Result<AiDecision, AiError>;

    /// Determine the next step based on the current state and the
    /// client's report.
    async fn determine_next_step(
        &self,
        definition_blob: &str,
        current_state: &WorkflowInstance,
        report: &StepReport,
        history: &[HistoryEntry],
    ) -> Result<AiDecision, AiError>;

    /// Reconcile the client's assumed position with the persisted state
    /// and determine the next step.
    async fn reconcile_and_determine_next_step(
        &self,
        definition_blob: &str,
        persisted_state: &WorkflowInstance,
        assumed_step: &str,
        report: &StepReport,
        history: &[HistoryEntry],
    ) -> Result<AiDecision, AiError>;
}

/// Canonical step IDs extracted from the definition blob's link list,
/// plus the `FINISH` sentinel. Used both for the response-schema enum
/// and for validating the model's choice.
pub fn valid_step_names(definition_blob: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let pattern = RE.get_or_init(|| {
        Regex::new(r"(?m)^[ \t]*(?:\d+\.|[-*+])[ \t]*\[([^\]]+)\]\(([^)]+\.md)\)")
            .expect("valid step link regex")
    });

    let mut names = vec![FINISH_STEP.to_string()];
    for caps in pattern.captures_iter(definition_blob) {
        let name = caps[1].trim().to_string();
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Reject decisions that name a step outside the workflow.
pub fn validate_next_step(decision: &AiDecision, valid_steps: &[String]) -> Result<(), AiError> {
    if valid_steps.iter().any(|s| s == &decision.next_step_name) {
        Ok(())
    } else {
        Err(AiError::invalid_response(
            format!(
                "model chose step '{}' which is not in the workflow (valid: {:?})",
                decision.next_step_name, valid_steps
            ),
            None,
        ))
    }
}

/// Append-mode JSON-lines sink for AI prompts and raw responses,
/// enabled by the `AI_INTERACTIONS_LOG_FILE` environment variable.
pub struct AiInteractionLog {
    file: Option<Mutex<File>>,
}

impl AiInteractionLog {
    pub fn from_env() -> Self {
        match std::env::var("AI_INTERACTIONS_LOG_FILE") {
            Ok(path) if !path.is_empty() => Self::open(Path::new(&path)),
            _ => Self { file: None },
        }
    }

    pub fn disabled() -> Self {
        Self { file: None }
    }

    fn open(path: &Path) -> Self {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Self {
                file: Some(Mutex::new(file)),
            },
            Err(e) => {
                tracing::warn!("cannot open AI interactions log {}: {}", path.display(), e);
                Self { file: None }
            }
        }
    }

    pub fn record(&self, intent: &str, prompt: &str, outcome: &str) {
        let Some(file) = &self.file else {
            return;
        };
        let line = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "intent": intent,
            "prompt": prompt,
            "outcome": outcome,
        });
        if let Ok(mut file) = file.lock() {
            let _ = writeln!(file, "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_step_names_from_blob() {
        let blob = "\
# Workflow

- [greet](steps/greet.md)
- [farewell](steps/farewell.md)

---

## Step: greet

body
";
        let names = valid_step_names(blob);
        assert_eq!(names, vec!["FINISH", "greet", "farewell"]);
    }

    #[test]
    fn test_validate_next_step() {
        let valid = vec!["FINISH".to_string(), "greet".to_string()];
        assert!(validate_next_step(&AiDecision::next("greet"), &valid).is_ok());
        assert!(validate_next_step(&AiDecision::next("FINISH"), &valid).is_ok());

        let err = validate_next_step(&AiDecision::next("hallucinated"), &valid).unwrap_err();
        assert!(matches!(err, AiError::InvalidResponse { .. }));
    }
}

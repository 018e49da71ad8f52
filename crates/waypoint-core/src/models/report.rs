use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The client's structured feedback about the outcome of the previously
/// issued step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepReport {
    /// How the step went from the client's perspective (`success`,
    /// `failure`, `data_provided`, …).
    #[serde(default)]
    pub status: Option<String>,
    /// Structured output or user feedback gathered during the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
    /// Free-text description of actions, struggles, outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error message when status is `failure`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepReport {
    /// The outcome status recorded in history, defaulting to `unknown`
    /// when the client omitted one.
    pub fn outcome_status(&self) -> &str {
        self.status.as_deref().unwrap_or("unknown")
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

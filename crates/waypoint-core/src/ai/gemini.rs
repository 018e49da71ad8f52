//! Google Gemini client speaking the `generateContent` REST API with
//! JSON structured output.
//!
//! The response schema constrains `next_step_name` to an enum of the
//! workflow's canonical step IDs (plus `FINISH`), and the parsed answer
//! is validated again on the way out. Timeouts and 5xx responses get
//! one immediate retry; 4xx, invalid responses, and safety blocks do
//! not.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::AiError;
use crate::models::{HistoryEntry, InstanceStatus, StepReport, WorkflowInstance};

use super::prompt::{build_prompt, PromptIntent};
use super::{valid_step_names, validate_next_step, AiClient, AiDecision, AiInteractionLog, ContextUpdate};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const MAX_RETRIES: usize = 1;

pub struct GeminiClient {
    http: reqwest::Client,
    model: String,
    api_key: String,
    base_url: String,
    interaction_log: AiInteractionLog,
}

impl GeminiClient {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        let model = model.into();
        tracing::info!("GeminiClient initialized with model: {}", model);
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            model,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            interaction_log: AiInteractionLog::from_env(),
        }
    }

    /// Point the client at a different endpoint (used by tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn call_api(&self, intent: &str, prompt: &str, schema: &Value) -> Result<Value, AiError> {
        for attempt in 0..=MAX_RETRIES {
            match self.send(prompt, schema).await {
                Ok(parsed) => {
                    self.interaction_log
                        .record(intent, prompt, &parsed.to_string());
                    return Ok(parsed);
                }
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    tracing::warn!(
                        "Gemini call failed (attempt {}/{}), retrying: {}",
                        attempt + 1,
                        MAX_RETRIES + 1,
                        e
                    );
                }
                Err(e) => {
                    self.interaction_log.record(intent, prompt, &e.to_string());
                    return Err(e);
                }
            }
        }
        unreachable!("retry loop returns on its final attempt")
    }

    async fn send(&self, prompt: &str, schema: &Value) -> Result<Value, AiError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            self.api_key
        );

        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": schema,
            }
        });

        let response = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    AiError::Timeout
                } else {
                    AiError::Api {
                        status: 0,
                        body: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        let response_text = response.text().await.map_err(|e| AiError::Api {
            status: status.as_u16(),
            body: format!("failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            return Err(AiError::Api {
                status: status.as_u16(),
                body: response_text,
            });
        }

        let envelope: Value = serde_json::from_str(&response_text).map_err(|_| {
            AiError::invalid_response(
                "Gemini response is not valid JSON",
                Some(response_text.clone()),
            )
        })?;

        if let Some(reason) = envelope
            .pointer("/promptFeedback/blockReason")
            .and_then(|v| v.as_str())
        {
            return Err(AiError::Safety {
                reason: reason.to_string(),
            });
        }

        let text = candidate_text(&envelope);
        if text.is_empty() {
            return Err(AiError::invalid_response(
                "Gemini returned an empty response",
                Some(response_text),
            ));
        }

        serde_json::from_str(&text).map_err(|_| {
            AiError::invalid_response("Gemini response text is not valid JSON", Some(text))
        })
    }

    async fn decide(
        &self,
        intent: &PromptIntent<'_>,
        definition_blob: &str,
    ) -> Result<AiDecision, AiError> {
        let valid_steps = valid_step_names(definition_blob);
        let prompt = build_prompt(intent, definition_blob);
        let schema = response_schema(&valid_steps);

        let raw = self.call_api(intent.name(), &prompt, &schema).await?;
        let decision = decision_from_json(&raw)?;
        validate_next_step(&decision, &valid_steps)?;
        Ok(decision)
    }
}

#[async_trait]
impl AiClient for GeminiClient {
    async fn determine_first_step(&self, definition_blob: &str) -> Result<AiDecision, AiError> {
        self.decide(&PromptIntent::FirstStep, definition_blob).await
    }

    async fn determine_next_step(
        &self,
        definition_blob: &str,
        current_state: &WorkflowInstance,
        report: &StepReport,
        history: &[HistoryEntry],
    ) -> Result<AiDecision, AiError> {
        self.decide(
            &PromptIntent::NextStep {
                current_state,
                report,
                history,
            },
            definition_blob,
        )
        .await
    }

    async fn reconcile_and_determine_next_step(
        &self,
        definition_blob: &str,
        persisted_state: &WorkflowInstance,
        assumed_step: &str,
        report: &StepReport,
        history: &[HistoryEntry],
    ) -> Result<AiDecision, AiError> {
        self.decide(
            &PromptIntent::Reconcile {
                persisted_state,
                assumed_step,
                report,
                history,
            },
            definition_blob,
        )
        .await
    }
}

/// Concatenated text parts of the first candidate.
fn candidate_text(envelope: &Value) -> String {
    envelope
        .pointer("/candidates/0/content/parts")
        .and_then(|v| v.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

/// OpenAPI-style response schema with the step-name enum, mirroring the
/// `AiDecision` shape.
pub fn response_schema(valid_steps: &[String]) -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "next_step_name": { "type": "STRING", "enum": valid_steps },
            "updated_context": {
                "type": "ARRAY",
                "nullable": true,
                "description": "List of key-value pairs to update the workflow context.",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "key": { "type": "STRING" },
                        "value": { "type": "STRING" }
                    },
                    "required": ["key", "value"]
                }
            },
            "status_suggestion": {
                "type": "STRING",
                "enum": ["RUNNING", "SUSPENDED", "COMPLETED", "FAILED"],
                "nullable": true,
                "description": "Suggested new status for the workflow instance (optional)."
            },
            "reasoning": {
                "type": "STRING",
                "nullable": true,
                "description": "Explanation for the chosen next step (optional)."
            }
        },
        "required": ["next_step_name"]
    })
}

/// Convert the model's raw JSON object into an [`AiDecision`], dropping
/// malformed context items and out-of-enum status suggestions with a
/// warning instead of failing the transition.
pub fn decision_from_json(raw: &Value) -> Result<AiDecision, AiError> {
    let next_step_name = raw
        .get("next_step_name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            AiError::invalid_response(
                "response missing 'next_step_name'",
                Some(raw.to_string()),
            )
        })?
        .to_string();

    let mut updated_context = Vec::new();
    if let Some(items) = raw.get("updated_context").and_then(|v| v.as_array()) {
        for item in items {
            match (item.get("key").and_then(|k| k.as_str()), item.get("value")) {
                (Some(key), Some(value)) => updated_context.push(ContextUpdate {
                    key: key.to_string(),
                    value: value.clone(),
                }),
                _ => tracing::warn!("skipping malformed context update item: {}", item),
            }
        }
    }

    let status_suggestion = match raw.get("status_suggestion").and_then(|v| v.as_str()) {
        Some(s) => {
            let parsed = InstanceStatus::from_str(s);
            if parsed.is_none() {
                tracing::warn!("ignoring invalid status suggestion '{}'", s);
            }
            parsed
        }
        None => None,
    };

    Ok(AiDecision {
        next_step_name,
        updated_context,
        status_suggestion,
        reasoning: raw
            .get("reasoning")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

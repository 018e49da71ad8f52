//! Deterministic stub AI client for tests and offline development.
//!
//! Decisions can be scripted per intent and step; anything unscripted
//! falls back to walking the workflow's steps in index order. The stub
//! can also simulate a wire-level timeout that is absorbed by the same
//! one-retry policy the real client applies, so the engine sees a
//! single successful call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use regex::Regex;

use crate::error::AiError;
use crate::models::{HistoryEntry, InstanceStatus, StepReport, WorkflowInstance, FINISH_STEP};

use super::{AiClient, AiDecision};

#[derive(Default)]
pub struct StubAiClient {
    scripted_first: Mutex<Option<AiDecision>>,
    scripted_next: Mutex<HashMap<String, AiDecision>>,
    scripted_resume: Mutex<HashMap<String, AiDecision>>,
    simulated_timeouts: AtomicUsize,
    retries: AtomicUsize,
    successes: AtomicUsize,
}

impl StubAiClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the decision for `determine_first_step`.
    pub fn with_first_step(self, decision: AiDecision) -> Self {
        *self.scripted_first.lock().unwrap() = Some(decision);
        self
    }

    /// Script the decision returned when advancing from `current_step`.
    pub fn with_next(self, current_step: &str, decision: AiDecision) -> Self {
        self.scripted_next
            .lock()
            .unwrap()
            .insert(current_step.to_string(), decision);
        self
    }

    /// Script the decision returned when resuming with `assumed_step`.
    pub fn with_resume(self, assumed_step: &str, decision: AiDecision) -> Self {
        self.scripted_resume
            .lock()
            .unwrap()
            .insert(assumed_step.to_string(), decision);
        self
    }

    /// Make the next call hit one simulated wire timeout before
    /// succeeding on the transparent retry.
    pub fn with_timeout_once(self) -> Self {
        self.simulated_timeouts.store(1, Ordering::SeqCst);
        self
    }

    /// Number of transparent retries the simulated wire performed.
    pub fn retries(&self) -> usize {
        self.retries.load(Ordering::SeqCst)
    }

    /// Number of calls that produced a decision.
    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    fn simulate_wire(&self) {
        if self.simulated_timeouts.load(Ordering::SeqCst) > 0 {
            self.simulated_timeouts.fetch_sub(1, Ordering::SeqCst);
            self.retries.fetch_add(1, Ordering::SeqCst);
            tracing::debug!("stub AI simulated a timeout, retrying");
        }
    }

    fn done(&self, decision: AiDecision) -> Result<AiDecision, AiError> {
        self.successes.fetch_add(1, Ordering::SeqCst);
        Ok(decision)
    }

    fn fallback_next(
        &self,
        definition_blob: &str,
        current_step: Option<&str>,
        report: &StepReport,
    ) -> AiDecision {
        match report.status.as_deref() {
            Some("failure") => {
                AiDecision::next(current_step.unwrap_or(FINISH_STEP))
                    .with_status(InstanceStatus::Failed)
                    .with_reasoning("stub: report status was 'failure'")
            }
            Some("FINISH") => AiDecision::next(FINISH_STEP)
                .with_reasoning("stub: report signalled completion"),
            _ => {
                let steps = steps_from_blob(definition_blob);
                let next = current_step
                    .and_then(|current| {
                        steps
                            .iter()
                            .position(|s| s == current)
                            .and_then(|i| steps.get(i + 1))
                    })
                    .cloned()
                    .unwrap_or_else(|| FINISH_STEP.to_string());
                AiDecision::next(next).with_reasoning("stub: advancing in index order")
            }
        }
    }
}

/// Step IDs in order, read back out of the assembled definition blob.
pub fn steps_from_blob(definition_blob: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let pattern =
        RE.get_or_init(|| Regex::new(r"(?m)^## Step: (.+)$").expect("valid step header regex"));
    pattern
        .captures_iter(definition_blob)
        .map(|c| c[1].trim().to_string())
        .collect()
}

#[async_trait]
impl AiClient for StubAiClient {
    async fn determine_first_step(&self, definition_blob: &str) -> Result<AiDecision, AiError> {
        self.simulate_wire();
        if let Some(decision) = self.scripted_first.lock().unwrap().clone() {
            return self.done(decision);
        }
        let first = steps_from_blob(definition_blob)
            .into_iter()
            .next()
            .unwrap_or_else(|| FINISH_STEP.to_string());
        self.done(AiDecision::next(first).with_reasoning("stub: first step in index order"))
    }

    async fn determine_next_step(
        &self,
        definition_blob: &str,
        current_state: &WorkflowInstance,
        report: &StepReport,
        _history: &[HistoryEntry],
    ) -> Result<AiDecision, AiError> {
        self.simulate_wire();
        let current = current_state.current_step_name.as_deref();
        if let Some(step) = current {
            if let Some(decision) = self.scripted_next.lock().unwrap().get(step).cloned() {
                return self.done(decision);
            }
        }
        let decision = self.fallback_next(definition_blob, current, report);
        self.done(decision)
    }

    async fn reconcile_and_determine_next_step(
        &self,
        definition_blob: &str,
        persisted_state: &WorkflowInstance,
        assumed_step: &str,
        report: &StepReport,
        _history: &[HistoryEntry],
    ) -> Result<AiDecision, AiError> {
        self.simulate_wire();
        if let Some(decision) = self
            .scripted_resume
            .lock()
            .unwrap()
            .get(assumed_step)
            .cloned()
        {
            return self.done(decision);
        }

        // Default reconciliation trusts the persisted step; a successful
        // report advances from it as a normal advance would.
        let persisted = persisted_state.current_step_name.as_deref();
        let decision = if report.status.as_deref() == Some("success") {
            self.fallback_next(definition_blob, persisted, report)
        } else {
            AiDecision::next(persisted.unwrap_or(FINISH_STEP))
                .with_reasoning("stub: defaulting to persisted step for reconciliation")
        };
        self.done(decision)
    }
}

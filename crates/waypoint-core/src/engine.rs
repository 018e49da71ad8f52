//! Orchestration Engine — the state machine driving `start`, `advance`,
//! and `resume` transitions.
//!
//! The engine combines the definition service, the instance store, and
//! the AI client. It owns the state-machine rules: context merge
//! precedence (client updates over stored context, AI updates over
//! client updates), status derivation, terminal-state handling, and the
//! atomic history-plus-instance commit. Transitions on one instance are
//! serialized through a per-instance async lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::ai::{AiClient, AiDecision};
use crate::definitions::WorkflowDefinitionService;
use crate::error::EngineError;
use crate::models::history::RESUMING_OUTCOME;
use crate::models::{HistoryEntry, InstanceStatus, StepReport, WorkflowInstance, FINISH_STEP};
use crate::store::InstanceStore;

/// Recent-history window passed to the model, bounding prompt size.
const HISTORY_LIMIT: usize = 5;

pub const COMPLETED_INSTRUCTIONS: &str = "Workflow Completed.";
pub const FAILED_INSTRUCTIONS: &str = "Workflow Failed.";

#[derive(Debug, Clone, Serialize)]
pub struct NextStep {
    pub step_name: String,
    pub instructions: String,
}

/// Shared return shape of all three transitions.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutput {
    pub instance_id: String,
    pub next_step: NextStep,
    pub current_context: Map<String, Value>,
}

enum TransitionKind {
    Advance,
    Resume { assumed_step: String },
}

pub struct OrchestrationEngine {
    definitions: Arc<WorkflowDefinitionService>,
    store: InstanceStore,
    ai: Arc<dyn AiClient>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl OrchestrationEngine {
    pub fn new(
        definitions: Arc<WorkflowDefinitionService>,
        store: InstanceStore,
        ai: Arc<dyn AiClient>,
    ) -> Self {
        Self {
            definitions,
            store,
            ai,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn list_workflows(&self) -> Vec<String> {
        self.definitions.list_workflows()
    }

    pub async fn get_status(&self, instance_id: &str) -> Result<WorkflowInstance, EngineError> {
        Ok(self.store.get(instance_id).await?)
    }

    /// Start a new instance: ask the model for the first step, persist
    /// the fresh instance, and return its client instructions. No
    /// history entry is recorded at start.
    pub async fn start_workflow(
        &self,
        workflow_name: &str,
        initial_context: Option<Map<String, Value>>,
    ) -> Result<TransitionOutput, EngineError> {
        let blob = self.definitions.full_definition_blob(workflow_name)?;
        let decision = self.ai.determine_first_step(&blob).await?;

        let mut context = initial_context.unwrap_or_default();
        apply_decision_context(&mut context, &decision);
        let status = derive_status(InstanceStatus::Running, &decision);

        let instance = WorkflowInstance::new(
            workflow_name.to_string(),
            Some(decision.next_step_name.clone()),
            status,
            context,
        );
        self.store.create(&instance).await?;
        tracing::info!(
            "started workflow '{}' as instance {} at step '{}'",
            workflow_name,
            instance.instance_id,
            decision.next_step_name
        );

        let instructions = self
            .step_instructions_for(&instance, &decision.next_step_name)
            .await?;
        Ok(TransitionOutput {
            instance_id: instance.instance_id,
            next_step: NextStep {
                step_name: decision.next_step_name,
                instructions,
            },
            current_context: instance.context,
        })
    }

    /// Record the client's report for the current step and move to the
    /// step the model selects.
    pub async fn advance_workflow(
        &self,
        instance_id: &str,
        report: &StepReport,
        context_updates: Option<Map<String, Value>>,
    ) -> Result<TransitionOutput, EngineError> {
        self.transition(instance_id, TransitionKind::Advance, report, context_updates)
            .await
    }

    /// Reconcile the client's assumed position with the persisted state
    /// and continue from the step the model selects.
    pub async fn resume_workflow(
        &self,
        instance_id: &str,
        assumed_step: &str,
        report: &StepReport,
        context_updates: Option<Map<String, Value>>,
    ) -> Result<TransitionOutput, EngineError> {
        self.transition(
            instance_id,
            TransitionKind::Resume {
                assumed_step: assumed_step.to_string(),
            },
            report,
            context_updates,
        )
        .await
    }

    async fn transition(
        &self,
        instance_id: &str,
        kind: TransitionKind,
        report: &StepReport,
        context_updates: Option<Map<String, Value>>,
    ) -> Result<TransitionOutput, EngineError> {
        let lock = self.instance_lock(instance_id);
        let result = {
            let _guard = lock.lock().await;
            self.transition_locked(instance_id, kind, report, context_updates)
                .await
        };
        self.evict_idle_lock(instance_id);
        result
    }

    async fn transition_locked(
        &self,
        instance_id: &str,
        kind: TransitionKind,
        report: &StepReport,
        context_updates: Option<Map<String, Value>>,
    ) -> Result<TransitionOutput, EngineError> {
        let state = self.store.get(instance_id).await?;

        // Terminal instances answer with their final step and context;
        // no history is recorded and nothing changes.
        if state.status.is_terminal() {
            tracing::info!(
                "instance {} is already {}, returning terminal state",
                instance_id,
                state.status.as_str()
            );
            return Ok(self.terminal_output(state));
        }

        let mut working_context = state.context.clone();
        if let Some(updates) = context_updates {
            working_context.extend(updates);
        }

        let (reported_step, outcome_status) = match &kind {
            TransitionKind::Advance => (
                state.current_step_name.clone().unwrap_or_default(),
                report.outcome_status().to_string(),
            ),
            TransitionKind::Resume { assumed_step } => {
                (assumed_step.clone(), RESUMING_OUTCOME.to_string())
            }
        };

        let blob = match self.definitions.full_definition_blob(&state.workflow_name) {
            Ok(blob) => blob,
            Err(e) => {
                tracing::error!(
                    "definition for '{}' unavailable while advancing instance {}: {}",
                    state.workflow_name,
                    instance_id,
                    e
                );
                self.fail_instance_best_effort(&state).await;
                return Err(e.into());
            }
        };
        let recent = self.store.recent_history(instance_id, HISTORY_LIMIT).await?;

        let decision = match &kind {
            TransitionKind::Advance => {
                self.ai
                    .determine_next_step(&blob, &state, report, &recent)
                    .await
            }
            TransitionKind::Resume { assumed_step } => {
                self.ai
                    .reconcile_and_determine_next_step(&blob, &state, assumed_step, report, &recent)
                    .await
            }
        };
        let decision = match decision {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!("AI call failed for instance {}: {}", instance_id, e);
                self.fail_instance_best_effort(&state).await;
                return Err(e.into());
            }
        };

        apply_decision_context(&mut working_context, &decision);
        let new_status = derive_status(state.status, &decision);

        let mut updated = state.clone();
        updated.current_step_name = Some(decision.next_step_name.clone());
        updated.status = new_status;
        updated.context = working_context;

        let mut entry = HistoryEntry::new(
            instance_id.to_string(),
            reported_step,
            Some(report.to_value()),
            Some(outcome_status),
        );
        entry.determined_next_step = Some(decision.next_step_name.clone());

        self.store.record_transition(&entry, &updated).await?;
        tracing::info!(
            "instance {} moved to step '{}' (status {})",
            instance_id,
            decision.next_step_name,
            new_status.as_str()
        );

        let instructions = self
            .step_instructions_for(&updated, &decision.next_step_name)
            .await?;
        Ok(TransitionOutput {
            instance_id: instance_id.to_string(),
            next_step: NextStep {
                step_name: decision.next_step_name,
                instructions,
            },
            current_context: updated.context,
        })
    }

    /// Client instructions for the step just selected, accounting for
    /// terminal states. A next step missing from the definition fails
    /// the workflow: the model validated against the step list, so this
    /// only happens when the definition changed underneath a live
    /// instance.
    async fn step_instructions_for(
        &self,
        instance: &WorkflowInstance,
        next_step: &str,
    ) -> Result<String, EngineError> {
        match instance.status {
            InstanceStatus::Completed => Ok(self.completion_instructions(&instance.workflow_name)),
            InstanceStatus::Failed => Ok(FAILED_INSTRUCTIONS.to_string()),
            _ => match self
                .definitions
                .step_client_instructions(&instance.workflow_name, next_step)
            {
                Ok(instructions) => Ok(instructions),
                Err(e) => {
                    tracing::error!(
                        "next step '{}' has no definition in workflow '{}'; failing instance {}",
                        next_step,
                        instance.workflow_name,
                        instance.instance_id
                    );
                    self.fail_instance_best_effort(instance).await;
                    Err(e.into())
                }
            },
        }
    }

    /// A workflow can override the completion text with a `FINISH` step
    /// entry; otherwise the canonical string is returned.
    fn completion_instructions(&self, workflow_name: &str) -> String {
        self.definitions
            .step_client_instructions(workflow_name, FINISH_STEP)
            .unwrap_or_else(|_| COMPLETED_INSTRUCTIONS.to_string())
    }

    fn terminal_output(&self, state: WorkflowInstance) -> TransitionOutput {
        let (step_name, instructions) = if state.status == InstanceStatus::Completed {
            (
                FINISH_STEP.to_string(),
                self.completion_instructions(&state.workflow_name),
            )
        } else {
            (
                state
                    .current_step_name
                    .clone()
                    .unwrap_or_else(|| FINISH_STEP.to_string()),
                FAILED_INSTRUCTIONS.to_string(),
            )
        };

        TransitionOutput {
            instance_id: state.instance_id,
            next_step: NextStep {
                step_name,
                instructions,
            },
            current_context: state.context,
        }
    }

    /// Move a live instance to FAILED after a definition or AI error.
    /// Best effort only: a persistence failure here is logged, not
    /// propagated, so the original error stays visible.
    async fn fail_instance_best_effort(&self, state: &WorkflowInstance) {
        if state.status.is_terminal() {
            return;
        }
        let mut failed = state.clone();
        failed.status = InstanceStatus::Failed;
        if let Err(e) = self.store.update(&failed).await {
            tracing::error!(
                "could not mark instance {} as FAILED: {}",
                state.instance_id,
                e
            );
        }
    }

    fn instance_lock(&self, instance_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("instance lock map");
        locks.entry(instance_id.to_string()).or_default().clone()
    }

    /// Drop a lock entry nobody is waiting on; the map stays bounded by
    /// the number of in-flight instances.
    fn evict_idle_lock(&self, instance_id: &str) {
        let mut locks = self.locks.lock().expect("instance lock map");
        if let Some(lock) = locks.get(instance_id) {
            if Arc::strong_count(lock) == 2 {
                locks.remove(instance_id);
            }
        }
    }
}

/// AI updates are applied last and override any client-supplied keys.
fn apply_decision_context(context: &mut Map<String, Value>, decision: &AiDecision) {
    for update in &decision.updated_context {
        context.insert(update.key.clone(), update.value.clone());
    }
}

/// `FINISH` always wins; otherwise a valid suggestion wins; otherwise
/// the instance keeps its current status.
fn derive_status(current: InstanceStatus, decision: &AiDecision) -> InstanceStatus {
    if decision.next_step_name == FINISH_STEP {
        return InstanceStatus::Completed;
    }
    decision.status_suggestion.unwrap_or(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_status_finish_wins() {
        let decision = AiDecision::next(FINISH_STEP).with_status(InstanceStatus::Suspended);
        assert_eq!(
            derive_status(InstanceStatus::Running, &decision),
            InstanceStatus::Completed
        );
    }

    #[test]
    fn test_derive_status_suggestion_used() {
        let decision = AiDecision::next("wait").with_status(InstanceStatus::Suspended);
        assert_eq!(
            derive_status(InstanceStatus::Running, &decision),
            InstanceStatus::Suspended
        );
    }

    #[test]
    fn test_derive_status_retained_without_suggestion() {
        let decision = AiDecision::next("next");
        assert_eq!(
            derive_status(InstanceStatus::Suspended, &decision),
            InstanceStatus::Suspended
        );
    }

    #[test]
    fn test_ai_context_overrides_client_keys() {
        let mut context = Map::new();
        context.insert("x".to_string(), serde_json::json!(2));
        context.insert("y".to_string(), serde_json::json!(3));

        let decision = AiDecision::next("step").with_update("x", serde_json::json!(5));
        apply_decision_context(&mut context, &decision);

        assert_eq!(context["x"], serde_json::json!(5));
        assert_eq!(context["y"], serde_json::json!(3));
    }
}

//! Prompt assembly for the three orchestration intents.
//!
//! The structure is fixed: role preamble, the full workflow definition,
//! the persisted state (and assumed step on resume), recent history,
//! the client's report, a per-intent task line, and a schema reminder.

use crate::models::{HistoryEntry, StepReport, WorkflowInstance};

const ROLE_PREAMBLE: &str = "SYSTEM: You are a Workflow Orchestrator Assistant. Your goal is to \
determine the next logical step in a workflow based on the provided definition, current state, \
user report, and history. You MUST pay close attention to the 'Orchestrator Guidance' within \
each step definition. Your output MUST be a single JSON object matching the provided schema. \
IMPORTANT: When determining the `next_step_name`, match the intended step from the guidance \
flexibly, ignoring differences in case or underscores (e.g., \"My Step\" matches \"my_step\"), \
and select the corresponding step name from the schema's enum. You MUST NOT suggest the status \
`COMPLETED` or `FAILED` unless there are no valid transitions available according to the \
Orchestrator Guidance; if the guidance suggests a next step or a conditional transition, \
suggest the status `RUNNING`.";

const SCHEMA_REMINDER: &str = "Format any context updates in the 'updated_context' field as an \
array of objects, where each object has a 'key' and a 'value' property. Output ONLY the JSON \
object matching the provided schema.";

/// Which transition the prompt is for, with the state that transition
/// carries.
pub enum PromptIntent<'a> {
    FirstStep,
    NextStep {
        current_state: &'a WorkflowInstance,
        report: &'a StepReport,
        history: &'a [HistoryEntry],
    },
    Reconcile {
        persisted_state: &'a WorkflowInstance,
        assumed_step: &'a str,
        report: &'a StepReport,
        history: &'a [HistoryEntry],
    },
}

impl PromptIntent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FirstStep => "first_step",
            Self::NextStep { .. } => "next_step",
            Self::Reconcile { .. } => "reconcile",
        }
    }
}

pub fn build_prompt(intent: &PromptIntent<'_>, definition_blob: &str) -> String {
    let mut parts = vec![
        ROLE_PREAMBLE.to_string(),
        format!("WORKFLOW DEFINITION:\n---\n{}\n---", definition_blob),
    ];

    match intent {
        PromptIntent::FirstStep => {}
        PromptIntent::NextStep {
            current_state,
            report,
            history,
        } => {
            parts.push(format!("CURRENT STATE:\n{}", render_state(current_state)));
            push_history(&mut parts, history);
            push_report(&mut parts, report);
        }
        PromptIntent::Reconcile {
            persisted_state,
            assumed_step,
            report,
            history,
        } => {
            parts.push(format!("PERSISTED STATE:\n{}", render_state(persisted_state)));
            parts.push(format!("ASSUMED STEP (from user report): {}", assumed_step));
            push_history(&mut parts, history);
            push_report(&mut parts, report);
        }
    }

    parts.push(format!("TASK: {}", task_line(intent)));
    parts.push(SCHEMA_REMINDER.to_string());

    parts.join("\n\n")
}

fn task_line(intent: &PromptIntent<'_>) -> String {
    match intent {
        PromptIntent::FirstStep => {
            "Analyze the workflow definition and determine the very first step.".to_string()
        }
        PromptIntent::NextStep { current_state, .. } => format!(
            "Based on the current state, the user's report for the last step ('{}'), and the \
             workflow definition (especially Orchestrator Guidance), determine the next logical \
             step.",
            current_state.current_step_name.as_deref().unwrap_or("N/A")
        ),
        PromptIntent::Reconcile {
            persisted_state,
            assumed_step,
            ..
        } => format!(
            "The user is resuming workflow instance '{}'. They believe they were on step '{}', \
             while the persisted server state shows the last known step was '{}'. Reconcile the \
             user's report and assumed state with the persisted state and history, using the \
             workflow definition (especially Orchestrator Guidance), to determine the correct \
             next logical step.",
            persisted_state.instance_id,
            assumed_step,
            persisted_state.current_step_name.as_deref().unwrap_or("N/A")
        ),
    }
}

fn render_state(state: &WorkflowInstance) -> String {
    serde_json::to_string_pretty(state).unwrap_or_else(|_| "{}".to_string())
}

fn push_history(parts: &mut Vec<String>, history: &[HistoryEntry]) {
    if history.is_empty() {
        return;
    }
    let rendered = serde_json::to_string_pretty(history).unwrap_or_else(|_| "[]".to_string());
    parts.push(format!("RECENT HISTORY:\n{}", rendered));
}

fn push_report(parts: &mut Vec<String>, report: &StepReport) {
    let rendered = serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string());
    parts.push(format!("USER REPORT:\n{}", rendered));
}

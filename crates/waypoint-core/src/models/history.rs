use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome recorded for a resume attempt, regardless of the report's own
/// status.
pub const RESUMING_OUTCOME: &str = "RESUMING";

/// One row of the append-only `workflow_history` log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Auto-incrementing ID, assigned by the database on insert.
    pub history_id: Option<i64>,
    pub instance_id: String,
    pub timestamp: DateTime<Utc>,
    /// The step being reported on, or the assumed step on resume.
    pub step_name: String,
    pub user_report: Option<Value>,
    /// Status derived from the report (`success`, `failure`, …) or
    /// `RESUMING`.
    pub outcome_status: Option<String>,
    /// The next step decided by the orchestrator after this event; kept
    /// for audit only.
    pub determined_next_step: Option<String>,
}

impl HistoryEntry {
    pub fn new(
        instance_id: String,
        step_name: String,
        user_report: Option<Value>,
        outcome_status: Option<String>,
    ) -> Self {
        Self {
            history_id: None,
            instance_id,
            timestamp: Utc::now(),
            step_name,
            user_report,
            outcome_status,
            determined_next_step: None,
        }
    }
}

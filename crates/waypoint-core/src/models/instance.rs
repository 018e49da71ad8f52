use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Running,
    Suspended,
    Completed,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Suspended => "SUSPENDED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(Self::Running),
            "SUSPENDED" => Some(Self::Suspended),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal instances accept no further state-mutating transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// The mutable per-instance record, mapping to the `workflow_instances`
/// table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub instance_id: String,
    pub workflow_name: String,
    /// The step the engine last selected. `FINISH` once completed,
    /// `None` before the first step is chosen.
    pub current_step_name: Option<String>,
    pub status: InstanceStatus,
    /// Free-form state bag shared with the client and the LLM.
    #[serde(default)]
    pub context: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn new(
        workflow_name: String,
        current_step_name: Option<String>,
        status: InstanceStatus,
        context: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            workflow_name,
            current_step_name,
            status,
            context,
            created_at: now,
            updated_at: now,
            completed_at: if status == InstanceStatus::Completed {
                Some(now)
            } else {
                None
            },
        }
    }
}

//! Core data models: workflow instances, history entries, and step
//! reports.

pub mod history;
pub mod instance;
pub mod report;

pub use history::HistoryEntry;
pub use instance::{InstanceStatus, WorkflowInstance};
pub use report::StepReport;

/// Reserved `next_step_name` value that signals workflow completion.
pub const FINISH_STEP: &str = "FINISH";

use crate::models::{StageName, WorkflowId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Event delivered to workflow subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A stage run started
    Status {
        /// Stage being run
        stage: StageName,
        /// 1 for the first run, incremented by every refine
        attempt: u32,
        /// Human-readable status line
        message: String,
    },
    /// Incremental text from the running stage
    Chunk {
        /// Producing stage
        stage: StageName,
        /// Text fragment
        content: String,
    },
    /// Coarse progress milestone
    Progress {
        /// Producing stage
        stage: StageName,
        /// 0..=100
        percent: u8,
        /// Milestone description
        message: String,
    },
    /// Stage finished and the workflow is awaiting review
    StepComplete {
        /// Finished stage
        stage: StageName,
    },
    /// Stage failed and the workflow is awaiting review
    Error {
        /// Failed stage
        stage: StageName,
        /// Failure reason
        message: String,
    },
    /// Workflow was cancelled
    Cancelled {
        /// Stage at the cursor when cancellation happened
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<StageName>,
    },
    /// All stages are done
    Completed,
}

impl WorkflowEvent {
    /// Stage the event relates to, if any
    pub fn stage(&self) -> Option<StageName> {
        match self {
            WorkflowEvent::Status { stage, .. }
            | WorkflowEvent::Chunk { stage, .. }
            | WorkflowEvent::Progress { stage, .. }
            | WorkflowEvent::StepComplete { stage }
            | WorkflowEvent::Error { stage, .. } => Some(*stage),
            WorkflowEvent::Cancelled { stage } => *stage,
            WorkflowEvent::Completed => None,
        }
    }

    /// Short event name, used as the SSE `event:` field
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::Status { .. } => "status",
            WorkflowEvent::Chunk { .. } => "chunk",
            WorkflowEvent::Progress { .. } => "progress",
            WorkflowEvent::StepComplete { .. } => "step_complete",
            WorkflowEvent::Error { .. } => "error",
            WorkflowEvent::Cancelled { .. } => "cancelled",
            WorkflowEvent::Completed => "completed",
        }
    }

    /// No further events follow a workflow-terminal event.
    pub fn ends_workflow(&self) -> bool {
        matches!(self, WorkflowEvent::Cancelled { .. } | WorkflowEvent::Completed)
    }

    /// Events that close a stage run
    pub fn ends_stage(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::StepComplete { .. } | WorkflowEvent::Error { .. }
        ) || self.ends_workflow()
    }
}

/// Sequenced wrapper around a [`WorkflowEvent`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EventEnvelope {
    /// Owning workflow
    pub workflow_id: WorkflowId,
    /// Monotonic per-workflow sequence number, starting at 1
    pub seq: u64,
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// The event itself
    #[serde(flatten)]
    pub event: WorkflowEvent,
}

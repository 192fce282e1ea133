//! Engine error taxonomy.

use deal_protocol::{StageName, StageStatus, WorkflowId};
use thiserror::Error;

/// Core error type for the Deal Co-Pilot engine
///
/// Every control operation and query reports failures through this enum.
/// Callers that need to map errors onto a transport (HTTP status codes,
/// exit codes) should match on [`EngineError::kind`].
#[derive(Error, Debug)]
pub enum EngineError {
    /// No workflow with this identifier exists
    #[error("workflow {0} not found")]
    WorkflowNotFound(WorkflowId),

    /// The stage has no stored output
    #[error("no output for stage '{stage}' in workflow {workflow_id}")]
    OutputNotFound {
        /// Workflow queried
        workflow_id: WorkflowId,
        /// Stage queried
        stage: StageName,
    },

    /// Continue was called while no review gate is open
    #[error("workflow {workflow_id} is not awaiting review")]
    NotAwaitingReview {
        /// Workflow addressed
        workflow_id: WorkflowId,
        /// Stage at the cursor
        stage: Option<StageName>,
    },

    /// The addressed stage is not the one at the cursor
    #[error("stage '{stage}' is not the current stage of workflow {workflow_id}")]
    StageNotCurrent {
        /// Workflow addressed
        workflow_id: WorkflowId,
        /// Stage named by the caller
        stage: StageName,
        /// Stage actually at the cursor
        current: Option<StageName>,
    },

    /// The stage is executing and cannot be modified
    #[error("stage '{stage}' of workflow {workflow_id} is still running")]
    StageBusy {
        /// Workflow addressed
        workflow_id: WorkflowId,
        /// Running stage
        stage: StageName,
    },

    /// The stage has not produced anything that can be refined
    #[error("stage '{stage}' of workflow {workflow_id} cannot be refined while {status}")]
    StageNotReviewable {
        /// Workflow addressed
        workflow_id: WorkflowId,
        /// Stage named by the caller
        stage: StageName,
        /// Its current status
        status: StageStatus,
    },

    /// The workflow was cancelled
    #[error("workflow {workflow_id} has been cancelled")]
    WorkflowCancelled {
        /// Workflow addressed
        workflow_id: WorkflowId,
        /// Stage named by the caller, else the one at the cursor
        stage: Option<StageName>,
    },

    /// The workflow already ran every stage
    #[error("workflow {workflow_id} has already completed")]
    WorkflowFinished {
        /// Workflow addressed
        workflow_id: WorkflowId,
        /// Stage named by the caller
        stage: Option<StageName>,
    },

    /// A control operation on an existing workflow carried bad input
    #[error("invalid request for stage '{stage}' of workflow {workflow_id}: {reason}")]
    InvalidControl {
        /// Workflow addressed
        workflow_id: WorkflowId,
        /// Stage named by the caller
        stage: StageName,
        /// What was wrong
        reason: String,
    },

    /// Malformed or semantically invalid input
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid configuration provided
    #[error("invalid configuration: {0}")]
    Config(String),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of [`EngineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown workflow or missing output
    NotFound,
    /// Operation not legal in the current state
    Precondition,
    /// Bad input
    Invalid,
    /// Everything else
    Internal,
}

impl EngineError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::WorkflowNotFound(_) | EngineError::OutputNotFound { .. } => {
                ErrorKind::NotFound
            }
            EngineError::NotAwaitingReview { .. }
            | EngineError::StageNotCurrent { .. }
            | EngineError::StageBusy { .. }
            | EngineError::StageNotReviewable { .. }
            | EngineError::WorkflowCancelled { .. }
            | EngineError::WorkflowFinished { .. } => ErrorKind::Precondition,
            EngineError::InvalidControl { .. } | EngineError::InvalidRequest(_) => {
                ErrorKind::Invalid
            }
            EngineError::Config(_) | EngineError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Workflow the error refers to, if any
    pub fn workflow_id(&self) -> Option<WorkflowId> {
        match self {
            EngineError::WorkflowNotFound(id) => Some(*id),
            EngineError::WorkflowCancelled { workflow_id, .. }
            | EngineError::WorkflowFinished { workflow_id, .. }
            | EngineError::InvalidControl { workflow_id, .. }
            | EngineError::OutputNotFound { workflow_id, .. }
            | EngineError::NotAwaitingReview { workflow_id, .. }
            | EngineError::StageNotCurrent { workflow_id, .. }
            | EngineError::StageBusy { workflow_id, .. }
            | EngineError::StageNotReviewable { workflow_id, .. } => Some(*workflow_id),
            EngineError::InvalidRequest(_) | EngineError::Config(_) | EngineError::Io(_) => None,
        }
    }

    /// Stage the error refers to, if any
    pub fn stage(&self) -> Option<StageName> {
        match self {
            EngineError::OutputNotFound { stage, .. }
            | EngineError::StageNotCurrent { stage, .. }
            | EngineError::StageBusy { stage, .. }
            | EngineError::StageNotReviewable { stage, .. }
            | EngineError::InvalidControl { stage, .. } => Some(*stage),
            EngineError::NotAwaitingReview { stage, .. }
            | EngineError::WorkflowCancelled { stage, .. }
            | EngineError::WorkflowFinished { stage, .. } => *stage,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let id = WorkflowId::new();
        assert_eq!(EngineError::WorkflowNotFound(id).kind(), ErrorKind::NotFound);
        assert_eq!(
            EngineError::StageBusy {
                workflow_id: id,
                stage: StageName::Research
            }
            .kind(),
            ErrorKind::Precondition
        );
        assert_eq!(
            EngineError::InvalidRequest("company_name is required".into()).kind(),
            ErrorKind::Invalid
        );
        assert_eq!(EngineError::Config("bad".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_error_context_accessors() {
        let id = WorkflowId::new();
        let err = EngineError::OutputNotFound {
            workflow_id: id,
            stage: StageName::Memo,
        };
        assert_eq!(err.workflow_id(), Some(id));
        assert_eq!(err.stage(), Some(StageName::Memo));
        assert!(err.to_string().contains("memo"));
        assert_eq!(EngineError::InvalidRequest("x".into()).workflow_id(), None);
    }

    #[test]
    fn test_review_rejections_name_the_stage() {
        let id = WorkflowId::new();
        let finished = EngineError::WorkflowFinished {
            workflow_id: id,
            stage: Some(StageName::Memo),
        };
        assert_eq!(finished.kind(), ErrorKind::Precondition);
        assert_eq!(finished.workflow_id(), Some(id));
        assert_eq!(finished.stage(), Some(StageName::Memo));

        let feedback = EngineError::InvalidControl {
            workflow_id: id,
            stage: StageName::RiskScan,
            reason: "feedback must not be empty".into(),
        };
        assert_eq!(feedback.kind(), ErrorKind::Invalid);
        assert_eq!(feedback.workflow_id(), Some(id));
        assert_eq!(feedback.stage(), Some(StageName::RiskScan));
        assert!(feedback.to_string().contains("risk_scan"));
    }
}

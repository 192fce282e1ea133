//! Per-workflow state machine.
//!
//! `WorkflowState` is plain data with no locking of its own; the store wraps
//! each instance in a mutex and every mutation below runs under it.

use chrono::{DateTime, Utc};
use deal_core::{precondition, EngineError, Result, StageInput};
use deal_protocol::{
    DataRoomDocument, DealContext, DocumentKind, StageName, StageOutputs, StageStatus,
    StartRequest, WorkflowId, WorkflowPhase, WorkflowSnapshot, WorkflowSummary,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Workflow-level cancel flag, readable from worker threads.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Raise the flag
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the flag is raised
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One stage run handed from the state machine to the orchestrator
#[derive(Debug, Clone)]
pub struct StageLaunch {
    /// Stage to run
    pub stage: StageName,
    /// Run attempt, starting at 1
    pub attempt: u32,
    /// Identifies this run; results carrying an older token are discarded
    pub token: u64,
    /// Executor input
    pub input: StageInput,
}

/// What happened to a stage result offered back to the state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Stored; the stage is now completed
    Completed,
    /// Recorded as a failure
    Failed(String),
    /// Dropped: the workflow was cancelled or the run was superseded
    Discarded,
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The workflow is now cancelled; carries the stage that was current
    Cancelled(Option<StageName>),
    /// Nothing changed
    AlreadyCancelled,
}

/// Mutable record of one workflow run
#[derive(Debug)]
pub struct WorkflowState {
    id: WorkflowId,
    context: Arc<DealContext>,
    documents: Arc<Vec<DataRoomDocument>>,
    stages: Vec<StageName>,
    cursor: usize,
    stage_status: BTreeMap<StageName, StageStatus>,
    outputs: StageOutputs,
    awaiting_review: bool,
    cancelled: bool,
    cancel_flag: CancelFlag,
    feedback: BTreeMap<StageName, String>,
    attempts: BTreeMap<StageName, u32>,
    errors: BTreeMap<StageName, String>,
    run_token: u64,
    created_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Validate a start request and build the initial state.
    ///
    /// Optional stages that were not selected, and stages whose precondition is
    /// unmet, are marked skipped and left out of the stage sequence.
    pub fn new(id: WorkflowId, request: StartRequest) -> Result<Self> {
        let StartRequest {
            context,
            stages: selected,
            mut documents,
        } = request;

        if context.company_name.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "company_name is required".into(),
            ));
        }

        for doc in documents.iter_mut() {
            let detected = DocumentKind::from_filename(&doc.filename).ok_or_else(|| {
                EngineError::InvalidRequest(format!(
                    "unsupported document type: {}",
                    doc.filename
                ))
            })?;
            doc.kind.get_or_insert(detected);
        }

        let selected: BTreeSet<StageName> = selected.into_iter().collect();
        let mut stages = Vec::new();
        let mut stage_status = BTreeMap::new();

        for stage in StageName::ALL {
            if stage.is_optional() && !selected.contains(&stage) {
                stage_status.insert(stage, StageStatus::Skipped);
                continue;
            }
            if let Some(reason) = precondition(stage, &documents) {
                info!(workflow_id = %id, stage = %stage, "Skipping stage: {}", reason);
                stage_status.insert(stage, StageStatus::Skipped);
                continue;
            }
            stages.push(stage);
            stage_status.insert(stage, StageStatus::Pending);
        }

        Ok(Self {
            id,
            context: Arc::new(context),
            documents: Arc::new(documents),
            stages,
            cursor: 0,
            stage_status,
            outputs: BTreeMap::new(),
            awaiting_review: false,
            cancelled: false,
            cancel_flag: CancelFlag::default(),
            feedback: BTreeMap::new(),
            attempts: BTreeMap::new(),
            errors: BTreeMap::new(),
            run_token: 0,
            created_at: Utc::now(),
        })
    }

    /// Workflow identifier
    pub fn id(&self) -> WorkflowId {
        self.id
    }

    /// Stage sequence fixed at creation
    pub fn stages(&self) -> &[StageName] {
        &self.stages
    }

    /// Index of the current stage
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Stage at the cursor, `None` once every stage is done
    pub fn current_stage(&self) -> Option<StageName> {
        self.stages.get(self.cursor).copied()
    }

    /// Status of any known stage
    pub fn status_of(&self, stage: StageName) -> StageStatus {
        self.stage_status
            .get(&stage)
            .copied()
            .unwrap_or(StageStatus::Skipped)
    }

    /// True while parked at a review gate
    pub fn awaiting_review(&self) -> bool {
        self.awaiting_review
    }

    /// True once cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// True once the cursor passed the last stage
    pub fn is_finished(&self) -> bool {
        self.cursor >= self.stages.len()
    }

    /// Handle to the cancel flag shared with workers
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel_flag.clone()
    }

    /// Stored output of a stage
    pub fn output(&self, stage: StageName) -> Option<&Value> {
        self.outputs.get(&stage)
    }

    /// Every stored output
    pub fn outputs(&self) -> &StageOutputs {
        &self.outputs
    }

    /// Derived workflow phase
    pub fn phase(&self) -> WorkflowPhase {
        if self.cancelled {
            WorkflowPhase::Cancelled
        } else if self.is_finished() {
            WorkflowPhase::Completed
        } else if self.awaiting_review {
            WorkflowPhase::AwaitingReview
        } else if self
            .current_stage()
            .is_some_and(|s| self.status_of(s) == StageStatus::Failed)
        {
            WorkflowPhase::Failed
        } else {
            WorkflowPhase::Processing
        }
    }

    /// Point-in-time view
    pub fn snapshot(&self) -> WorkflowSnapshot {
        let current_stage = self.current_stage();
        WorkflowSnapshot {
            id: self.id,
            stages: self.stages.clone(),
            cursor: self.cursor,
            current_stage,
            stage_status: self.stage_status.clone(),
            awaiting_review: self.awaiting_review,
            cancelled: self.cancelled,
            phase: self.phase(),
            error: current_stage.and_then(|s| self.errors.get(&s).cloned()),
            context: (*self.context).clone(),
            created_at: self.created_at,
        }
    }

    /// Listing row
    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id,
            company_name: self.context.company_name.clone(),
            phase: self.phase(),
            current_stage: self.current_stage(),
            created_at: self.created_at,
        }
    }

    /// Mark the current stage running and build its executor input.
    pub fn begin_stage(&mut self) -> Result<StageLaunch> {
        let stage = self.ensure_open(None)?;
        match self.status_of(stage) {
            StageStatus::Pending | StageStatus::Refining => {}
            StageStatus::Running => {
                return Err(EngineError::StageBusy {
                    workflow_id: self.id,
                    stage,
                })
            }
            status => {
                return Err(EngineError::StageNotReviewable {
                    workflow_id: self.id,
                    stage,
                    status,
                })
            }
        }

        let attempt = {
            let n = self.attempts.entry(stage).or_insert(0);
            *n += 1;
            *n
        };
        self.run_token += 1;
        self.errors.remove(&stage);
        self.stage_status.insert(stage, StageStatus::Running);

        // Upstream results only; skipped stages have no output to pass on.
        let prior_outputs = self.stages[..self.cursor]
            .iter()
            .filter_map(|s| self.outputs.get(s).map(|v| (*s, v.clone())))
            .collect();

        debug!(workflow_id = %self.id, stage = %stage, attempt, "Stage running");

        Ok(StageLaunch {
            stage,
            attempt,
            token: self.run_token,
            input: StageInput {
                workflow_id: self.id,
                stage,
                attempt,
                context: Arc::clone(&self.context),
                documents: Arc::clone(&self.documents),
                prior_outputs,
                feedback: self.feedback.remove(&stage),
            },
        })
    }

    /// Offer a successful result from run `token`.
    pub fn complete_stage(&mut self, token: u64, output: Value) -> Applied {
        let Some(stage) = self.accepting(token) else {
            return Applied::Discarded;
        };
        self.outputs.insert(stage, output);
        self.stage_status.insert(stage, StageStatus::Completed);
        self.awaiting_review = true;
        Applied::Completed
    }

    /// Offer a failure from run `token`.
    pub fn fail_stage(&mut self, token: u64, message: String) -> Applied {
        let Some(stage) = self.accepting(token) else {
            return Applied::Discarded;
        };
        self.stage_status.insert(stage, StageStatus::Failed);
        self.errors.insert(stage, message.clone());
        self.awaiting_review = false;
        Applied::Failed(message)
    }

    /// Leave the review gate and move to the next stage.
    ///
    /// Returns the new current stage, or `None` when the workflow is done.
    pub fn continue_review(&mut self) -> Result<Option<StageName>> {
        let current = self.ensure_open(None)?;
        if !self.awaiting_review {
            return Err(EngineError::NotAwaitingReview {
                workflow_id: self.id,
                stage: Some(current),
            });
        }
        self.awaiting_review = false;
        self.cursor += 1;
        Ok(self.current_stage())
    }

    /// Discard the current stage's output and queue a rerun with feedback.
    pub fn refine(&mut self, stage: StageName, feedback: String) -> Result<()> {
        self.ensure_current(stage)?;
        if feedback.trim().is_empty() {
            return Err(EngineError::InvalidControl {
                workflow_id: self.id,
                stage,
                reason: "feedback must not be empty".into(),
            });
        }
        match self.status_of(stage) {
            StageStatus::Completed | StageStatus::Failed => {}
            StageStatus::Running => {
                return Err(EngineError::StageBusy {
                    workflow_id: self.id,
                    stage,
                })
            }
            status => {
                return Err(EngineError::StageNotReviewable {
                    workflow_id: self.id,
                    stage,
                    status,
                })
            }
        }
        self.outputs.remove(&stage);
        self.errors.remove(&stage);
        self.stage_status.insert(stage, StageStatus::Refining);
        self.feedback.insert(stage, feedback);
        self.awaiting_review = false;
        Ok(())
    }

    /// Bypass the current stage.
    ///
    /// Returns the new current stage, or `None` when the workflow is done.
    pub fn skip(&mut self, stage: StageName) -> Result<Option<StageName>> {
        self.ensure_current(stage)?;
        if self.status_of(stage) == StageStatus::Running {
            return Err(EngineError::StageBusy {
                workflow_id: self.id,
                stage,
            });
        }
        self.outputs.remove(&stage);
        self.errors.remove(&stage);
        self.feedback.remove(&stage);
        self.stage_status.insert(stage, StageStatus::Skipped);
        self.awaiting_review = false;
        self.cursor += 1;
        Ok(self.current_stage())
    }

    /// Cancel the workflow.
    ///
    /// Cancelling twice is not an error; cancelling a finished workflow is.
    pub fn cancel(&mut self) -> Result<CancelOutcome> {
        if self.cancelled {
            return Ok(CancelOutcome::AlreadyCancelled);
        }
        if self.is_finished() {
            return Err(EngineError::WorkflowFinished {
                workflow_id: self.id,
                stage: None,
            });
        }
        self.cancelled = true;
        self.cancel_flag.cancel();
        self.awaiting_review = false;
        for status in self.stage_status.values_mut() {
            if matches!(
                status,
                StageStatus::Pending | StageStatus::Running | StageStatus::Refining
            ) {
                *status = StageStatus::Cancelled;
            }
        }
        Ok(CancelOutcome::Cancelled(self.current_stage()))
    }

    /// Current stage of a live workflow. Rejections name `named`, else the cursor stage.
    fn ensure_open(&self, named: Option<StageName>) -> Result<StageName> {
        if self.cancelled {
            return Err(EngineError::WorkflowCancelled {
                workflow_id: self.id,
                stage: named.or(self.current_stage()),
            });
        }
        self.current_stage().ok_or(EngineError::WorkflowFinished {
            workflow_id: self.id,
            stage: named,
        })
    }

    fn ensure_current(&self, stage: StageName) -> Result<()> {
        let current = self.ensure_open(Some(stage))?;
        if current != stage {
            return Err(EngineError::StageNotCurrent {
                workflow_id: self.id,
                stage,
                current: Some(current),
            });
        }
        Ok(())
    }

    fn accepting(&self, token: u64) -> Option<StageName> {
        if self.cancelled || token != self.run_token {
            return None;
        }
        self.current_stage()
            .filter(|s| self.status_of(*s) == StageStatus::Running)
    }
}

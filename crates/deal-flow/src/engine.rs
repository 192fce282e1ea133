use crate::bridge;
use crate::dispatch::StageExecutors;
use crate::publisher::{self, EventSubscription};
use crate::runner::StageRunner;
use crate::state::{CancelOutcome, StageLaunch, WorkflowState};
use crate::store::{WorkflowEntry, WorkflowStore};
use deal_core::{EngineConfig, EngineError, Result};
use deal_protocol::{
    StageName, StageOutputs, StartRequest, WorkflowEvent, WorkflowId, WorkflowSnapshot,
    WorkflowSummary,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

/// Orchestrates workflows: sequencing stages, offloading them to workers and
/// exposing the control operations.
#[derive(Clone)]
pub struct FlowEngine {
    store: WorkflowStore,
    executors: Arc<StageExecutors>,
    permits: Arc<Semaphore>,
    config: EngineConfig,
}

impl FlowEngine {
    /// Create a new flow engine
    pub fn new(executors: StageExecutors, config: EngineConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_stages.max(1)));
        Self {
            store: WorkflowStore::new(),
            executors: Arc::new(executors),
            permits,
            config,
        }
    }

    /// Underlying store
    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    /// Create a workflow and start its first stage
    #[instrument(skip(self, request), fields(company = %request.context.company_name))]
    pub async fn start(&self, request: StartRequest) -> Result<WorkflowId> {
        let id = WorkflowId::new();
        let state = WorkflowState::new(id, request)?;
        info!(workflow_id = %id, stages = ?state.stages(), "Starting workflow");

        let entry = Arc::new(WorkflowEntry::new(state, self.config.event_capacity));
        self.store.insert(Arc::clone(&entry)).await?;

        let launch = entry.state().lock().begin_stage()?;
        self.launch(entry, launch).await;
        Ok(id)
    }

    /// Subscribe to a workflow's events
    pub async fn subscribe(&self, id: WorkflowId) -> Result<EventSubscription> {
        Ok(self.store.get(id).await?.hub().subscribe())
    }

    /// Current snapshot
    pub async fn status(&self, id: WorkflowId) -> Result<WorkflowSnapshot> {
        Ok(self.store.get(id).await?.state().lock().snapshot())
    }

    /// Stored output of one stage
    pub async fn output(&self, id: WorkflowId, stage: StageName) -> Result<Value> {
        let entry = self.store.get(id).await?;
        let state = entry.state().lock();
        state
            .output(stage)
            .cloned()
            .ok_or(EngineError::OutputNotFound {
                workflow_id: id,
                stage,
            })
    }

    /// Every stored output; the final result once the workflow completed
    pub async fn outputs(&self, id: WorkflowId) -> Result<StageOutputs> {
        Ok(self.store.get(id).await?.state().lock().outputs().clone())
    }

    /// Summaries of every workflow, oldest first
    pub async fn list(&self) -> Vec<WorkflowSummary> {
        let mut summaries: Vec<WorkflowSummary> = self
            .store
            .list()
            .await
            .iter()
            .map(|entry| entry.state().lock().summary())
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    /// Accept the current stage and move on
    #[instrument(skip(self))]
    pub async fn continue_workflow(&self, id: WorkflowId) -> Result<WorkflowSnapshot> {
        let entry = self.store.get(id).await?;
        let (next, snapshot) = {
            let mut state = entry.state().lock();
            let next = match state.continue_review()? {
                Some(_) => Some(state.begin_stage()?),
                None => None,
            };
            (next, state.snapshot())
        };

        self.advance(entry, next).await;
        Ok(snapshot)
    }

    /// Discard the current stage's output and rerun it with feedback
    #[instrument(skip(self, feedback))]
    pub async fn refine(
        &self,
        id: WorkflowId,
        stage: StageName,
        feedback: String,
    ) -> Result<WorkflowSnapshot> {
        let entry = self.store.get(id).await?;
        let (launch, snapshot) = {
            let mut state = entry.state().lock();
            state.refine(stage, feedback)?;
            let launch = state.begin_stage()?;
            (launch, state.snapshot())
        };

        info!(workflow_id = %id, stage = %stage, attempt = launch.attempt, "Refining stage");
        self.launch(entry, launch).await;
        Ok(snapshot)
    }

    /// Bypass the current stage
    #[instrument(skip(self))]
    pub async fn skip(&self, id: WorkflowId, stage: StageName) -> Result<WorkflowSnapshot> {
        let entry = self.store.get(id).await?;
        let (next, snapshot) = {
            let mut state = entry.state().lock();
            let next = match state.skip(stage)? {
                Some(_) => Some(state.begin_stage()?),
                None => None,
            };
            (next, state.snapshot())
        };

        info!(workflow_id = %id, stage = %stage, "Stage skipped");
        self.advance(entry, next).await;
        Ok(snapshot)
    }

    /// Cancel the workflow. Running workers are left to finish; their results are discarded.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: WorkflowId) -> Result<WorkflowSnapshot> {
        let entry = self.store.get(id).await?;
        let mut state = entry.state().lock();
        match state.cancel()? {
            CancelOutcome::Cancelled(stage) => {
                entry.hub().close(WorkflowEvent::Cancelled { stage });
                info!(workflow_id = %id, "Workflow cancelled");
            }
            CancelOutcome::AlreadyCancelled => {
                debug!(workflow_id = %id, "Workflow already cancelled");
            }
        }
        Ok(state.snapshot())
    }

    async fn advance(&self, entry: Arc<WorkflowEntry>, next: Option<StageLaunch>) {
        match next {
            Some(launch) => self.launch(entry, launch).await,
            None => {
                let id = entry.state().lock().id();
                // The last stage's terminal event must go out before `completed`.
                Self::wait_for_publisher(&entry).await;
                entry.hub().close(WorkflowEvent::Completed);
                info!(workflow_id = %id, "Workflow completed");
            }
        }
    }

    async fn launch(&self, entry: Arc<WorkflowEntry>, launch: StageLaunch) {
        Self::wait_for_publisher(&entry).await;

        if !entry.hub().begin_stage(launch.stage, launch.attempt) {
            debug!(stage = %launch.stage, "Workflow closed before the stage started");
            return;
        }

        let (sender, receiver) = bridge::channel(entry.cancel_flag().clone());
        let publisher = tokio::spawn(publisher::consume(
            Arc::clone(entry.hub()),
            launch.stage,
            receiver,
            entry.cancel_flag().clone(),
            self.config.poll_interval(),
        ));
        entry.set_publisher(publisher);

        let runner = StageRunner {
            executor: self.executors.resolve(launch.stage),
            entry,
            launch,
            sender,
            permits: Arc::clone(&self.permits),
            timeout: self.config.stage_timeout(),
        };
        tokio::spawn(runner.drive());
    }

    async fn wait_for_publisher(entry: &WorkflowEntry) {
        if let Some(previous) = entry.take_publisher() {
            if let Err(e) = previous.await {
                warn!("Publisher task ended abnormally: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

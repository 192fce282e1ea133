//! Drives one stage run on the blocking worker pool.

use crate::bridge::BridgeSender;
use crate::state::{Applied, StageLaunch};
use crate::store::WorkflowEntry;
use deal_core::{StageEmitter, StepExecutor};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

pub(crate) struct StageRunner {
    pub entry: Arc<WorkflowEntry>,
    pub executor: Arc<dyn StepExecutor>,
    pub launch: StageLaunch,
    pub sender: BridgeSender,
    pub permits: Arc<Semaphore>,
    pub timeout: Option<Duration>,
}

impl StageRunner {
    /// Run the executor, apply its result to the state, then enqueue the sentinel.
    pub async fn drive(self) {
        let StageRunner {
            entry,
            executor,
            launch,
            sender,
            permits,
            timeout,
        } = self;
        let StageLaunch {
            stage,
            attempt,
            token,
            input,
        } = launch;
        let workflow_id = input.workflow_id;

        let permit = match permits.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                let outcome = entry
                    .state()
                    .lock()
                    .fail_stage(token, "worker pool is shut down".into());
                sender.finish(outcome);
                return;
            }
        };

        if sender.is_cancelled() {
            info!(workflow_id = %workflow_id, stage = %stage, "Cancelled before start");
            sender.finish(Applied::Discarded);
            return;
        }

        info!(
            workflow_id = %workflow_id,
            stage = %stage,
            attempt,
            refinement = input.is_refinement(),
            "Running stage"
        );

        let worker = sender.clone();
        let handle = tokio::task::spawn_blocking(move || {
            // The permit is released when the worker really finishes, even after a timeout.
            let _permit = permit;
            executor.execute(input, &worker)
        });

        let result: Result<Value, String> = match timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => flatten(joined),
                Err(_) => {
                    warn!(workflow_id = %workflow_id, stage = %stage, "Stage timed out");
                    Err(format!("stage timed out after {}s", limit.as_secs()))
                }
            },
            None => flatten(handle.await),
        };

        let outcome = {
            let mut state = entry.state().lock();
            match result {
                Ok(value) => state.complete_stage(token, value),
                Err(message) => state.fail_stage(token, message),
            }
        };

        match &outcome {
            Applied::Completed => {
                info!(workflow_id = %workflow_id, stage = %stage, attempt, "Stage completed, awaiting review")
            }
            Applied::Failed(message) => {
                error!(workflow_id = %workflow_id, stage = %stage, attempt, "Stage failed: {}", message)
            }
            Applied::Discarded => {
                info!(workflow_id = %workflow_id, stage = %stage, attempt, "Late stage result discarded")
            }
        }

        sender.finish(outcome);
    }
}

fn flatten(
    joined: Result<anyhow::Result<Value>, tokio::task::JoinError>,
) -> Result<Value, String> {
    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(e) if e.is_panic() => Err("stage executor panicked".to_string()),
        Err(e) => Err(format!("stage worker aborted: {}", e)),
    }
}

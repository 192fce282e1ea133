//! The seam between the workflow engine and the agents that do the work.

use deal_protocol::{DataRoomDocument, DealContext, StageName, WorkflowId};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything a stage needs to run once.
#[derive(Debug, Clone)]
pub struct StageInput {
    /// Owning workflow
    pub workflow_id: WorkflowId,
    /// Stage being run
    pub stage: StageName,
    /// 1 for the first run, incremented by each refine
    pub attempt: u32,
    /// Company metadata
    pub context: Arc<DealContext>,
    /// Data-room documents supplied at start
    pub documents: Arc<Vec<DataRoomDocument>>,
    /// Outputs of completed stages that precede this one
    pub prior_outputs: BTreeMap<StageName, Value>,
    /// Reviewer feedback when this run is a refinement
    pub feedback: Option<String>,
}

impl StageInput {
    /// Output of an earlier stage, if it completed
    pub fn prior(&self, stage: StageName) -> Option<&Value> {
        self.prior_outputs.get(&stage)
    }

    /// True when rerunning with reviewer feedback
    pub fn is_refinement(&self) -> bool {
        self.feedback.is_some()
    }
}

/// Sink for incremental output, handed to a running executor.
///
/// Implementations must be callable from a blocking worker thread.
pub trait StageEmitter: Send + Sync {
    /// Forward one text fragment in production order
    fn emit(&self, fragment: String);

    /// Report a coarse progress milestone
    fn progress(&self, percent: u8, message: &str);

    /// Cooperative cancellation hint. Executors may stop early when this
    /// returns true; their result will be discarded either way.
    fn is_cancelled(&self) -> bool;
}

/// A stage implementation.
///
/// `execute` is blocking and runs on a worker thread, never on the async
/// runtime. The returned value becomes the stage output.
pub trait StepExecutor: Send + Sync {
    /// Run the stage
    fn execute(&self, input: StageInput, emitter: &dyn StageEmitter) -> anyhow::Result<Value>;
}

impl<F> StepExecutor for F
where
    F: Fn(StageInput, &dyn StageEmitter) -> anyhow::Result<Value> + Send + Sync,
{
    fn execute(&self, input: StageInput, emitter: &dyn StageEmitter) -> anyhow::Result<Value> {
        self(input, emitter)
    }
}

/// Whether a stage can run with the inputs supplied at start.
///
/// Returns the reason when it cannot.
pub fn precondition(stage: StageName, documents: &[DataRoomDocument]) -> Option<&'static str> {
    match stage {
        StageName::Extraction if documents.is_empty() => Some("no data-room documents supplied"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingEmitter {
        fragments: Mutex<Vec<String>>,
    }

    impl StageEmitter for RecordingEmitter {
        fn emit(&self, fragment: String) {
            self.fragments.lock().expect("lock").push(fragment);
        }

        fn progress(&self, _percent: u8, _message: &str) {}

        fn is_cancelled(&self) -> bool {
            false
        }
    }

    fn input(stage: StageName) -> StageInput {
        StageInput {
            workflow_id: WorkflowId::new(),
            stage,
            attempt: 1,
            context: Arc::new(DealContext::new("Bizzi", "https://bizzi.vn")),
            documents: Arc::new(Vec::new()),
            prior_outputs: BTreeMap::new(),
            feedback: None,
        }
    }

    #[test]
    fn test_closure_executor() {
        let exec = |input: StageInput, emitter: &dyn StageEmitter| -> anyhow::Result<Value> {
            emitter.emit(format!("hello {}", input.context.company_name));
            Ok(serde_json::json!({ "stage": input.stage }))
        };
        let emitter = RecordingEmitter::default();
        let out = exec
            .execute(input(StageName::Memo), &emitter)
            .expect("execute");
        assert_eq!(out["stage"], "memo");
        assert_eq!(
            *emitter.fragments.lock().expect("lock"),
            vec!["hello Bizzi".to_string()]
        );
    }

    #[test]
    fn test_refinement_follows_feedback() {
        let mut first = input(StageName::RiskScan);
        assert!(!first.is_refinement());
        first.feedback = Some("dig into churn".into());
        first.attempt = 2;
        assert!(first.is_refinement());
    }

    #[test]
    fn test_extraction_needs_documents() {
        assert!(precondition(StageName::Extraction, &[]).is_some());
        let docs = vec![DataRoomDocument::new("deck.pdf", "revenue")];
        assert!(precondition(StageName::Extraction, &docs).is_none());
        assert!(precondition(StageName::Research, &[]).is_none());
    }
}

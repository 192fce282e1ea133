//! Stage dispatch table.

use deal_core::StepExecutor;
use deal_protocol::StageName;
use std::sync::Arc;

/// Dispatch table from stage to executor.
///
/// One field per stage; adding a stage without an executor fails to compile.
#[derive(Clone)]
pub struct StageExecutors {
    /// Public research
    pub research: Arc<dyn StepExecutor>,
    /// Data-room extraction
    pub extraction: Arc<dyn StepExecutor>,
    /// Risk scan
    pub risk_scan: Arc<dyn StepExecutor>,
    /// IC memo
    pub memo: Arc<dyn StepExecutor>,
}

impl StageExecutors {
    /// Use the same executor for every stage
    pub fn uniform(executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            research: Arc::clone(&executor),
            extraction: Arc::clone(&executor),
            risk_scan: Arc::clone(&executor),
            memo: executor,
        }
    }

    /// Executor for `stage`
    pub fn resolve(&self, stage: StageName) -> Arc<dyn StepExecutor> {
        let executor = match stage {
            StageName::Research => &self.research,
            StageName::Extraction => &self.extraction,
            StageName::RiskScan => &self.risk_scan,
            StageName::Memo => &self.memo,
        };
        Arc::clone(executor)
    }
}

impl std::fmt::Debug for StageExecutors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutors").finish_non_exhaustive()
    }
}

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque identifier of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct WorkflowId(#[schemars(with = "String")] Uuid);

impl WorkflowId {
    /// Allocate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// The closed set of stages a due-diligence workflow can run.
///
/// Declaration order is execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Public research: company, competitors, market
    #[serde(alias = "deep_research")]
    Research,
    /// Private data-room extraction
    #[serde(alias = "data_room", alias = "dataroom")]
    Extraction,
    /// Risk and anomaly scan across upstream outputs
    #[serde(
        alias = "risk-scan",
        alias = "riskScan",
        alias = "riskscan",
        alias = "risk_scanner"
    )]
    RiskScan,
    /// Investment committee memo drafting
    #[serde(alias = "ic_memo", alias = "ic-memo")]
    Memo,
}

impl StageName {
    /// Every stage, in execution order
    pub const ALL: [StageName; 4] = [
        StageName::Research,
        StageName::Extraction,
        StageName::RiskScan,
        StageName::Memo,
    ];

    /// Wire name of the stage
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Research => "research",
            StageName::Extraction => "extraction",
            StageName::RiskScan => "risk_scan",
            StageName::Memo => "memo",
        }
    }

    /// Human-readable title
    pub fn title(&self) -> &'static str {
        match self {
            StageName::Research => "Deep Research",
            StageName::Extraction => "Data Room Extraction",
            StageName::RiskScan => "Risk Scan",
            StageName::Memo => "IC Memo",
        }
    }

    /// Optional stages only run when the caller selects them.
    pub fn is_optional(&self) -> bool {
        matches!(self, StageName::Research | StageName::Extraction)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a stage name does not match any known stage
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage: {0}")]
pub struct UnknownStage(pub String);

impl FromStr for StageName {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "research" | "deep_research" => Ok(StageName::Research),
            "extraction" | "data_room" | "dataroom" => Ok(StageName::Extraction),
            "risk_scan" | "risk-scan" | "riskscan" | "risk_scanner" => Ok(StageName::RiskScan),
            "memo" | "ic_memo" | "ic-memo" => Ok(StageName::Memo),
            _ => Err(UnknownStage(s.to_string())),
        }
    }
}

/// Lifecycle of a single stage inside one workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Waiting for its turn
    Pending,
    /// Executing on a worker
    Running,
    /// Finished; output stored
    Completed,
    /// Output discarded, waiting to rerun with feedback
    Refining,
    /// Bypassed, no output
    Skipped,
    /// Stopped by workflow cancellation
    Cancelled,
    /// Executor raised an error
    Failed,
}

impl StageStatus {
    /// Terminal statuses never change again without an explicit control operation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Skipped | StageStatus::Cancelled | StageStatus::Failed
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Refining => "refining",
            StageStatus::Skipped => "skipped",
            StageStatus::Cancelled => "cancelled",
            StageStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Workflow-level phase derived from the stage table and flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    /// A stage is pending or running
    Processing,
    /// Parked at a review gate
    AwaitingReview,
    /// The current stage failed and needs a decision
    Failed,
    /// Cursor passed the last stage
    Completed,
    /// Cancel flag set
    Cancelled,
}

/// Subject of the due-diligence run, passed unchanged to every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DealContext {
    /// Company under review
    pub company_name: String,
    /// Company website
    #[serde(default)]
    pub website: String,
    /// Sector or vertical
    #[serde(default = "default_sector")]
    pub sector: String,
    /// Geographic region
    #[serde(default = "default_region")]
    pub region: String,
    /// Headquarters, when it differs from the region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hq_location: Option<String>,
}

fn default_sector() -> String {
    "Technology".to_string()
}

fn default_region() -> String {
    "Global".to_string()
}

impl DealContext {
    /// Create a context with default sector and region
    pub fn new(company_name: impl Into<String>, website: impl Into<String>) -> Self {
        Self {
            company_name: company_name.into(),
            website: website.into(),
            sector: default_sector(),
            region: default_region(),
            hq_location: None,
        }
    }

    /// Set the sector
    pub fn with_sector(mut self, sector: impl Into<String>) -> Self {
        self.sector = sector.into();
        self
    }

    /// Set the region
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Headquarters, falling back to the region
    pub fn headquarters(&self) -> &str {
        self.hq_location.as_deref().unwrap_or(&self.region)
    }
}

/// Kind of data-room document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// Pitch decks, contracts
    Pdf,
    /// Financials, KPIs, cap tables
    Excel,
    /// Presentations
    #[serde(rename = "powerpoint")]
    PowerPoint,
    /// Word documents
    Word,
}

impl DocumentKind {
    /// Detect the kind from a file name's extension
    pub fn from_filename(filename: &str) -> Option<Self> {
        let ext = std::path::Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())?
            .to_ascii_lowercase();

        match ext.as_str() {
            "pdf" => Some(DocumentKind::Pdf),
            "xlsx" | "xls" => Some(DocumentKind::Excel),
            "pptx" | "ppt" => Some(DocumentKind::PowerPoint),
            "docx" | "doc" => Some(DocumentKind::Word),
            _ => None,
        }
    }
}

/// A data-room document with its already extracted text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DataRoomDocument {
    /// Original file name
    pub filename: String,
    /// Detected kind; derived from `filename` when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<DocumentKind>,
    /// Extracted text content
    pub content: String,
}

impl DataRoomDocument {
    /// Build a document, detecting its kind from the file name
    pub fn new(filename: impl Into<String>, content: impl Into<String>) -> Self {
        let filename = filename.into();
        let kind = DocumentKind::from_filename(&filename);
        Self {
            filename,
            kind,
            content: content.into(),
        }
    }

    /// Size of the text content in bytes
    pub fn size(&self) -> usize {
        self.content.len()
    }
}

/// Payload of the start operation
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StartRequest {
    /// Company metadata
    pub context: DealContext,
    /// Optional stages to run (`research`, `extraction`); mandatory stages are always added
    #[serde(default)]
    pub stages: Vec<StageName>,
    /// Data-room documents; `extraction` is skipped when empty
    #[serde(default)]
    pub documents: Vec<DataRoomDocument>,
}

/// Payload of the refine operation
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RefineRequest {
    /// Stage to rerun; must be the current stage
    pub stage: StageName,
    /// Reviewer feedback threaded into the rerun
    pub feedback: String,
}

/// Payload of the skip operation
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SkipRequest {
    /// Stage to skip; must be the current stage
    pub stage: StageName,
}

/// Point-in-time view of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowSnapshot {
    /// Workflow identifier
    pub id: WorkflowId,
    /// Stage sequence fixed at creation
    pub stages: Vec<StageName>,
    /// Index into `stages`
    pub cursor: usize,
    /// Stage at the cursor, if any
    pub current_stage: Option<StageName>,
    /// Status of every known stage
    pub stage_status: BTreeMap<StageName, StageStatus>,
    /// True while parked at a review gate
    pub awaiting_review: bool,
    /// True once cancelled
    pub cancelled: bool,
    /// Derived workflow phase
    pub phase: WorkflowPhase,
    /// Last failure reason of the current stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Company metadata
    pub context: DealContext,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Row of the workflow listing
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowSummary {
    /// Workflow identifier
    pub id: WorkflowId,
    /// Company under review
    pub company_name: String,
    /// Derived workflow phase
    pub phase: WorkflowPhase,
    /// Stage at the cursor, if any
    pub current_stage: Option<StageName>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Outputs accumulated by a workflow, keyed by stage
pub type StageOutputs = BTreeMap<StageName, Value>;

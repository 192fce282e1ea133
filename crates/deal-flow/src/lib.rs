//! Deal Flow - human-in-the-loop workflow engine
//!
//! Sequences due-diligence stages, runs each one on a bounded blocking worker
//! pool, streams the fragments a stage produces to subscribers, and parks the
//! workflow at a review gate after every stage until a control operation
//! (continue, refine, skip, cancel) arrives.
//!
//! # Modules
//!
//! - [`state`] - The per-workflow state machine
//! - [`store`] - Process-wide workflow registry (in memory only)
//! - [`bridge`] - Worker-to-publisher channel with a completion sentinel
//! - [`publisher`] - Ordered, replayable event fan-out
//! - [`engine`] - [`FlowEngine`], the orchestrator and control surface

#![warn(missing_docs)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

pub mod bridge;
pub mod dispatch;
/// The orchestrator and control operations
pub mod engine;
pub mod publisher;
mod runner;
pub mod state;
pub mod store;

pub use dispatch::StageExecutors;
pub use engine::FlowEngine;
pub use publisher::{EventHub, EventSubscription};
pub use state::{Applied, CancelFlag, CancelOutcome, StageLaunch, WorkflowState};
pub use store::{WorkflowEntry, WorkflowStore};

//! Deal Protocol - shared wire types for Deal Co-Pilot
//!
//! Every crate in the workspace speaks in these types: the engine stores them,
//! the server serializes them, and the CLI prints them.
//!
//! # Core Types
//!
//! - [`StageName`] - The closed set of due-diligence stages
//! - [`StageStatus`] / [`WorkflowPhase`] - Stage and workflow lifecycles
//! - [`DealContext`] / [`DataRoomDocument`] - Inputs of a workflow run
//! - [`WorkflowSnapshot`] - Point-in-time view returned by status queries
//! - [`WorkflowEvent`] / [`EventEnvelope`] - Events streamed to subscribers
//!
//! # Example
//!
//! ```rust
//! use deal_protocol::{DealContext, StageName, StartRequest};
//!
//! let request = StartRequest {
//!     context: DealContext::new("Bizzi", "https://bizzi.vn").with_region("Vietnam"),
//!     stages: vec![StageName::Research],
//!     documents: vec![],
//! };
//! assert_eq!(request.context.sector, "Technology");
//! ```

#![warn(missing_docs)]

/// Streamed workflow events
pub mod events;
/// Protocol models module
pub mod models;

pub use events::*;
pub use models::*;

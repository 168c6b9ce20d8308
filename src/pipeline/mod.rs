//! Pipeline layer for clipforge
//!
//! This module drives the end-to-end media test runs, separating concerns
//! between:
//! - Control/Coordination: the run state machine and the busy flag
//! - Stage submission: merge and transcode calls through the engine gateway
//! - Result assembly: timing/size aggregation into immutable records
//!
//! # Architecture
//!
//! One orchestrator drives one run at a time. Segments are captured
//! sequentially, then each engine stage is a single awaited request whose
//! settlement arrives through the correlation registry.

pub mod orchestrator;
pub mod state;
pub mod types;

pub use orchestrator::{PipelineOrchestrator, RunOptions};
pub use state::RunState;
pub use types::{ResultRecord, RunId, Segment};

//! Segment capture module
//!
//! The capture device is an external collaborator: it produces one opaque
//! binary segment per request, for a given duration. The pipeline never
//! looks inside a segment; ownership of the payload moves into the stage
//! submission that consumes it.

mod synthetic;

pub use synthetic::TestPatternSource;

use crate::error::PipelineError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Produces media segments on demand.
///
/// One segment at a time: the orchestrator records sequentially because
/// sources share one capture device.
#[async_trait]
pub trait SegmentSource: Send {
    /// Record one segment of approximately `duration`.
    async fn record(&mut self, duration: Duration) -> Result<Bytes, PipelineError>;

    /// Name of this source for logging
    fn name(&self) -> &'static str {
        "capture"
    }
}

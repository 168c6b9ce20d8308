//! Error taxonomy for the capture/merge/transcode pipeline.

use crate::engine::protocol::StageKey;
use thiserror::Error;

/// Failures surfaced by the pipeline and the engine gateway.
///
/// Orphan engine events are not represented here: an unmatched settlement is
/// counted and logged by the correlation registry, it never propagates.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The media engine could not be initialized. Fatal to the run that
    /// triggered loading, not to the process; re-initialization is an
    /// explicit recovery action.
    #[error("media engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Two stage requests for the same (run, phase) key were outstanding at
    /// once. Strict stage sequencing makes this a programming invariant
    /// violation, surfaced loudly.
    #[error("stage request already outstanding for {0}")]
    DuplicateKey(StageKey),

    /// The engine reported an error for a dispatched operation.
    #[error("stage {key} failed: {message}")]
    Stage { key: StageKey, message: String },

    /// The capture collaborator could not produce a segment.
    #[error("capture failed: {0}")]
    Capture(String),

    /// Appending a result record to the external log failed. Non-fatal to
    /// the run; callers log it at the persistence point.
    #[error("result persistence failed: {0}")]
    Persistence(#[from] std::io::Error),

    /// A new run was requested while another one is active.
    #[error("a run is already active")]
    RunActive,
}

impl PipelineError {
    /// True for failures that abort the current run. Persistence failures
    /// are non-fatal, and a busy refusal never had a run to abort.
    pub fn aborts_run(&self) -> bool {
        !matches!(
            self,
            PipelineError::Persistence(_) | PipelineError::RunActive
        )
    }
}

//! Run state management

use std::time::Instant;

/// Per-run state machine
///
/// Represents where the active run currently is. State transitions are
/// validated to keep stage sequencing consistent: stages only ever advance,
/// and any active state may drop straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No run is active; the only state a new run may start from
    Idle,

    /// Capturing segments from the capture collaborator
    Recording {
        /// When the run started
        started_at: Instant,
    },

    /// Splicing the captured segments (stream copy, no re-encode)
    Merging,

    /// Normalizing the merged output with the fixed argument profile
    Transcoding,

    /// Run finished; a result record was assembled
    Done,

    /// Run aborted; no result record is produced and nothing from this
    /// run is reused
    Failed,
}

impl RunState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &RunState) -> bool {
        use RunState::*;

        match (self, target) {
            // From Idle
            (Idle, Recording { .. }) => true,

            // Stages advance strictly in sequence
            (Recording { .. }, Merging) => true,
            (Merging, Transcoding) => true,
            (Transcoding, Done) => true,

            // Any active state may fail directly
            (Recording { .. }, Failed) => true,
            (Merging, Failed) => true,
            (Transcoding, Failed) => true,

            // Terminal states release the run slot
            (Done, Idle) => true,
            (Failed, Idle) => true,

            // Self-transitions
            (a, b) if a == b => true,

            // All other transitions invalid
            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            RunState::Idle => "Idle",
            RunState::Recording { .. } => "Recording",
            RunState::Merging => "Merging",
            RunState::Transcoding => "Transcoding",
            RunState::Done => "Done",
            RunState::Failed => "Failed",
        }
    }

    /// Check if a run is currently in flight
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunState::Recording { .. } | RunState::Merging | RunState::Transcoding
        )
    }

    /// Check if the run reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    /// Get the duration since the run started (if recording)
    pub fn recording_duration(&self) -> Option<std::time::Duration> {
        if let RunState::Recording { started_at } = self {
            Some(started_at.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

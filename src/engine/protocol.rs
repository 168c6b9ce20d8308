//! Wire contract between the engine gateway and the media engine worker.
//!
//! Commands travel gateway → worker, events travel back. A terminal
//! `Result`/`Error` event echoes the stage key of the command it answers;
//! `Progress` events are uncorrelated chatter and never settle a request.

use crate::pipeline::types::RunId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Merge,
    Transcode,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Merge => "merge",
            Phase::Transcode => "transcode",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlation key of one dispatched engine operation.
///
/// The fully-absent pair is legal and denotes an ad-hoc call made outside a
/// run; it occupies a single reserved slot in the correlation registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageKey {
    #[serde(rename = "runId", skip_serializing_if = "Option::is_none", default)]
    pub run: Option<RunId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub phase: Option<Phase>,
}

impl StageKey {
    pub fn correlated(run: impl Into<RunId>, phase: Phase) -> Self {
        Self {
            run: Some(run.into()),
            phase: Some(phase),
        }
    }

    /// Key of an ad-hoc (non-correlated) call.
    pub fn ad_hoc() -> Self {
        Self::default()
    }

    pub fn is_ad_hoc(&self) -> bool {
        self.run.is_none() && self.phase.is_none()
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.run {
            Some(run) => write!(f, "{run}")?,
            None => f.write_str("-")?,
        }
        match &self.phase {
            Some(phase) => write!(f, ":{phase}"),
            None => f.write_str(":-"),
        }
    }
}

/// A named binary payload handed to or returned by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedBlob {
    pub name: String,
    pub data: Bytes,
}

impl NamedBlob {
    pub fn new(name: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Operations dispatched to the engine worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum EngineCommand {
    /// Load the engine runtime. Idempotent; emitted once per gateway
    /// lifecycle unless an explicit re-initialization is requested.
    Load,

    /// Container-level stream-copy splice of the given segments, in order.
    Concat {
        segments: Vec<NamedBlob>,
        #[serde(rename = "outputName")]
        output_name: String,
        #[serde(flatten)]
        key: StageKey,
    },

    /// Re-encode one input with a caller-supplied fixed argument profile.
    Transcode {
        #[serde(rename = "inputName")]
        input_name: String,
        #[serde(rename = "inputData")]
        input_data: Bytes,
        #[serde(rename = "outputName")]
        output_name: String,
        args: Vec<String>,
        #[serde(flatten)]
        key: StageKey,
    },
}

/// Notifications emitted by the engine worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum EngineEvent {
    /// The runtime finished loading. Emitted at most once per load attempt.
    Loaded,

    /// Non-terminal chatter, forwarded verbatim to the telemetry sink.
    Progress { message: String },

    /// Terminal success for the stage request identified by `key`.
    Result {
        #[serde(rename = "outputName")]
        output_name: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
        data: Bytes,
        #[serde(flatten)]
        key: StageKey,
    },

    /// Terminal failure. A load-time fatal error carries the ad-hoc key.
    Error {
        message: String,
        #[serde(flatten)]
        key: StageKey,
    },
}

/// Output blob of a completed stage, tagged with its container mime type.
#[derive(Debug, Clone)]
pub struct OutputBlob {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl OutputBlob {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Container mime tag inferred from an output name suffix. Unknown suffixes
/// tag as generic binary.
pub fn mime_for_name(name: &str) -> &'static str {
    let suffix = name.rsplit('.').next().unwrap_or_default();
    match suffix.to_ascii_lowercase().as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        _ => "application/octet-stream",
    }
}

//! Core types for the run pipeline.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of one end-to-end run.
///
/// Generated once at run start and immutable afterwards: it is the sole
/// correlation root for every stage request belonging to the run. The
/// millisecond timestamp keeps ids sortable; the random suffix makes
/// collisions negligible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let suffix: String = std::iter::repeat_with(|| rng.sample(Alphanumeric) as char)
            .take(6)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Self(format!("{}-{}", Utc::now().timestamp_millis(), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One captured media segment, ordered by `index` within its run.
///
/// The payload is handed over to the stage submission as-is; `Bytes`
/// transfers the handle without copying and nothing mutates it afterwards.
#[derive(Debug, Clone)]
pub struct Segment {
    pub index: usize,
    pub data: Bytes,
}

impl Segment {
    pub fn new(index: usize, data: Bytes) -> Self {
        Self { index, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Deterministic engine artifact name for this segment.
    pub fn artifact_name(&self) -> String {
        format!("seg{}.webm", self.index)
    }
}

/// Immutable snapshot of one completed run: every size and timing the
/// pipeline observed. One of these is appended per successful run; failed
/// runs never produce one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: RunId,
    pub segment_count: usize,
    pub segment_duration_ms: u64,
    pub gap_ms: u64,
    pub segment_sizes_bytes: Vec<u64>,
    pub merged_bytes: u64,
    pub mp4_bytes: u64,
    pub t_record_ms: u64,
    pub t_merge_ms: u64,
    pub t_mp4_ms: u64,
    pub t_total_ms: u64,
}

impl fmt::Display for ResultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {}: {} segments, merged {} B, mp4 {} B (record {} ms, merge {} ms, mp4 {} ms, total {} ms)",
            self.run_id,
            self.segment_count,
            self.merged_bytes,
            self.mp4_bytes,
            self.t_record_ms,
            self.t_merge_ms,
            self.t_mp4_ms,
            self.t_total_ms
        )
    }
}

//! Append-only persistence of result records.

use crate::error::PipelineError;
use crate::pipeline::types::ResultRecord;
use std::io;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// Writes one JSON-serialized result record per line to an externally
/// chosen destination. With no destination configured, appends are a
/// no-op, not an error.
pub struct ResultWriter {
    path: Option<PathBuf>,
}

impl ResultWriter {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Append `record` as one newline-delimited JSON object. Failures are
    /// reported to the caller, which logs them; they never invalidate the
    /// run's in-memory result.
    pub async fn append(&self, record: &ResultRecord) -> Result<(), PipelineError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut line = serde_json::to_string(record)
            .map_err(|err| PipelineError::Persistence(io::Error::other(err)))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

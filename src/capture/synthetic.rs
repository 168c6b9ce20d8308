//! Synthetic capture source producing test-pattern segments.
//!
//! Stands in for a real camera: renders a `lavfi` test pattern of the
//! requested duration and returns the encoded container bytes. Useful for
//! exercising the full pipeline on machines without capture hardware.

use crate::assets::FRAME_RATE;
use crate::capture::SegmentSource;
use crate::error::PipelineError;
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

pub struct TestPatternSource {
    binary: PathBuf,
    size: String,
}

impl TestPatternSource {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            size: "640x360".to_string(),
        }
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = size.into();
        self
    }
}

#[async_trait]
impl SegmentSource for TestPatternSource {
    async fn record(&mut self, duration: Duration) -> Result<Bytes, PipelineError> {
        let spec = format!(
            "testsrc2=duration={:.3}:size={}:rate={}",
            duration.as_secs_f64(),
            self.size,
            FRAME_RATE
        );
        debug!("capture: {spec}");

        let output = Command::new(&self.binary)
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-f",
                "lavfi",
                "-i",
                &spec,
                "-c:v",
                "libvpx",
                "-b:v",
                "1M",
                "-f",
                "webm",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| {
                PipelineError::Capture(format!(
                    "failed to launch {}: {err}",
                    self.binary.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Capture(format!(
                "recorder exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(PipelineError::Capture("recorder produced no data".into()));
        }
        Ok(Bytes::from(output.stdout))
    }

    fn name(&self) -> &'static str {
        "test-pattern"
    }
}

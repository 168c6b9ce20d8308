//! Pipeline orchestrator
//!
//! Drives one end-to-end run: record → merge → transcode, assembling the
//! result record from every timing and size observed along the way. Owns
//! run identity, the per-run state machine and the busy flag that keeps
//! runs mutually exclusive.

use crate::assets::{MERGE_OUTPUT_NAME, transcode_args};
use crate::capture::SegmentSource;
use crate::engine::gateway::EngineGateway;
use crate::engine::protocol::{NamedBlob, Phase, StageKey};
use crate::error::PipelineError;
use crate::pipeline::state::RunState;
use crate::pipeline::types::{ResultRecord, RunId, Segment};
use crate::telemetry::{ResultWriter, RollingLog};
use chrono::Utc;
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Shape of one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub segment_count: usize,
    pub segment_duration: Duration,
    pub segment_gap: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            segment_count: crate::assets::SEGMENT_COUNT,
            segment_duration: Duration::from_millis(crate::assets::SEGMENT_DURATION_MS),
            segment_gap: Duration::from_millis(crate::assets::SEGMENT_GAP_MS),
        }
    }
}

/// Coordinates the run pipeline: Record → Merge → Transcode
///
/// One orchestrator drives at most one run at a time; a second run request
/// while busy is refused rather than queued.
pub struct PipelineOrchestrator {
    capture: tokio::sync::Mutex<Box<dyn SegmentSource>>,
    gateway: Arc<EngineGateway>,
    telemetry: Arc<RollingLog>,
    recorder: ResultWriter,
    options: RunOptions,
    busy: AtomicBool,
    state: Mutex<RunState>,
}

impl PipelineOrchestrator {
    pub fn new(
        capture: Box<dyn SegmentSource>,
        gateway: Arc<EngineGateway>,
        telemetry: Arc<RollingLog>,
        recorder: ResultWriter,
        options: RunOptions,
    ) -> Self {
        Self {
            capture: tokio::sync::Mutex::new(capture),
            gateway,
            telemetry,
            recorder,
            options,
            busy: AtomicBool::new(false),
            state: Mutex::new(RunState::Idle),
        }
    }

    /// Get the current run state
    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Execute one full run.
    ///
    /// Any stage failure aborts the run immediately: no further stages are
    /// attempted, no result record is produced, and nothing captured by the
    /// failed run is reused. The busy flag is released on every exit path.
    pub async fn execute(&self) -> Result<ResultRecord, PipelineError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PipelineError::RunActive);
        }

        let run_id = RunId::generate();
        let outcome = self.drive(&run_id).await;
        match &outcome {
            Ok(record) => {
                self.narrate(format!("[RUN {run_id}] done: {record}"));
            }
            Err(err) => {
                self.transition(RunState::Failed);
                error!("[RUN {run_id}] {err}");
                self.telemetry.push(format!("[RUN {run_id}] [ERROR] {err}"));
            }
        }
        self.transition(RunState::Idle);
        self.busy.store(false, Ordering::Release);
        outcome
    }

    async fn drive(&self, run_id: &RunId) -> Result<ResultRecord, PipelineError> {
        let started = Utc::now();
        let n = self.options.segment_count;
        let duration = self.options.segment_duration;
        let gap = self.options.segment_gap;

        self.narrate(format!(
            "[RUN {run_id}] starting: {n} segments x {}ms (gap {}ms)",
            duration.as_millis(),
            gap.as_millis()
        ));

        // Record: sequential by design, segments share one capture device.
        // The timing window spans the first segment to the last, gaps
        // included, with no trailing gap.
        let run_timer = Instant::now();
        self.transition(RunState::Recording {
            started_at: run_timer,
        });
        let mut segments = Vec::with_capacity(n);
        {
            let mut capture = self.capture.lock().await;
            for index in 0..n {
                let data = capture.record(duration).await?;
                self.narrate(format!(
                    "[RUN {run_id}] segment {index}: {} bytes",
                    data.len()
                ));
                segments.push(Segment::new(index, data));
                if index + 1 < n {
                    tokio::time::sleep(gap).await;
                }
            }
        }
        let t_record = run_timer.elapsed();
        let segment_sizes: Vec<u64> = segments.iter().map(|s| s.len() as u64).collect();

        // Merge: one stream-copy splice of all segments, in order.
        self.transition(RunState::Merging);
        let merge_timer = Instant::now();
        let blobs: Vec<NamedBlob> = segments
            .into_iter()
            .map(|segment| NamedBlob::new(segment.artifact_name(), segment.data))
            .collect();
        let merged = self
            .gateway
            .concat(
                blobs,
                MERGE_OUTPUT_NAME,
                StageKey::correlated(run_id.clone(), Phase::Merge),
            )
            .await?;
        let t_merge = merge_timer.elapsed();
        let merged_bytes = merged.len() as u64;
        self.narrate(format!(
            "[RUN {run_id}] merged: {} bytes ({}) in {} ms",
            merged.len(),
            merged.mime_type,
            t_merge.as_millis()
        ));

        // Transcode: normalize the merged output with the fixed profile.
        self.transition(RunState::Transcoding);
        let transcode_timer = Instant::now();
        let output_name = format!("{run_id}.mp4");
        let mp4 = self
            .gateway
            .transcode(
                NamedBlob::new(merged.name, merged.data),
                output_name,
                transcode_args(),
                StageKey::correlated(run_id.clone(), Phase::Transcode),
            )
            .await?;
        let t_mp4 = transcode_timer.elapsed();
        self.narrate(format!(
            "[RUN {run_id}] transcoded: {} bytes ({}) in {} ms",
            mp4.len(),
            mp4.mime_type,
            t_mp4.as_millis()
        ));

        self.transition(RunState::Done);
        let record = ResultRecord {
            timestamp: started,
            run_id: run_id.clone(),
            segment_count: n,
            segment_duration_ms: duration.as_millis() as u64,
            gap_ms: gap.as_millis() as u64,
            segment_sizes_bytes: segment_sizes,
            merged_bytes,
            mp4_bytes: mp4.len() as u64,
            t_record_ms: t_record.as_millis() as u64,
            t_merge_ms: t_merge.as_millis() as u64,
            t_mp4_ms: t_mp4.as_millis() as u64,
            t_total_ms: run_timer.elapsed().as_millis() as u64,
        };

        // Append failure is logged here and nowhere else; the run stays Done.
        if let Err(err) = self.recorder.append(&record).await {
            error!("[RUN {run_id}] {err}");
            self.telemetry.push(format!("[RUN {run_id}] [ERROR] {err}"));
        }

        Ok(record)
    }

    fn transition(&self, target: RunState) {
        let mut state = self.state.lock().unwrap();
        if !state.can_transition_to(&target) {
            warn!("invalid run state transition {} -> {}", *state, target);
        }
        *state = target;
    }

    fn narrate(&self, line: String) {
        info!("{line}");
        self.telemetry.push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback;
    use crate::engine::protocol::{EngineCommand, EngineEvent, mime_for_name};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Capture double: hands out pre-scripted segment payloads.
    struct ScriptedSource {
        segments: std::sync::Mutex<VecDeque<Result<Bytes, String>>>,
    }

    impl ScriptedSource {
        fn new(segments: Vec<Result<Bytes, String>>) -> Box<Self> {
            Box::new(Self {
                segments: std::sync::Mutex::new(segments.into()),
            })
        }

        fn of_sizes(sizes: &[usize]) -> Box<Self> {
            Self::new(
                sizes
                    .iter()
                    .map(|&size| Ok(Bytes::from(vec![0x42u8; size])))
                    .collect(),
            )
        }
    }

    #[async_trait]
    impl SegmentSource for ScriptedSource {
        async fn record(&mut self, _duration: Duration) -> Result<Bytes, PipelineError> {
            tokio::time::sleep(Duration::from_millis(2)).await;
            match self.segments.lock().unwrap().pop_front() {
                Some(Ok(data)) => Ok(data),
                Some(Err(message)) => Err(PipelineError::Capture(message)),
                None => Err(PipelineError::Capture("no segments scripted".into())),
            }
        }
    }

    /// Engine double: concat concatenates payloads, transcode emits a fixed
    /// smaller payload. Set `fail_merge` to answer the concat with an error.
    fn spawn_fake_engine(
        mut commands: mpsc::Receiver<EngineCommand>,
        events: mpsc::Sender<EngineEvent>,
        fail_merge: bool,
    ) {
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                tokio::time::sleep(Duration::from_millis(2)).await;
                match command {
                    EngineCommand::Load => {
                        let _ = events.send(EngineEvent::Loaded).await;
                    }
                    EngineCommand::Concat {
                        segments,
                        output_name,
                        key,
                    } => {
                        if fail_merge {
                            let _ = events
                                .send(EngineEvent::Error {
                                    message: "splice failed".into(),
                                    key,
                                })
                                .await;
                            continue;
                        }
                        let mut data = Vec::new();
                        for segment in &segments {
                            data.extend_from_slice(&segment.data);
                        }
                        let _ = events
                            .send(EngineEvent::Result {
                                output_name,
                                mime_type: "video/webm".into(),
                                data: Bytes::from(data),
                                key,
                            })
                            .await;
                    }
                    EngineCommand::Transcode {
                        output_name, key, ..
                    } => {
                        let mime = mime_for_name(&output_name).to_string();
                        let _ = events
                            .send(EngineEvent::Result {
                                output_name,
                                mime_type: mime,
                                data: Bytes::from_static(b"normalized-mp4-payload"),
                                key,
                            })
                            .await;
                    }
                }
            }
        });
    }

    fn orchestrator(
        source: Box<dyn SegmentSource>,
        recorder: ResultWriter,
        options: RunOptions,
        fail_merge: bool,
    ) -> (Arc<PipelineOrchestrator>, Arc<RollingLog>) {
        let (channels, command_rx, event_tx) = loopback();
        spawn_fake_engine(command_rx, event_tx, fail_merge);
        let telemetry = Arc::new(RollingLog::new(128));
        let gateway = EngineGateway::connect(
            channels,
            Arc::clone(&telemetry),
            CancellationToken::new(),
        );
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            source,
            gateway,
            Arc::clone(&telemetry),
            recorder,
            options,
        ));
        (orchestrator, telemetry)
    }

    fn quick_options(segment_count: usize) -> RunOptions {
        RunOptions {
            segment_count,
            segment_duration: Duration::from_millis(5),
            segment_gap: Duration::from_millis(3),
        }
    }

    #[tokio::test]
    async fn full_run_assembles_the_result_record() {
        let sizes = [1000usize, 1200, 900, 1100];
        let dir = tempfile::tempdir().unwrap();
        let results_path = dir.path().join("results.jsonl");
        let (orchestrator, telemetry) = orchestrator(
            ScriptedSource::of_sizes(&sizes),
            ResultWriter::new(Some(results_path.clone())),
            quick_options(4),
            false,
        );

        let record = orchestrator.execute().await.unwrap();

        assert_eq!(record.segment_count, 4);
        assert_eq!(record.segment_sizes_bytes, vec![1000, 1200, 900, 1100]);
        assert_eq!(record.merged_bytes, 4200);
        assert!(record.mp4_bytes > 0);
        assert!(record.t_record_ms > 0);
        assert!(record.t_merge_ms > 0);
        assert!(record.t_mp4_ms > 0);
        assert!(
            record.t_total_ms >= record.t_record_ms + record.t_merge_ms + record.t_mp4_ms
        );

        // the slot is free again and the record hit the external log
        assert!(!orchestrator.is_busy());
        assert_eq!(orchestrator.state(), RunState::Idle);
        let contents = tokio::fs::read_to_string(&results_path).await.unwrap();
        let persisted: ResultRecord =
            serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(persisted, record);

        assert!(
            telemetry
                .snapshot()
                .iter()
                .any(|line| line.contains("done:"))
        );
    }

    #[tokio::test]
    async fn capture_failure_aborts_without_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let results_path = dir.path().join("results.jsonl");
        let (orchestrator, telemetry) = orchestrator(
            ScriptedSource::new(vec![
                Ok(Bytes::from_static(b"first")),
                Err("device lost".into()),
            ]),
            ResultWriter::new(Some(results_path.clone())),
            quick_options(4),
            false,
        );

        let err = orchestrator.execute().await.unwrap_err();
        assert!(matches!(err, PipelineError::Capture(_)));

        assert!(!orchestrator.is_busy());
        assert_eq!(orchestrator.state(), RunState::Idle);
        assert!(tokio::fs::metadata(&results_path).await.is_err());
        assert!(
            telemetry
                .snapshot()
                .iter()
                .any(|line| line.contains("[ERROR]"))
        );
    }

    #[tokio::test]
    async fn stage_failure_aborts_and_the_next_run_starts_clean() {
        let (orchestrator, _telemetry) = orchestrator(
            ScriptedSource::of_sizes(&[10, 20, 10, 20]),
            ResultWriter::disabled(),
            quick_options(2),
            true,
        );

        let err = orchestrator.execute().await.unwrap_err();
        match err {
            PipelineError::Stage { key, message } => {
                assert!(key.to_string().ends_with(":merge"));
                assert_eq!(message, "splice failed");
            }
            other => panic!("expected stage failure, got {other:?}"),
        }
        assert!(!orchestrator.is_busy());

        // nothing from the failed run leaks into the next attempt
        assert_eq!(orchestrator.gateway.registry().pending_count(), 0);
        let err = orchestrator.execute().await.unwrap_err();
        assert!(matches!(err, PipelineError::Stage { .. }));
        assert!(!orchestrator.is_busy());
    }

    #[tokio::test]
    async fn persistence_failure_does_not_fail_the_run() {
        let dir = tempfile::tempdir().unwrap();
        // destination is a directory: every append fails
        let (orchestrator, telemetry) = orchestrator(
            ScriptedSource::of_sizes(&[50, 60]),
            ResultWriter::new(Some(dir.path().to_path_buf())),
            quick_options(2),
            false,
        );

        let record = orchestrator.execute().await.unwrap();
        assert_eq!(record.segment_count, 2);
        assert!(
            telemetry
                .snapshot()
                .iter()
                .any(|line| line.contains("persistence failed"))
        );
    }

    #[tokio::test]
    async fn concurrent_runs_are_refused() {
        let (orchestrator, _telemetry) = orchestrator(
            ScriptedSource::of_sizes(&[10, 10, 10, 10]),
            ResultWriter::disabled(),
            quick_options(4),
            false,
        );

        let first = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.execute().await })
        };
        // give the first run a moment to claim the slot
        tokio::time::sleep(Duration::from_millis(1)).await;

        let second = orchestrator.execute().await;
        assert!(matches!(second, Err(PipelineError::RunActive)));

        assert!(first.await.unwrap().is_ok());
        assert!(!orchestrator.is_busy());
    }
}

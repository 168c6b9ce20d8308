//! Media engine worker: a serialized ffmpeg bridge running on its own task.
//!
//! The worker owns a private artifact directory and processes one command at
//! a time: inputs are written as named artifacts, ffmpeg is invoked on them,
//! the named output is read back, and every artifact touched by the
//! operation is deleted again regardless of outcome. ffmpeg stderr lines are
//! forwarded as progress events; exactly one terminal result or error event
//! answers each stage command.

use crate::assets::{CONCAT_MANIFEST_NAME, DEFAULT_ENGINE_BINARY, MERGE_MIME_TYPE};
use crate::engine::protocol::{EngineCommand, EngineEvent, NamedBlob, StageKey, mime_for_name};
use anyhow::{Context, Result, bail};
use bytes::Bytes;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const COMMAND_QUEUE: usize = 8;
const EVENT_QUEUE: usize = 64;

/// Worker configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    /// Preferred ffmpeg binary (the richer runtime profile, e.g. a
    /// hardware-enabled build). Falls back to `ffmpeg` on PATH.
    pub preferred_binary: Option<PathBuf>,
}

/// Gateway-side handles of the engine duplex.
pub struct EngineChannels {
    pub commands: mpsc::Sender<EngineCommand>,
    pub events: mpsc::Receiver<EngineEvent>,
}

/// Which encoder set the loaded runtime supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecProfile {
    /// libx264 available: the full argument profile runs as-is.
    X264,
    /// Degraded build without libx264; the worker substitutes mpeg4.
    Mpeg4,
}

/// A located and probed ffmpeg runtime.
#[derive(Debug, Clone)]
pub struct EngineRuntime {
    binary: PathBuf,
    profile: CodecProfile,
}

impl EngineRuntime {
    /// Locate a usable binary: the preferred candidate first, then the
    /// default lookup on PATH. Fatal only when no candidate responds.
    async fn locate(settings: &EngineSettings, events: &mpsc::Sender<EngineEvent>) -> Result<Self> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(preferred) = &settings.preferred_binary {
            candidates.push(preferred.clone());
        }
        candidates.push(PathBuf::from(DEFAULT_ENGINE_BINARY));

        for (index, candidate) in candidates.iter().enumerate() {
            match Self::probe_version(candidate).await {
                Ok(()) => {
                    let profile = Self::probe_profile(candidate).await;
                    if index > 0 {
                        send_progress(
                            events,
                            format!(
                                "engine: preferred binary unavailable, using {}",
                                candidate.display()
                            ),
                        )
                        .await;
                    }
                    if profile == CodecProfile::Mpeg4 {
                        send_progress(
                            events,
                            "engine: libx264 missing, degraded to mpeg4".to_string(),
                        )
                        .await;
                    }
                    return Ok(Self {
                        binary: candidate.clone(),
                        profile,
                    });
                }
                Err(err) => {
                    debug!("engine candidate {} rejected: {err:#}", candidate.display());
                }
            }
        }
        bail!("no usable ffmpeg binary found")
    }

    async fn probe_version(binary: &Path) -> Result<()> {
        let output = Command::new(binary)
            .args(["-hide_banner", "-version"])
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to launch {}", binary.display()))?;
        if !output.status.success() {
            bail!("{} exited with {}", binary.display(), output.status);
        }
        Ok(())
    }

    async fn probe_profile(binary: &Path) -> CodecProfile {
        let output = Command::new(binary)
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                let listing = String::from_utf8_lossy(&out.stdout);
                if listing.contains("libx264") {
                    CodecProfile::X264
                } else {
                    CodecProfile::Mpeg4
                }
            }
            _ => CodecProfile::Mpeg4,
        }
    }

    pub fn profile(&self) -> CodecProfile {
        self.profile
    }

    /// Rewrite the caller's fixed argument profile for a degraded runtime:
    /// the x264 codec/quality pair becomes mpeg4 with a q:v target.
    fn effective_args(&self, args: &[String]) -> Vec<String> {
        if self.profile == CodecProfile::X264 {
            return args.to_vec();
        }
        let mut out = Vec::with_capacity(args.len());
        let mut iter = args.iter().peekable();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-c:v" if iter.peek().map(|v| v.as_str()) == Some("libx264") => {
                    iter.next();
                    out.push("-c:v".into());
                    out.push("mpeg4".into());
                }
                "-crf" if iter.peek().is_some() => {
                    iter.next();
                    out.push("-q:v".into());
                    out.push("5".into());
                }
                _ => out.push(arg.clone()),
            }
        }
        out
    }
}

/// Named binary objects held transiently in the worker's working directory.
struct ArtifactStore {
    root: TempDir,
}

impl ArtifactStore {
    fn new() -> Result<Self> {
        let root = tempfile::Builder::new()
            .prefix("clipforge-engine-")
            .tempdir()
            .context("failed to create engine working directory")?;
        Ok(Self { root })
    }

    /// Artifact names are single path components; anything that could
    /// escape the working directory is rejected.
    fn path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
        {
            bail!("invalid artifact name: {name:?}");
        }
        Ok(self.root.path().join(name))
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path(name)?;
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("failed to write artifact {name}"))
    }

    async fn read(&self, name: &str) -> Result<Bytes> {
        let path = self.path(name)?;
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read artifact {name}"))?;
        Ok(Bytes::from(data))
    }

    /// Best-effort removal; missing artifacts are not an error.
    async fn remove(&self, name: &str) {
        if let Ok(path) = self.path(name) {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove artifact {name}: {err}");
                }
            }
        }
    }
}

/// Render the concat demuxer manifest: one `file '<name>'` line per
/// artifact, in splice order.
fn render_manifest(names: &[String]) -> String {
    names
        .iter()
        .map(|name| format!("file '{name}'"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct EngineWorker {
    commands: mpsc::Receiver<EngineCommand>,
    events: mpsc::Sender<EngineEvent>,
    settings: EngineSettings,
    store: ArtifactStore,
    runtime: Option<EngineRuntime>,
    cancel: CancellationToken,
}

impl EngineWorker {
    /// Spawn the worker on its own task and return the gateway-side
    /// channel handles.
    pub fn spawn(settings: EngineSettings, cancel: CancellationToken) -> Result<EngineChannels> {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let mut worker = Self {
            commands: command_rx,
            events: event_tx,
            settings,
            store: ArtifactStore::new()?,
            runtime: None,
            cancel,
        };
        tokio::spawn(async move {
            worker.run().await;
        });
        Ok(EngineChannels {
            commands: command_tx,
            events: event_rx,
        })
    }

    async fn run(&mut self) {
        let cancel = self.cancel.clone();
        loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => None,
                command = self.commands.recv() => command,
            };
            let Some(command) = command else { break };
            self.handle(command).await;
        }
        debug!("engine worker stopped");
    }

    async fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Load => self.handle_load().await,
            EngineCommand::Concat {
                segments,
                output_name,
                key,
            } => {
                let outcome = self.run_concat(&segments, &output_name).await;
                self.report(outcome, output_name, MERGE_MIME_TYPE, key).await;
            }
            EngineCommand::Transcode {
                input_name,
                input_data,
                output_name,
                args,
                key,
            } => {
                let outcome = self
                    .run_transcode(&input_name, &input_data, &output_name, &args)
                    .await;
                let mime = mime_for_name(&output_name);
                self.report(outcome, output_name, mime, key).await;
            }
        }
    }

    async fn handle_load(&mut self) {
        if self.runtime.is_some() {
            self.emit(EngineEvent::Loaded).await;
            return;
        }
        match EngineRuntime::locate(&self.settings, &self.events).await {
            Ok(runtime) => {
                info!(
                    "engine runtime loaded: {} ({:?})",
                    runtime.binary.display(),
                    runtime.profile
                );
                self.runtime = Some(runtime);
                self.emit(EngineEvent::Loaded).await;
            }
            Err(err) => {
                self.emit(EngineEvent::Error {
                    message: format!("{err:#}"),
                    key: StageKey::ad_hoc(),
                })
                .await;
            }
        }
    }

    async fn report(
        &self,
        outcome: Result<Bytes>,
        output_name: String,
        mime_type: &str,
        key: StageKey,
    ) {
        let event = match outcome {
            Ok(data) => EngineEvent::Result {
                output_name,
                mime_type: mime_type.to_string(),
                data,
                key,
            },
            Err(err) => EngineEvent::Error {
                message: format!("{err:#}"),
                key,
            },
        };
        self.emit(event).await;
    }

    fn runtime(&self) -> Result<&EngineRuntime> {
        self.runtime
            .as_ref()
            .context("engine runtime not loaded")
    }

    /// Stream-copy splice. No re-encoding happens here: the concat demuxer
    /// with `-c copy` only touches the container.
    async fn run_concat(&self, segments: &[NamedBlob], output_name: &str) -> Result<Bytes> {
        let mut written: Vec<String> = Vec::with_capacity(segments.len() + 1);
        let outcome = self
            .concat_inner(segments, output_name, &mut written)
            .await;
        // cleanup is independent of outcome reporting
        for name in &written {
            self.store.remove(name).await;
        }
        self.store.remove(output_name).await;
        outcome
    }

    async fn concat_inner(
        &self,
        segments: &[NamedBlob],
        output_name: &str,
        written: &mut Vec<String>,
    ) -> Result<Bytes> {
        if segments.is_empty() {
            bail!("concat requires at least one segment");
        }
        let runtime = self.runtime()?;

        let mut names = Vec::with_capacity(segments.len());
        for segment in segments {
            self.store.write(&segment.name, &segment.data).await?;
            written.push(segment.name.clone());
            names.push(segment.name.clone());
        }
        self.store
            .write(CONCAT_MANIFEST_NAME, render_manifest(&names).as_bytes())
            .await?;
        written.push(CONCAT_MANIFEST_NAME.to_string());

        let manifest_path = self.store.path(CONCAT_MANIFEST_NAME)?;
        let output_path = self.store.path(output_name)?;
        let args = [
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            manifest_path.display().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            output_path.display().to_string(),
        ];
        self.invoke(&runtime.binary, &args).await?;
        self.store.read(output_name).await
    }

    async fn run_transcode(
        &self,
        input_name: &str,
        input_data: &[u8],
        output_name: &str,
        args: &[String],
    ) -> Result<Bytes> {
        let mut written: Vec<String> = Vec::with_capacity(1);
        let outcome = self
            .transcode_inner(input_name, input_data, output_name, args, &mut written)
            .await;
        for name in &written {
            self.store.remove(name).await;
        }
        self.store.remove(output_name).await;
        outcome
    }

    async fn transcode_inner(
        &self,
        input_name: &str,
        input_data: &[u8],
        output_name: &str,
        args: &[String],
        written: &mut Vec<String>,
    ) -> Result<Bytes> {
        let runtime = self.runtime()?;
        self.store.write(input_name, input_data).await?;
        written.push(input_name.to_string());

        let input_path = self.store.path(input_name)?;
        let output_path = self.store.path(output_name)?;
        let mut invocation = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-i".to_string(),
            input_path.display().to_string(),
        ];
        invocation.extend(runtime.effective_args(args));
        invocation.push(output_path.display().to_string());

        self.invoke(&runtime.binary, &invocation).await?;
        self.store.read(output_name).await
    }

    /// Run one ffmpeg invocation, forwarding stderr lines as progress
    /// events. The process runs to completion; there is no mid-operation
    /// cancellation.
    async fn invoke(&self, binary: &Path, args: &[String]) -> Result<()> {
        debug!("engine invoke: {} {}", binary.display(), args.join(" "));
        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to launch {}", binary.display()))?;

        let stderr = child.stderr.take().context("engine stderr unavailable")?;
        let mut lines = BufReader::new(stderr).lines();
        let mut last_line = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            last_line = line.clone();
            send_progress(&self.events, line).await;
        }

        let status = child.wait().await.context("engine process lost")?;
        if !status.success() {
            if last_line.is_empty() {
                bail!("engine exited with {status}");
            }
            bail!("engine exited with {status}: {last_line}");
        }
        Ok(())
    }

    async fn emit(&self, event: EngineEvent) {
        if self.events.send(event).await.is_err() {
            debug!("engine event dropped: gateway gone");
        }
    }
}

async fn send_progress(events: &mpsc::Sender<EngineEvent>, message: String) {
    let _ = events.send(EngineEvent::Progress { message }).await;
}

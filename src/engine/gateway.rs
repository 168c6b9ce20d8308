//! Engine gateway: the single owner of the connection to the media engine.
//!
//! Exposes stage operations as asynchronous request/response exchanges on
//! top of the command/event duplex, correlates terminal events back to
//! callers through the registry, and owns the engine lifecycle
//! (`Uninitialized → Loading → Ready`, with a sticky `Failed` that only an
//! explicit re-initialization clears).

use crate::engine::protocol::{EngineCommand, EngineEvent, NamedBlob, OutputBlob, StageKey};
use crate::engine::registry::{CorrelationRegistry, Settlement, StageOutcome};
use crate::engine::worker::{EngineChannels, EngineSettings, EngineWorker};
use crate::error::PipelineError;
use crate::telemetry::RollingLog;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Engine lifecycle as observed by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Loading,
    Ready,
    /// Initialization failed fatally; every caller re-observes the failure
    /// until `reinitialize` is invoked.
    Failed(String),
}

pub struct EngineGateway {
    commands: mpsc::Sender<EngineCommand>,
    registry: Arc<CorrelationRegistry>,
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
    cancel: CancellationToken,
}

impl EngineGateway {
    /// Spawn the ffmpeg engine worker and connect a gateway to it.
    pub fn spawn(
        settings: EngineSettings,
        telemetry: Arc<RollingLog>,
    ) -> anyhow::Result<Arc<Self>> {
        let cancel = CancellationToken::new();
        let channels = EngineWorker::spawn(settings, cancel.child_token())?;
        Ok(Self::connect(channels, telemetry, cancel))
    }

    /// Connect a gateway to an already-running engine duplex.
    pub fn connect(
        channels: EngineChannels,
        telemetry: Arc<RollingLog>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(EngineState::Uninitialized);
        let registry = Arc::new(CorrelationRegistry::new());

        tokio::spawn(Self::pump(
            channels.events,
            Arc::clone(&registry),
            state_tx.clone(),
            telemetry,
            cancel.child_token(),
        ));

        Arc::new(Self {
            commands: channels.commands,
            registry,
            state_tx,
            state_rx,
            cancel,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state_rx.borrow().clone()
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    /// Explicitly initialize the engine ahead of the first stage call.
    pub async fn preload(&self) -> Result<(), PipelineError> {
        self.ensure_ready().await
    }

    /// Clear a fatal load failure and attempt initialization again.
    /// Recovery is explicit; it never happens behind a stage call.
    pub async fn reinitialize(&self) -> Result<(), PipelineError> {
        self.state_tx.send_if_modified(|state| {
            if matches!(state, EngineState::Failed(_)) {
                *state = EngineState::Uninitialized;
                true
            } else {
                false
            }
        });
        self.ensure_ready().await
    }

    /// Container-level stream-copy splice of `segments`, in order.
    pub async fn concat(
        &self,
        segments: Vec<NamedBlob>,
        output_name: impl Into<String>,
        key: StageKey,
    ) -> Result<OutputBlob, PipelineError> {
        self.ensure_ready().await?;
        let pending = self.registry.register(key.clone())?;
        self.dispatch(
            EngineCommand::Concat {
                segments,
                output_name: output_name.into(),
                key: key.clone(),
            },
            &key,
        )
        .await;
        self.await_settlement(pending, key).await
    }

    /// Re-encode `input` with the caller-supplied fixed argument profile.
    pub async fn transcode(
        &self,
        input: NamedBlob,
        output_name: impl Into<String>,
        args: Vec<String>,
        key: StageKey,
    ) -> Result<OutputBlob, PipelineError> {
        self.ensure_ready().await?;
        let pending = self.registry.register(key.clone())?;
        self.dispatch(
            EngineCommand::Transcode {
                input_name: input.name,
                input_data: input.data,
                output_name: output_name.into(),
                args,
                key: key.clone(),
            },
            &key,
        )
        .await;
        self.await_settlement(pending, key).await
    }

    /// Shut the worker and the event pump down. Pending requests settle
    /// with failure when the event channel drains.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Suspend until the engine is `Ready`. The first caller to observe
    /// `Uninitialized` triggers loading; everyone else awaits the same
    /// completion.
    async fn ensure_ready(&self) -> Result<(), PipelineError> {
        let mut state_rx = self.state_rx.clone();
        loop {
            let current = state_rx.borrow_and_update().clone();
            match current {
                EngineState::Ready => return Ok(()),
                EngineState::Failed(message) => {
                    return Err(PipelineError::EngineUnavailable(message));
                }
                EngineState::Uninitialized => self.trigger_load().await?,
                EngineState::Loading => {
                    if state_rx.changed().await.is_err() {
                        return Err(PipelineError::EngineUnavailable(
                            "engine worker terminated".into(),
                        ));
                    }
                }
            }
        }
    }

    async fn trigger_load(&self) -> Result<(), PipelineError> {
        let should_dispatch = self.state_tx.send_if_modified(|state| {
            if *state == EngineState::Uninitialized {
                *state = EngineState::Loading;
                true
            } else {
                false
            }
        });
        if should_dispatch {
            info!("engine gateway: loading runtime");
            if self.commands.send(EngineCommand::Load).await.is_err() {
                let message = "engine worker unavailable".to_string();
                let _ = self.state_tx.send(EngineState::Failed(message.clone()));
                return Err(PipelineError::EngineUnavailable(message));
            }
        }
        Ok(())
    }

    /// Hand a command to the worker. A dispatch failure still reaches the
    /// original caller: it settles the already-registered continuation.
    async fn dispatch(&self, command: EngineCommand, key: &StageKey) {
        if self.commands.send(command).await.is_err() {
            self.registry
                .settle(key, Err("engine worker unavailable".into()));
        }
    }

    async fn await_settlement(
        &self,
        pending: tokio::sync::oneshot::Receiver<StageOutcome>,
        key: StageKey,
    ) -> Result<OutputBlob, PipelineError> {
        match pending.await {
            Ok(Ok(blob)) => Ok(blob),
            Ok(Err(message)) => Err(PipelineError::Stage { key, message }),
            Err(_) => Err(PipelineError::Stage {
                key,
                message: "engine connection closed before settlement".into(),
            }),
        }
    }

    /// Event pump: translates engine events into registry settlements,
    /// lifecycle changes and telemetry lines.
    async fn pump(
        mut events: mpsc::Receiver<EngineEvent>,
        registry: Arc<CorrelationRegistry>,
        state_tx: watch::Sender<EngineState>,
        telemetry: Arc<RollingLog>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => None,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                Self::on_disconnect(&registry, &state_tx);
                break;
            };
            match event {
                EngineEvent::Loaded => {
                    state_tx.send_if_modified(|state| {
                        if *state == EngineState::Ready {
                            false
                        } else {
                            *state = EngineState::Ready;
                            true
                        }
                    });
                    info!("engine ready");
                    telemetry.push("engine ready");
                }
                EngineEvent::Progress { message } => {
                    debug!("engine: {message}");
                    telemetry.push(message);
                }
                EngineEvent::Result {
                    output_name,
                    mime_type,
                    data,
                    key,
                } => {
                    let blob = OutputBlob {
                        name: output_name,
                        mime_type,
                        data,
                    };
                    if registry.settle(&key, Ok(blob)) == Settlement::Orphaned {
                        warn!("orphan engine result for {key} dropped");
                        telemetry.push(format!("orphan engine result for {key} dropped"));
                    }
                }
                EngineEvent::Error { message, key } => {
                    // a fatal load error is uncorrelated and arrives while loading
                    let loading = *state_tx.borrow() == EngineState::Loading;
                    if key.is_ad_hoc() && loading {
                        warn!("engine load failed: {message}");
                        telemetry.push(format!("engine load failed: {message}"));
                        let _ = state_tx.send(EngineState::Failed(message));
                        continue;
                    }
                    if registry.settle(&key, Err(message)) == Settlement::Orphaned {
                        warn!("orphan engine error for {key} dropped");
                        telemetry.push(format!("orphan engine error for {key} dropped"));
                    }
                }
            }
        }
        debug!("engine event pump stopped");
    }

    fn on_disconnect(registry: &CorrelationRegistry, state_tx: &watch::Sender<EngineState>) {
        state_tx.send_if_modified(|state| {
            if *state == EngineState::Ready || matches!(state, EngineState::Failed(_)) {
                false
            } else {
                *state = EngineState::Failed("engine worker terminated".into());
                true
            }
        });
        registry.fail_all("engine worker terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback;
    use crate::engine::protocol::Phase;
    use bytes::Bytes;

    fn gateway() -> (
        Arc<EngineGateway>,
        mpsc::Receiver<EngineCommand>,
        mpsc::Sender<EngineEvent>,
        Arc<RollingLog>,
    ) {
        let (channels, command_rx, event_tx) = loopback();
        let telemetry = Arc::new(RollingLog::new(64));
        let gateway = EngineGateway::connect(
            channels,
            Arc::clone(&telemetry),
            CancellationToken::new(),
        );
        (gateway, command_rx, event_tx, telemetry)
    }

    fn result_event(name: &str, payload: &'static [u8], key: StageKey) -> EngineEvent {
        EngineEvent::Result {
            output_name: name.into(),
            mime_type: "video/webm".into(),
            data: Bytes::from_static(payload),
            key,
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_load() {
        let (gateway, mut command_rx, event_tx, _telemetry) = gateway();

        let first = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.preload().await })
        };
        let second = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.preload().await })
        };

        assert!(matches!(
            command_rx.recv().await,
            Some(EngineCommand::Load)
        ));
        event_tx.send(EngineEvent::Loaded).await.unwrap();

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(gateway.state(), EngineState::Ready);

        // no second load crossed the channel
        assert!(command_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fatal_load_failure_is_sticky_until_reinitialize() {
        let (gateway, mut command_rx, event_tx, _telemetry) = gateway();

        let preload = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.preload().await })
        };
        assert!(matches!(
            command_rx.recv().await,
            Some(EngineCommand::Load)
        ));
        event_tx
            .send(EngineEvent::Error {
                message: "no usable ffmpeg binary found".into(),
                key: StageKey::ad_hoc(),
            })
            .await
            .unwrap();

        match preload.await.unwrap() {
            Err(PipelineError::EngineUnavailable(message)) => {
                assert!(message.contains("no usable ffmpeg"));
            }
            other => panic!("expected EngineUnavailable, got {other:?}"),
        }

        // later calls re-observe the failure without re-dispatching load
        let err = gateway
            .concat(
                vec![NamedBlob::new("seg0.webm", Bytes::new())],
                "merged.webm",
                StageKey::ad_hoc(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EngineUnavailable(_)));
        assert!(command_rx.try_recv().is_err());

        // explicit recovery dispatches a fresh load
        let reinit = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.reinitialize().await })
        };
        assert!(matches!(
            command_rx.recv().await,
            Some(EngineCommand::Load)
        ));
        event_tx.send(EngineEvent::Loaded).await.unwrap();
        reinit.await.unwrap().unwrap();
        assert_eq!(gateway.state(), EngineState::Ready);
    }

    #[tokio::test]
    async fn settlement_follows_the_key_not_arrival_order() {
        let (gateway, mut command_rx, event_tx, _telemetry) = gateway();

        let run_a = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway
                    .concat(
                        vec![NamedBlob::new("seg0.webm", Bytes::from_static(b"a"))],
                        "a.webm",
                        StageKey::correlated("run-a", Phase::Merge),
                    )
                    .await
            })
        };

        assert!(matches!(
            command_rx.recv().await,
            Some(EngineCommand::Load)
        ));
        event_tx.send(EngineEvent::Loaded).await.unwrap();
        let EngineCommand::Concat { key: key_a, .. } = command_rx.recv().await.unwrap() else {
            panic!("expected concat command");
        };

        let run_b = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway
                    .concat(
                        vec![NamedBlob::new("seg0.webm", Bytes::from_static(b"b"))],
                        "b.webm",
                        StageKey::correlated("run-b", Phase::Merge),
                    )
                    .await
            })
        };
        let EngineCommand::Concat { key: key_b, .. } = command_rx.recv().await.unwrap() else {
            panic!("expected concat command");
        };

        // answer b first, then a: each caller still gets its own output
        event_tx
            .send(result_event("b.webm", b"bbb", key_b))
            .await
            .unwrap();
        event_tx
            .send(result_event("a.webm", b"aaa", key_a))
            .await
            .unwrap();

        assert_eq!(run_a.await.unwrap().unwrap().name, "a.webm");
        assert_eq!(run_b.await.unwrap().unwrap().name, "b.webm");
    }

    #[tokio::test]
    async fn stage_error_reaches_the_caller() {
        let (gateway, mut command_rx, event_tx, _telemetry) = gateway();

        let call = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway
                    .transcode(
                        NamedBlob::new("merged.webm", Bytes::from_static(b"m")),
                        "out.mp4",
                        crate::assets::transcode_args(),
                        StageKey::correlated("run-x", Phase::Transcode),
                    )
                    .await
            })
        };

        assert!(matches!(
            command_rx.recv().await,
            Some(EngineCommand::Load)
        ));
        event_tx.send(EngineEvent::Loaded).await.unwrap();
        let EngineCommand::Transcode { key, .. } = command_rx.recv().await.unwrap() else {
            panic!("expected transcode command");
        };

        event_tx
            .send(EngineEvent::Error {
                message: "exit status 1: unsupported pixel format".into(),
                key,
            })
            .await
            .unwrap();

        match call.await.unwrap() {
            Err(PipelineError::Stage { key, message }) => {
                assert_eq!(key.to_string(), "run-x:transcode");
                assert!(message.contains("unsupported pixel format"));
            }
            other => panic!("expected stage failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn orphan_events_never_disturb_pending_requests() {
        let (gateway, mut command_rx, event_tx, telemetry) = gateway();

        let call = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway
                    .concat(
                        vec![NamedBlob::new("seg0.webm", Bytes::from_static(b"a"))],
                        "merged.webm",
                        StageKey::correlated("run-live", Phase::Merge),
                    )
                    .await
            })
        };

        assert!(matches!(
            command_rx.recv().await,
            Some(EngineCommand::Load)
        ));
        event_tx.send(EngineEvent::Loaded).await.unwrap();
        let EngineCommand::Concat { key, .. } = command_rx.recv().await.unwrap() else {
            panic!("expected concat command");
        };

        // an event for a key that was never registered
        event_tx
            .send(result_event(
                "ghost.webm",
                b"ghost",
                StageKey::correlated("X", Phase::Merge),
            ))
            .await
            .unwrap();
        // the real settlement still lands
        event_tx
            .send(result_event("merged.webm", b"mmm", key))
            .await
            .unwrap();

        let blob = call.await.unwrap().unwrap();
        assert_eq!(blob.data.as_ref(), b"mmm");
        assert_eq!(gateway.registry().orphaned_count(), 1);
        assert!(
            telemetry
                .snapshot()
                .iter()
                .any(|line| line.contains("orphan"))
        );
    }

    #[tokio::test]
    async fn duplicate_outstanding_key_is_rejected() {
        let (gateway, mut command_rx, event_tx, _telemetry) = gateway();

        let key = StageKey::correlated("run-dup", Phase::Merge);
        let first = {
            let gateway = Arc::clone(&gateway);
            let key = key.clone();
            tokio::spawn(async move {
                gateway
                    .concat(
                        vec![NamedBlob::new("seg0.webm", Bytes::from_static(b"a"))],
                        "merged.webm",
                        key,
                    )
                    .await
            })
        };

        assert!(matches!(
            command_rx.recv().await,
            Some(EngineCommand::Load)
        ));
        event_tx.send(EngineEvent::Loaded).await.unwrap();
        let EngineCommand::Concat { key: live_key, .. } = command_rx.recv().await.unwrap() else {
            panic!("expected concat command");
        };

        let err = gateway
            .concat(
                vec![NamedBlob::new("seg1.webm", Bytes::from_static(b"b"))],
                "merged.webm",
                key.clone(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateKey(k) if k == key));

        event_tx
            .send(result_event("merged.webm", b"ok", live_key))
            .await
            .unwrap();
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn progress_is_forwarded_and_never_settles() {
        let (gateway, mut command_rx, event_tx, telemetry) = gateway();

        let call = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway
                    .concat(
                        vec![NamedBlob::new("seg0.webm", Bytes::from_static(b"a"))],
                        "merged.webm",
                        StageKey::ad_hoc(),
                    )
                    .await
            })
        };

        assert!(matches!(
            command_rx.recv().await,
            Some(EngineCommand::Load)
        ));
        event_tx.send(EngineEvent::Loaded).await.unwrap();
        let EngineCommand::Concat { key, .. } = command_rx.recv().await.unwrap() else {
            panic!("expected concat command");
        };

        event_tx
            .send(EngineEvent::Progress {
                message: "frame=  42 fps=30".into(),
            })
            .await
            .unwrap();
        event_tx
            .send(result_event("merged.webm", b"done", key))
            .await
            .unwrap();

        assert!(call.await.unwrap().is_ok());
        assert!(
            telemetry
                .snapshot()
                .iter()
                .any(|line| line.contains("frame=  42"))
        );
    }

    #[tokio::test]
    async fn dispatch_failure_still_rejects_the_caller() {
        let (gateway, mut command_rx, event_tx, _telemetry) = gateway();

        let preload = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.preload().await })
        };
        assert!(matches!(
            command_rx.recv().await,
            Some(EngineCommand::Load)
        ));
        event_tx.send(EngineEvent::Loaded).await.unwrap();
        preload.await.unwrap().unwrap();

        // the worker's command side goes away
        drop(command_rx);

        let err = gateway
            .concat(
                vec![NamedBlob::new("seg0.webm", Bytes::from_static(b"a"))],
                "merged.webm",
                StageKey::correlated("run-gone", Phase::Merge),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Stage { .. }));
        assert_eq!(gateway.registry().pending_count(), 0);
    }
}

//! Media engine integration.
//!
//! The engine is an out-of-thread collaborator: a serialized worker that
//! accepts named operations with binary inputs and answers each with
//! exactly one terminal result or error, plus any amount of progress
//! chatter. The gateway owns the connection and the correlation protocol;
//! the registry guarantees exactly-one-settlement per stage request.

pub mod gateway;
pub mod protocol;
pub mod registry;
pub mod worker;

pub use gateway::{EngineGateway, EngineState};
pub use protocol::{EngineCommand, EngineEvent, NamedBlob, OutputBlob, Phase, StageKey};
pub use registry::{CorrelationRegistry, Settlement};
pub use worker::{EngineChannels, EngineSettings, EngineWorker};

/// In-process stand-in for the engine duplex: the gateway side of the
/// channels plus the test-side handles for scripting engine behavior.
#[cfg(test)]
pub(crate) fn loopback() -> (
    EngineChannels,
    tokio::sync::mpsc::Receiver<EngineCommand>,
    tokio::sync::mpsc::Sender<EngineEvent>,
) {
    let (command_tx, command_rx) = tokio::sync::mpsc::channel(8);
    let (event_tx, event_rx) = tokio::sync::mpsc::channel(64);
    (
        EngineChannels {
            commands: command_tx,
            events: event_rx,
        },
        command_rx,
        event_tx,
    )
}

//! Telemetry: the bounded rolling operator log and append-only result
//! record persistence.

pub mod recorder;
pub mod rolling_log;

pub use recorder::ResultWriter;
pub use rolling_log::RollingLog;

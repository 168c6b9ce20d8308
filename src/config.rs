use crate::assets;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration assembled from CLI arguments and defaults.
pub struct Config {
    pub segment_count: usize,
    pub segment_duration: Duration,
    pub segment_gap: Duration,
    /// Destination for appended result records; `None` disables persistence.
    pub results_path: Option<PathBuf>,
    /// Preferred engine binary; `None` uses the default PATH lookup.
    pub engine_binary: Option<PathBuf>,
    pub log_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            segment_count: assets::SEGMENT_COUNT,
            segment_duration: Duration::from_millis(assets::SEGMENT_DURATION_MS),
            segment_gap: Duration::from_millis(assets::SEGMENT_GAP_MS),
            results_path: None,
            engine_binary: None,
            log_capacity: assets::ROLLING_LOG_CAPACITY,
        }
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

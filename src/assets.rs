pub const FRAME_RATE: u32 = 30;

// capture defaults
pub const SEGMENT_COUNT: usize = 4;
pub const SEGMENT_DURATION_MS: u64 = 5000;
pub const SEGMENT_GAP_MS: u64 = 250;

// telemetry
pub const ROLLING_LOG_CAPACITY: usize = 200;

// engine
pub const DEFAULT_ENGINE_BINARY: &str = "ffmpeg";
pub const MERGE_OUTPUT_NAME: &str = "merged.webm";
pub const MERGE_MIME_TYPE: &str = "video/webm";
pub const CONCAT_MANIFEST_NAME: &str = "concat.txt";

/// Normalization profile applied by the transcode stage: regenerated
/// timestamps, constant 30 fps, x264 at a fixed quality target, faststart
/// container, audio dropped. Reproduced verbatim for output compatibility.
pub const TRANSCODE_ARGS: [&str; 17] = [
    "-fflags",
    "+genpts",
    "-vsync",
    "cfr",
    "-r",
    "30",
    "-vf",
    "fps=30",
    "-c:v",
    "libx264",
    "-crf",
    "23",
    "-pix_fmt",
    "yuv420p",
    "-movflags",
    "+faststart",
    "-an",
];

pub fn transcode_args() -> Vec<String> {
    TRANSCODE_ARGS.iter().map(|s| s.to_string()).collect()
}

use crate::capture::TestPatternSource;
use crate::config::{Config, app_name, version};
use crate::engine::EngineGateway;
use crate::engine::worker::EngineSettings;
use crate::pipeline::{PipelineOrchestrator, RunOptions};
use crate::telemetry::{ResultWriter, RollingLog};
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::{panic, process};

pub mod assets;
pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("segments")
                .short('n')
                .long("segments")
                .value_name("COUNT")
                .help("Number of segments to record.")
                .value_parser(clap::value_parser!(usize))
                .default_value("4"),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_name("MILLIS")
                .help("Duration of each segment in milliseconds.")
                .value_parser(clap::value_parser!(u64))
                .default_value("5000"),
        )
        .arg(
            Arg::new("gap")
                .short('g')
                .long("gap")
                .value_name("MILLIS")
                .help("Delay between segments in milliseconds.")
                .value_parser(clap::value_parser!(u64))
                .default_value("250"),
        )
        .arg(
            Arg::new("results")
                .short('r')
                .long("results")
                .value_name("FILE")
                .help("Append one JSON result record per run to this file."),
        )
        .arg(
            Arg::new("engine")
                .short('e')
                .long("engine")
                .value_name("BINARY")
                .help("Preferred ffmpeg binary (falls back to ffmpeg on PATH)."),
        )
        .arg(
            Arg::new("preload")
                .long("preload")
                .help("Initialize the engine before recording starts.")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config = Config {
        segment_count: *matches.get_one::<usize>("segments").unwrap(),
        segment_duration: Duration::from_millis(*matches.get_one::<u64>("duration").unwrap()),
        segment_gap: Duration::from_millis(*matches.get_one::<u64>("gap").unwrap()),
        results_path: matches.get_one::<String>("results").map(PathBuf::from),
        engine_binary: matches.get_one::<String>("engine").map(PathBuf::from),
        ..Config::default()
    };

    // kill the main thread as soon as a secondary task panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        // invoke the default handler and exit the process
        orig_hook(panic_info);
        process::exit(105);
    }));

    let telemetry = Arc::new(RollingLog::new(config.log_capacity));
    let gateway = EngineGateway::spawn(
        EngineSettings {
            preferred_binary: config.engine_binary.clone(),
        },
        Arc::clone(&telemetry),
    )?;

    let capture_binary = config
        .engine_binary
        .clone()
        .unwrap_or_else(|| PathBuf::from(assets::DEFAULT_ENGINE_BINARY));
    let orchestrator = PipelineOrchestrator::new(
        Box::new(TestPatternSource::new(capture_binary)),
        Arc::clone(&gateway),
        Arc::clone(&telemetry),
        ResultWriter::new(config.results_path.clone()),
        RunOptions {
            segment_count: config.segment_count,
            segment_duration: config.segment_duration,
            segment_gap: config.segment_gap,
        },
    );

    if matches.get_flag("preload") {
        gateway.preload().await?;
    }

    let outcome = orchestrator.execute().await;
    gateway.close();

    match outcome {
        Ok(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

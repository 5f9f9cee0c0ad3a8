//! CLI entry point for framepipe
//!
//! `serve` runs the engine with its metrics endpoint until Ctrl-C. The task
//! commands submit a single task, stream its progress and exit with its
//! outcome.

use clap::{Args, Parser, Subcommand, ValueEnum};
use framepipe::config::{QualityPreset, VideoCodec};
use framepipe::{
    Config, ConcatParams, Engine, EngineError, EngineEvent, ExtractFramesParams, FilterParams,
    HardwareDetector, Operation, ResizeParams, TaskRequest, ThumbnailParams, TranscodeParams,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// framepipe - prioritized, supervised ffmpeg rendering
#[derive(Parser, Debug)]
#[command(name = "framepipe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (missing file = defaults)
    #[arg(short, long, default_value = "framepipe.toml")]
    config: PathBuf,

    /// Debug logging unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,

    /// Skip startup checks (ffmpeg resolution and version) and hardware detection
    #[arg(long)]
    skip_checks: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print detected hardware capabilities as JSON
    Detect,
    /// Run the engine and metrics server until Ctrl-C
    Serve,
    /// Re-encode a video
    Transcode {
        #[command(flatten)]
        task: TaskArgs,
        #[command(flatten)]
        encoding: EncodingArgs,
        /// Copy audio instead of re-encoding it
        #[arg(long)]
        copy_audio: bool,
    },
    /// Scale a video to WIDTHxHEIGHT
    Resize {
        #[command(flatten)]
        task: TaskArgs,
        #[command(flatten)]
        encoding: EncodingArgs,
        #[arg(long)]
        width: u32,
        #[arg(long)]
        height: u32,
    },
    /// Join videos in order without re-encoding
    Concat {
        /// Output file
        output: PathBuf,
        /// Sources, in order
        #[arg(required = true)]
        sources: Vec<PathBuf>,
        #[arg(short, long, default_value_t = 0)]
        priority: i32,
    },
    /// Write frames as JPEGs into an output directory
    ExtractFrames {
        #[command(flatten)]
        task: TaskArgs,
        /// Frames per second to extract
        #[arg(long, default_value_t = 1.0)]
        fps: f64,
    },
    /// Apply an ffmpeg video filter chain
    Filter {
        #[command(flatten)]
        task: TaskArgs,
        #[command(flatten)]
        encoding: EncodingArgs,
        /// Filter, repeatable; applied in order
        #[arg(short = 'f', long = "filter", required = true)]
        filters: Vec<String>,
    },
    /// Grab one frame as an image
    Thumbnail {
        #[command(flatten)]
        task: TaskArgs,
        /// Position in seconds
        #[arg(long, default_value_t = 0.0)]
        at: f64,
        #[arg(long, default_value_t = 320)]
        width: u32,
        #[arg(long, default_value_t = 180)]
        height: u32,
    },
}

#[derive(Args, Debug)]
struct TaskArgs {
    input: PathBuf,
    output: PathBuf,
    /// Higher runs sooner
    #[arg(short, long, default_value_t = 0)]
    priority: i32,
    /// Override the per-operation timeout
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Args, Debug)]
struct EncodingArgs {
    #[arg(long, value_enum)]
    codec: Option<CodecArg>,
    #[arg(long, value_enum)]
    quality: Option<QualityArg>,
    /// Explicit CRF, overrides --quality
    #[arg(long)]
    crf: Option<u8>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CodecArg {
    H264,
    Hevc,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum QualityArg {
    High,
    Medium,
    Low,
}

impl EncodingArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(codec) = self.codec {
            config.encoding.codec = match codec {
                CodecArg::H264 => VideoCodec::H264,
                CodecArg::Hevc => VideoCodec::Hevc,
            };
        }
        if let Some(quality) = self.quality {
            config.encoding.quality = match quality {
                QualityArg::High => QualityPreset::High,
                QualityArg::Medium => QualityPreset::Medium,
                QualityArg::Low => QualityPreset::Low,
            };
        }
        if self.crf.is_some() {
            config.encoding.crf = self.crf;
        }
    }
}

impl TaskArgs {
    fn request(&self, operation: Operation) -> TaskRequest {
        let mut request = TaskRequest::new(operation, &self.input, &self.output)
            .with_priority(self.priority);
        if let Some(secs) = self.timeout_secs {
            request = request.with_timeout(Duration::from_secs(secs));
        }
        request
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn build_engine(config: Config, skip_checks: bool) -> Result<Engine, EngineError> {
    if skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        Engine::new_without_checks(config)
    } else {
        Engine::new(config).await
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match Config::load_or_default(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let request = match cli.command {
        Command::Detect => return detect(&config).await,
        Command::Serve => return serve(config, cli.skip_checks).await,
        Command::Transcode {
            task,
            encoding,
            copy_audio,
        } => {
            encoding.apply(&mut config);
            task.request(Operation::Transcode(TranscodeParams { copy_audio }))
        }
        Command::Resize {
            task,
            encoding,
            width,
            height,
        } => {
            encoding.apply(&mut config);
            task.request(Operation::Resize(ResizeParams { width, height }))
        }
        Command::Concat {
            output,
            sources,
            priority,
        } => {
            let input = sources.first().cloned().unwrap_or_default();
            TaskRequest::new(Operation::Concat(ConcatParams { sources }), input, output)
                .with_priority(priority)
        }
        Command::ExtractFrames { task, fps } => {
            task.request(Operation::ExtractFrames(ExtractFramesParams { fps }))
        }
        Command::Filter {
            task,
            encoding,
            filters,
        } => {
            encoding.apply(&mut config);
            task.request(Operation::ApplyFilter(FilterParams { filters }))
        }
        Command::Thumbnail {
            task,
            at,
            width,
            height,
        } => task.request(Operation::Thumbnail(ThumbnailParams {
            timestamp_secs: at,
            width,
            height,
        })),
    };

    run_one(config, cli.skip_checks, request).await
}

async fn detect(config: &Config) -> ExitCode {
    let caps = HardwareDetector::new(&config.tools).detect().await;
    match serde_json::to_string_pretty(&caps) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to encode capabilities: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: Config, skip_checks: bool) -> ExitCode {
    let metrics_enabled = config.metrics_server.enabled;
    let engine = match build_engine(config, skip_checks).await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Failed to initialize engine: {}", e);
            return ExitCode::FAILURE;
        }
    };

    engine.start();
    if metrics_enabled {
        engine.start_metrics_server();
    }
    info!(
        pool_size = engine.worker_plan().pool_size,
        vendor = engine.capabilities().vendor.as_str(),
        "Serving; Ctrl-C to stop"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutting down");
    engine.cleanup().await;
    ExitCode::SUCCESS
}

async fn run_one(config: Config, skip_checks: bool, request: TaskRequest) -> ExitCode {
    let engine = match build_engine(config, skip_checks).await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Failed to initialize engine: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut events = engine.subscribe();
    engine.start();
    let id = match engine.submit(request) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("Submission rejected: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let code = loop {
        let event = match events.recv().await {
            Ok(event) if event.task_id() == id => event,
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break ExitCode::FAILURE,
        };
        match event {
            EngineEvent::TaskStarted { .. } => eprintln!("started {}", id),
            EngineEvent::TaskProgress { progress, .. } => {
                eprintln!("progress {:>5.1}%", progress * 100.0)
            }
            EngineEvent::TaskCompleted { outcome, .. } => {
                match serde_json::to_string(&outcome) {
                    Ok(json) => println!("{}", json),
                    Err(e) => warn!(error = %e, "Could not encode outcome"),
                }
                break ExitCode::SUCCESS;
            }
            EngineEvent::TaskFailed { error, .. } => {
                eprintln!("failed ({}): {}", error.kind.as_str(), error.message);
                break ExitCode::FAILURE;
            }
            EngineEvent::TaskCancelled { .. } => {
                eprintln!("cancelled");
                break ExitCode::FAILURE;
            }
        }
    };

    engine.cleanup().await;
    code
}

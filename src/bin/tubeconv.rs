use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};
use tubeconv_engine::config::{load_engine_config, EngineConfig};
use tubeconv_engine::paths::AppPaths;
use tubeconv_engine::{JobEvent, JobRequest, JobSupervisor, OutputFormat, ProgressEvent, ProgressStatus};

/// Download a URL or search query and convert it to audio.
#[derive(Debug, Parser)]
#[command(name = "tubeconv", version, about = "Download and convert audio with the tubeconv worker")]
struct Cli {
    /// URL or free-text search query.
    source: String,
    output_dir: PathBuf,
    #[arg(long, default_value_t = OutputFormat::Mp3)]
    format: OutputFormat,
    #[arg(long)]
    quality: Option<String>,
    #[arg(long)]
    process_playlist: bool,
    #[arg(long)]
    skip_existing: bool,
    /// Seconds before the job is stopped; 0 disables the limit.
    #[arg(long, default_value_t = 0)]
    timeout: u64,
    /// Folder holding `config/engine.json` and the bundled worker.
    #[arg(long, env = "TUBECONV_BASE_DIR")]
    base_dir: Option<PathBuf>,
    #[arg(long)]
    worker: Option<PathBuf>,
    #[arg(long)]
    interpreter: Option<PathBuf>,
    /// Print every event as one JSON line.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter_layer).with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("tubeconv: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, String> {
    let config = resolve_config(&cli)?;

    let mut request = JobRequest::new(cli.source, cli.output_dir);
    request.format = cli.format;
    request.quality_hint = cli.quality;
    request.process_playlist = cli.process_playlist;
    request.skip_existing = cli.skip_existing;
    request.timeout_seconds = cli.timeout;

    let supervisor = JobSupervisor::new(config);
    let handle = supervisor.start(request);
    tracing::info!(job_id = %handle.id(), "job started");

    let mut cancelled = false;
    for event in handle.iter() {
        if cli.json {
            let line = serde_json::to_string(&event).map_err(|e| e.to_string())?;
            println!("{line}");
        }
        match event {
            JobEvent::Progress(progress) => {
                cancelled |= progress.status == ProgressStatus::Cancelled;
                if !cli.json {
                    println!("{}", describe_progress(&progress));
                }
            }
            JobEvent::Finished(result) => {
                if !cli.json {
                    match (&result.output_path, &result.error_message) {
                        (Some(path), _) if result.success => println!("done: {path}"),
                        (_, Some(message)) => println!("failed: {message}"),
                        _ => println!("failed"),
                    }
                }
                return Ok(if result.success {
                    ExitCode::SUCCESS
                } else if cancelled {
                    ExitCode::from(130)
                } else {
                    ExitCode::FAILURE
                });
            }
        }
    }

    Err("job ended without a result".to_string())
}

fn resolve_config(cli: &Cli) -> Result<EngineConfig, String> {
    let base = match &cli.base_dir {
        Some(dir) => {
            let paths = AppPaths::new(AppPaths::normalize_base_dir(dir));
            load_engine_config(&paths).map_err(|e| e.to_string())?
        }
        None => EngineConfig::default(),
    };
    let mut config = base.with_env_overrides();
    if let Some(worker) = &cli.worker {
        config.worker_program = worker.clone();
    }
    if let Some(interpreter) = &cli.interpreter {
        config.interpreter = Some(interpreter.clone());
    }
    Ok(config)
}

fn describe_progress(p: &ProgressEvent) -> String {
    let mut line = format!("[{}] {:5.1}%", p.status, p.percentage);
    if p.is_playlist && p.total_item_count > 0 {
        line.push_str(&format!(" item {}/{}", p.current_item_index, p.total_item_count));
    }
    if !p.current_file_name.is_empty() {
        line.push_str(&format!(" {}", p.current_file_name));
    }
    if p.status == ProgressStatus::Downloading {
        line.push_str(&format!(" {} ETA {}", p.speed_text, p.eta_seconds));
    }
    if !p.message.is_empty() {
        line.push_str(&format!(" ({})", p.message));
    }
    line
}

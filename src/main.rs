mod config;
mod dispatcher;
mod error;
mod extractor;
mod fetcher;
mod retry;
mod session;
mod sink;
mod target;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use config::{Config, PipelineArgs};
use dispatcher::Dispatcher;
use extractor::FieldExtractor;
use fetcher::PageFetcher;
use retry::{RetryController, RetryPolicy};
use session::{BackendProvider, SessionProvider};
use sink::OutputSink;
use target::Target;

const EXIT_PARTIAL: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(
    name = "sidebar_scraper",
    about = "Extract detail sidebars from an authenticated portal"
)]
struct Cli {
    /// Also append log output to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract every target listed in a descriptor directory
    Run {
        /// Directory of JSON descriptor files
        #[arg(short, long)]
        descriptors: PathBuf,
        /// Write the run summary as JSON to this path
        #[arg(long)]
        report: Option<PathBuf>,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Extract a single page and print its fields
    Extract {
        #[arg(short, long)]
        url: String,
        /// Also save the record to this path
        #[arg(long)]
        save: Option<PathBuf>,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Show which targets a run would process, without fetching anything
    Plan {
        #[arg(short, long)]
        descriptors: PathBuf,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;

    let t0 = Instant::now();
    let result = match cli.command {
        Commands::Run {
            descriptors,
            report,
            pipeline,
        } => run(&descriptors, report.as_deref(), Config::from(pipeline)).await,
        Commands::Extract {
            url,
            save,
            pipeline,
        } => extract(url, save, Config::from(pipeline)).await,
        Commands::Plan {
            descriptors,
            pipeline,
        } => plan(&descriptors, Config::from(pipeline)),
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

fn build_controller(config: &Config) -> Result<RetryController> {
    extractor::parse_selector(&config.selectors.marker)?;
    let extractor = FieldExtractor::new(&config.selectors)?;
    Ok(RetryController::new(
        PageFetcher::new(config),
        extractor,
        RetryPolicy::from(config),
    ))
}

async fn run(descriptors: &Path, report: Option<&Path>, config: Config) -> Result<ExitCode> {
    let controller = build_controller(&config)?;
    let targets = target::load_targets(
        descriptors,
        &config.output_dir,
        &config.address_pointer,
        config.format,
    )?;
    if targets.is_empty() {
        println!("No targets found in {}.", descriptors.display());
        return Ok(ExitCode::SUCCESS);
    }
    std::fs::create_dir_all(&config.output_dir).with_context(|| {
        format!("Failed to create output directory {}", config.output_dir.display())
    })?;

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    let dispatcher = Dispatcher::new(
        BackendProvider::new(&config),
        controller,
        OutputSink::new(config.format),
        config.workers,
        config.session_timeout,
    )
    .with_progress(pb);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping workers");
            trigger.cancel();
        }
    });

    let summary = dispatcher.run(targets, cancel.clone()).await;
    summary.log();
    for failure in &summary.failures {
        println!("  FAILED {} ({})", failure.address, failure.reason);
    }

    if let Some(path) = report {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        info!("Report written to {}", path.display());
    }

    if cancel.is_cancelled() {
        Ok(ExitCode::from(EXIT_INTERRUPTED))
    } else if summary.failed > 0 {
        Ok(ExitCode::from(EXIT_PARTIAL))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn extract(url: String, save: Option<PathBuf>, config: Config) -> Result<ExitCode> {
    let controller = build_controller(&config)?;
    let target = Target::new(url, save.clone().unwrap_or_default());

    let mut session = BackendProvider::new(&config).create_session().await?;
    let extraction = controller.extract_with_retry(session.as_mut(), &target).await;
    session.close().await;

    if !extraction.success {
        println!(
            "No fields extracted after {} attempts: {}",
            extraction.attempts.len(),
            extraction.failure_reason().unwrap_or_default()
        );
        return Ok(ExitCode::from(EXIT_PARTIAL));
    }

    for group in &extraction.record.groups {
        println!("{}", group.values.join(" | "));
    }

    if save.is_some() {
        OutputSink::new(config.format).write(&target, &extraction.record)?;
        println!("\nSaved to {}", target.destination.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn plan(descriptors: &Path, config: Config) -> Result<ExitCode> {
    let targets = target::load_targets(
        descriptors,
        &config.output_dir,
        &config.address_pointer,
        config.format,
    )?;
    let (pending, skipped) = OutputSink::new(config.format).partition(targets);

    println!("{:<8} | {:<60} | {}", "State", "Address", "Output");
    println!("{}", "-".repeat(100));
    for (state, list) in [("pending", &pending), ("done", &skipped)] {
        for t in list {
            println!(
                "{:<8} | {:<60} | {}",
                state,
                truncate(&t.address, 60),
                t.destination.display()
            );
        }
    }
    println!(
        "\n{} pending, {} already extracted, {} workers",
        pending.len(),
        skipped.len(),
        config.workers
    );
    Ok(ExitCode::SUCCESS)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run() {
        let cli = Cli::try_parse_from([
            "sidebar_scraper",
            "run",
            "-d",
            "metadata",
            "-w",
            "8",
            "--format",
            "csv",
            "--report",
            "report.json",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                descriptors,
                report,
                pipeline,
            } => {
                assert_eq!(descriptors, PathBuf::from("metadata"));
                assert_eq!(report, Some(PathBuf::from("report.json")));
                assert_eq!(pipeline.workers, 8);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn truncate_keeps_width() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("https://portal/items/123456", 10), "https:/...");
        assert_eq!(truncate("https://portal/items/123456", 10).chars().count(), 10);
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(std::time::Duration::from_millis(2500)), "2.5s");
        assert_eq!(format_duration(std::time::Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(std::time::Duration::from_secs(3725)), "1h 2m 5s");
    }
}

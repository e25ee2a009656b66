//! screendb - Screening Database Builder
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use screendb::config::{BuildArgs, BuildConfig, CliArgs, Command};
use screendb::ingest::DatabaseBuilder;
use screendb::progress::{print_header, print_info, print_summary, ProgressReporter};
use screendb::source::JsonLinesSource;
use screendb::store::SqliteAccessor;
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();

    setup_logging(args.verbose)?;

    match &args.command {
        Command::Build(build) => run_build(build, args.quiet, args.verbose),
        Command::Info { db } => run_info(db),
    }
}

fn run_build(args: &BuildArgs, quiet: bool, verbose: bool) -> Result<()> {
    let config =
        BuildConfig::from_args(args, quiet, verbose).context("Invalid configuration")?;

    if config.num_threads == 0 {
        info!(
            cpus = num_cpus::get(),
            "Running single-threaded; use --threads to ingest in parallel"
        );
    }

    if config.show_progress {
        print_header(
            &args.input.display().to_string(),
            &config.output_path.display().to_string(),
            config.mode.as_str(),
            config.num_threads,
        );
    }

    let source = JsonLinesSource::open(&args.input).context("Failed to open input")?;
    let builder = DatabaseBuilder::new(config.clone());

    // Setup signal handler for graceful shutdown
    let shutdown_flag = builder.shutdown_flag();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down...");
        shutdown_flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let progress = config.show_progress.then(ProgressReporter::new);
    if let Some(ref p) = progress {
        p.set_status("Ingesting records...");
    }

    let result = builder.run(source, progress.as_ref());

    if let Some(ref p) = progress {
        match &result {
            Ok(summary) if summary.completed => p.finish("Build completed"),
            Ok(_) => p.finish("Build interrupted"),
            Err(_) => p.finish_and_clear(),
        }
    }

    let summary = result.context("Build failed")?;

    if config.show_progress {
        print_summary(
            &summary,
            &config.output_path.display().to_string(),
            file_size(&config.output_path),
        );
    }

    if !summary.completed {
        info!("Build was interrupted before completion");
    }

    if summary.failed > 0 {
        info!(failed = summary.failed, "Build completed with failed records");
    }

    Ok(())
}

fn run_info(db: &Path) -> Result<()> {
    let accessor = SqliteAccessor::open(db)
        .with_context(|| format!("Failed to open database '{}'", db.display()))?;
    let summary = accessor.summary().context("Failed to read database summary")?;
    let metadata = accessor.all_metadata().context("Failed to read build info")?;

    print_info(&db.display().to_string(), file_size(db), &summary, &metadata);
    Ok(())
}

fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("screendb=debug,warn")
    } else {
        EnvFilter::new("screendb=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

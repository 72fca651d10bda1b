mod commands;
mod logging;
mod progress;
mod report;

use std::path::Path;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{parse_labeled, Cli, Commands, OutputFormat};
use dotenv::dotenv;
use imgscan_core::analysis::{diff_manifests, find_duplicates, find_leakage, LabeledRecords};
use imgscan_core::pipeline::SubprocessWorker;
use imgscan_core::scanner::DiscoveredItem;
use imgscan_core::storage::{ManifestStore, Record};
use imgscan_core::{AppConfig, Analyzer, ImageAnalyzer, ScanControl, ScanEngine, ScanStatus};
use progress::CliReporter;
use tracing::{error, info};

const EXIT_ERROR: i32 = 1;
/// Scan stopped early by Ctrl-C; re-running resumes it.
const EXIT_INTERRUPTED: i32 = 130;

fn main() {
    dotenv().ok();
    let args = Cli::parse();

    if let Some(Commands::AnalyzeItem {
        path,
        size,
        mtime_ns,
    }) = &args.command
    {
        logging::init_child_logger();
        // Only the coordinator stops a child, by killing it once its grace period runs out.
        if let Err(err) = ctrlc::set_handler(|| {}) {
            eprintln!("analyze-item could not ignore interrupts: {}", err);
        }
        let item = DiscoveredItem {
            path: path.clone(),
            size: *size,
            mtime_ns: *mtime_ns,
        };
        if let Err(err) = run_analyze_item(&item) {
            eprintln!("analyze-item failed: {:#}", err);
            process::exit(EXIT_ERROR);
        }
        return;
    }

    let guard = logging::init_logger();

    let config = match imgscan_core::config::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            drop(guard);
            process::exit(EXIT_ERROR);
        }
    };

    let code = match run(args, &config) {
        Ok(code) => code,
        Err(err) => {
            error!("Error: {:#}", err);
            EXIT_ERROR
        }
    };

    drop(guard);
    process::exit(code);
}

fn run(args: Cli, config: &AppConfig) -> Result<i32> {
    match args.command {
        Some(Commands::Scan {
            root,
            output,
            workers,
            batch_size,
            force,
            isolate,
        }) => {
            let mut scan = config.scan.clone();
            if let Some(workers) = workers {
                scan.workers = workers;
            }
            if let Some(batch_size) = batch_size {
                scan.batch_size = batch_size;
            }
            scan.force |= force;
            let status = run_scan(&root, &output, scan, isolate)?;
            Ok(match status {
                ScanStatus::Completed => 0,
                ScanStatus::Interrupted => EXIT_INTERRUPTED,
            })
        }
        Some(Commands::Duplicates {
            manifest,
            threshold,
            format,
        }) => {
            let mut clustering = config.clustering.clone();
            if let Some(threshold) = threshold {
                clustering = clustering.with_threshold(threshold);
            }
            let records = load_latest(&manifest)?;
            let report = find_duplicates(&records, &clustering)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Text => report::print_duplicates(&report),
            }
            Ok(0)
        }
        Some(Commands::Leakage {
            sets,
            threshold,
            format,
        }) => {
            let mut clustering = config.clustering.clone();
            if let Some(threshold) = threshold {
                clustering = clustering.with_threshold(threshold);
            }
            let mut labeled = Vec::with_capacity(sets.len());
            for arg in &sets {
                let (label, path) = parse_labeled(arg)
                    .with_context(|| format!("expected label=manifest, got '{}'", arg))?;
                labeled.push(LabeledRecords::new(label, load_latest(&path)?));
            }
            let report = find_leakage(&labeled, &clustering)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Text => report::print_leakage(&report),
            }
            Ok(0)
        }
        Some(Commands::Diff { old, new, format }) => {
            let diff = diff_manifests(&load_latest(&old)?, &load_latest(&new)?);
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&diff)?),
                OutputFormat::Text => report::print_diff(&diff),
            }
            Ok(0)
        }
        Some(Commands::PrintConfig) => {
            println!("{}", serde_json::to_string_pretty(config)?);
            Ok(0)
        }
        Some(Commands::AnalyzeItem { .. }) => Ok(0),
        None => {
            let _ = Cli::command().print_long_help();
            Ok(0)
        }
    }
}

fn run_scan(
    root: &Path,
    output: &Path,
    scan: imgscan_core::ScanConfig,
    isolate: bool,
) -> Result<ScanStatus> {
    let control = ScanControl::new();
    let handler_control = control.clone();
    ctrlc::set_handler(move || {
        if handler_control.request_drain() {
            eprintln!("\nInterrupt received, finishing in-flight work...");
        } else {
            eprintln!("\nSecond interrupt, exiting now");
            process::exit(EXIT_INTERRUPTED);
        }
    })
    .context("Failed to set signal handler")?;

    let mut engine = ScanEngine::new(scan)
        .with_manifest_path(output)
        .with_control(control);
    if isolate {
        engine = engine.with_worker(Arc::new(SubprocessWorker::current_exe()?));
    }

    let reporter = CliReporter::new();
    let result = engine
        .scan(root, &reporter)
        .with_context(|| format!("scan of {} failed", root.display()))?;
    let outcome = &result.outcome;

    info!(
        "Scan: {}, status: {}",
        format!("{:.2}s", result.scan_duration.as_secs_f64()).green(),
        format!("{:?}", outcome.status).cyan(),
    );
    info!(
        "{} ok, {} corrupt, {} unreadable, {} skipped, {} retried",
        format!("{}", outcome.ok).green(),
        format!("{}", outcome.corrupt).red(),
        format!("{}", outcome.unreadable).red(),
        format!("{}", outcome.skipped).cyan(),
        format!("{}", outcome.retries).yellow(),
    );
    info!(
        "{} records in {} batches appended to {}",
        outcome.records_written,
        outcome.batches_flushed,
        result.manifest_path.display()
    );
    if outcome.status == ScanStatus::Interrupted {
        info!(
            "{} in-flight items abandoned; re-run the same command to resume",
            outcome.abandoned
        );
    }

    Ok(outcome.status)
}

fn load_latest(path: &Path) -> Result<Vec<Record>> {
    let store = ManifestStore::new(path);
    if !store.exists() {
        bail!("manifest {} does not exist", path.display());
    }
    let manifest = store
        .read_all()
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(manifest.into_latest())
}

fn run_analyze_item(item: &DiscoveredItem) -> Result<()> {
    let record = ImageAnalyzer::new().analyze(item);
    println!("{}", serde_json::to_string(&record)?);
    Ok(())
}

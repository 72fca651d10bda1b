use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "imgscan")]
#[command(about = "Resumable image collection scanner and duplicate finder", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan a directory tree into a manifest, resuming if it already exists
    Scan {
        root: PathBuf,
        /// Manifest file to create or resume
        #[arg(short, long, default_value = "manifest.jsonl")]
        output: PathBuf,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        /// Discard any existing manifest and start over
        #[arg(long)]
        force: bool,
        /// Analyze each file in a separate process
        #[arg(long)]
        isolate: bool,
    },
    /// Report exact and near-duplicate clusters in a manifest
    Duplicates {
        manifest: PathBuf,
        #[arg(long)]
        threshold: Option<u32>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Report duplicates shared between labeled manifests, e.g. train=a.jsonl test=b.jsonl
    Leakage {
        #[arg(required = true, num_args = 2..)]
        sets: Vec<String>,
        #[arg(long)]
        threshold: Option<u32>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Compare two manifests by path
    Diff {
        old: PathBuf,
        new: PathBuf,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Print configuration values
    PrintConfig,
    /// Analyze one file and print its record as JSON
    #[command(hide = true)]
    AnalyzeItem {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        size: u64,
        #[arg(long, allow_hyphen_values = true)]
        mtime_ns: i64,
    },
}

/// Splits `label=path`.
pub fn parse_labeled(arg: &str) -> Option<(String, PathBuf)> {
    let (label, path) = arg.split_once('=')?;
    if label.is_empty() || path.is_empty() {
        return None;
    }
    Some((label.to_string(), PathBuf::from(path)))
}

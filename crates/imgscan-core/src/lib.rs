pub mod analysis;
pub mod analyzer;
pub mod config;
pub mod engine;
pub mod error;
pub mod hasher;
pub mod pipeline;
pub mod progress;
pub mod scanner;
pub mod storage;

pub use analyzer::{Analyzer, ImageAnalyzer};
pub use config::{AppConfig, ClusterConfig, HashField, ScanConfig};
pub use engine::{ScanEngine, ScanResult};
pub use error::Error;
pub use pipeline::{ScanControl, ScanOutcome, ScanStatus};
pub use progress::{ProgressReporter, SilentReporter};

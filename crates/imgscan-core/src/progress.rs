use crate::pipeline::ScanOutcome;
use crate::storage::models::Record;

/// Trait for reporting scan progress.
///
/// The CLI implements it with indicatif progress bars. Hooks are called from
/// the coordinator thread only. All methods have default no-op implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_scan_start(&self, _root: &str, _resumed_records: usize) {}
    fn on_item_skipped(&self, _path: &str) {}
    fn on_item_complete(&self, _record: &Record) {}
    fn on_worker_crash(&self, _path: &str, _attempt: u32, _message: &str) {}
    fn on_batch_flushed(&self, _records: usize, _total_written: u64) {}
    fn on_drain_start(&self, _in_flight: usize) {}
    fn on_scan_complete(&self, _outcome: &ScanOutcome, _duration_secs: f64) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}

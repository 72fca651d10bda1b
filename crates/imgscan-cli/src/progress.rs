use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

use imgscan_core::storage::Record;
use imgscan_core::{ProgressReporter, ScanOutcome};

/// CLI progress reporter using an indicatif spinner.
///
/// The total is unknown while discovery streams, so a spinner with running
/// counts is used instead of a bar.
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
    counts: Mutex<Counts>,
}

#[derive(Default)]
struct Counts {
    done: u64,
    skipped: u64,
    failed: u64,
    written: u64,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
            counts: Mutex::new(Counts::default()),
        }
    }

    fn set_bar(&self, pb: ProgressBar) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(old) = guard.take() {
                old.finish_and_clear();
            }
            *guard = Some(pb);
        }
    }

    fn finish_bar(&self) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(pb) = guard.take() {
                pb.finish_and_clear();
            }
        }
    }

    fn update<F: FnOnce(&mut Counts)>(&self, f: F) {
        let message = match self.counts.lock() {
            Ok(mut counts) => {
                f(&mut counts);
                format!(
                    "Analyzed {} ({} failed), skipped {}, written {}",
                    counts.done, counts.failed, counts.skipped, counts.written
                )
            }
            Err(_) => return,
        };
        if let Ok(guard) = self.bar.lock() {
            if let Some(pb) = guard.as_ref() {
                pb.set_message(message);
            }
        }
    }

    fn println(&self, line: String) {
        match self.bar.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(pb) => pb.println(line),
                None => eprintln!("{}", line),
            },
            Err(_) => eprintln!("{}", line),
        }
    }
}

impl ProgressReporter for CliReporter {
    fn on_scan_start(&self, root: &str, resumed_records: usize) {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {msg}") {
            pb.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
        }
        pb.set_message(format!("Scanning {}...", root));
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
        if resumed_records > 0 {
            self.println(format!(
                "  Resuming: {} records already in the manifest",
                resumed_records
            ));
        }
    }

    fn on_item_skipped(&self, _path: &str) {
        self.update(|c| c.skipped += 1);
    }

    fn on_item_complete(&self, record: &Record) {
        let failed = !record.is_ok();
        self.update(|c| {
            c.done += 1;
            if failed {
                c.failed += 1;
            }
        });
    }

    fn on_worker_crash(&self, path: &str, attempt: u32, message: &str) {
        self.println(format!(
            "  \x1b[33m!\x1b[0m Worker crashed on {} (attempt {}): {}",
            path, attempt, message
        ));
    }

    fn on_batch_flushed(&self, _records: usize, total_written: u64) {
        self.update(|c| c.written = total_written);
    }

    fn on_drain_start(&self, in_flight: usize) {
        self.println(format!(
            "  Interrupted: finishing {} in-flight items (Ctrl-C again to abort)",
            in_flight
        ));
    }

    fn on_scan_complete(&self, outcome: &ScanOutcome, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Scan {:?}: {} analyzed, {} skipped, {} written in {:.2}s",
            outcome.status,
            outcome.analyzed(),
            outcome.skipped,
            outcome.records_written,
            duration_secs
        );
    }
}

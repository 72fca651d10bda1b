use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::analyzer::ImageAnalyzer;
use crate::config::ScanConfig;
use crate::error::Error;
use crate::pipeline::{InProcessWorker, ScanControl, ScanOutcome, ScanScheduler, ScanStatus, Worker};
use crate::progress::ProgressReporter;
use crate::scanner;
use crate::storage::{ManifestHeader, ManifestStore, ResumeIndex, ScanSummary};

/// State recovered from the manifest before the scheduler starts.
struct Prepared {
    header: ManifestHeader,
    /// Keys to skip.
    resume: ResumeIndex,
    prior_records: usize,
    /// Bytes cut from a corrupt tail.
    truncated_bytes: u64,
}

pub struct ScanEngine {
    config: ScanConfig,
    manifest_path: PathBuf,
    worker: Arc<dyn Worker>,
    control: ScanControl,
}

#[derive(Debug)]
pub struct ScanResult {
    pub manifest_path: PathBuf,
    /// Whether existing records were reused.
    pub resumed: bool,
    /// Distinct paths already recorded in the manifest before this run.
    pub prior_records: usize,
    /// Bytes of a torn or corrupt tail cut from the manifest before appending.
    pub truncated_bytes: u64,
    pub outcome: ScanOutcome,
    pub scan_duration: Duration,
}

impl ScanResult {
    pub fn status(&self) -> ScanStatus {
        self.outcome.status
    }
}

impl ScanEngine {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            manifest_path: PathBuf::from("manifest.jsonl"),
            worker: Arc::new(InProcessWorker::new(ImageAnalyzer::new())),
            control: ScanControl::new(),
        }
    }

    pub fn with_manifest_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest_path = path.into();
        self
    }

    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_control(mut self, control: ScanControl) -> Self {
        self.control = control;
        self
    }

    /// Handle for requesting a drain from another thread.
    pub fn control(&self) -> ScanControl {
        self.control.clone()
    }

    /// Run the scan pipeline:
    /// 1. Open or create the manifest, cutting any torn tail
    /// 2. Stream discovery through the scheduler, skipping recorded keys
    /// 3. Refresh the header with the outcome
    pub fn scan(&self, root: &Path, reporter: &dyn ProgressReporter) -> Result<ScanResult, Error> {
        self.config.validate()?;
        if !root.is_dir() {
            return Err(Error::InvalidPath(root.to_path_buf()));
        }
        let root = fs::canonicalize(root)?;
        let root_str = root.to_string_lossy().into_owned();
        let store = ManifestStore::new(&self.manifest_path);

        let Prepared {
            mut header,
            mut resume,
            prior_records,
            truncated_bytes,
        } = self.prepare(&store, &root_str)?;
        let resumed = !resume.is_empty();
        reporter.on_scan_start(&root_str, prior_records);

        info!("Scanning {} into {}", root_str, self.manifest_path.display());
        let scan_start = Instant::now();
        let scheduler = ScanScheduler::new(self.config.clone(), Arc::clone(&self.worker))
            .with_control(self.control.clone());
        let outcome = {
            let mut writer = store.open_writer()?;
            scheduler.run(
                scanner::discover(&root, &self.config),
                &mut resume,
                &mut writer,
                reporter,
            )?
        };
        let scan_duration = scan_start.elapsed();

        if outcome.status == ScanStatus::Completed {
            header.total_files = outcome.discovered;
        } else {
            header.total_files = header.total_files.max(outcome.discovered);
        }
        header.last_scan = Some(ScanSummary {
            status: outcome.status,
            records_written: outcome.records_written,
            finished_at: chrono::Utc::now().to_rfc3339(),
        });
        store.write_header(&header)?;

        debug!(
            "Scan finished in {:.2}s: {:?}",
            scan_duration.as_secs_f64(),
            outcome
        );
        reporter.on_scan_complete(&outcome, scan_duration.as_secs_f64());

        Ok(ScanResult {
            manifest_path: self.manifest_path.clone(),
            resumed,
            prior_records,
            truncated_bytes,
            outcome,
            scan_duration,
        })
    }

    fn prepare(&self, store: &ManifestStore, root: &str) -> Result<Prepared, Error> {
        if self.config.force || !self.config.resume || !store.exists() {
            let header = ManifestHeader::new(root, self.config.clone());
            store.create(&header)?;
            return Ok(Prepared {
                header,
                resume: ResumeIndex::new(),
                prior_records: 0,
                truncated_bytes: 0,
            });
        }

        let manifest = store.read_all()?;
        let mut truncated = 0;
        if let Some(tail) = &manifest.discarded_tail {
            store.truncate_discarded(tail)?;
            truncated = tail.bytes;
        }

        let header = match &manifest.header {
            Some(existing) if existing.source_root != root => {
                return Err(Error::Manifest {
                    path: store.path().to_path_buf(),
                    message: format!(
                        "manifest belongs to {}, not {}; use force to start over",
                        existing.source_root, root
                    ),
                });
            }
            Some(existing) => {
                let mut header = existing.clone();
                header.settings = self.config.clone();
                header
            }
            None => {
                warn!(
                    "Manifest {} has no header, writing a fresh one",
                    store.path().display()
                );
                ManifestHeader::new(root, self.config.clone())
            }
        };
        store.write_header(&header)?;

        let resume = manifest.resume_index();
        let prior_records = manifest.distinct_paths();
        info!(
            "Resuming from {} recorded paths ({} keys) in {}",
            prior_records,
            resume.len(),
            store.path().display()
        );
        Ok(Prepared {
            header,
            resume,
            prior_records,
            truncated_bytes: truncated,
        })
    }
}

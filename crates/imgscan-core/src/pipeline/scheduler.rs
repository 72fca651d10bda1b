use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::control::{ScanControl, ScanStatus};
use super::worker::{Worker, WorkerCrash, WorkerPool, WorkerReply};
use crate::analyzer::new_record;
use crate::config::ScanConfig;
use crate::error::Error;
use crate::progress::ProgressReporter;
use crate::scanner::DiscoveredItem;
use crate::storage::models::{Record, RecordStatus};
use crate::storage::{RecordSink, ResumeIndex};

/// Upper bound on how long the coordinator blocks before re-checking the
/// control state and the flush timer.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Attempts per item before it is recorded as unreadable.
const MAX_ATTEMPTS: u32 = 2;

/// Counters from one scheduler run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    pub status: ScanStatus,
    /// Items pulled from discovery, skipped ones included.
    pub discovered: u64,
    /// Items whose identity key was already in the resume index.
    pub skipped: u64,
    pub ok: u64,
    pub corrupt: u64,
    pub unreadable: u64,
    /// Crashes that were retried.
    pub retries: u64,
    /// Items that crashed on both attempts.
    pub crashed_twice: u64,
    /// In-flight items given up when the grace period ran out.
    pub abandoned: u64,
    pub batches_flushed: u64,
    pub records_written: u64,
    /// Largest number of records ever held in the batch buffer.
    pub peak_buffered: usize,
}

impl ScanOutcome {
    fn new() -> Self {
        Self {
            status: ScanStatus::Completed,
            discovered: 0,
            skipped: 0,
            ok: 0,
            corrupt: 0,
            unreadable: 0,
            retries: 0,
            crashed_twice: 0,
            abandoned: 0,
            batches_flushed: 0,
            records_written: 0,
            peak_buffered: 0,
        }
    }

    pub fn analyzed(&self) -> u64 {
        self.ok + self.corrupt + self.unreadable
    }
}

/// Bounded buffer of finished records, flushed when full or on a timer.
struct Batch {
    records: Vec<Record>,
    capacity: usize,
    interval: Duration,
    last_flush: Instant,
}

impl Batch {
    fn new(capacity: usize, interval: Duration) -> Self {
        Self {
            records: Vec::with_capacity(capacity.min(1024)),
            capacity,
            interval,
            last_flush: Instant::now(),
        }
    }

    fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn should_flush(&self) -> bool {
        self.records.len() >= self.capacity
            || (!self.records.is_empty() && self.last_flush.elapsed() >= self.interval)
    }

    fn time_until_due(&self) -> Duration {
        if self.records.is_empty() {
            return POLL_INTERVAL;
        }
        self.interval.saturating_sub(self.last_flush.elapsed())
    }

    fn flush<S: RecordSink + ?Sized>(&mut self, sink: &mut S) -> Result<usize, Error> {
        let flushed = self.records.len();
        if flushed > 0 {
            sink.append_batch(&self.records)?;
            self.records.clear();
        }
        self.last_flush = Instant::now();
        Ok(flushed)
    }
}

/// Drives discovered items through a worker pool into a record sink.
///
/// At most `workers * 2` items are in flight. Finished records are buffered
/// up to `batch_size` and appended as one batch. A [`ScanControl`] drain
/// stops submission, waits up to the grace period, then abandons whatever is
/// still running and kills its child processes. Crashes seen while draining
/// are abandoned, never retried or recorded.
pub struct ScanScheduler {
    config: ScanConfig,
    worker: Arc<dyn Worker>,
    control: ScanControl,
}

impl ScanScheduler {
    pub fn new(config: ScanConfig, worker: Arc<dyn Worker>) -> Self {
        Self {
            config,
            worker,
            control: ScanControl::new(),
        }
    }

    pub fn with_control(mut self, control: ScanControl) -> Self {
        self.control = control;
        self
    }

    pub fn control(&self) -> ScanControl {
        self.control.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.config.workers.max(1) * 2
    }

    /// Runs until discovery is exhausted and every result is durable, or
    /// until a drain completes. A sink error aborts the run; batches already
    /// appended stay durable.
    pub fn run<I, S>(
        &self,
        items: I,
        resume: &mut ResumeIndex,
        sink: &mut S,
        reporter: &dyn ProgressReporter,
    ) -> Result<ScanOutcome, Error>
    where
        I: IntoIterator<Item = DiscoveredItem>,
        S: RecordSink + ?Sized,
    {
        self.config.validate()?;
        let max_in_flight = self.max_in_flight();
        let pool = WorkerPool::spawn(Arc::clone(&self.worker), self.config.workers, max_in_flight)?;

        let mut items = items.into_iter().fuse();
        let mut outcome = ScanOutcome::new();
        let mut batch = Batch::new(self.config.batch_size, self.config.flush_interval());
        let mut in_flight = 0usize;
        let mut exhausted = false;
        let mut drain_deadline: Option<Instant> = None;

        info!(
            "Scanning with {} workers, batch size {}, {} keys already recorded",
            self.config.workers,
            self.config.batch_size,
            resume.len()
        );

        loop {
            while self.control.is_running() && !exhausted && in_flight < max_in_flight {
                let Some(item) = items.next() else {
                    exhausted = true;
                    break;
                };
                outcome.discovered += 1;
                // Claimed at submission so a path seen twice in one run is analysed once.
                if !resume.insert(item.identity_key()) {
                    outcome.skipped += 1;
                    reporter.on_item_skipped(&item.path_string());
                    continue;
                }
                pool.submit(item, 1)?;
                in_flight += 1;
            }

            if in_flight == 0 && (exhausted || !self.control.is_running()) {
                break;
            }

            if !self.control.is_running() && drain_deadline.is_none() {
                info!("Draining {} in-flight items", in_flight);
                reporter.on_drain_start(in_flight);
                drain_deadline = Some(Instant::now() + self.config.grace_period());
            }

            let mut timeout = batch.time_until_due().min(POLL_INTERVAL);
            if let Some(deadline) = drain_deadline {
                let now = Instant::now();
                if now >= deadline {
                    warn!(
                        "Grace period elapsed, abandoning {} in-flight items",
                        in_flight
                    );
                    outcome.abandoned += in_flight as u64;
                    pool.terminate();
                    break;
                }
                timeout = timeout.min(deadline - now);
            }

            if let Some(reply) = pool.recv_timeout(timeout)? {
                in_flight -= 1;
                if let Some(record) = self.handle_reply(reply, &pool, &mut in_flight, &mut outcome, reporter)? {
                    batch.push(record);
                    outcome.peak_buffered = outcome.peak_buffered.max(batch.len());
                }
            }

            if batch.should_flush() {
                self.flush(&mut batch, sink, &mut outcome, reporter)?;
            }
        }

        self.flush(&mut batch, sink, &mut outcome, reporter)?;
        self.control.mark_stopped();

        if exhausted && outcome.abandoned == 0 {
            outcome.status = ScanStatus::Completed;
            pool.join();
        } else {
            outcome.status = ScanStatus::Interrupted;
            drop(pool);
        }

        info!(
            "Scan {:?}: {} discovered, {} skipped, {} analysed, {} written in {} batches",
            outcome.status,
            outcome.discovered,
            outcome.skipped,
            outcome.analyzed(),
            outcome.records_written,
            outcome.batches_flushed
        );
        Ok(outcome)
    }

    fn handle_reply(
        &self,
        reply: WorkerReply,
        pool: &WorkerPool,
        in_flight: &mut usize,
        outcome: &mut ScanOutcome,
        reporter: &dyn ProgressReporter,
    ) -> Result<Option<Record>, Error> {
        let WorkerReply {
            item,
            attempt,
            outcome: result,
        } = reply;

        let record = match result {
            Ok(record) => record,
            Err(WorkerCrash { message }) => {
                let path = item.path_string();
                reporter.on_worker_crash(&path, attempt, &message);
                if !self.control.is_running() {
                    // The crash may be the interrupt itself; the next run analyses the item again.
                    warn!("Worker crashed on {} while draining: {}", path, message);
                    outcome.abandoned += 1;
                    return Ok(None);
                }
                if attempt < MAX_ATTEMPTS {
                    warn!("Worker crashed on {}, retrying: {}", path, message);
                    outcome.retries += 1;
                    pool.submit(item, attempt + 1)?;
                    *in_flight += 1;
                    return Ok(None);
                }
                warn!("Worker crashed twice on {}, marking unreadable", path);
                outcome.crashed_twice += 1;
                new_record(
                    &item,
                    RecordStatus::Unreadable {
                        message: format!("worker crashed twice: {}", message),
                    },
                )
            }
        };

        match record.status {
            RecordStatus::Ok(_) => outcome.ok += 1,
            RecordStatus::Corrupt { .. } => outcome.corrupt += 1,
            RecordStatus::Unreadable { .. } => outcome.unreadable += 1,
        }
        reporter.on_item_complete(&record);
        Ok(Some(record))
    }

    fn flush<S: RecordSink + ?Sized>(
        &self,
        batch: &mut Batch,
        sink: &mut S,
        outcome: &mut ScanOutcome,
        reporter: &dyn ProgressReporter,
    ) -> Result<(), Error> {
        let flushed = batch.flush(sink)?;
        if flushed > 0 {
            outcome.batches_flushed += 1;
            outcome.records_written += flushed as u64;
            debug!(
                "Flushed batch of {} records ({} total)",
                flushed, outcome.records_written
            );
            reporter.on_batch_flushed(flushed, outcome.records_written);
        }
        Ok(())
    }
}

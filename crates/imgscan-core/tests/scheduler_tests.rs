use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use imgscan_core::analyzer::new_record;
use imgscan_core::config::ScanConfig;
use imgscan_core::hasher::PerceptualHash;
use imgscan_core::pipeline::{
    ScanControl, ScanScheduler, ScanStatus, SubprocessWorker, Worker, WorkerCrash,
};
use imgscan_core::scanner::DiscoveredItem;
use imgscan_core::storage::models::{Fingerprint, Record, RecordStatus};
use imgscan_core::storage::{RecordSink, ResumeIndex};
use imgscan_core::{Error, ProgressReporter, SilentReporter};

/// Keeps every appended batch in memory, optionally failing from some batch on.
#[derive(Default)]
struct MemorySink {
    batches: Vec<Vec<Record>>,
    fail_from_batch: Option<usize>,
}

impl MemorySink {
    fn records(&self) -> Vec<Record> {
        self.batches.iter().flatten().cloned().collect()
    }
}

impl RecordSink for MemorySink {
    fn append_batch(&mut self, records: &[Record]) -> Result<(), Error> {
        if let Some(n) = self.fail_from_batch {
            if self.batches.len() >= n {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
        }
        self.batches.push(records.to_vec());
        Ok(())
    }
}

/// Produces an ok record per item. Paths listed in `crash_times` crash that many times first;
/// paths in `slow` sleep before answering.
#[derive(Default)]
struct ScriptedWorker {
    crash_times: Mutex<HashMap<String, u32>>,
    slow: Vec<String>,
    calls: AtomicUsize,
}

impl ScriptedWorker {
    fn crashing(path: &str, times: u32) -> Self {
        let worker = Self::default();
        worker
            .crash_times
            .lock()
            .unwrap()
            .insert(path.to_string(), times);
        worker
    }
}

impl Worker for ScriptedWorker {
    fn run(&self, item: &DiscoveredItem) -> Result<Record, WorkerCrash> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let path = item.path_string();
        if let Some(left) = self.crash_times.lock().unwrap().get_mut(&path) {
            if *left > 0 {
                *left -= 1;
                return Err(WorkerCrash::new("simulated crash"));
            }
        }
        if self.slow.contains(&path) {
            thread::sleep(Duration::from_millis(500));
        }
        Ok(new_record(
            item,
            RecordStatus::Ok(Fingerprint {
                content_hash: format!("{:064x}", item.size),
                phash: PerceptualHash(item.size),
                dhash: PerceptualHash(item.size),
                width: 1,
                height: 1,
                format: "png".into(),
            }),
        ))
    }
}

fn items(n: u64) -> Vec<DiscoveredItem> {
    (0..n)
        .map(|i| DiscoveredItem {
            path: PathBuf::from(format!("/data/{:03}.jpg", i)),
            size: i,
            mtime_ns: 1_700_000_000_000_000_000 + i as i64,
        })
        .collect()
}

fn config(workers: usize, batch_size: usize) -> ScanConfig {
    ScanConfig {
        workers,
        batch_size,
        flush_interval_ms: 60_000,
        grace_period_ms: 50,
        ..ScanConfig::default()
    }
}

#[test]
fn test_every_item_written_once() {
    let scheduler = ScanScheduler::new(config(4, 7), Arc::new(ScriptedWorker::default()));
    let mut sink = MemorySink::default();
    let outcome = scheduler
        .run(items(50), &mut ResumeIndex::new(), &mut sink, &SilentReporter)
        .unwrap();

    assert_eq!(outcome.status, ScanStatus::Completed);
    assert_eq!(outcome.discovered, 50);
    assert_eq!(outcome.ok, 50);
    assert_eq!(outcome.records_written, 50);
    let mut paths: Vec<String> = sink.records().into_iter().map(|r| r.path).collect();
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 50);
}

#[test]
fn test_resume_skips_recorded_items() {
    let scheduler = ScanScheduler::new(config(2, 10), Arc::new(ScriptedWorker::default()));
    let mut first = MemorySink::default();
    scheduler
        .run(items(20), &mut ResumeIndex::new(), &mut first, &SilentReporter)
        .unwrap();

    let worker = Arc::new(ScriptedWorker::default());
    let scheduler = ScanScheduler::new(config(2, 10), worker.clone());
    let mut index = ResumeIndex::from_records(&first.records());
    let mut second = MemorySink::default();
    let outcome = scheduler
        .run(items(20), &mut index, &mut second, &SilentReporter)
        .unwrap();

    assert_eq!(outcome.skipped, 20);
    assert_eq!(outcome.analyzed(), 0);
    assert!(second.batches.is_empty());
    assert_eq!(worker.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_changed_mtime_is_reanalysed() {
    let all = items(5);
    let mut index = ResumeIndex::new();
    for item in &all {
        index.insert(item.identity_key());
    }
    let mut changed = all.clone();
    changed[3].mtime_ns += 1;

    let scheduler = ScanScheduler::new(config(2, 10), Arc::new(ScriptedWorker::default()));
    let mut sink = MemorySink::default();
    let outcome = scheduler
        .run(changed, &mut index, &mut sink, &SilentReporter)
        .unwrap();

    assert_eq!(outcome.skipped, 4);
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].path, "/data/003.jpg");
}

#[test]
fn test_item_discovered_twice_is_analysed_once() {
    let mut doubled = items(3);
    doubled.extend(items(3));
    let worker = Arc::new(ScriptedWorker::default());
    let scheduler = ScanScheduler::new(config(2, 10), worker.clone());
    let mut sink = MemorySink::default();
    let outcome = scheduler
        .run(doubled, &mut ResumeIndex::new(), &mut sink, &SilentReporter)
        .unwrap();

    assert_eq!(outcome.discovered, 6);
    assert_eq!(outcome.skipped, 3);
    assert_eq!(sink.records().len(), 3);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_single_crash_is_retried() {
    let worker = Arc::new(ScriptedWorker::crashing("/data/002.jpg", 1));
    let scheduler = ScanScheduler::new(config(2, 10), worker.clone());
    let mut sink = MemorySink::default();
    let outcome = scheduler
        .run(items(4), &mut ResumeIndex::new(), &mut sink, &SilentReporter)
        .unwrap();

    assert_eq!(outcome.retries, 1);
    assert_eq!(outcome.crashed_twice, 0);
    assert_eq!(outcome.ok, 4);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 5);
}

#[test]
fn test_second_crash_marks_unreadable() {
    let worker = Arc::new(ScriptedWorker::crashing("/data/001.jpg", 5));
    let scheduler = ScanScheduler::new(config(2, 10), worker.clone());
    let mut sink = MemorySink::default();
    let outcome = scheduler
        .run(items(3), &mut ResumeIndex::new(), &mut sink, &SilentReporter)
        .unwrap();

    assert_eq!(outcome.retries, 1);
    assert_eq!(outcome.crashed_twice, 1);
    assert_eq!(outcome.unreadable, 1);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 4);

    let records = sink.records();
    let flagged = records.iter().find(|r| r.path == "/data/001.jpg").unwrap();
    assert_eq!(flagged.status_name(), "unreadable");
}

/// Counts pulls from discovery against completions to track the in-flight window.
struct WindowWatcher {
    pulled: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    max_window: Arc<AtomicUsize>,
}

impl ProgressReporter for WindowWatcher {
    fn on_item_complete(&self, _record: &Record) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_memory_is_bounded_by_batch_and_window() {
    let watcher = WindowWatcher {
        pulled: Arc::new(AtomicUsize::new(0)),
        completed: Arc::new(AtomicUsize::new(0)),
        max_window: Arc::new(AtomicUsize::new(0)),
    };
    let (pulled, completed, max_window) = (
        watcher.pulled.clone(),
        watcher.completed.clone(),
        watcher.max_window.clone(),
    );
    let stream = items(200).into_iter().inspect(move |_| {
        let now = pulled.fetch_add(1, Ordering::SeqCst) + 1;
        let window = now - completed.load(Ordering::SeqCst);
        max_window.fetch_max(window, Ordering::SeqCst);
    });

    let scheduler = ScanScheduler::new(config(3, 16), Arc::new(ScriptedWorker::default()));
    let mut sink = MemorySink::default();
    let outcome = scheduler
        .run(stream, &mut ResumeIndex::new(), &mut sink, &watcher)
        .unwrap();

    assert_eq!(outcome.records_written, 200);
    assert!(outcome.peak_buffered <= 16);
    assert!(sink.batches.iter().all(|b| b.len() <= 16));
    assert_eq!(sink.batches.len(), 13);
    assert!(watcher.max_window.load(Ordering::SeqCst) <= scheduler.max_in_flight());
}

#[test]
fn test_flush_interval_flushes_partial_batch() {
    let scheduler = ScanScheduler::new(
        ScanConfig {
            flush_interval_ms: 0,
            ..config(1, 1000)
        },
        Arc::new(ScriptedWorker::default()),
    );
    let mut sink = MemorySink::default();
    let outcome = scheduler
        .run(items(5), &mut ResumeIndex::new(), &mut sink, &SilentReporter)
        .unwrap();

    assert_eq!(outcome.records_written, 5);
    assert!(sink.batches.len() > 1);
}

#[test]
fn test_storage_failure_is_fatal_but_earlier_batches_stay() {
    let scheduler = ScanScheduler::new(config(2, 5), Arc::new(ScriptedWorker::default()));
    let mut sink = MemorySink {
        fail_from_batch: Some(2),
        ..MemorySink::default()
    };
    let result = scheduler.run(items(30), &mut ResumeIndex::new(), &mut sink, &SilentReporter);

    assert!(matches!(result, Err(Error::Io(_))));
    assert_eq!(sink.batches.len(), 2);
    assert_eq!(sink.records().len(), 10);
}

#[test]
fn test_drain_before_start_submits_nothing() {
    let control = ScanControl::new();
    control.request_drain();
    let worker = Arc::new(ScriptedWorker::default());
    let scheduler = ScanScheduler::new(config(2, 10), worker.clone()).with_control(control);
    let mut sink = MemorySink::default();
    let outcome = scheduler
        .run(items(10), &mut ResumeIndex::new(), &mut sink, &SilentReporter)
        .unwrap();

    assert_eq!(outcome.status, ScanStatus::Interrupted);
    assert_eq!(outcome.discovered, 0);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 0);
}

/// Requests a drain as soon as the first record completes.
struct DrainOnFirst {
    control: ScanControl,
}

impl ProgressReporter for DrainOnFirst {
    fn on_item_complete(&self, _record: &Record) {
        self.control.request_drain();
    }
}

#[test]
fn test_interrupt_then_resume_completes_exactly_once() {
    let all = items(6);
    let control = ScanControl::new();
    let worker = Arc::new(ScriptedWorker {
        slow: vec!["/data/001.jpg".to_string()],
        ..ScriptedWorker::default()
    });
    let scheduler = ScanScheduler::new(config(1, 100), worker).with_control(control.clone());
    let mut first = MemorySink::default();
    let outcome = scheduler
        .run(
            all.clone(),
            &mut ResumeIndex::new(),
            &mut first,
            &DrainOnFirst {
                control: control.clone(),
            },
        )
        .unwrap();

    assert_eq!(outcome.status, ScanStatus::Interrupted);
    assert_eq!(outcome.abandoned, 1);
    assert_eq!(first.records().len(), 1);
    assert_eq!(outcome.records_written, 1);

    let scheduler = ScanScheduler::new(config(2, 100), Arc::new(ScriptedWorker::default()));
    let mut index = ResumeIndex::from_records(&first.records());
    let mut second = MemorySink::default();
    let resumed = scheduler
        .run(all, &mut index, &mut second, &SilentReporter)
        .unwrap();

    assert_eq!(resumed.status, ScanStatus::Completed);
    assert_eq!(resumed.skipped, 1);
    let mut paths: Vec<String> = first
        .records()
        .into_iter()
        .chain(second.records())
        .map(|r| r.path)
        .collect();
    paths.sort();
    let expected: Vec<String> = (0..6).map(|i| format!("/data/{:03}.jpg", i)).collect();
    assert_eq!(paths, expected);
}

/// Requests a drain once `ready` holds, after `delay`.
fn drain_when<F>(control: &ScanControl, delay: Duration, ready: F) -> thread::JoinHandle<()>
where
    F: Fn() -> bool + Send + 'static,
{
    let control = control.clone();
    thread::spawn(move || {
        while !ready() {
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(delay);
        control.request_drain();
    })
}

#[cfg(unix)]
fn is_alive(pid: &str) -> bool {
    std::process::Command::new("sh")
        .args(["-c", &format!("kill -0 {} 2>/dev/null", pid)])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(unix)]
#[test]
fn test_retry_killed_by_interrupt_is_left_for_next_run() {
    let tmp = tempfile::tempdir().unwrap();
    let marker = tmp.path().join("first-attempt");
    // The first attempt fails at once; the retry dies of SIGINT once the drain has begun.
    let worker = SubprocessWorker::new("sh").with_args([
        "-c",
        "if [ -e \"$1\" ]; then sleep 0.5; kill -INT $$; else touch \"$1\"; exit 1; fi",
        "sh",
        marker.to_str().unwrap(),
    ]);
    let control = ScanControl::new();
    let scheduler = ScanScheduler::new(
        ScanConfig {
            grace_period_ms: 5_000,
            ..config(1, 10)
        },
        Arc::new(worker),
    )
    .with_control(control.clone());

    let watched = marker.clone();
    let drainer = drain_when(&control, Duration::from_millis(150), move || watched.exists());
    let mut sink = MemorySink::default();
    let outcome = scheduler
        .run(items(1), &mut ResumeIndex::new(), &mut sink, &SilentReporter)
        .unwrap();
    drainer.join().unwrap();

    assert_eq!(outcome.status, ScanStatus::Interrupted);
    assert_eq!(outcome.retries, 1);
    assert_eq!(outcome.crashed_twice, 0);
    assert_eq!(outcome.unreadable, 0);
    assert_eq!(outcome.abandoned, 1);
    assert!(sink.records().is_empty());
}

#[cfg(unix)]
#[test]
fn test_grace_expiry_kills_child_processes() {
    let tmp = tempfile::tempdir().unwrap();
    let pid_file = tmp.path().join("pid");
    let worker = SubprocessWorker::new("sh").with_args([
        "-c",
        "echo $$ > \"$1\"; exec sleep 30",
        "sh",
        pid_file.to_str().unwrap(),
    ]);
    let control = ScanControl::new();
    let scheduler = ScanScheduler::new(config(1, 10), Arc::new(worker)).with_control(control.clone());

    let watched = pid_file.clone();
    let drainer = drain_when(&control, Duration::ZERO, move || {
        std::fs::read_to_string(&watched).map_or(false, |pid| !pid.trim().is_empty())
    });
    let start = Instant::now();
    let outcome = scheduler
        .run(items(1), &mut ResumeIndex::new(), &mut MemorySink::default(), &SilentReporter)
        .unwrap();
    drainer.join().unwrap();

    assert_eq!(outcome.status, ScanStatus::Interrupted);
    assert_eq!(outcome.abandoned, 1);
    assert!(start.elapsed() < Duration::from_secs(10));

    let pid = std::fs::read_to_string(&pid_file).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while is_alive(pid.trim()) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert!(!is_alive(pid.trim()));
}

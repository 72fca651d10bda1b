use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use crate::analyzer::Analyzer;
use crate::error::Error;
use crate::scanner::DiscoveredItem;
use crate::storage::manifest::trim_ascii;
use crate::storage::models::Record;

/// Name of the CLI subcommand a [`SubprocessWorker`] invokes.
pub const ANALYZE_ITEM_COMMAND: &str = "analyze-item";

/// How often a waiting [`SubprocessWorker`] checks its child and the cancel flag.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A worker died (panic, non-zero exit, signal, garbled output) without
/// producing a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCrash {
    pub message: String,
}

impl WorkerCrash {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::new(format!("analyzer panicked: {}", message))
    }
}

/// Executes the analysis of a single item. Stateless across items.
pub trait Worker: Send + Sync {
    fn run(&self, item: &DiscoveredItem) -> Result<Record, WorkerCrash>;

    /// Like [`Worker::run`], but stops early once `cancel` is set. Workers
    /// that cannot be interrupted finish the item.
    fn run_cancellable(&self, item: &DiscoveredItem, _cancel: &AtomicBool) -> Result<Record, WorkerCrash> {
        self.run(item)
    }
}

/// Runs the analyzer on the pool thread, turning a panic into a crash.
pub struct InProcessWorker<A> {
    analyzer: A,
}

impl<A: Analyzer> InProcessWorker<A> {
    pub fn new(analyzer: A) -> Self {
        Self { analyzer }
    }
}

impl<A: Analyzer> Worker for InProcessWorker<A> {
    fn run(&self, item: &DiscoveredItem) -> Result<Record, WorkerCrash> {
        panic::catch_unwind(AssertUnwindSafe(|| self.analyzer.analyze(item)))
            .map_err(WorkerCrash::from_panic)
    }
}

/// Analyzes each item in a fresh child process, so a decoder that aborts or
/// segfaults only takes down that child.
///
/// The child is invoked as `<program> <args..> analyze-item --path=.. --size=.. --mtime-ns=..`
/// and must print exactly one JSON record on stdout. On unix it runs in its
/// own process group, so a terminal Ctrl-C reaches only the coordinator; the
/// child is killed only when the pool is cancelled.
pub struct SubprocessWorker {
    program: PathBuf,
    args: Vec<String>,
}

impl SubprocessWorker {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-invokes the running executable.
    pub fn current_exe() -> Result<Self, Error> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Arguments placed before the subcommand.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn command(&self, item: &DiscoveredItem) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(ANALYZE_ITEM_COMMAND)
            .arg(format!("--path={}", item.path.display()))
            .arg(format!("--size={}", item.size))
            .arg(format!("--mtime-ns={}", item.mtime_ns))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }
}

impl Worker for SubprocessWorker {
    fn run(&self, item: &DiscoveredItem) -> Result<Record, WorkerCrash> {
        self.run_cancellable(item, &AtomicBool::new(false))
    }

    fn run_cancellable(&self, item: &DiscoveredItem, cancel: &AtomicBool) -> Result<Record, WorkerCrash> {
        let mut child = self
            .command(item)
            .spawn()
            .map_err(|e| WorkerCrash::new(format!("failed to spawn {}: {}", self.program.display(), e)))?;
        let stdout = child.stdout.take().map(read_pipe);
        let stderr = child.stderr.take().map(read_pipe);

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    kill_child(&mut child);
                    return Err(WorkerCrash::new(format!("failed to wait for analyzer process: {}", e)));
                }
            }
            if cancel.load(Ordering::Acquire) {
                kill_child(&mut child);
                return Err(WorkerCrash::new("analyzer process terminated on shutdown"));
            }
            thread::sleep(CHILD_POLL_INTERVAL);
        };

        let stdout = collect_pipe(stdout);
        let stderr = collect_pipe(stderr);
        if !status.success() {
            let how = match status.code() {
                Some(code) => format!("exited with status {}", code),
                None => "killed by signal".to_string(),
            };
            return Err(WorkerCrash::new(format!(
                "analyzer process {}: {}",
                how,
                String::from_utf8_lossy(&stderr).trim()
            )));
        }

        serde_json::from_slice::<Record>(trim_ascii(&stdout))
            .map_err(|e| WorkerCrash::new(format!("unparseable analyzer output: {}", e)))
    }
}

/// Reads a child pipe to the end on its own thread so a chatty child never
/// blocks on a full pipe.
fn read_pipe<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect_pipe(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Kills and reaps. Pipe readers are left to finish on their own.
fn kill_child(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!("Failed to kill analyzer process {}: {}", child.id(), e);
    }
    let _ = child.wait();
}

/// Result of one attempt at one item.
#[derive(Debug)]
pub struct WorkerReply {
    pub item: DiscoveredItem,
    /// 1 for the first attempt, 2 for the retry.
    pub attempt: u32,
    pub outcome: Result<Record, WorkerCrash>,
}

struct Job {
    item: DiscoveredItem,
    attempt: u32,
}

/// Fixed set of threads pulling jobs from one queue and pushing replies to another.
pub(crate) struct WorkerPool {
    jobs: Option<Sender<Job>>,
    replies: Receiver<WorkerReply>,
    handles: Vec<JoinHandle<()>>,
    cancel: Arc<AtomicBool>,
}

impl WorkerPool {
    pub(crate) fn spawn(worker: Arc<dyn Worker>, threads: usize, queue_depth: usize) -> Result<Self, Error> {
        let (job_tx, job_rx) = bounded::<Job>(queue_depth.max(1));
        let (reply_tx, reply_rx) = unbounded::<WorkerReply>();
        let cancel = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(threads);
        for id in 0..threads {
            let jobs = job_rx.clone();
            let replies = reply_tx.clone();
            let worker = Arc::clone(&worker);
            let cancel = Arc::clone(&cancel);
            let handle = thread::Builder::new()
                .name(format!("imgscan-worker-{}", id))
                .spawn(move || worker_loop(worker, jobs, replies, cancel))
                .map_err(|e| Error::WorkerPool(format!("failed to spawn worker {}: {}", id, e)))?;
            handles.push(handle);
        }
        debug!("Started {} workers", threads);

        Ok(Self {
            jobs: Some(job_tx),
            replies: reply_rx,
            handles,
            cancel,
        })
    }

    pub(crate) fn submit(&self, item: DiscoveredItem, attempt: u32) -> Result<(), Error> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| Error::WorkerPool("pool already closed".into()))?;
        jobs.send(Job { item, attempt })
            .map_err(|_| Error::WorkerPool("all workers exited".into()))
    }

    pub(crate) fn recv_timeout(&self, timeout: Duration) -> Result<Option<WorkerReply>, Error> {
        match self.replies.recv_timeout(timeout) {
            Ok(reply) => Ok(Some(reply)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::WorkerPool("all workers exited".into()))
            }
        }
    }

    /// Stops interruptible work in flight and drops queued jobs.
    pub(crate) fn terminate(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Closes the queue and waits for every worker to exit.
    pub(crate) fn join(mut self) {
        self.jobs.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("Worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for WorkerPool {
    /// Child processes of abandoned items are killed. Threads still busy
    /// in-process are detached; their replies are dropped.
    fn drop(&mut self) {
        self.terminate();
        self.jobs.take();
        if !self.handles.is_empty() {
            debug!("Detaching {} worker threads", self.handles.len());
        }
    }
}

fn worker_loop(
    worker: Arc<dyn Worker>,
    jobs: Receiver<Job>,
    replies: Sender<WorkerReply>,
    cancel: Arc<AtomicBool>,
) {
    for job in jobs.iter() {
        if cancel.load(Ordering::Acquire) {
            break;
        }
        let outcome = worker.run_cancellable(&job.item, &cancel);
        let reply = WorkerReply {
            item: job.item,
            attempt: job.attempt,
            outcome,
        };
        if replies.send(reply).is_err() {
            break;
        }
    }
}

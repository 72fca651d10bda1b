//! Resumable parallel scan: discovered items in, durable record batches out.

pub mod control;
pub mod scheduler;
pub mod worker;

pub use control::{ScanControl, ScanState, ScanStatus};
pub use scheduler::{ScanOutcome, ScanScheduler};
pub use worker::{InProcessWorker, SubprocessWorker, Worker, WorkerCrash, WorkerReply, ANALYZE_ITEM_COMMAND};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle of a running scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Running,
    /// No new submissions; outstanding replies are awaited up to the grace period.
    Draining,
    Stopped,
}

impl ScanState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ScanState::Running,
            1 => ScanState::Draining,
            _ => ScanState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ScanState::Running => 0,
            ScanState::Draining => 1,
            ScanState::Stopped => 2,
        }
    }
}

/// How a scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Completed,
    /// Drained after an interrupt. Re-running resumes where it stopped.
    Interrupted,
}

/// Shared handle to a scan's state. Cloning shares the state, so a signal
/// handler can hold one clone while the scheduler holds another.
///
/// Transitions only move forward: `Running -> Draining -> Stopped`.
#[derive(Debug, Clone)]
pub struct ScanControl {
    state: Arc<AtomicU8>,
}

impl Default for ScanControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanControl {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(ScanState::Running.as_u8())),
        }
    }

    pub fn state(&self) -> ScanState {
        ScanState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ScanState::Running
    }

    /// Running -> Draining. Returns `true` if this call made the transition.
    pub fn request_drain(&self) -> bool {
        self.state
            .compare_exchange(
                ScanState::Running.as_u8(),
                ScanState::Draining.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(crate) fn mark_stopped(&self) {
        self.state.store(ScanState::Stopped.as_u8(), Ordering::SeqCst);
    }
}

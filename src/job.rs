#![forbid(unsafe_code)]

//! Single-slot download job state shared between the HTTP handlers and the
//! background runner task.
//!
//! There is at most one job in flight per process. The tracker owns the only
//! snapshot of its progress plus the cancellation token bound to it; handlers
//! poll the snapshot, the runner advances it, and a cancel request flips the
//! token the adapter loop watches.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Lifecycle states of the job slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Starting,
    Downloading,
    Processing,
    Completed,
    Error,
    CancelRequested,
}

impl JobStatus {
    /// A new job may claim the slot only when nothing is running or the last
    /// run already settled.
    pub fn allows_start(self) -> bool {
        matches!(self, Self::Idle | Self::Completed | Self::Error)
    }

    /// Cancellation is meaningful only before the adapter has finished; a job
    /// that is already committing records must not be interrupted.
    pub fn accepts_cancel(self) -> bool {
        matches!(self, Self::Starting | Self::Downloading)
    }
}

/// Snapshot of the job slot as served by `GET /status`.
#[derive(Clone, Debug, Serialize)]
pub struct JobState {
    pub status: JobStatus,
    pub percentage: String,
    pub current_filename: String,
    pub speed: String,
    pub eta: String,
    pub owner_id: Option<String>,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobState {
    fn idle() -> Self {
        Self {
            status: JobStatus::Idle,
            percentage: "0%".to_string(),
            current_filename: String::new(),
            speed: String::new(),
            eta: String::new(),
            owner_id: None,
            cancel_requested: false,
            message: None,
        }
    }

    fn starting(owner_id: &str) -> Self {
        Self {
            status: JobStatus::Starting,
            percentage: "0%".to_string(),
            current_filename: "Initializing...".to_string(),
            speed: String::new(),
            eta: String::new(),
            owner_id: Some(owner_id.to_string()),
            cancel_requested: false,
            message: None,
        }
    }
}

/// Partial update applied by the runner; unset fields keep their value.
#[derive(Debug, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub percentage: Option<String>,
    pub current_filename: Option<String>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub message: Option<String>,
}

/// Cooperative cancellation handle bound to exactly one job.
///
/// `begin` issues a fresh token per job, so a handle kept around from an
/// earlier job can never cancel a later one.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Slot {
    state: JobState,
    token: CancelToken,
}

/// Process-wide store for the single job slot.
///
/// Safe under one writer (the runner) concurrent with many pollers and a
/// cancel request; every operation is one short mutex section and no lock is
/// ever held across the adapter call.
#[derive(Clone)]
pub struct JobTracker {
    slot: Arc<Mutex<Slot>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                state: JobState::idle(),
                token: CancelToken::new(),
            })),
        }
    }

    /// Claims the slot for a new job owned by `owner_id`.
    ///
    /// Returns `None` while another job is active. On success the slot is
    /// reset to a fresh `starting` state (percentage back to 0%, cancel flag
    /// cleared) and the returned token is the one the new job must watch.
    /// Check and reset share one critical section so two concurrent starts
    /// cannot both claim the slot.
    pub fn begin(&self, owner_id: &str) -> Option<CancelToken> {
        let mut slot = self.slot.lock();
        if !slot.state.status.allows_start() {
            return None;
        }
        slot.state = JobState::starting(owner_id);
        slot.token = CancelToken::new();
        Some(slot.token.clone())
    }

    /// Returns the current snapshot without side effects.
    pub fn observe(&self) -> JobState {
        self.slot.lock().state.clone()
    }

    /// Advances the snapshot; only the active runner calls this.
    pub fn apply(&self, update: JobUpdate) {
        let mut slot = self.slot.lock();
        let state = &mut slot.state;
        if let Some(status) = update.status {
            state.status = status;
        }
        if let Some(percentage) = update.percentage {
            state.percentage = percentage;
        }
        if let Some(current_filename) = update.current_filename {
            state.current_filename = current_filename;
        }
        if let Some(speed) = update.speed {
            state.speed = speed;
        }
        if let Some(eta) = update.eta {
            state.eta = eta;
        }
        if let Some(message) = update.message {
            state.message = Some(message);
        }
    }

    /// Terminates the job as failed with a human-readable cause.
    pub fn fail(&self, message: impl Into<String>) {
        self.apply(JobUpdate {
            status: Some(JobStatus::Error),
            message: Some(message.into()),
            ..JobUpdate::default()
        });
    }

    /// Requests cancellation of the active job.
    ///
    /// Succeeds only while the job is `starting` or `downloading`: the flag
    /// and status flip together and the job's token is triggered, to be
    /// observed at the next progress event. Any other status reports "no
    /// active job" by returning false.
    pub fn request_cancel(&self) -> bool {
        let mut slot = self.slot.lock();
        if !slot.state.status.accepts_cancel() {
            return false;
        }
        slot.state.cancel_requested = true;
        slot.state.status = JobStatus::CancelRequested;
        slot.token.cancel();
        true
    }
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

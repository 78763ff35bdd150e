//! Core data model.
//!
//! A job is an item reserved from the queue server. The server owns it; this
//! process only holds a handle while a worker is processing it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default priority for enqueued jobs. Lower is more urgent.
pub const DEFAULT_PRIORITY: u32 = 50;

/// Default time-to-run, in seconds, requested by the producer.
pub const DEFAULT_TTR: u32 = 60;

/// Extra seconds added to every submitted time-to-run so this process times
/// a job out before the server reclaims it.
pub const TTR_PADDING: u32 = 2;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Server-assigned job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reserved job: identifier plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub body: Vec<u8>,
}

/// Queue-reported metadata for a single job (`stats-job`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobStats {
    pub id: JobId,
    pub tube: String,
    /// "ready", "delayed", "reserved" or "buried".
    pub state: String,
    pub pri: u32,
    /// Seconds since the job was created.
    pub age: u64,
    /// Delay, in seconds, the job was last put or released with.
    pub delay: u32,
    pub ttr: u32,
    /// Seconds until the server reclaims a reserved job (or a delayed job
    /// becomes ready).
    pub time_left: u64,
    pub reserves: u32,
    pub timeouts: u32,
    pub releases: u32,
    pub buries: u32,
}

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Lifecycle state of one reserved job inside a JobRunner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Reserved, strategy not started.
    New,
    /// Strategy running.
    Running,
    /// Strategy succeeded; job is being deleted.
    Succeeded,
    /// Deadline passed before the strategy resolved.
    TimedOut,
    /// Strategy failed or raised.
    Failed,
    /// Disposed of. Terminal.
    Done,
}

impl JobState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (New, Running)
                | (New, Failed)     // stats unavailable, never started
                | (Running, Succeeded)
                | (Running, TimedOut)
                | (Running, Failed)
                | (Succeeded, Done)
                | (TimedOut, Done)
                | (Failed, Done)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        self == JobState::Done
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::New => "new",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::TimedOut => "timed_out",
            JobState::Failed => "failed",
            JobState::Done => "done",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Strategy outcome
// ---------------------------------------------------------------------------

/// Why a strategy did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    /// Worth retrying later; the job is released with a decayed delay.
    #[error("failed: {}", .reason.as_deref().unwrap_or("no reason given"))]
    Retry { reason: Option<String> },

    /// Retrying cannot help; the job is deleted.
    #[error("failed, not retrying: {}", .reason.as_deref().unwrap_or("no reason given"))]
    NoRetry { reason: Option<String> },

    /// The job ran past its deadline.
    #[error("timed out")]
    TimedOut,
}

impl Failure {
    pub fn retry(reason: impl Into<String>) -> Self {
        Failure::Retry {
            reason: Some(reason.into()),
        }
    }

    pub fn no_retry(reason: impl Into<String>) -> Self {
        Failure::NoRetry {
            reason: Some(reason.into()),
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Failure::Retry { reason } | Failure::NoRetry { reason } => reason.as_deref(),
            Failure::TimedOut => Some("timed_out"),
        }
    }

    /// Short stable label for logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            Failure::Retry { .. } => "retry",
            Failure::NoRetry { .. } => "no_retry",
            Failure::TimedOut => "timed_out",
        }
    }
}

/// Outcome a strategy reports through its deferred.
pub type StrategyResult = std::result::Result<(), Failure>;

// ---------------------------------------------------------------------------
// Enqueue options
// ---------------------------------------------------------------------------

/// Options a producer attaches to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub(crate) priority: u32,
    pub(crate) ttr: u32,
    pub(crate) delay: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            ttr: DEFAULT_TTR,
            delay: 0,
        }
    }
}

impl EnqueueOptions {
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Time-to-run in seconds, before padding.
    pub fn ttr(mut self, seconds: u32) -> Self {
        self.ttr = seconds;
        self
    }

    /// Seconds before the job becomes reservable.
    pub fn delay(mut self, seconds: u32) -> Self {
        self.delay = seconds;
        self
    }

    /// The options as submitted to the queue, with padded TTR.
    pub(crate) fn to_put(self) -> PutOptions {
        PutOptions {
            priority: self.priority,
            delay: self.delay,
            ttr: self.ttr.saturating_add(TTR_PADDING),
        }
    }
}

/// Raw `put` parameters understood by a queue client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOptions {
    pub priority: u32,
    pub delay: u32,
    pub ttr: u32,
}

impl Default for PutOptions {
    fn default() -> Self {
        EnqueueOptions::default().to_put()
    }
}

//! Scheduler data models.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capsule::JobId;

/// A persisted timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Timer id (shared with the capsule record).
    pub job_id: JobId,
    /// When the timer should fire.
    pub fire_at: DateTime<Utc>,
    /// Opaque arguments handed to the handler.
    pub args: serde_json::Value,
}

/// A pending timer as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingJob {
    /// Timer id.
    pub job_id: JobId,
    /// Next (and only) fire time.
    pub fire_at: DateTime<Utc>,
}

/// Result of one handler run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    /// Whether the run achieved its purpose.
    pub success: bool,
    /// Human-readable summary.
    pub message: String,
}

impl JobOutcome {
    /// A successful outcome.
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    /// A failed outcome.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Why a claimed timer did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    /// It was claimed later than the misfire grace allows.
    GraceExpired,
    /// Too many runs of the same job id were already in flight.
    InstanceLimit,
}

/// Work executed when a timer fires.
pub trait JobHandler: Send + Sync + 'static {
    /// Runs a fired job.
    fn run(&self, job: Job) -> impl Future<Output = JobOutcome> + Send;

    /// Called instead of [`run`](Self::run) when a claimed job is skipped.
    /// The timer is already gone when this is called.
    fn missed(&self, job: Job, reason: MissReason) -> impl Future<Output = ()> + Send;
}

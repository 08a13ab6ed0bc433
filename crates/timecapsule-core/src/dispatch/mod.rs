//! Delivery of unlocked capsules.
//!
//! The [`Dispatcher`] is the scheduler's [`JobHandler`]: when a timer fires
//! it loads the capsule, composes the email, sends it and records the
//! outcome. Attachments are deleted only after a successful send.

mod compose;
mod transport;

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub use compose::{Composed, compose, html_body, subject};
pub use transport::{DeliveryError, OutboundMessage, SmtpTransport, Transport};

use crate::capsule::{Capsule, CapsuleStatus, CapsuleStore, JobId};
use crate::scheduler::{Job, JobHandler, JobOutcome, MissReason};
use crate::uploads;

/// Arguments stored with each timer. Only the id is persisted, so message
/// bodies never leave the encrypted store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchArgs {
    /// Capsule to deliver.
    pub job_id: JobId,
}

/// Sends capsules when their timers fire.
#[derive(Debug)]
pub struct Dispatcher<T> {
    store: Arc<CapsuleStore>,
    transport: T,
    sender: String,
}

impl<T: Transport> Dispatcher<T> {
    /// Creates a dispatcher sending from `sender`.
    pub fn new(store: Arc<CapsuleStore>, transport: T, sender: impl Into<String>) -> Self {
        Self {
            store,
            transport,
            sender: sender.into(),
        }
    }

    /// Delivers the capsule identified by `job_id` and records the outcome.
    pub async fn dispatch(&self, job_id: &JobId) -> JobOutcome {
        let capsule = match self.store.get(job_id).await {
            Ok(capsule) => capsule,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "cannot load capsule");
                return JobOutcome::failed(format!("capsule unavailable: {e}"));
            }
        };

        if capsule.status.is_terminal() {
            tracing::info!(job_id = %job_id, status = %capsule.status, "capsule already final, nothing to send");
            return JobOutcome::ok(format!("already {}", capsule.status));
        }

        tracing::info!(job_id = %job_id, recipient = %capsule.recipient, "sending time capsule");
        match self.deliver_now(&capsule).await {
            Ok(attached) => {
                self.record(job_id, CapsuleStatus::Sent).await;
                uploads::remove_files(&attached).await;
                tracing::info!(job_id = %job_id, recipient = %capsule.recipient, "email sent successfully");
                JobOutcome::ok("Email sent successfully")
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "delivery failed");
                self.record(job_id, CapsuleStatus::Failed).await;
                JobOutcome::failed(e.to_string())
            }
        }
    }

    /// Composes and sends `capsule` without touching the store.
    ///
    /// Returns the files that were attached.
    ///
    /// # Errors
    ///
    /// Returns the composition or transport failure.
    pub async fn deliver_now(
        &self,
        capsule: &Capsule,
    ) -> Result<Vec<std::path::PathBuf>, DeliveryError> {
        let composed = compose(capsule, &self.sender).await?;
        self.transport.send(&composed.message).await?;
        Ok(composed.attached)
    }

    /// Status updates are best-effort; failures are logged.
    async fn record(&self, job_id: &JobId, status: CapsuleStatus) {
        let sent_at = (status == CapsuleStatus::Sent).then(Utc::now);
        if let Err(e) = self.store.set_status(job_id, status, sent_at).await {
            tracing::error!(job_id = %job_id, status = %status, error = %e, "failed to update capsule status");
        }
    }
}

impl<T: Transport> JobHandler for Dispatcher<T> {
    async fn run(&self, job: Job) -> JobOutcome {
        let job_id = serde_json::from_value::<DispatchArgs>(job.args)
            .map_or(job.job_id, |args| args.job_id);
        self.dispatch(&job_id).await
    }

    async fn missed(&self, job: Job, reason: MissReason) {
        match reason {
            MissReason::GraceExpired => {
                tracing::warn!(job_id = %job.job_id, fire_at = %job.fire_at, "capsule missed its delivery window");
                self.record(&job.job_id, CapsuleStatus::Failed).await;
            }
            MissReason::InstanceLimit => {
                tracing::warn!(job_id = %job.job_id, "capsule delivery skipped: instance limit reached");
            }
        }
    }
}

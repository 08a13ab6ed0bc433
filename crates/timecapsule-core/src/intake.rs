//! Capsule intake.
//!
//! Turns a submission into a stored, scheduled capsule, or into a
//! structured rejection with nothing committed. Steps run in a fixed order:
//! field checks, attachment checks, time resolution, encrypted write, then
//! timer registration. Staged attachment files are removed whenever the
//! request does not end in an accepted capsule.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::capsule::{Capsule, CapsuleStore, JobId};
use crate::dispatch::DispatchArgs;
use crate::scheduler::Scheduler;
use crate::uploads;
use crate::{Config, Error, Result, ValidationError};

/// When the capsule should unlock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockAt {
    /// Wall-clock date (`YYYY-MM-DD`) and time (`HH:MM`) in the configured zone.
    Local {
        /// Date part.
        date: String,
        /// Time part.
        time: String,
    },
    /// An already-resolved instant.
    Instant(DateTime<Utc>),
}

/// A capsule submission.
#[derive(Debug, Clone)]
pub struct CapsuleRequest {
    /// Recipient address.
    pub recipient: String,
    /// Message body.
    pub message: String,
    /// Unlock moment.
    pub unlock: UnlockAt,
    /// Files already staged in the upload folder, in order.
    pub attachments: Vec<PathBuf>,
}

impl CapsuleRequest {
    /// A request with a wall-clock unlock time.
    pub fn new(
        recipient: impl Into<String>,
        message: impl Into<String>,
        unlock_date: impl Into<String>,
        unlock_time: impl Into<String>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            message: message.into(),
            unlock: UnlockAt::Local {
                date: unlock_date.into(),
                time: unlock_time.into(),
            },
            attachments: Vec::new(),
        }
    }

    /// A request with a resolved unlock instant.
    pub fn with_unlock_at(
        recipient: impl Into<String>,
        message: impl Into<String>,
        unlock_at: DateTime<Utc>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            message: message.into(),
            unlock: UnlockAt::Instant(unlock_at),
            attachments: Vec::new(),
        }
    }

    /// Adds staged attachment files.
    #[must_use]
    pub fn attachments(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.attachments.extend(paths);
        self
    }
}

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeResponse {
    /// Id of the accepted capsule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// Whether the capsule was stored and scheduled.
    pub accepted: bool,
    /// Message for the person submitting.
    pub message: String,
    /// Machine-readable rejection kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IntakeResponse {
    fn accepted(job_id: JobId, local: DateTime<Tz>) -> Self {
        Self {
            job_id: Some(job_id),
            accepted: true,
            message: format!(
                "⏳ Time Capsule scheduled successfully for {} at {}!",
                local.format("%Y-%m-%d"),
                local.format("%H:%M")
            ),
            error: None,
        }
    }

    fn rejected(err: &Error) -> Self {
        let (message, kind) = match err {
            Error::Validation(v) => (rejection_message(v), v.kind()),
            Error::DuplicateJob(_) => (
                "A capsule with this id is already scheduled".to_string(),
                "duplicate_job",
            ),
            _ => (
                "Could not schedule the time capsule. Please try again.".to_string(),
                "unavailable",
            ),
        };
        Self {
            job_id: None,
            accepted: false,
            message,
            error: Some(kind.to_string()),
        }
    }
}

fn rejection_message(err: &ValidationError) -> String {
    match err {
        ValidationError::MissingField(_) => "Please fill all fields".into(),
        ValidationError::InvalidRecipient(_) => "Invalid email address".into(),
        ValidationError::InvalidDateTime(_) => "Invalid date or time format".into(),
        ValidationError::NotInFuture => "⚠️ Scheduled time must be in the future!".into(),
        other => other.to_string(),
    }
}

/// Trimmed unlock input.
enum Unlock<'a> {
    Wall(&'a str, &'a str),
    Resolved(DateTime<Utc>),
}

/// Limits applied to every submission.
#[derive(Debug, Clone)]
pub struct IntakePolicy {
    /// Zone unlock times are read in.
    pub zone: Tz,
    /// Allowed attachment extensions.
    pub allowed_extensions: Vec<String>,
    /// Ceiling on the combined attachment size.
    pub max_upload_bytes: u64,
}

impl IntakePolicy {
    /// Reads the policy from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the zone is unknown.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            zone: config.zone()?,
            allowed_extensions: config.allowed_extensions.clone(),
            max_upload_bytes: config.max_upload_bytes,
        })
    }
}

/// Accepts capsule submissions.
#[derive(Debug, Clone)]
pub struct Intake {
    store: Arc<CapsuleStore>,
    scheduler: Scheduler,
    policy: IntakePolicy,
}

impl Intake {
    /// Creates an intake writing to `store` and registering on `scheduler`.
    #[must_use]
    pub const fn new(store: Arc<CapsuleStore>, scheduler: Scheduler, policy: IntakePolicy) -> Self {
        Self {
            store,
            scheduler,
            policy,
        }
    }

    /// The active policy.
    #[must_use]
    pub const fn policy(&self) -> &IntakePolicy {
        &self.policy
    }

    /// Validates, stores and schedules a capsule.
    pub async fn create_capsule(&self, request: CapsuleRequest) -> IntakeResponse {
        self.create_capsule_at(request, Utc::now()).await
    }

    /// [`create_capsule`](Self::create_capsule) with an explicit clock.
    pub async fn create_capsule_at(
        &self,
        request: CapsuleRequest,
        now: DateTime<Utc>,
    ) -> IntakeResponse {
        match self.accept(&request, now).await {
            Ok((job_id, unlock_at)) => {
                tracing::info!(
                    job_id = %job_id,
                    recipient = %request.recipient.trim(),
                    unlock_at = %unlock_at,
                    attachments = request.attachments.len(),
                    "time capsule scheduled"
                );
                IntakeResponse::accepted(job_id, unlock_at.with_timezone(&self.policy.zone))
            }
            Err(e) => {
                match &e {
                    Error::Validation(v) => tracing::info!(reason = %v, "capsule rejected"),
                    other => tracing::error!(error = %other, "capsule intake failed"),
                }
                uploads::remove_files(&request.attachments).await;
                IntakeResponse::rejected(&e)
            }
        }
    }

    async fn accept(
        &self,
        request: &CapsuleRequest,
        now: DateTime<Utc>,
    ) -> Result<(JobId, DateTime<Utc>)> {
        let recipient = request.recipient.trim();
        let message = request.message.trim();
        if recipient.is_empty() {
            return Err(ValidationError::MissingField("recipient").into());
        }
        if message.is_empty() {
            return Err(ValidationError::MissingField("message").into());
        }
        let unlock = match &request.unlock {
            UnlockAt::Local { date, time } => {
                let (date, time) = (date.trim(), time.trim());
                if date.is_empty() {
                    return Err(ValidationError::MissingField("unlock_date").into());
                }
                if time.is_empty() {
                    return Err(ValidationError::MissingField("unlock_time").into());
                }
                Unlock::Wall(date, time)
            }
            UnlockAt::Instant(at) => Unlock::Resolved(*at),
        };

        if !recipient.contains('@') {
            return Err(ValidationError::InvalidRecipient(recipient.to_string()).into());
        }

        self.check_attachments(&request.attachments).await?;

        let unlock_at = match unlock {
            Unlock::Wall(date, time) => resolve_local(self.policy.zone, date, time)?,
            Unlock::Resolved(at) => at,
        };
        if unlock_at <= now {
            return Err(ValidationError::NotInFuture.into());
        }

        let job_id = JobId::generate(recipient, now);
        let capsule = Capsule::new(
            job_id.clone(),
            recipient,
            message,
            unlock_at,
            self.policy.zone,
            request.attachments.clone(),
        );
        self.store.put(&capsule).await?;

        let args = serde_json::to_value(DispatchArgs {
            job_id: job_id.clone(),
        })?;
        if let Err(e) = self.scheduler.schedule(&job_id, unlock_at, args).await {
            if let Err(discard) = self.store.discard(&job_id).await {
                tracing::error!(job_id = %job_id, error = %discard, "failed to discard unscheduled capsule");
            }
            return Err(e);
        }

        Ok((job_id, unlock_at))
    }

    async fn check_attachments(&self, paths: &[PathBuf]) -> Result<()> {
        let mut total: u64 = 0;
        for path in paths {
            let name = uploads::original_name(path);
            if !uploads::is_allowed(&name, &self.policy.allowed_extensions) {
                return Err(ValidationError::DisallowedExtension(name).into());
            }
            let meta = tokio::fs::metadata(path)
                .await
                .ok()
                .filter(std::fs::Metadata::is_file)
                .ok_or_else(|| ValidationError::AttachmentMissing(path.clone()))?;
            total = total.saturating_add(meta.len());
        }
        if total > self.policy.max_upload_bytes {
            return Err(ValidationError::AttachmentsTooLarge {
                total,
                limit: self.policy.max_upload_bytes,
            }
            .into());
        }
        Ok(())
    }
}

/// Resolves a wall-clock date and time in `zone`.
///
/// Ambiguous times (clocks going back) take the earlier instant.
///
/// # Errors
///
/// [`ValidationError::InvalidDateTime`] for unparsable input and
/// [`ValidationError::NonexistentLocalTime`] for times skipped by a
/// transition.
pub fn resolve_local(zone: Tz, date: &str, time: &str) -> Result<DateTime<Utc>> {
    let invalid = || ValidationError::InvalidDateTime(format!("{date} {time}"));
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| invalid())?;
    let time = NaiveTime::parse_from_str(time, "%H:%M").map_err(|_| invalid())?;
    let naive = date.and_time(time);
    zone.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| ValidationError::NonexistentLocalTime(naive.to_string()).into())
}

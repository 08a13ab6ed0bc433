//! Capsule data models.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

static JOB_SEQ: AtomicU64 = AtomicU64::new(0);

/// Longest recipient fragment kept in a generated id.
const RECIPIENT_CHARS: usize = 64;

/// Longest id accepted, leaving room for the object and temp-file wrapping
/// inside a 255-byte file name.
const MAX_ID_LEN: usize = 200;

/// Identifier shared by a capsule record and its timer.
///
/// Only `[A-Za-z0-9._@+-]` and `_` appear, so the id is always safe inside a
/// file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generates a fresh id of the form
    /// `capsule_<unix-micros>_<seq>_<recipient>`, keeping at most the first
    /// 64 characters of the recipient.
    #[must_use]
    pub fn generate(recipient: &str, now: DateTime<Utc>) -> Self {
        let seq = JOB_SEQ.fetch_add(1, Ordering::Relaxed);
        let recipient: String = recipient
            .chars()
            .take(RECIPIENT_CHARS)
            .map(|c| if is_id_char(c) { c } else { '_' })
            .collect();
        Self(format!(
            "capsule_{}_{seq}_{recipient}",
            now.timestamp_micros()
        ))
    }

    /// Parses an id supplied from outside (CLI arguments, stored rows).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for ids that could never have been issued.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() || raw.len() > MAX_ID_LEN || !raw.chars().all(is_id_char) || raw.starts_with('.') {
            return Err(Error::NotFound(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the encrypted object holding this capsule.
    #[must_use]
    pub fn object_name(&self) -> String {
        format!("capsule_{}.enc", self.0)
    }
}

const fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '+' | '-')
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Delivery status of a capsule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapsuleStatus {
    /// Waiting for its unlock time.
    Scheduled,
    /// Delivered; attachments deleted.
    Sent,
    /// Delivery failed or was missed; attachments kept.
    Failed,
}

impl CapsuleStatus {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }

    /// Only `Scheduled -> Sent` and `Scheduled -> Failed` are allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Scheduled, Self::Sent | Self::Failed)
        )
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CapsuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message sealed until its unlock time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capsule {
    /// Shared id of the record and its timer.
    pub job_id: JobId,
    /// Recipient address.
    pub recipient: String,
    /// Message body. Never leaves the encrypted store except in the email.
    pub message: String,
    /// When the capsule opens.
    pub unlock_at: DateTime<Utc>,
    /// Zone the unlock time was entered in and is rendered in.
    pub zone: Tz,
    /// Staged attachment paths, in order.
    pub attachments: Vec<PathBuf>,
    /// Delivery status.
    pub status: CapsuleStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Delivery time, once sent.
    pub sent_at: Option<DateTime<Utc>>,
    /// Bumped on every rewrite of the record.
    #[serde(default)]
    pub revision: u64,
}

impl Capsule {
    /// Creates a new `Scheduled` capsule.
    #[must_use]
    pub fn new(
        job_id: JobId,
        recipient: impl Into<String>,
        message: impl Into<String>,
        unlock_at: DateTime<Utc>,
        zone: Tz,
        attachments: Vec<PathBuf>,
    ) -> Self {
        Self {
            job_id,
            recipient: recipient.into(),
            message: message.into(),
            unlock_at,
            zone,
            attachments,
            status: CapsuleStatus::Scheduled,
            created_at: Utc::now(),
            sent_at: None,
            revision: 0,
        }
    }

    /// Unlock time in the capsule's zone.
    #[must_use]
    pub fn unlock_local(&self) -> DateTime<Tz> {
        self.unlock_at.with_timezone(&self.zone)
    }

    /// Projection without the message body.
    #[must_use]
    pub fn summary(&self) -> CapsuleSummary {
        CapsuleSummary {
            job_id: self.job_id.clone(),
            recipient: self.recipient.clone(),
            unlock_at: self.unlock_at,
            created_at: self.created_at,
            status: self.status,
            sent_at: self.sent_at,
            attachment_count: self.attachments.len(),
        }
    }
}

/// What operational reads may show about a capsule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleSummary {
    /// Job id.
    pub job_id: JobId,
    /// Recipient address.
    pub recipient: String,
    /// When the capsule opens.
    pub unlock_at: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Delivery status.
    pub status: CapsuleStatus,
    /// Delivery time, once sent.
    pub sent_at: Option<DateTime<Utc>>,
    /// Number of attachments.
    pub attachment_count: usize,
}

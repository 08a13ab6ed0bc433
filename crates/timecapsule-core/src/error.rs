//! Error types for the core library.

use std::path::PathBuf;

use thiserror::Error;

use crate::capsule::CapsuleStatus;
use crate::codec::CodecError;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A capsule request was rejected before anything was stored.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A timer with this job id already exists.
    #[error("Job already scheduled: {0}")]
    DuplicateJob(String),

    /// A stored record could not be encrypted or decrypted.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A listed record could not be read back.
    #[error("Unreadable capsule object {object}: {reason}")]
    Unreadable {
        /// File name of the object.
        object: String,
        /// What went wrong.
        reason: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// No capsule with this job id.
    #[error("Capsule not found: {0}")]
    NotFound(String),

    /// The requested status change is not allowed.
    #[error("Capsule {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Capsule job id.
        job_id: String,
        /// Current status.
        from: CapsuleStatus,
        /// Requested status.
        to: CapsuleStatus,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic failure shown to operational callers.
    #[error("Service temporarily unavailable")]
    Unavailable,
}

/// Reasons a capsule request is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is empty.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// The recipient does not look like an email address.
    #[error("Invalid recipient address: {0}")]
    InvalidRecipient(String),

    /// The attachment's extension is not on the allow list.
    #[error("File type not allowed: {0}")]
    DisallowedExtension(String),

    /// Nothing usable is left of the uploaded file name.
    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),

    /// The attachment does not exist on disk.
    #[error("Attachment not found: {}", .0.display())]
    AttachmentMissing(PathBuf),

    /// The attachments together exceed the upload ceiling.
    #[error("Attachments total {total} bytes, limit is {limit}")]
    AttachmentsTooLarge {
        /// Combined size in bytes.
        total: u64,
        /// Configured ceiling.
        limit: u64,
    },

    /// Date or time could not be parsed.
    #[error("Invalid date/time: {0}")]
    InvalidDateTime(String),

    /// The wall-clock time does not exist in the configured zone.
    #[error("Local time {0} does not exist in the configured time zone")]
    NonexistentLocalTime(String),

    /// The unlock time is not strictly in the future.
    #[error("Unlock time must be in the future")]
    NotInFuture,
}

impl ValidationError {
    /// Stable, machine-readable name of the rejection.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MissingField(_) => "missing_field",
            Self::InvalidRecipient(_) => "invalid_recipient",
            Self::DisallowedExtension(_) => "disallowed_extension",
            Self::InvalidFileName(_) => "invalid_file_name",
            Self::AttachmentMissing(_) => "attachment_missing",
            Self::AttachmentsTooLarge { .. } => "attachments_too_large",
            Self::InvalidDateTime(_) => "invalid_datetime",
            Self::NonexistentLocalTime(_) => "nonexistent_local_time",
            Self::NotInFuture => "not_in_future",
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

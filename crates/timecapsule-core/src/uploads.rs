//! Attachment staging.
//!
//! Uploaded files are written into the upload folder under a sanitized name
//! with a `YYYYmmdd_HHMMSS_ffffff_` prefix. The prefix keeps concurrent
//! uploads of the same name apart and is stripped again when the file is
//! attached to the outgoing email.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::{Result, ValidationError};

/// Length of `YYYYmmdd_HHMMSS_ffffff_`.
const PREFIX_LEN: usize = 23;

/// Reduces a client-supplied name to `[A-Za-z0-9_.-]`.
///
/// Path separators and runs of whitespace become `_`, non-ASCII characters
/// are dropped, and leading or trailing dots and underscores are trimmed.
/// Returns `None` if nothing is left.
#[must_use]
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let spaced: String = name
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    let trimmed = kept.trim_matches(|c| c == '.' || c == '_');
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Whether `name` has an extension on the allow list (case-insensitive).
#[must_use]
pub fn is_allowed(name: &str, allowed: &[String]) -> bool {
    name.rsplit_once('.').is_some_and(|(_, ext)| {
        allowed
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(ext))
    })
}

/// Writes `bytes` into `upload_dir` under a sanitized, time-prefixed name.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidFileName`] if the name sanitizes to
/// nothing, or an I/O error if the file cannot be written.
pub async fn stage(
    upload_dir: &Path,
    original_name: &str,
    bytes: &[u8],
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    let clean = sanitize_file_name(original_name)
        .ok_or_else(|| ValidationError::InvalidFileName(original_name.to_string()))?;
    tokio::fs::create_dir_all(upload_dir).await?;

    let path = upload_dir.join(format!("{}_{clean}", now.format("%Y%m%d_%H%M%S_%6f")));
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await?;
    let written = async {
        file.write_all(bytes).await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    discard_on_error(&path, written).await?;

    tracing::info!(path = %path.display(), size = bytes.len(), "file staged");
    Ok(path)
}

/// Removes a partially written upload if writing it failed.
async fn discard_on_error(path: &Path, written: std::io::Result<()>) -> Result<()> {
    if let Err(e) = written {
        if let Err(remove) = tokio::fs::remove_file(path).await {
            tracing::warn!(path = %path.display(), error = %remove, "could not remove partial upload");
        }
        return Err(e.into());
    }
    Ok(())
}

/// The name the sender gave the file, without the staging prefix.
#[must_use]
pub fn original_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if has_stage_prefix(&name) {
        name[PREFIX_LEN..].to_string()
    } else {
        name
    }
}

fn has_stage_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() > PREFIX_LEN
        && bytes[..PREFIX_LEN].iter().enumerate().all(|(i, b)| match i {
            8 | 15 | 22 => *b == b'_',
            _ => b.is_ascii_digit(),
        })
}

/// Deletes files, logging instead of failing. Missing files are ignored.
pub async fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::info!(path = %path.display(), "file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(path = %path.display(), error = %e, "failed to remove file"),
        }
    }
}

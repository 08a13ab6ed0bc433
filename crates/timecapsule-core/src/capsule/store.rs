//! Encrypted, directory-backed capsule storage.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use super::model::{Capsule, CapsuleStatus, CapsuleSummary, JobId};
use crate::codec::Codec;
use crate::{Error, Result};

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Stores one encrypted object per capsule at
/// `<dir>/capsule_<job_id>.enc`.
///
/// Mutations of the same capsule are serialized within this process.
/// Across processes, exclusivity comes from the scheduler's single-fire
/// claim: only the process that claimed a timer mutates its record.
#[derive(Debug)]
pub struct CapsuleStore {
    dir: PathBuf,
    codec: Codec,
    locks: Mutex<HashMap<JobId, Arc<tokio::sync::Mutex<()>>>>,
}

impl CapsuleStore {
    /// Opens the store, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>, codec: Codec) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            codec,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding the objects.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, job_id: &JobId) -> PathBuf {
        self.dir.join(job_id.object_name())
    }

    fn lock_for(&self, job_id: &JobId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(job_id.clone()).or_default())
    }

    /// Encrypts and writes a capsule, replacing any previous version.
    ///
    /// The write goes to a temporary sibling that is synced and renamed into
    /// place, so readers never observe a partially written object.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption or any file operation fails.
    pub async fn put(&self, capsule: &Capsule) -> Result<()> {
        let lock = self.lock_for(&capsule.job_id);
        let _guard = lock.lock().await;
        self.write(capsule).await
    }

    async fn write(&self, capsule: &Capsule) -> Result<()> {
        let sealed = self.codec.encrypt(capsule)?;
        let target = self.path_for(&capsule.job_id);
        let tmp = self.dir.join(format!(
            ".{}.{}.tmp",
            capsule.job_id.object_name(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&sealed).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &target).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tracing::debug!(job_id = %capsule.job_id, revision = capsule.revision, "capsule written");
        Ok(())
    }

    /// Reads and decrypts a capsule.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if no object exists, [`Error::Codec`] if it exists
    /// but cannot be decrypted.
    pub async fn get(&self, job_id: &JobId) -> Result<Capsule> {
        let bytes = match tokio::fs::read(self.path_for(job_id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(job_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(self.codec.decrypt(&bytes)?)
    }

    /// Changes the status (and `sent_at`) of a capsule.
    ///
    /// Only the status fields change; `revision` is bumped.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] if the move is not allowed, plus the
    /// errors of [`get`](Self::get) and [`put`](Self::put).
    pub async fn set_status(
        &self,
        job_id: &JobId,
        status: CapsuleStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<Capsule> {
        let lock = self.lock_for(job_id);
        let _guard = lock.lock().await;

        let mut capsule = self.get(job_id).await?;
        if !capsule.status.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                job_id: job_id.to_string(),
                from: capsule.status,
                to: status,
            });
        }
        capsule.status = status;
        capsule.sent_at = sent_at;
        capsule.revision += 1;
        self.write(&capsule).await?;

        tracing::info!(job_id = %job_id, status = %status, "capsule status updated");
        Ok(capsule)
    }

    /// Removes an object that never became live. Missing objects are fine.
    pub(crate) async fn discard(&self, job_id: &JobId) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(job_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lazily iterates summaries of every stored capsule.
    ///
    /// Each item is read and decrypted only when the iterator reaches it.
    /// Unreadable objects yield [`Error::Unreadable`] instead of being
    /// skipped. The order is unspecified.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn list(&self) -> Result<CapsuleIter<'_>> {
        Ok(CapsuleIter {
            entries: std::fs::read_dir(&self.dir)?,
            codec: &self.codec,
        })
    }
}

/// Iterator returned by [`CapsuleStore::list`].
#[derive(Debug)]
pub struct CapsuleIter<'a> {
    entries: std::fs::ReadDir,
    codec: &'a Codec,
}

impl Iterator for CapsuleIter<'_> {
    type Item = Result<CapsuleSummary>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            let object = entry.file_name().to_string_lossy().into_owned();
            if object.starts_with('.') || !object.ends_with(".enc") {
                continue;
            }

            let unreadable = |reason: String| Error::Unreadable {
                object: object.clone(),
                reason,
            };
            let summary = std::fs::read(entry.path())
                .map_err(|e| unreadable(e.to_string()))
                .and_then(|bytes| {
                    self.codec
                        .decrypt::<Capsule>(&bytes)
                        .map_err(|e| unreadable(e.to_string()))
                })
                .map(|capsule| capsule.summary());
            return Some(summary);
        }
    }
}

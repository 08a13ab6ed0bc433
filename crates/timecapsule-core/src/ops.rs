//! Operational reads: pending timers and capsule metadata.
//!
//! Nothing here ever returns a message body. Internal failures are logged
//! and surfaced as [`Error::Unavailable`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capsule::{CapsuleStore, CapsuleSummary, JobId};
use crate::scheduler::{PendingJob, Scheduler};
use crate::{Error, Result};

/// One entry of [`list_capsules`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum CapsuleListing {
    /// A readable record.
    Available(CapsuleSummary),
    /// A record that exists but cannot be decrypted or parsed.
    Unavailable {
        /// File name of the object.
        object: String,
    },
}

/// Pending timers, earliest first.
///
/// # Errors
///
/// [`Error::Unavailable`] if the job store cannot be read.
pub async fn list_pending_jobs(scheduler: &Scheduler) -> Result<Vec<PendingJob>> {
    scheduler.list_pending().await.map_err(|e| {
        tracing::error!(error = %e, "failed to list pending jobs");
        Error::Unavailable
    })
}

/// Metadata of every stored capsule, readable or not.
///
/// # Errors
///
/// [`Error::Unavailable`] if the capsule directory cannot be read.
pub async fn list_capsules(store: Arc<CapsuleStore>) -> Result<Vec<CapsuleListing>> {
    let listing = tokio::task::spawn_blocking(move || -> Result<Vec<CapsuleListing>> {
        let mut out = Vec::new();
        for item in store.list()? {
            match item {
                Ok(summary) => out.push(CapsuleListing::Available(summary)),
                Err(Error::Unreadable { object, reason }) => {
                    tracing::warn!(object = %object, reason = %reason, "unreadable capsule");
                    out.push(CapsuleListing::Unavailable { object });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    })
    .await;

    match listing {
        Ok(Ok(listing)) => Ok(listing),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "failed to list capsules");
            Err(Error::Unavailable)
        }
        Err(e) => {
            tracing::error!(error = %e, "capsule listing task failed");
            Err(Error::Unavailable)
        }
    }
}

/// Metadata of one capsule.
///
/// # Errors
///
/// [`Error::NotFound`] for an unknown id, [`Error::Unavailable`] otherwise.
pub async fn capsule_status(store: &CapsuleStore, job_id: &JobId) -> Result<CapsuleSummary> {
    match store.get(job_id).await {
        Ok(capsule) => Ok(capsule.summary()),
        Err(Error::NotFound(id)) => Err(Error::NotFound(id)),
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "failed to read capsule");
            Err(Error::Unavailable)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::capsule::{Capsule, CapsuleStatus};
    use crate::codec::Codec;
    use crate::scheduler::{JobStore, SchedulerOptions};
    use chrono::{Duration, Utc};

    fn capsule(recipient: &str) -> Capsule {
        Capsule::new(
            JobId::generate(recipient, Utc::now()),
            recipient,
            "top secret body",
            Utc::now() + Duration::days(1),
            chrono_tz::Asia::Kolkata,
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_list_capsules_reports_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CapsuleStore::open(dir.path(), Codec::from_secret("k")).unwrap());
        let good = capsule("a@x.com");
        store.put(&good).await.unwrap();
        std::fs::write(dir.path().join("capsule_broken.enc"), b"garbage").unwrap();

        let mut listing = list_capsules(Arc::clone(&store)).await.unwrap();
        listing.sort_by_key(|l| matches!(l, CapsuleListing::Unavailable { .. }));
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0], CapsuleListing::Available(good.summary()));
        assert_eq!(
            listing[1],
            CapsuleListing::Unavailable {
                object: "capsule_broken.enc".into()
            }
        );

        let json = serde_json::to_string(&listing).unwrap();
        assert!(!json.contains("top secret body"));
        assert!(json.contains("\"state\":\"available\""));
    }

    #[tokio::test]
    async fn test_capsule_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = CapsuleStore::open(dir.path(), Codec::from_secret("k")).unwrap();
        let c = capsule("a@x.com");
        store.put(&c).await.unwrap();

        let summary = capsule_status(&store, &c.job_id).await.unwrap();
        assert_eq!(summary.status, CapsuleStatus::Scheduled);
        assert_eq!(summary.recipient, "a@x.com");

        let missing = JobId::parse("capsule_0_0_nobody").unwrap();
        assert!(matches!(
            capsule_status(&store, &missing).await,
            Err(Error::NotFound(_))
        ));

        let other = CapsuleStore::open(dir.path(), Codec::from_secret("other")).unwrap();
        assert!(matches!(
            capsule_status(&other, &c.job_id).await,
            Err(Error::Unavailable)
        ));
    }

    #[tokio::test]
    async fn test_list_pending_jobs_hides_internal_errors() {
        let jobs = JobStore::in_memory().await.unwrap();
        let scheduler = Scheduler::new(jobs.clone(), SchedulerOptions::default());
        let c = capsule("a@x.com");
        scheduler
            .schedule(&c.job_id, c.unlock_at, serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(list_pending_jobs(&scheduler).await.unwrap().len(), 1);

        jobs.close().await;
        assert!(matches!(
            list_pending_jobs(&scheduler).await,
            Err(Error::Unavailable)
        ));
    }
}

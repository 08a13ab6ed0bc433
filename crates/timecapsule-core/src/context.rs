//! The runtime context.
//!
//! [`CapsuleContext`] owns everything a process needs: the derived codec
//! inside the capsule store, the timer database, the scheduler handle and
//! the intake. It is built once at startup and passed to callers; nothing
//! is global.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use crate::capsule::{CapsuleStore, CapsuleSummary, JobId};
use crate::codec::Codec;
use crate::dispatch::{Dispatcher, Transport};
use crate::intake::{CapsuleRequest, Intake, IntakePolicy, IntakeResponse};
use crate::ops::{self, CapsuleListing};
use crate::scheduler::{JobStore, PendingJob, Scheduler, SchedulerGuard, SchedulerOptions};
use crate::{Config, Error, Result, uploads};

/// Everything one process uses to accept and deliver capsules.
#[derive(Debug)]
pub struct CapsuleContext {
    config: Config,
    store: Arc<CapsuleStore>,
    jobs: JobStore,
    scheduler: Scheduler,
    intake: Intake,
}

impl CapsuleContext {
    /// Validates `config`, creates the data directories, opens the timer
    /// database and derives the record key.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or storage cannot
    /// be opened.
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        if config.uses_dev_secret() {
            tracing::warn!(
                "ENCRYPTION_SECRET is not set; capsules are encrypted with the development secret"
            );
        }

        tokio::fs::create_dir_all(config.uploads_dir()).await?;
        let store = Arc::new(CapsuleStore::open(
            config.capsules_dir(),
            Codec::from_secret(config.secret()),
        )?);
        let jobs = JobStore::new(&config.database_path()).await?;
        let scheduler = Scheduler::new(jobs.clone(), SchedulerOptions::from(&config.scheduler));
        let intake = Intake::new(
            Arc::clone(&store),
            scheduler.clone(),
            IntakePolicy::from_config(&config)?,
        );

        tracing::info!(
            data_dir = %config.data_dir.display(),
            timezone = %config.timezone,
            "capsule context opened"
        );
        Ok(Self {
            config,
            store,
            jobs,
            scheduler,
            intake,
        })
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The encrypted capsule store.
    #[must_use]
    pub const fn store(&self) -> &Arc<CapsuleStore> {
        &self.store
    }

    /// The scheduler handle.
    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The intake.
    #[must_use]
    pub const fn intake(&self) -> &Intake {
        &self.intake
    }

    /// Copies an uploaded file into the upload folder.
    ///
    /// # Errors
    ///
    /// See [`uploads::stage`].
    pub async fn stage_upload(&self, original_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        uploads::stage(&self.config.uploads_dir(), original_name, bytes, Utc::now()).await
    }

    /// See [`Intake::create_capsule`].
    pub async fn create_capsule(&self, request: CapsuleRequest) -> IntakeResponse {
        self.intake.create_capsule(request).await
    }

    /// See [`ops::list_pending_jobs`].
    ///
    /// # Errors
    ///
    /// [`Error::Unavailable`] if the timers cannot be read.
    pub async fn list_pending_jobs(&self) -> Result<Vec<PendingJob>> {
        ops::list_pending_jobs(&self.scheduler).await
    }

    /// See [`ops::list_capsules`].
    ///
    /// # Errors
    ///
    /// [`Error::Unavailable`] if the capsule folder cannot be read.
    pub async fn list_capsules(&self) -> Result<Vec<CapsuleListing>> {
        ops::list_capsules(Arc::clone(&self.store)).await
    }

    /// See [`ops::capsule_status`].
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] or [`Error::Unavailable`].
    pub async fn capsule_status(&self, job_id: &JobId) -> Result<CapsuleSummary> {
        ops::capsule_status(&self.store, job_id).await
    }

    /// A dispatcher sending from the configured sender.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if no usable sender is configured.
    pub fn dispatcher<T: Transport>(&self, transport: T) -> Result<Dispatcher<T>> {
        self.config.smtp.validate()?;
        let sender = self
            .config
            .smtp
            .sender()
            .ok_or_else(|| Error::Config("no sender address".into()))?;
        Ok(Dispatcher::new(Arc::clone(&self.store), transport, sender))
    }

    /// Starts delivering due capsules through `transport`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if no usable sender is configured.
    pub fn start<T: Transport>(&self, transport: T) -> Result<SchedulerGuard> {
        let dispatcher = self.dispatcher(transport)?;
        Ok(self.scheduler.start(dispatcher))
    }

    /// Closes the timer database. Call after the scheduler has shut down.
    pub async fn close(&self) {
        self.jobs.close().await;
    }
}

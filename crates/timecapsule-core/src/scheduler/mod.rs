//! Durable scheduler.
//!
//! Timers live in `SQLite` ([`JobStore`]). A single run loop per process sleeps
//! until the earliest timer, a local registration, or the poll interval,
//! then claims due rows and hands them to a [`JobHandler`] on a bounded
//! pool.

mod model;
mod store;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};

pub use model::{Job, JobHandler, JobOutcome, MissReason, PendingJob};
pub use store::JobStore;

use crate::Result;
use crate::capsule::JobId;
use crate::config::SchedulerConfig;

/// Scheduler tuning in runtime units.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Upper bound on handler runs in flight.
    pub max_concurrent: usize,
    /// Upper bound on runs in flight for one job id.
    pub max_instances: usize,
    /// How late a claimed timer may be and still run.
    pub misfire_grace: Duration,
    /// Longest sleep between polls of the store.
    pub poll_interval: Duration,
    /// How long shutdown waits for runs in flight.
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for SchedulerOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_dispatches.max(1),
            max_instances: config.max_instances.max(1),
            misfire_grace: config.misfire_grace(),
            poll_interval: config.poll_interval(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

/// Handle for registering timers and starting the run loop.
#[derive(Debug, Clone)]
pub struct Scheduler {
    store: JobStore,
    wake: Arc<Notify>,
    options: SchedulerOptions,
}

impl Scheduler {
    /// Creates a scheduler over `store`.
    #[must_use]
    pub fn new(store: JobStore, options: SchedulerOptions) -> Self {
        Self {
            store,
            wake: Arc::new(Notify::new()),
            options,
        }
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &JobStore {
        &self.store
    }

    /// Persists a one-shot timer and wakes the local run loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateJob`](crate::Error::DuplicateJob) if a timer
    /// with this id exists; the existing timer is left untouched.
    pub async fn schedule(
        &self,
        job_id: &JobId,
        fire_at: DateTime<Utc>,
        args: serde_json::Value,
    ) -> Result<()> {
        self.store.insert(job_id, fire_at, &args).await?;
        self.wake.notify_one();
        tracing::info!(job_id = %job_id, fire_at = %fire_at, "job scheduled");
        Ok(())
    }

    /// Pending timers, earliest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn list_pending(&self) -> Result<Vec<PendingJob>> {
        self.store.list_pending().await
    }

    /// Spawns the run loop. Timers fire until the guard is shut down or
    /// dropped.
    pub fn start<H: JobHandler>(&self, handler: H) -> SchedulerGuard {
        let (stop_tx, stop_rx) = watch::channel(false);
        let run = RunLoop {
            scheduler: self.clone(),
            handler: Arc::new(handler),
            permits: Arc::new(Semaphore::new(self.options.max_concurrent)),
            instances: Arc::new(Mutex::new(HashMap::new())),
            tasks: JoinSet::new(),
            in_flight: HashMap::new(),
            stop: stop_rx,
        };
        tracing::info!(
            max_concurrent = self.options.max_concurrent,
            max_instances = self.options.max_instances,
            misfire_grace_secs = self.options.misfire_grace.as_secs(),
            "scheduler started"
        );
        SchedulerGuard {
            stop: stop_tx,
            handle: Some(tokio::spawn(run.run())),
        }
    }
}

/// Keeps the run loop alive.
///
/// Dropping the guard signals the loop to stop; [`shutdown`](Self::shutdown)
/// additionally waits for it to drain.
#[derive(Debug)]
pub struct SchedulerGuard {
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl SchedulerGuard {
    /// Stops claiming timers, waits up to the shutdown timeout for runs in
    /// flight, then aborts whatever is left and puts its timers back.
    pub async fn shutdown(mut self) {
        self.stop.send_replace(true);
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "scheduler loop ended abnormally");
        }
        tracing::info!("scheduler stopped");
    }
}

impl Drop for SchedulerGuard {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

type InstanceCounts = Arc<Mutex<HashMap<JobId, usize>>>;

/// Releases one instance slot when the run ends, even if it panics or is
/// aborted.
struct InstanceSlot {
    counts: InstanceCounts,
    job_id: JobId,
}

impl Drop for InstanceSlot {
    fn drop(&mut self) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(n) = counts.get_mut(&self.job_id) {
            *n -= 1;
            if *n == 0 {
                counts.remove(&self.job_id);
            }
        }
    }
}

struct RunLoop<H> {
    scheduler: Scheduler,
    handler: Arc<H>,
    permits: Arc<Semaphore>,
    instances: InstanceCounts,
    tasks: JoinSet<()>,
    /// Claimed timers whose run has not finished, by task.
    in_flight: HashMap<Id, Job>,
    stop: watch::Receiver<bool>,
}

impl<H: JobHandler> RunLoop<H> {
    async fn run(mut self) {
        loop {
            if self.stopping() {
                break;
            }
            self.reap();

            if let Err(e) = self.fire_due().await {
                tracing::error!(error = %e, "failed to poll due jobs");
            }
            if self.stopping() {
                break;
            }

            let sleep_for = self.next_sleep().await;
            let wake = Arc::clone(&self.scheduler.wake);
            tokio::select! {
                () = tokio::time::sleep(sleep_for) => {}
                () = wake.notified() => {}
                changed = self.stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.drain().await;
    }

    fn stopping(&self) -> bool {
        *self.stop.borrow() || self.stop.has_changed().is_err()
    }

    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next_with_id() {
            self.settle(result);
        }
    }

    fn settle(&mut self, result: std::result::Result<(Id, ()), JoinError>) {
        let id = match result {
            Ok((id, ())) => id,
            Err(e) => {
                if e.is_panic() {
                    tracing::error!(error = %e, "job panicked");
                }
                e.id()
            }
        };
        self.in_flight.remove(&id);
    }

    /// Spawns a run whose timer is restored if shutdown aborts it.
    fn spawn_tracked<F>(&mut self, job: Job, run: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.tasks.spawn(run).id();
        self.in_flight.insert(id, job);
    }

    async fn next_sleep(&self) -> Duration {
        let ceiling = self.scheduler.options.poll_interval;
        match self.scheduler.store.next_fire_at().await {
            Ok(Some(next)) => (next - Utc::now())
                .to_std()
                .map_or(Duration::ZERO, |d| d.min(ceiling)),
            Ok(None) => ceiling,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read next fire time");
                ceiling
            }
        }
    }

    /// Claims and dispatches every timer due now, one batch at a time.
    async fn fire_due(&mut self) -> Result<()> {
        let batch = u32::try_from(self.scheduler.options.max_concurrent.saturating_mul(2))
            .unwrap_or(u32::MAX);
        let due = self.scheduler.store.due(Utc::now(), batch).await?;

        for job in due {
            let Some(permit) = self.acquire().await else {
                return Ok(());
            };
            if !self.scheduler.store.claim(&job.job_id).await? {
                tracing::debug!(job_id = %job.job_id, "job claimed elsewhere");
                continue;
            }
            self.dispatch(job, permit);
        }
        Ok(())
    }

    /// Waits for a pool slot, giving up if shutdown is requested first.
    async fn acquire(&mut self) -> Option<OwnedSemaphorePermit> {
        let permits = Arc::clone(&self.permits);
        tokio::select! {
            permit = permits.acquire_owned() => permit.ok(),
            _ = self.stop.changed() => None,
        }
    }

    fn dispatch(&mut self, job: Job, permit: OwnedSemaphorePermit) {
        let handler = Arc::clone(&self.handler);
        let options = &self.scheduler.options;

        let lateness = (Utc::now() - job.fire_at).to_std().unwrap_or(Duration::ZERO);
        if lateness > options.misfire_grace {
            tracing::warn!(
                job_id = %job.job_id,
                late_secs = lateness.as_secs(),
                "job missed its grace window"
            );
            let tracked = job.clone();
            self.spawn_tracked(tracked, async move {
                let _permit = permit;
                handler.missed(job, MissReason::GraceExpired).await;
            });
            return;
        }

        let slot = {
            let mut counts = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
            let running = counts.entry(job.job_id.clone()).or_insert(0);
            if *running >= options.max_instances {
                None
            } else {
                *running += 1;
                Some(InstanceSlot {
                    counts: Arc::clone(&self.instances),
                    job_id: job.job_id.clone(),
                })
            }
        };
        let Some(slot) = slot else {
            tracing::warn!(job_id = %job.job_id, "job skipped: too many instances running");
            self.tasks.spawn(async move {
                let _permit = permit;
                handler.missed(job, MissReason::InstanceLimit).await;
            });
            return;
        };

        let tracked = job.clone();
        self.spawn_tracked(tracked, async move {
            let _permit = permit;
            let _slot = slot;
            let job_id = job.job_id.clone();
            let started = Instant::now();
            let outcome = handler.run(job).await;
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            if outcome.success {
                tracing::info!(job_id = %job_id, elapsed_ms, message = %outcome.message, "job completed");
            } else {
                tracing::warn!(job_id = %job_id, elapsed_ms, message = %outcome.message, "job failed");
            }
        });
    }

    async fn drain(mut self) {
        if self.tasks.is_empty() {
            return;
        }
        let timeout = self.scheduler.options.shutdown_timeout;
        tracing::info!(in_flight = self.tasks.len(), "waiting for running jobs");

        let finished = tokio::time::timeout(timeout, async {
            while let Some(result) = self.tasks.join_next_with_id().await {
                self.settle(result);
            }
        })
        .await;
        if finished.is_ok() {
            return;
        }

        tracing::warn!(
            aborted = self.tasks.len(),
            timeout_secs = timeout.as_secs(),
            "shutdown timeout reached, aborting running jobs"
        );
        self.tasks.abort_all();
        while let Some(result) = self.tasks.join_next_with_id().await {
            match result {
                Err(e) if e.is_cancelled() => {
                    if let Some(job) = self.in_flight.remove(&e.id()) {
                        self.requeue(job).await;
                    }
                }
                other => self.settle(other),
            }
        }
    }

    /// Restores the timer of an aborted run with its original fire time.
    async fn requeue(&self, job: Job) {
        match self
            .scheduler
            .store
            .insert(&job.job_id, job.fire_at, &job.args)
            .await
        {
            Ok(()) => {
                tracing::info!(job_id = %job.job_id, fire_at = %job.fire_at, "aborted job returned to the queue");
            }
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "failed to return aborted job to the queue");
            }
        }
    }
}

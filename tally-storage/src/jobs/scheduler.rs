//! Job schedulers for flush runs.
//!
//! [`TokioJobScheduler`] spawns one task per scheduled job. The task sleeps
//! for the delay, runs the worker and keeps retrying with the returned
//! backoff until the outcome is terminal. Shutdown cuts every pending sleep
//! short so cached deltas are reconciled before the process exits.
//!
//! [`ManualScheduler`] only records jobs; the caller decides when they run.
//! Useful in tests and when an external queue owns the timing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tally_core::{StorageError, TallyResult};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinSet;

use super::{FlushJob, FlushOutcome, FlushWorker, JobScheduler};
use crate::store::BackingStore;

// ============================================================================
// TOKIO SCHEDULER
// ============================================================================

/// Delayed execution on tokio tasks.
pub struct TokioJobScheduler<S: BackingStore> {
    worker: Arc<FlushWorker<S>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: AsyncMutex<JoinSet<()>>,
}

impl<S: BackingStore> TokioJobScheduler<S> {
    pub fn new(worker: Arc<FlushWorker<S>>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            worker,
            shutdown_tx,
            tasks: AsyncMutex::new(JoinSet::new()),
        }
    }

    pub fn worker(&self) -> &Arc<FlushWorker<S>> {
        &self.worker
    }

    /// Number of jobs still sleeping or running.
    pub async fn in_flight(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Run every pending job now and wait for all of them to finish.
    ///
    /// Jobs that are rescheduled during shutdown are attempted once more
    /// without delay, then left to their markers' expiry.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let mut tasks = self.tasks.lock().await;
        tracing::info!(pending = tasks.len(), "Flush scheduler shutting down");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Flush task aborted");
            }
        }
    }
}

#[async_trait]
impl<S: BackingStore> JobScheduler for TokioJobScheduler<S> {
    async fn schedule(&self, job: FlushJob, delay: Duration) -> TallyResult<()> {
        tracing::debug!(
            type_tag = %job.type_tag,
            record_id = %job.record_id,
            delay_secs = delay.as_secs(),
            "Flush scheduled"
        );
        let worker = self.worker.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(flush_task(worker, job, delay, shutdown_rx));
        Ok(())
    }

    async fn run_sync(&self, job: FlushJob) -> TallyResult<FlushOutcome> {
        let outcome = self.worker.handle(&job).await?;
        if let FlushOutcome::Rescheduled { after, .. } = &outcome {
            self.schedule(job, *after).await?;
        }
        Ok(outcome)
    }
}

/// Body of one spawned job: wait, run, and retry until terminal.
async fn flush_task<S: BackingStore>(
    worker: Arc<FlushWorker<S>>,
    job: FlushJob,
    delay: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut delay = delay;
    let mut attempts_after_shutdown = 0u32;
    loop {
        wait_or_shutdown(delay, &mut shutdown_rx).await;
        if *shutdown_rx.borrow() {
            attempts_after_shutdown += 1;
        }

        delay = match worker.handle(&job).await {
            Ok(FlushOutcome::Rescheduled { after, .. }) => after,
            Ok(_) => return,
            Err(e) => {
                tracing::error!(
                    type_tag = %job.type_tag,
                    record_id = %job.record_id,
                    error = %e,
                    "Flush run failed"
                );
                worker.config().retry_backoff
            }
        };

        if attempts_after_shutdown > 1 {
            tracing::warn!(
                type_tag = %job.type_tag,
                record_id = %job.record_id,
                "Dropping flush retry at shutdown; markers will expire"
            );
            return;
        }
    }
}

async fn wait_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) {
    if *shutdown_rx.borrow() {
        return;
    }
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    tokio::select! {
        _ = &mut sleep => {}
        changed = shutdown_rx.changed() => {
            // Sender gone: nobody can signal shutdown, so sleep it out.
            if changed.is_err() {
                sleep.await;
            }
        }
    }
}

// ============================================================================
// MANUAL SCHEDULER
// ============================================================================

/// Records scheduled jobs and runs them on demand.
pub struct ManualScheduler<S: BackingStore> {
    worker: Arc<FlushWorker<S>>,
    pending: Mutex<Vec<(FlushJob, Duration)>>,
}

impl<S: BackingStore> ManualScheduler<S> {
    pub fn new(worker: Arc<FlushWorker<S>>) -> Self {
        Self {
            worker,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn worker(&self) -> &Arc<FlushWorker<S>> {
        &self.worker
    }

    /// Jobs waiting to run, with the delay they were scheduled with.
    pub fn pending(&self) -> TallyResult<Vec<(FlushJob, Duration)>> {
        let pending = self
            .pending
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(pending.clone())
    }

    pub fn pending_len(&self) -> TallyResult<usize> {
        Ok(self.pending()?.len())
    }

    /// Run every pending job once, ignoring delays.
    ///
    /// Rescheduled jobs go back on the queue with their backoff.
    pub async fn run_pending(&self) -> TallyResult<Vec<FlushOutcome>> {
        let jobs = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| StorageError::LockPoisoned)?;
            std::mem::take(&mut *pending)
        };

        let mut outcomes = Vec::with_capacity(jobs.len());
        for (job, _) in jobs {
            outcomes.push(self.run_sync(job).await?);
        }
        Ok(outcomes)
    }

    fn push(&self, job: FlushJob, delay: Duration) -> TallyResult<()> {
        self.pending
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?
            .push((job, delay));
        Ok(())
    }
}

#[async_trait]
impl<S: BackingStore> JobScheduler for ManualScheduler<S> {
    async fn schedule(&self, job: FlushJob, delay: Duration) -> TallyResult<()> {
        tracing::debug!(
            type_tag = %job.type_tag,
            record_id = %job.record_id,
            delay_secs = delay.as_secs(),
            "Flush queued"
        );
        self.push(job, delay)
    }

    async fn run_sync(&self, job: FlushJob) -> TallyResult<FlushOutcome> {
        let outcome = self.worker.handle(&job).await?;
        if let FlushOutcome::Rescheduled { after, .. } = &outcome {
            self.push(job, *after)?;
        }
        Ok(outcome)
    }
}

//! Producer-side facade and worker pool.

use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::core::backend::{Backend, BackendError, Connector};
use crate::core::event_bus::{Address, EventBus, Message};
use crate::core::events::{EventEnvelope, EventKind};
use crate::core::job::{Job, JobId, JobState, NewJob};
use crate::core::job_processor::{JobError, JobProcessor};
use crate::core::lifecycle::LifecycleError;
use crate::core::Utc;
use crate::runner::worker::{Worker, WorkerOptions};
use crate::runner::wrapped_job::WrappedJobHandler;

/// Options for configuring a queue.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct QueueOptions {
    /// Options handed to every worker.
    pub worker: WorkerOptions,

    /// Put jobs back into the pending set after a retryable failure (default: true).
    pub requeue_failed_attempts: bool,

    /// How long `shutdown` waits for workers to drain (default: 5 seconds).
    pub shutdown_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            worker: WorkerOptions::default(),
            requeue_failed_attempts: true,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl QueueOptions {
    pub fn with_worker(mut self, worker: WorkerOptions) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_requeue_failed_attempts(mut self, requeue: bool) -> Self {
        self.requeue_failed_attempts = requeue;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }
}

/// Errors related to queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue is shut down")]
    Closed,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Creates jobs and runs pools of workers against one store.
///
/// # Example
///
/// ```rust,ignore
/// use foreman::prelude::*;
/// use foreman::memory::MemoryStore;
///
/// let queue = Queue::connect(MemoryStore::default(), QueueOptions::default()).await?;
/// queue.process("email", 4, SendEmail).await?;
///
/// queue
///     .create_job(NewJob::new("email", json!({ "to": "a@example.com" })).with_priority(Priority::HIGH))
///     .await?;
///
/// // Later
/// queue.shutdown().await;
/// ```
pub struct Queue<C: Connector> {
    connector: C,
    backend: C::Backend,
    bus: EventBus,
    shutdown: CancellationToken,
    listener_shutdown: CancellationToken,
    workers: TaskTracker,
    options: QueueOptions,
}

impl<C: Connector> Queue<C> {
    #[instrument(skip_all, err)]
    pub async fn connect(connector: C, options: QueueOptions) -> Result<Self, QueueError> {
        let backend = connector.connect().await?;
        let queue = Self {
            connector,
            backend,
            bus: EventBus::new(),
            shutdown: CancellationToken::new(),
            listener_shutdown: CancellationToken::new(),
            workers: TaskTracker::new(),
            options,
        };

        if queue.options.requeue_failed_attempts {
            let backend = queue.connector.connect().await?;
            queue.spawn_requeue_listener(backend);
        }
        info!(
            prefix = queue.backend.keys().prefix(),
            requeue_failed_attempts = queue.options.requeue_failed_attempts,
            "Queue connected"
        );
        Ok(queue)
    }

    fn spawn_requeue_listener(&self, backend: C::Backend) {
        let mut attempts = self.bus.subscribe(Address::Global(EventKind::FailedAttempt));
        let stop = self.listener_shutdown.clone();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    message = attempts.recv() => message,
                    _ = stop.cancelled() => break,
                };
                match message {
                    Some(Message::Event(EventEnvelope { job: Some(job), .. })) => {
                        requeue_failed_attempt(&backend, job.id).await;
                    }
                    Some(_) => continue,
                    None => break,
                }
            }
            debug!("Requeue listener stopped");
        });
    }

    /// Persist a new job and wake one worker of its type.
    #[instrument(skip_all, err, fields(job_type = %new_job.job_type()))]
    pub async fn create_job(&self, new_job: NewJob) -> Result<Job, QueueError> {
        let id = self.backend.next_id().await?;
        let job = new_job.into_job(id, Utc::now());
        self.backend.add_job(&job).await?;
        debug!(jid = id, priority = job.priority.score(), "Job created");
        Ok(job)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.backend.get_job(id).await?)
    }

    /// Delete a job. Returns `false` when it did not exist.
    #[instrument(skip_all, err, fields(jid = id))]
    pub async fn remove_job(&self, id: JobId) -> Result<bool, QueueError> {
        match self.backend.get_job(id).await? {
            Some(job) => {
                self.backend.remove_job(&job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Move an active or failed job back to the pending set.
    #[instrument(skip_all, err, fields(jid = id))]
    pub async fn requeue(&self, id: JobId) -> Result<Job, QueueError> {
        let job = self
            .backend
            .get_job(id)
            .await?
            .ok_or(BackendError::JobNotFound(id))?;
        Ok(job.requeue(&self.backend).await?)
    }

    /// Spawn `concurrency` workers for `job_type`, each with its own connection.
    pub async fn process<P>(
        &self,
        job_type: impl Into<String>,
        concurrency: usize,
        processor: P,
    ) -> Result<(), QueueError>
    where
        P: JobProcessor + 'static,
        P::Payload: DeserializeOwned,
        P::Error: Into<JobError>,
    {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let job_type = job_type.into();
        let handler = WrappedJobHandler::new(processor).shared();
        for _ in 0..concurrency {
            let backend = self.connector.connect().await?;
            let worker = Worker::new(
                job_type.clone(),
                backend,
                self.bus.clone(),
                handler.clone(),
                self.shutdown.child_token(),
                self.options.worker.clone(),
            );
            debug!(worker_id = %worker.id(), job_type = %job_type, "Spawning worker");
            self.workers.spawn(worker.run());
        }
        info!(job_type = %job_type, concurrency, "Workers started");
        Ok(())
    }

    /// The bus lifecycle events are published on.
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop all workers and wait up to `shutdown_timeout` for in-flight jobs.
    ///
    /// Returns `true` if every worker stopped in time.
    pub async fn shutdown(&self) -> bool {
        info!("Shutting down queue");
        self.shutdown.cancel();
        self.workers.close();

        let drained = tokio::time::timeout(self.options.shutdown_timeout, self.workers.wait())
            .await
            .is_ok();
        if !drained {
            warn!(
                timeout = ?self.options.shutdown_timeout,
                "Workers did not stop in time"
            );
        }
        self.listener_shutdown.cancel();
        drained
    }
}

async fn requeue_failed_attempt<B: Backend>(backend: &B, id: JobId) {
    let job = match backend.get_job(id).await {
        Ok(Some(job)) => job,
        Ok(None) => return,
        Err(err) => {
            warn!(jid = id, error = %err, "Failed to load job for requeue");
            return;
        }
    };
    if job.state == JobState::Inactive || !job.has_attempts() {
        return;
    }
    match job.requeue(backend).await {
        Ok(job) => debug!(jid = job.id, attempts = job.attempts, "Requeued failed attempt"),
        Err(err) => warn!(jid = id, error = %err, "Failed to requeue job"),
    }
}

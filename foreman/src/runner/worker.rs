//! The worker engine: claims jobs of one type, runs them through a processor and records the
//! outcome.
//!
//! A worker owns its backend connection and handles one job at a time. It only exits once its
//! shutdown token is cancelled; every other failure is logged, turned into an `error` event and
//! followed by another claim.

use std::any::Any;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::core::backend::{strip_fifo, Backend, BackendError, SIGNAL};
use crate::core::event_bus::{Address, EventBus, Execution, Message, Subscription};
use crate::core::events::{emit_job_event, message_extra, EventKind};
use crate::core::job::{Job, JobId, JobState};
use crate::core::job_processor::{JobDone, JobError};
use crate::core::lifecycle::LifecycleError;
use crate::core::Utc;
use crate::runner::wrapped_job::SharedJobHandler;

/// Message of the `error` event emitted when a claimed id has no record.
pub const JOB_NOT_EXIST: &str = "job_not_exist";

/// Options for configuring a worker.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct WorkerOptions {
    /// Upper bound of a single blocking pop on the signal list (default: 1 second).
    /// Shutdown is observed between pops.
    pub block_timeout: Duration,

    /// Pause after a backend error while claiming (default: 1 second).
    pub error_backoff: Duration,

    /// How long to wait for a job to report completion (default: wait forever).
    pub job_timeout: Option<Duration>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            block_timeout: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            job_timeout: None,
        }
    }
}

impl WorkerOptions {
    pub fn with_block_timeout(mut self, block_timeout: Duration) -> Self {
        self.block_timeout = block_timeout;
        self
    }

    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    pub fn with_job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = Some(job_timeout);
        self
    }
}

/// Errors a worker absorbs and reports as `error` events.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// A claimed id whose record is gone.
    #[error("job_not_exist")]
    JobNotExist(JobId),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// How a job execution ended.
#[derive(Debug, PartialEq)]
enum Outcome {
    Completed(Option<Value>),
    Failed(String),
}

pub struct Worker<B: Backend> {
    id: Uuid,
    job_type: String,
    backend: B,
    bus: EventBus,
    handler: SharedJobHandler,
    shutdown: CancellationToken,
    options: WorkerOptions,
    current_job: Option<JobId>,
    completion: Option<(Subscription, Subscription)>,
}

impl<B> Worker<B>
where
    B: Backend + 'static,
{
    pub fn new(
        job_type: impl Into<String>,
        backend: B,
        bus: EventBus,
        handler: SharedJobHandler,
        shutdown: CancellationToken,
        options: WorkerOptions,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_type: job_type.into(),
            backend,
            bus,
            handler,
            shutdown,
            options,
            current_job: None,
            completion: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Id of the job being processed, if any.
    pub fn current_job(&self) -> Option<JobId> {
        self.current_job
    }

    /// Claim and process jobs until the shutdown token is cancelled.
    pub async fn run(mut self) {
        let span = info_span!("worker", worker_id = %self.id, job_type = %self.job_type);
        async move {
            info!("Worker started");
            loop {
                self.cleanup();

                let job = match self.claim_next_job().await {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(WorkerError::JobNotExist(jid)) => {
                        warn!(jid, "Claimed job has no record");
                        emit_job_event(
                            &self.bus,
                            EventKind::Error,
                            None,
                            Some(json!({ "message": JOB_NOT_EXIST, "jid": jid })),
                        );
                        continue;
                    }
                    Err(err) => {
                        error!(error = %err, "Failed to claim next job");
                        emit_job_event(&self.bus, EventKind::Error, None, Some(message_extra(&err)));
                        self.backoff().await;
                        continue;
                    }
                };

                self.process(job).await;
            }
            self.cleanup();
            info!("Worker stopped");
        }
        .instrument(span)
        .await
    }

    fn cleanup(&mut self) {
        self.completion = None;
        self.current_job = None;
    }

    async fn backoff(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.options.error_backoff) => {}
        }
    }

    /// Wait for a signal, then pop the highest-priority pending job and load it.
    ///
    /// Returns `Ok(None)` only once shutdown began.
    async fn claim_next_job(&self) -> Result<Option<Job>, WorkerError> {
        let keys = self.backend.keys();
        let signal_key = keys.signal_list(&self.job_type);
        let pending_key = keys.type_state_set(&self.job_type, JobState::Inactive);

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(None);
            }

            match self
                .backend
                .blocking_pop(&signal_key, self.options.block_timeout)
                .await
            {
                Ok(Some(_)) if self.shutdown.is_cancelled() => {
                    // Leave the signal for whoever runs next.
                    self.backend.push(&signal_key, SIGNAL).await?;
                    return Ok(None);
                }
                Ok(Some(_)) => {}
                Ok(None) => continue,
                Err(_) if self.shutdown.is_cancelled() => return Ok(None),
                Err(err) => {
                    warn!(error = %err, "Blocking pop failed, re-arming signal");
                    self.backend.push(&signal_key, SIGNAL).await?;
                    return Err(err.into());
                }
            }

            let (member, score) = match self.backend.pop_min(&pending_key).await {
                Ok(Some(popped)) => popped,
                Ok(None) => {
                    debug!("Signal without a pending job");
                    continue;
                }
                Err(err) => {
                    warn!(error = %err, "Failed to pop pending job, re-arming signal");
                    self.backend.push(&signal_key, SIGNAL).await?;
                    return Err(err.into());
                }
            };
            let jid = strip_fifo(&member)?;

            return match self.backend.get_job(jid).await {
                Ok(Some(job)) => Ok(Some(job)),
                Ok(None) => Err(WorkerError::JobNotExist(jid)),
                Err(err @ BackendError::Store(_)) => {
                    warn!(jid, error = %err, "Failed to load claimed job, putting it back");
                    self.backend
                        .restore_member(&pending_key, &member, score)
                        .await?;
                    self.backend.push(&signal_key, SIGNAL).await?;
                    Err(err.into())
                }
                Err(err) => Err(err.into()),
            };
        }
    }

    async fn process(&mut self, job: Job) {
        let jid = job.id;
        self.current_job = Some(jid);

        let job = match self.activate(job.clone()).await {
            Ok(job) => job,
            Err(err) => {
                error!(jid, error = %err, "Failed to activate job");
                emit_job_event(&self.bus, EventKind::Error, Some(&job), Some(message_extra(&err)));
                return;
            }
        };
        debug!(jid, attempts = job.attempts, "Processing job");
        emit_job_event(&self.bus, EventKind::Start, Some(&job), None);

        // Handles of earlier attempts address another execution and go unheard.
        let execution = Execution::new(jid);
        let mut done = self.bus.subscribe(Address::Done(execution));
        let mut fail = self.bus.subscribe(Address::DoneFail(execution));

        let handler = self.handler.clone();
        let done_handle = JobDone::new(execution, self.bus.clone());
        let (input, data) = (job.clone(), job.data.clone());
        let invocation = tokio::spawn(async move { handler.handle(input, data, done_handle).await });

        let outcome =
            wait_for_outcome(&mut done, &mut fail, invocation, self.options.job_timeout).await;
        self.completion = Some((done, fail));

        let result = match outcome {
            Outcome::Completed(result) => self.complete_job(job.clone(), result).await,
            Outcome::Failed(reason) => self.fail_job(&job, reason).await,
        };
        if let Err(err) = result {
            error!(jid, error = %err, "Failed to record job outcome");
            emit_job_event(&self.bus, EventKind::Error, Some(&job), Some(message_extra(&err)));
        }
    }

    async fn activate(&self, mut job: Job) -> Result<Job, WorkerError> {
        job.record_start(Utc::now());
        self.backend.set_fields(job.id, &job.start_record()).await?;
        Ok(job.activate(&self.backend).await?)
    }

    async fn complete_job(&self, mut job: Job, result: Option<Value>) -> Result<(), WorkerError> {
        job.record_completion(Utc::now(), result);
        self.backend
            .set_fields(job.id, &job.completion_record())
            .await?;
        let job = job.complete(&self.backend).await?;
        if job.remove_on_complete {
            self.backend.remove_job(&job).await?;
        }

        info!(jid = job.id, duration = job.duration, "Job completed");
        emit_job_event(&self.bus, EventKind::Complete, Some(&job), None);
        Ok(())
    }

    async fn fail_job(&self, job: &Job, reason: String) -> Result<(), WorkerError> {
        let job = self.backend.record_failed_attempt(job.id, &reason).await?;

        if job.has_attempts() {
            warn!(
                jid = job.id,
                attempts = job.attempts,
                max_attempts = job.max_attempts,
                error = %reason,
                "Job attempt failed"
            );
            emit_job_event(
                &self.bus,
                EventKind::FailedAttempt,
                Some(&job),
                Some(message_extra(&reason)),
            );
        } else {
            let job = job.fail(&self.backend).await?;
            error!(jid = job.id, attempts = job.attempts, error = %reason, "Job failed");
            emit_job_event(&self.bus, EventKind::Failed, Some(&job), Some(message_extra(&reason)));
        }
        Ok(())
    }
}

/// Wait for the first completion signal.
///
/// The handler returning `Ok` does not end the wait, it may still signal later. An error or
/// panic counts as a failure signal.
async fn wait_for_outcome(
    done: &mut Subscription,
    fail: &mut Subscription,
    mut invocation: JoinHandle<Result<(), JobError>>,
    job_timeout: Option<Duration>,
) -> Outcome {
    let expired = async {
        match job_timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expired);
    let mut running = true;

    loop {
        tokio::select! {
            biased;
            Some(Message::Done(result)) = done.recv() => return Outcome::Completed(result),
            Some(Message::Failed(reason)) = fail.recv() => return Outcome::Failed(reason),
            joined = &mut invocation, if running => {
                running = false;
                match joined {
                    Ok(Ok(())) => continue,
                    Ok(Err(err)) => return Outcome::Failed(err.to_string()),
                    Err(err) if err.is_panic() => {
                        let panicked = JobError::Panicked(panic_message(err.into_panic()));
                        return Outcome::Failed(panicked.to_string());
                    }
                    Err(err) => return Outcome::Failed(err.to_string()),
                }
            }
            _ = &mut expired => {
                invocation.abort();
                let timeout = job_timeout.unwrap_or_default();
                return Outcome::Failed(JobError::Timeout(timeout).to_string());
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

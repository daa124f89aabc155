use async_trait::async_trait;
use serde_json::Value;
use std::convert::Infallible;
use std::fmt;
use thiserror::Error;

use crate::core::event_bus::{Address, EventBus, Execution, Message};
use crate::core::job::{Job, JobId};

/// User-supplied processing logic for one job type.
///
/// `handle` is invoked on its own task with the activated job. Completion is not the return
/// value: the processor reports it through `done`, possibly from another task and long after
/// `handle` returned. Returning an error (or panicking) before reporting counts as a failed
/// attempt.
///
/// ## Example
/// ```rust,ignore
/// use foreman::prelude::*;
/// use async_trait::async_trait;
///
/// struct SendEmail;
///
/// #[derive(Deserialize)]
/// struct Email {
///     to: String,
/// }
///
/// #[async_trait]
/// impl JobProcessor for SendEmail {
///     type Payload = Email;
///     type Error = anyhow::Error;
///
///     async fn handle(&self, job: Job, email: Email, done: JobDone) -> Result<(), Self::Error> {
///         let receipt = deliver(&email.to).await?;
///         done.complete_with(serde_json::json!({ "receipt": receipt }));
///         Ok(())
///     }
/// }
/// ```
///
/// ## Services
/// If your job processor requires external services (mail client, database pool, etc.),
/// add them directly as struct fields.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// The input payload, decoded from the job's `data`.
    type Payload: Send;

    /// The error type returned by this processor.
    type Error: Send + Into<JobError>;

    async fn handle(&self, job: Job, payload: Self::Payload, done: JobDone)
        -> Result<(), Self::Error>;
}

/// Completion handle of one job execution.
///
/// Each method consumes the handle, so one handle sends at most one signal. The signal is
/// addressed to the execution the handle was created for; once the job has moved on to a
/// later attempt, it is discarded.
#[must_use = "a job is only finished once `complete` or `fail` is called"]
#[derive(Debug)]
pub struct JobDone {
    execution: Execution,
    bus: EventBus,
}

impl JobDone {
    pub fn new(execution: Execution, bus: EventBus) -> Self {
        Self { execution, bus }
    }

    pub fn job_id(&self) -> JobId {
        self.execution.job_id
    }

    pub fn execution(&self) -> Execution {
        self.execution
    }

    /// Report success without a result.
    pub fn complete(self) {
        self.signal_success(None);
    }

    /// Report success with a result that is persisted on the job.
    pub fn complete_with(self, result: Value) {
        self.signal_success(Some(result));
    }

    /// Report failure.
    pub fn fail(self, error: impl fmt::Display) {
        self.bus.publish(
            Address::DoneFail(self.execution),
            Message::Failed(error.to_string()),
        );
    }

    fn signal_success(self, result: Option<Value>) {
        self.bus
            .publish(Address::Done(self.execution), Message::Done(result));
    }
}

/// Error types for job processing.
#[derive(Error, Debug)]
pub enum JobError {
    /// Failed to deserialize job payload with context.
    #[error("Failed to deserialize payload: {error}\nPayload sample: {payload_sample}")]
    Deserialization {
        #[source]
        error: serde_json::Error,
        payload_sample: String,
    },

    /// Job did not report completion in time.
    #[error("Job failed to complete within {0:#?}")]
    Timeout(std::time::Duration),

    /// The processor panicked.
    #[error("Job handler panicked: {0}")]
    Panicked(String),

    /// Error from job handler implementation.
    #[error("Job handler error: {0}")]
    HandlerError(#[source] anyhow::Error),
}

impl JobError {
    /// Create a deserialization error with payload context.
    pub fn deserialization_error(error: serde_json::Error, payload: &Value) -> Self {
        let payload_sample = payload.to_string().chars().take(500).collect();

        Self::Deserialization {
            error,
            payload_sample,
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        Self::HandlerError(error)
    }
}

impl From<Infallible> for JobError {
    fn from(_: Infallible) -> Self {
        unreachable!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_done_signals_success() {
        let bus = EventBus::new();
        let execution = Execution::new(1);
        let mut done = bus.subscribe(Address::Done(execution));
        let mut failed = bus.subscribe(Address::DoneFail(execution));

        JobDone::new(execution, bus.clone()).complete_with(json!({"x": 1}));

        assert_eq!(done.recv().await, Some(Message::Done(Some(json!({"x": 1})))));
        assert_eq!(failed.try_recv(), None);
    }

    #[tokio::test]
    async fn test_done_signals_failure() {
        let bus = EventBus::new();
        let execution = Execution::new(2);
        let mut done = bus.subscribe(Address::Done(execution));
        let mut failed = bus.subscribe(Address::DoneFail(execution));

        JobDone::new(execution, bus.clone()).fail("disk full");

        assert_eq!(failed.recv().await, Some(Message::Failed("disk full".into())));
        assert_eq!(done.try_recv(), None);
    }

    #[tokio::test]
    async fn test_earlier_execution_does_not_reach_later_one() {
        let bus = EventBus::new();
        let earlier = JobDone::new(Execution::new(3), bus.clone());
        let current = Execution::new(3);
        let mut done = bus.subscribe(Address::Done(current));
        let mut failed = bus.subscribe(Address::DoneFail(current));

        earlier.complete_with(json!("stale"));

        assert_eq!(done.try_recv(), None);
        assert_eq!(failed.try_recv(), None);
    }

    #[test]
    fn test_deserialization_error_truncates_sample() {
        let payload = json!("x".repeat(1000));
        let error = serde_json::from_value::<u32>(payload.clone()).unwrap_err();

        match JobError::deserialization_error(error, &payload) {
            JobError::Deserialization { payload_sample, .. } => {
                assert_eq!(payload_sample.chars().count(), 500);
            }
            other => panic!("Expected Deserialization error, got {:?}", other),
        }
    }

    #[test]
    fn test_handler_error_from_anyhow() {
        let error: JobError = anyhow::anyhow!("smtp refused").into();
        assert_eq!(error.to_string(), "Job handler error: smtp refused");
    }
}

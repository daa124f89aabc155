use crate::core::job::Job;
use crate::core::job_processor::{JobDone, JobError, JobProcessor};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::instrument;

/// Shorthand for a shared trait object of a WrappedJobHandler.
pub type SharedJobHandler = Arc<dyn JobProcessor<Payload = Value, Error = JobError>>;

/// Object-safe implementation of a job processor that can be used by workers. Generally
/// speaking, you don't need to use this type directly, `Queue::process` wraps processors for you.
pub struct WrappedJobHandler<T: JobProcessor> {
    job: T,
}

impl<J> WrappedJobHandler<J>
where
    J: JobProcessor + 'static,
    J::Payload: DeserializeOwned,
    J::Error: Into<JobError>,
{
    pub fn new(job: J) -> Self {
        Self { job }
    }

    pub fn shared(self) -> SharedJobHandler {
        Arc::new(self) as SharedJobHandler
    }
}

#[async_trait]
impl<J> JobProcessor for WrappedJobHandler<J>
where
    J: JobProcessor + 'static,
    J::Payload: DeserializeOwned,
    J::Error: Into<JobError>,
{
    type Payload = Value;
    type Error = JobError;

    #[instrument(skip_all, err, fields(jid = job.id, job_type = %job.job_type))]
    async fn handle(
        &self,
        job: Job,
        payload: Self::Payload,
        done: JobDone,
    ) -> Result<(), Self::Error> {
        let typed_payload: J::Payload = serde_json::from_value(payload.clone())
            .map_err(|error| JobError::deserialization_error(error, &payload))?;

        self.job
            .handle(job, typed_payload, done)
            .await
            .map_err(Into::into)
    }
}

impl<J> From<J> for WrappedJobHandler<J>
where
    J: JobProcessor + 'static,
    J::Payload: DeserializeOwned,
    J::Error: Into<JobError>,
{
    fn from(job: J) -> Self {
        Self::new(job)
    }
}

//! Job lifecycle state machine.
//!
//! Each method validates the move, stamps the transition-specific fields and persists the
//! job in one backend write. The job is consumed and handed back updated, so a failed
//! transition leaves the caller without a half-updated copy.

use chrono::Utc;
use thiserror::Error;
use tracing::instrument;

use crate::core::backend::{Backend, BackendError};
use crate::core::job::{Job, JobId, JobState};

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Job {job_id} cannot move from '{from}' to '{to}'")]
    IllegalTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl Job {
    /// `inactive -> active`.
    pub async fn activate<B: Backend + ?Sized>(self, backend: &B) -> Result<Job, LifecycleError> {
        self.transition(JobState::Active, backend).await
    }

    /// `active -> complete`.
    pub async fn complete<B: Backend + ?Sized>(self, backend: &B) -> Result<Job, LifecycleError> {
        self.transition(JobState::Complete, backend).await
    }

    /// `active -> failed`, terminal.
    pub async fn fail<B: Backend + ?Sized>(self, backend: &B) -> Result<Job, LifecycleError> {
        self.transition(JobState::Failed, backend).await
    }

    /// `active | failed -> inactive`: make the job claimable again.
    pub async fn requeue<B: Backend + ?Sized>(self, backend: &B) -> Result<Job, LifecycleError> {
        self.transition(JobState::Inactive, backend).await
    }

    #[instrument(skip_all, err, fields(jid = self.id, from = %self.state, to = %next))]
    pub async fn transition<B: Backend + ?Sized>(
        mut self,
        next: JobState,
        backend: &B,
    ) -> Result<Job, LifecycleError> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(LifecycleError::IllegalTransition {
                job_id: self.id,
                from,
                to: next,
            });
        }

        let now = Utc::now();
        self.state = next;
        self.updated_at = Some(now);
        if next == JobState::Failed {
            self.failed_at.get_or_insert(now);
        }

        backend.transition(&self, from).await?;
        Ok(self)
    }
}

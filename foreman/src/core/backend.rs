use async_trait::async_trait;
use thiserror::Error;

use crate::core::job::{Job, JobId, JobState};

/// Value pushed onto a signal list. Signals carry no job data.
pub const SIGNAL: &str = "1";

/// Builds the store keys used by workers and producers.
///
/// Every key lives under a prefix so several queues can share one store.
///
/// ```rust
/// use foreman::core::backend::Keys;
/// use foreman::core::job::JobState;
///
/// let keys = Keys::new("app");
/// assert_eq!(keys.signal_list("email"), "app:email:jobs");
/// assert_eq!(keys.type_state_set("email", JobState::Inactive), "app:jobs:email:INACTIVE");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, suffix: &str) -> String {
        if self.prefix.is_empty() {
            suffix.to_string()
        } else {
            format!("{}:{}", self.prefix, suffix)
        }
    }

    /// List workers of `job_type` block on while idle.
    pub fn signal_list(&self, job_type: &str) -> String {
        self.key(&format!("{job_type}:jobs"))
    }

    /// Per-type state index. The `INACTIVE` one is the pending priority set.
    pub fn type_state_set(&self, job_type: &str, state: JobState) -> String {
        self.key(&format!("jobs:{job_type}:{}", state.key_segment()))
    }

    /// Type-agnostic state index.
    pub fn state_set(&self, state: JobState) -> String {
        self.key(&format!("jobs:{}", state.key_segment()))
    }

    pub fn job(&self, id: JobId) -> String {
        self.key(&format!("job:{id}"))
    }

    pub fn ids(&self) -> String {
        self.key("ids")
    }

    pub fn job_types(&self) -> String {
        self.key("job:types")
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new("foreman")
    }
}

/// Encode a job id as a priority set member.
///
/// Members with equal scores are ordered lexicographically by the store, so the id is
/// prefixed with its digit count; that makes lexicographic order equal to numeric order,
/// which is insertion order because ids come from a counter.
///
/// ```rust
/// use foreman::core::backend::{fifo_member, strip_fifo};
///
/// assert_eq!(fifo_member(42), "02|42");
/// assert!(fifo_member(9) < fifo_member(10));
/// assert_eq!(strip_fifo("02|42").unwrap(), 42);
/// ```
pub fn fifo_member(id: JobId) -> String {
    let digits = id.to_string();
    format!("{:02}|{}", digits.len(), digits)
}

/// Extract the job id from a priority set member.
pub fn strip_fifo(member: &str) -> Result<JobId, BackendError> {
    member
        .split_once('|')
        .and_then(|(_, id)| id.parse().ok())
        .ok_or_else(|| BackendError::InvalidMember(member.to_string()))
}

/// Atomic-operation surface of the shared store. Owns no business logic.
///
/// One value of this type is one connection: workers never share it, because a blocking pop
/// occupies the connection for the whole wait.
///
/// ### Atomicity
///
/// `pop_min` must remove and return the member in a single atomic step; it is the only thing
/// that prevents two workers from claiming the same job.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Key layout this backend was configured with.
    fn keys(&self) -> &Keys;

    /// Pop the head of the list at `key`, waiting up to `timeout` for a value to arrive.
    ///
    /// Returns `Ok(None)` when the timeout elapses.
    async fn blocking_pop(
        &self,
        key: &str,
        timeout: std::time::Duration,
    ) -> Result<Option<String>, BackendError>;

    /// Atomically remove and return the lowest-scored member of the sorted set at `key`.
    async fn pop_min(&self, key: &str) -> Result<Option<(String, i64)>, BackendError>;

    /// Put a member taken by `pop_min` back into the sorted set at `key` with its score.
    async fn restore_member(&self, key: &str, member: &str, score: i64)
        -> Result<(), BackendError>;

    /// Push `value` onto the head of the list at `key`, waking a blocked `blocking_pop`.
    async fn push(&self, key: &str, value: &str) -> Result<(), BackendError>;

    /// Issue the next job id.
    async fn next_id(&self) -> Result<JobId, BackendError>;

    /// Persist a new inactive job, index it in the pending priority set and push a signal.
    async fn add_job(&self, job: &Job) -> Result<(), BackendError>;

    /// Load a job record. `Ok(None)` when the record does not exist.
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, BackendError>;

    /// Overwrite individual record fields.
    async fn set_fields(&self, id: JobId, fields: &[(&'static str, String)])
        -> Result<(), BackendError>;

    /// Persist `job` after its state changed from `from` to `job.state` and move it between
    /// the state indexes. Entering `inactive` pushes a signal.
    async fn transition(&self, job: &Job, from: JobState) -> Result<(), BackendError>;

    /// Atomically increment `attempts` (never past `max_attempts`) and store the error.
    ///
    /// Returns the updated job, or [`BackendError::JobNotFound`].
    async fn record_failed_attempt(&self, id: JobId, error: &str) -> Result<Job, BackendError>;

    /// Delete the job record and drop it from the state indexes.
    async fn remove_job(&self, job: &Job) -> Result<(), BackendError>;
}

/// Hands out dedicated backend connections, one per worker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Backend: Backend + 'static;

    async fn connect(&self) -> Result<Self::Backend, BackendError>;
}

/// Errors related to backend operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackendError {
    /// Job record not found.
    #[error("Job {0} not found")]
    JobNotFound(JobId),

    /// A priority set member that does not encode a job id.
    #[error("Malformed priority set member '{0}'")]
    InvalidMember(String),

    /// A stored job record that cannot be decoded.
    #[error("Malformed record for job {job_id}: {reason}")]
    InvalidRecord { job_id: JobId, reason: String },

    /// Connection, protocol or other store error.
    #[error("Backend error: {0}")]
    Store(#[from] anyhow::Error),
}

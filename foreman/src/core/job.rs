//! The job entity, its persisted states and the flat record form backends store it in.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::backend::BackendError;
use crate::core::DateTime;

/// Job identifier. Issued by the backend's id counter, so ids grow with insertion order.
pub type JobId = u64;

/// Job priority. Lower values are claimed first.
///
/// ```rust
/// use foreman::core::job::Priority;
///
/// assert!(Priority::CRITICAL < Priority::NORMAL);
/// assert_eq!(Priority::from(3i64).score(), 3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i64);

impl Priority {
    pub const LOW: Priority = Priority(10);
    pub const NORMAL: Priority = Priority(0);
    pub const MEDIUM: Priority = Priority(-5);
    pub const HIGH: Priority = Priority(-10);
    pub const CRITICAL: Priority = Priority(-15);

    /// Score used in the pending priority set.
    pub fn score(self) -> i64 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<i64> for Priority {
    fn from(score: i64) -> Self {
        Self(score)
    }
}

/// Persisted job state.
///
/// `failed_attempt` is not a state: a retryable failure leaves the job where it was and is
/// only announced as an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Inactive,
    Active,
    Complete,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Inactive,
        JobState::Active,
        JobState::Complete,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Inactive => "inactive",
            JobState::Active => "active",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
        }
    }

    /// Segment used in state index keys, e.g. `jobs:email:INACTIVE`.
    pub fn key_segment(&self) -> &'static str {
        match self {
            JobState::Inactive => "INACTIVE",
            JobState::Active => "ACTIVE",
            JobState::Complete => "COMPLETE",
            JobState::Failed => "FAILED",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Moving back to `inactive` is re-queueing and is only possible for jobs that were
    /// claimed. A state never transitions to itself.
    ///
    /// ```rust
    /// use foreman::core::job::JobState;
    ///
    /// assert!(JobState::Inactive.can_transition_to(JobState::Active));
    /// assert!(!JobState::Active.can_transition_to(JobState::Active));
    /// ```
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, next),
            (Inactive, Active)
                | (Active, Complete)
                | (Active, Failed)
                | (Active, Inactive)
                | (Failed, Inactive)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown job state '{0}'")]
pub struct ParseStateError(pub String);

impl FromStr for JobState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseStateError(s.to_string()))
    }
}

/// Field names of the persisted job record.
pub mod fields {
    pub const ID: &str = "id";
    pub const TYPE: &str = "type";
    pub const DATA: &str = "data";
    pub const PRIORITY: &str = "priority";
    pub const STATE: &str = "state";
    pub const ATTEMPTS: &str = "attempts";
    pub const MAX_ATTEMPTS: &str = "max_attempts";
    pub const CREATED_AT: &str = "created_at";
    pub const UPDATED_AT: &str = "updated_at";
    pub const STARTED_AT: &str = "started_at";
    pub const FAILED_AT: &str = "failed_at";
    pub const DURATION: &str = "duration";
    pub const RESULT: &str = "result";
    pub const ERROR: &str = "error";
    pub const REMOVE_ON_COMPLETE: &str = "remove_on_complete";
}

/// In-memory representation of one unit of work.
///
/// Mutated by the worker that claimed it; state changes go through the lifecycle methods in
/// [`crate::core::lifecycle`] so that every transition is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub data: Value,
    pub priority: Priority,
    pub state: JobState,
    /// Number of failed attempts recorded so far.
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub updated_at: Option<DateTime>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub started_at: Option<DateTime>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub failed_at: Option<DateTime>,
    /// Milliseconds between activation and completion.
    pub duration: Option<u64>,
    pub result: Option<Value>,
    /// Message of the last failed attempt.
    pub error: Option<String>,
    pub remove_on_complete: bool,
}

impl Job {
    /// Whether another failure would still be retryable.
    pub fn has_attempts(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn record_start(&mut self, now: DateTime) {
        self.started_at = Some(now);
    }

    /// Set `duration` (relative to `started_at`) and `result`. Only the first call has an effect.
    pub fn record_completion(&mut self, now: DateTime, result: Option<Value>) {
        if self.duration.is_some() {
            return;
        }
        let elapsed = self
            .started_at
            .map(|started_at| (now - started_at).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        self.duration = Some(elapsed);
        if result.is_some() {
            self.result = result;
        }
    }

    /// Fields written when the job is activated.
    pub fn start_record(&self) -> Vec<(&'static str, String)> {
        self.started_at
            .map(|started_at| vec![(fields::STARTED_AT, millis(started_at))])
            .unwrap_or_default()
    }

    /// Fields written when the job completes.
    pub fn completion_record(&self) -> Vec<(&'static str, String)> {
        let mut record = Vec::with_capacity(2);
        if let Some(duration) = self.duration {
            record.push((fields::DURATION, duration.to_string()));
        }
        if let Some(result) = &self.result {
            record.push((fields::RESULT, result.to_string()));
        }
        record
    }

    /// Flatten the job into the field map stored by backends.
    pub fn to_record(&self) -> Vec<(&'static str, String)> {
        let mut record = vec![
            (fields::ID, self.id.to_string()),
            (fields::TYPE, self.job_type.clone()),
            (fields::DATA, self.data.to_string()),
            (fields::PRIORITY, self.priority.score().to_string()),
            (fields::STATE, self.state.as_str().to_string()),
            (fields::ATTEMPTS, self.attempts.to_string()),
            (fields::MAX_ATTEMPTS, self.max_attempts.to_string()),
            (fields::CREATED_AT, millis(self.created_at)),
            (
                fields::REMOVE_ON_COMPLETE,
                self.remove_on_complete.to_string(),
            ),
        ];

        if let Some(updated_at) = self.updated_at {
            record.push((fields::UPDATED_AT, millis(updated_at)));
        }
        if let Some(failed_at) = self.failed_at {
            record.push((fields::FAILED_AT, millis(failed_at)));
        }
        if let Some(error) = &self.error {
            record.push((fields::ERROR, error.clone()));
        }
        record.extend(self.start_record());
        record.extend(self.completion_record());
        record
    }

    /// Rebuild a job from its stored field map.
    pub fn from_record(id: JobId, record: &HashMap<String, String>) -> Result<Self, BackendError> {
        let required = |name: &'static str| {
            record
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| invalid(id, format!("missing field '{name}'")))
        };
        let optional = |name: &'static str| record.get(name).map(String::as_str);

        let state = required(fields::STATE)?
            .parse::<JobState>()
            .map_err(|e| invalid(id, e.to_string()))?;

        Ok(Self {
            id,
            job_type: required(fields::TYPE)?.to_string(),
            data: parse_json(id, fields::DATA, required(fields::DATA)?)?,
            priority: Priority(parse_number(id, fields::PRIORITY, required(fields::PRIORITY)?)?),
            state,
            attempts: optional(fields::ATTEMPTS)
                .map(|raw| parse_number(id, fields::ATTEMPTS, raw))
                .transpose()?
                .unwrap_or(0),
            max_attempts: optional(fields::MAX_ATTEMPTS)
                .map(|raw| parse_number(id, fields::MAX_ATTEMPTS, raw))
                .transpose()?
                .unwrap_or(1),
            created_at: parse_millis(id, fields::CREATED_AT, required(fields::CREATED_AT)?)?,
            updated_at: optional(fields::UPDATED_AT)
                .map(|raw| parse_millis(id, fields::UPDATED_AT, raw))
                .transpose()?,
            started_at: optional(fields::STARTED_AT)
                .map(|raw| parse_millis(id, fields::STARTED_AT, raw))
                .transpose()?,
            failed_at: optional(fields::FAILED_AT)
                .map(|raw| parse_millis(id, fields::FAILED_AT, raw))
                .transpose()?,
            duration: optional(fields::DURATION)
                .map(|raw| parse_number(id, fields::DURATION, raw))
                .transpose()?,
            result: optional(fields::RESULT)
                .map(|raw| parse_json(id, fields::RESULT, raw))
                .transpose()?,
            error: optional(fields::ERROR).map(str::to_string),
            remove_on_complete: optional(fields::REMOVE_ON_COMPLETE) == Some("true"),
        })
    }
}

/// A job as submitted by a producer, before the backend assigns it an id.
///
/// ```rust
/// use foreman::core::job::{NewJob, Priority};
/// use foreman::core::serde_json::json;
///
/// let job = NewJob::new("email", json!({"to": "ops@example.com"}))
///     .with_priority(Priority::HIGH)
///     .with_max_attempts(3)
///     .remove_on_complete(true);
/// assert_eq!(job.job_type(), "email");
/// ```
#[derive(Debug, Clone)]
pub struct NewJob {
    job_type: String,
    data: Value,
    priority: Priority,
    max_attempts: u32,
    remove_on_complete: bool,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, data: Value) -> Self {
        Self {
            job_type: job_type.into(),
            data,
            priority: Priority::NORMAL,
            max_attempts: 1,
            remove_on_complete: false,
        }
    }

    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Total number of attempts before the job fails for good. Clamped to at least 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = remove;
        self
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn into_job(self, id: JobId, now: DateTime) -> Job {
        Job {
            id,
            job_type: self.job_type,
            data: self.data,
            priority: self.priority,
            state: JobState::Inactive,
            attempts: 0,
            max_attempts: self.max_attempts,
            created_at: now,
            updated_at: Some(now),
            started_at: None,
            failed_at: None,
            duration: None,
            result: None,
            error: None,
            remove_on_complete: self.remove_on_complete,
        }
    }
}

pub(crate) fn millis(at: DateTime) -> String {
    at.timestamp_millis().to_string()
}

fn invalid(job_id: JobId, reason: String) -> BackendError {
    BackendError::InvalidRecord { job_id, reason }
}

fn parse_number<T: FromStr>(job_id: JobId, name: &str, raw: &str) -> Result<T, BackendError> {
    raw.parse()
        .map_err(|_| invalid(job_id, format!("field '{name}' is not a number: '{raw}'")))
}

fn parse_millis(job_id: JobId, name: &str, raw: &str) -> Result<DateTime, BackendError> {
    let millis: i64 = parse_number(job_id, name, raw)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| invalid(job_id, format!("field '{name}' is out of range: {millis}")))
}

fn parse_json(job_id: JobId, name: &str, raw: &str) -> Result<Value, BackendError> {
    serde_json::from_str(raw)
        .map_err(|e| invalid(job_id, format!("field '{name}' is not valid JSON: {e}")))
}

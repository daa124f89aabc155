//! Shared test specifications for Backend implementations.
//!
//! These test functions can be called by any backend (in-memory, Redis, etc.)
//! to ensure consistent behavior across all implementations.

/// Generate all backend spec test wrappers for a backend.
///
/// # Usage
///
/// ```ignore
/// foreman::generate_backend_spec_tests! {
///     backend = "memory",
///     test_attr = #[tokio::test],
///     setup = MemoryStore::default()
/// }
///
/// // Redis example: the setup expression may await.
/// foreman::generate_backend_spec_tests! {
///     backend = "redis",
///     test_attr = #[tokio::test] #[ignore = "requires a running redis server"],
///     setup = make_backend().await
/// }
/// ```
#[macro_export]
macro_rules! generate_backend_spec_tests {
    (
        backend = $backend:literal,
        test_attr = $(#[$test_attr:meta])+,
        setup = $setup_expr:expr
    ) => {
        $crate::paste::paste! {
            // Claiming
            $(#[$test_attr])+
            async fn [<pop_min_priority_order_ $backend>]() {
                let backend = $setup_expr;
                $crate::backend_spec::test_pop_min_priority_order(backend).await;
            }

            $(#[$test_attr])+
            async fn [<pop_min_fifo_ties_ $backend>]() {
                let backend = $setup_expr;
                $crate::backend_spec::test_pop_min_fifo_ties(backend).await;
            }

            $(#[$test_attr])+
            async fn [<pop_min_empty_ $backend>]() {
                let backend = $setup_expr;
                $crate::backend_spec::test_pop_min_empty(backend).await;
            }

            $(#[$test_attr])+
            async fn [<restore_member_ $backend>]() {
                let backend = $setup_expr;
                $crate::backend_spec::test_restore_member(backend).await;
            }

            $(#[$test_attr])+
            async fn [<blocking_pop_signal_and_timeout_ $backend>]() {
                let backend = $setup_expr;
                $crate::backend_spec::test_blocking_pop_signal_and_timeout(backend).await;
            }

            // Records
            $(#[$test_attr])+
            async fn [<add_and_get_job_ $backend>]() {
                let backend = $setup_expr;
                $crate::backend_spec::test_add_and_get_job(backend).await;
            }

            $(#[$test_attr])+
            async fn [<get_missing_job_ $backend>]() {
                let backend = $setup_expr;
                $crate::backend_spec::test_get_missing_job(backend).await;
            }

            $(#[$test_attr])+
            async fn [<set_fields_ $backend>]() {
                let backend = $setup_expr;
                $crate::backend_spec::test_set_fields(backend).await;
            }

            $(#[$test_attr])+
            async fn [<next_id_monotonic_ $backend>]() {
                let backend = $setup_expr;
                $crate::backend_spec::test_next_id_monotonic(backend).await;
            }

            // Failed attempts
            $(#[$test_attr])+
            async fn [<failed_attempt_capped_ $backend>]() {
                let backend = $setup_expr;
                $crate::backend_spec::test_failed_attempt_capped(backend).await;
            }

            $(#[$test_attr])+
            async fn [<failed_attempt_missing_job_ $backend>]() {
                let backend = $setup_expr;
                $crate::backend_spec::test_failed_attempt_missing_job(backend).await;
            }

            // State indexes
            $(#[$test_attr])+
            async fn [<transition_moves_indexes_ $backend>]() {
                let backend = $setup_expr;
                $crate::backend_spec::test_transition_moves_indexes(backend).await;
            }

            $(#[$test_attr])+
            async fn [<remove_job_ $backend>]() {
                let backend = $setup_expr;
                $crate::backend_spec::test_remove_job(backend).await;
            }
        }
    };
}

use std::time::Duration;

use serde_json::json;

use crate::core::backend::{fifo_member, strip_fifo, Backend, BackendError, SIGNAL};
use crate::core::job::{Job, JobId, JobState, NewJob, Priority};
use crate::core::Utc;

const SHORT_WAIT: Duration = Duration::from_millis(100);

async fn create<B: Backend>(backend: &B, new_job: NewJob) -> Job {
    let id = backend.next_id().await.unwrap();
    let job = new_job.into_job(id, Utc::now());
    backend.add_job(&job).await.unwrap();
    job
}

async fn claim_order<B: Backend>(backend: &B, job_type: &str) -> Vec<JobId> {
    let pending = backend.keys().type_state_set(job_type, JobState::Inactive);
    let mut ids = Vec::new();
    while let Some((member, _)) = backend.pop_min(&pending).await.unwrap() {
        ids.push(strip_fifo(&member).unwrap());
    }
    ids
}

/// Lower priority values are claimed first.
pub async fn test_pop_min_priority_order<B: Backend>(backend: B) {
    let new_job = |score| NewJob::new("suite_priority", json!({})).with_priority(Priority(score));
    let low = create(&backend, new_job(5)).await;
    let high = create(&backend, new_job(1)).await;
    let mid = create(&backend, new_job(3)).await;

    assert_eq!(
        claim_order(&backend, "suite_priority").await,
        vec![high.id, mid.id, low.id]
    );
}

/// Jobs with equal priority are claimed in creation order.
pub async fn test_pop_min_fifo_ties<B: Backend>(backend: B) {
    let mut created = Vec::new();
    // Enough jobs to cross a digit boundary in the member encoding.
    for _ in 0..12 {
        created.push(create(&backend, NewJob::new("suite_fifo", json!({}))).await.id);
    }

    assert_eq!(claim_order(&backend, "suite_fifo").await, created);
}

pub async fn test_pop_min_empty<B: Backend>(backend: B) {
    let pending = backend.keys().type_state_set("suite_empty", JobState::Inactive);
    assert!(backend.pop_min(&pending).await.unwrap().is_none());
}

/// A pushed signal is popped once, then the pop times out.
/// A popped member put back with its score keeps its place in the claim order.
pub async fn test_restore_member<B: Backend>(backend: B) {
    let first = create(&backend, NewJob::new("suite_restore", json!({}))).await;
    let second = create(&backend, NewJob::new("suite_restore", json!({}))).await;
    let pending = backend.keys().type_state_set("suite_restore", JobState::Inactive);

    let (member, score) = backend.pop_min(&pending).await.unwrap().unwrap();
    assert_eq!(strip_fifo(&member).unwrap(), first.id);
    backend.restore_member(&pending, &member, score).await.unwrap();

    assert_eq!(
        claim_order(&backend, "suite_restore").await,
        vec![first.id, second.id]
    );
}

pub async fn test_blocking_pop_signal_and_timeout<B: Backend>(backend: B) {
    let key = backend.keys().signal_list("suite_signal");
    backend.push(&key, SIGNAL).await.unwrap();

    let popped = backend.blocking_pop(&key, SHORT_WAIT).await.unwrap();
    assert_eq!(popped.as_deref(), Some(SIGNAL));

    let popped = backend.blocking_pop(&key, SHORT_WAIT).await.unwrap();
    assert!(popped.is_none());
}

/// Adding a job persists the record, indexes it and pushes one signal.
pub async fn test_add_and_get_job<B: Backend>(backend: B) {
    let new_job = NewJob::new("suite_add", json!({"to": "a@example.com", "n": [1, 2]}))
        .with_priority(Priority::HIGH)
        .with_max_attempts(4)
        .remove_on_complete(true);
    let job = create(&backend, new_job).await;

    let stored = backend.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.id, job.id);
    assert_eq!(stored.job_type, "suite_add");
    assert_eq!(stored.data, json!({"to": "a@example.com", "n": [1, 2]}));
    assert_eq!(stored.priority.score(), -10);
    assert_eq!(stored.state, JobState::Inactive);
    assert_eq!(stored.attempts, 0);
    assert_eq!(stored.max_attempts, 4);
    assert!(stored.remove_on_complete);
    assert_eq!(
        stored.created_at.timestamp_millis(),
        job.created_at.timestamp_millis()
    );

    let signal_key = backend.keys().signal_list("suite_add");
    let signal = backend.blocking_pop(&signal_key, SHORT_WAIT).await.unwrap();
    assert_eq!(signal.as_deref(), Some(SIGNAL));
    assert_eq!(claim_order(&backend, "suite_add").await, vec![job.id]);
}

pub async fn test_get_missing_job<B: Backend>(backend: B) {
    let id = backend.next_id().await.unwrap();
    assert!(backend.get_job(id).await.unwrap().is_none());
}

pub async fn test_set_fields<B: Backend>(backend: B) {
    let mut job = create(&backend, NewJob::new("suite_fields", json!({}))).await;
    job.record_start(Utc::now());

    backend.set_fields(job.id, &job.start_record()).await.unwrap();

    let stored = backend.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(
        stored.started_at.map(|at| at.timestamp_millis()),
        job.started_at.map(|at| at.timestamp_millis())
    );
    assert_eq!(stored.state, JobState::Inactive);
}

pub async fn test_next_id_monotonic<B: Backend>(backend: B) {
    let first = backend.next_id().await.unwrap();
    let second = backend.next_id().await.unwrap();
    let third = backend.next_id().await.unwrap();
    assert!(first < second && second < third);
}

/// Attempts grow by one per failure and stop at `max_attempts`.
pub async fn test_failed_attempt_capped<B: Backend>(backend: B) {
    let job = create(
        &backend,
        NewJob::new("suite_attempts", json!({})).with_max_attempts(2),
    )
    .await;

    let first = backend.record_failed_attempt(job.id, "first").await.unwrap();
    assert_eq!(first.attempts, 1);
    assert!(first.has_attempts());
    assert_eq!(first.error.as_deref(), Some("first"));
    assert!(first.failed_at.is_some());

    let second = backend.record_failed_attempt(job.id, "second").await.unwrap();
    assert_eq!(second.attempts, 2);
    assert!(!second.has_attempts());

    let third = backend.record_failed_attempt(job.id, "third").await.unwrap();
    assert_eq!(third.attempts, 2);
    assert_eq!(third.error.as_deref(), Some("third"));
}

pub async fn test_failed_attempt_missing_job<B: Backend>(backend: B) {
    let id = backend.next_id().await.unwrap();
    match backend.record_failed_attempt(id, "boom").await {
        Err(BackendError::JobNotFound(missing)) => assert_eq!(missing, id),
        other => panic!("Expected JobNotFound, got {:?}", other),
    }
}

/// Transitions move the job between state indexes; re-entering inactive signals again.
pub async fn test_transition_moves_indexes<B: Backend>(backend: B) {
    let job = create(&backend, NewJob::new("suite_transition", json!({}))).await;
    let keys = backend.keys().clone();
    let signal_key = keys.signal_list("suite_transition");
    backend.blocking_pop(&signal_key, SHORT_WAIT).await.unwrap();
    assert_eq!(claim_order(&backend, "suite_transition").await, vec![job.id]);

    let job = job.activate(&backend).await.unwrap();
    let active = keys.type_state_set("suite_transition", JobState::Active);
    let popped = backend.pop_min(&active).await.unwrap();
    assert_eq!(popped.map(|(member, _)| member), Some(fifo_member(job.id)));

    let job = job.fail(&backend).await.unwrap();
    let stored = backend.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Failed);

    let job = job.requeue(&backend).await.unwrap();
    let signal = backend.blocking_pop(&signal_key, SHORT_WAIT).await.unwrap();
    assert_eq!(signal.as_deref(), Some(SIGNAL));
    assert_eq!(claim_order(&backend, "suite_transition").await, vec![job.id]);
    let failed = keys.type_state_set("suite_transition", JobState::Failed);
    assert!(backend.pop_min(&failed).await.unwrap().is_none());
}

pub async fn test_remove_job<B: Backend>(backend: B) {
    let job = create(&backend, NewJob::new("suite_remove", json!({}))).await;

    backend.remove_job(&job).await.unwrap();

    assert!(backend.get_job(job.id).await.unwrap().is_none());
    assert!(claim_order(&backend, "suite_remove").await.is_empty());
}

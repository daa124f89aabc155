use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use foreman::core::backend::{fifo_member, SIGNAL};
use foreman::core::job::fields;
use foreman::memory::MemoryStore;
use foreman::prelude::*;
use foreman::runner::wrapped_job::WrappedJobHandler;
use serde_json::Value;

const WAIT: Duration = Duration::from_secs(5);

fn setup_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn worker_options() -> WorkerOptions {
    WorkerOptions::default()
        .with_block_timeout(Duration::from_millis(50))
        .with_error_backoff(Duration::from_millis(10))
}

async fn start_queue(store: &MemoryStore) -> Queue<MemoryStore> {
    let options = QueueOptions::default().with_worker(worker_options());
    Queue::connect(store.clone(), options).await.unwrap()
}

async fn next_message(subscription: &mut Subscription) -> Message {
    match tokio::time::timeout(WAIT, subscription.recv()).await {
        Ok(Some(message)) => message,
        Ok(None) => panic!("bus closed while waiting on {}", subscription.address()),
        Err(_) => panic!("timed out waiting on {}", subscription.address()),
    }
}

fn envelope(message: Message) -> EventEnvelope {
    match message {
        Message::Event(envelope) => envelope,
        other => panic!("Expected event envelope, got {:?}", other),
    }
}

fn extra_message(envelope: &EventEnvelope) -> String {
    envelope
        .extra
        .as_ref()
        .and_then(|extra| extra["message"].as_str())
        .unwrap_or_default()
        .to_string()
}

/// Completes every job and records the order jobs were seen in.
#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<JobId>>>,
}

impl Recorder {
    fn seen(&self) -> Vec<JobId> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobProcessor for Recorder {
    type Payload = Value;
    type Error = anyhow::Error;

    async fn handle(&self, job: Job, _payload: Value, done: JobDone) -> Result<(), Self::Error> {
        self.seen.lock().unwrap().push(job.id);
        tokio::time::sleep(Duration::from_millis(5)).await;
        done.complete();
        Ok(())
    }
}

struct AlwaysFail;

#[async_trait]
impl JobProcessor for AlwaysFail {
    type Payload = Value;
    type Error = anyhow::Error;

    async fn handle(&self, _job: Job, _payload: Value, _done: JobDone) -> Result<(), Self::Error> {
        Err(anyhow::anyhow!("boom"))
    }
}

struct Panics;

#[async_trait]
impl JobProcessor for Panics {
    type Payload = Value;
    type Error = anyhow::Error;

    async fn handle(&self, _job: Job, _payload: Value, _done: JobDone) -> Result<(), Self::Error> {
        panic!("kaboom")
    }
}

/// Signals failure explicitly from a detached task.
struct SignalsFailure;

#[async_trait]
impl JobProcessor for SignalsFailure {
    type Payload = Value;
    type Error = anyhow::Error;

    async fn handle(&self, _job: Job, _payload: Value, done: JobDone) -> Result<(), Self::Error> {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            done.fail("quota exceeded");
        });
        Ok(())
    }
}

#[derive(Deserialize)]
struct Sum {
    a: i64,
    b: i64,
}

struct Adder;

#[async_trait]
impl JobProcessor for Adder {
    type Payload = Sum;
    type Error = anyhow::Error;

    async fn handle(&self, _job: Job, sum: Sum, done: JobDone) -> Result<(), Self::Error> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        done.complete_with(json!({ "sum": sum.a + sum.b }));
        Ok(())
    }
}

/// Holds on to the completion handle forever.
struct Hangs;

#[async_trait]
impl JobProcessor for Hangs {
    type Payload = Value;
    type Error = anyhow::Error;

    async fn handle(&self, _job: Job, _payload: Value, done: JobDone) -> Result<(), Self::Error> {
        std::future::pending::<()>().await;
        done.complete();
        Ok(())
    }
}

#[tokio::test]
async fn test_each_job_claimed_once() {
    setup_logger();
    let store = MemoryStore::default();
    let queue = start_queue(&store).await;
    let mut completed = queue.events().subscribe(Address::Global(EventKind::Complete));
    let recorder = Recorder::default();

    let mut created = Vec::new();
    for n in 0..20 {
        let job = queue
            .create_job(NewJob::new("email", json!({ "n": n })))
            .await
            .unwrap();
        created.push(job.id);
    }
    queue.process("email", 4, recorder.clone()).await.unwrap();

    for _ in 0..20 {
        next_message(&mut completed).await;
    }
    assert!(queue.shutdown().await);

    let mut seen = recorder.seen();
    seen.sort_unstable();
    assert_eq!(seen, created);
    for id in created {
        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Complete);
    }
}

#[tokio::test]
async fn test_priority_then_fifo_order() {
    setup_logger();
    let store = MemoryStore::default();
    let queue = start_queue(&store).await;
    let mut completed = queue.events().subscribe(Address::Global(EventKind::Complete));
    let recorder = Recorder::default();

    let mut ids = Vec::new();
    for priority in [5, 1, 3, 3, 3] {
        let job = queue
            .create_job(NewJob::new("report", json!({})).with_priority(Priority(priority)))
            .await
            .unwrap();
        ids.push(job.id);
    }
    queue.process("report", 1, recorder.clone()).await.unwrap();

    for _ in 0..ids.len() {
        next_message(&mut completed).await;
    }
    queue.shutdown().await;

    assert_eq!(recorder.seen(), vec![ids[1], ids[2], ids[3], ids[4], ids[0]]);
}

#[tokio::test]
async fn test_retry_exhaustion() {
    setup_logger();
    let store = MemoryStore::default();
    let queue = start_queue(&store).await;
    let job = queue
        .create_job(NewJob::new("flaky", json!({})).with_max_attempts(3))
        .await
        .unwrap();
    let mut attempts = queue
        .events()
        .subscribe(Address::Job(EventKind::FailedAttempt, job.id));
    let mut failed = queue.events().subscribe(Address::Job(EventKind::Failed, job.id));
    let mut starts = queue.events().subscribe(Address::Job(EventKind::Start, job.id));

    queue.process("flaky", 1, AlwaysFail).await.unwrap();

    let envelope = envelope(next_message(&mut failed).await);
    queue.shutdown().await;

    assert_eq!(extra_message(&envelope), "Job handler error: boom");
    let first = self::envelope(attempts.try_recv().unwrap());
    let second = self::envelope(attempts.try_recv().unwrap());
    assert!(attempts.try_recv().is_none());
    assert_eq!(first.job.map(|j| j.attempts), Some(1));
    assert_eq!(second.job.map(|j| j.attempts), Some(2));

    let mut started = 0;
    while starts.try_recv().is_some() {
        started += 1;
    }
    assert_eq!(started, 3);

    let stored = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.attempts, 3);
    assert_eq!(stored.error.as_deref(), Some("Job handler error: boom"));
    assert!(stored.failed_at.is_some());
}

#[tokio::test]
async fn test_failed_attempt_left_alone_without_requeue() {
    setup_logger();
    let store = MemoryStore::default();
    let options = QueueOptions::default()
        .with_worker(worker_options())
        .with_requeue_failed_attempts(false);
    let queue = Queue::connect(store.clone(), options).await.unwrap();
    let job = queue
        .create_job(NewJob::new("flaky", json!({})).with_max_attempts(3))
        .await
        .unwrap();
    let mut attempts = queue
        .events()
        .subscribe(Address::Job(EventKind::FailedAttempt, job.id));

    queue.process("flaky", 1, AlwaysFail).await.unwrap();
    next_message(&mut attempts).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    queue.shutdown().await;

    assert!(attempts.try_recv().is_none());
    let stored = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Active);
    assert_eq!(stored.attempts, 1);
}

#[tokio::test]
async fn test_completion_result_persisted() {
    setup_logger();
    let store = MemoryStore::default();
    let queue = start_queue(&store).await;
    let job = queue
        .create_job(NewJob::new("sum", json!({ "a": 2, "b": 3 })))
        .await
        .unwrap();
    let mut completed = queue.events().subscribe(Address::Job(EventKind::Complete, job.id));

    queue.process("sum", 1, Adder).await.unwrap();

    let message = next_message(&mut completed).await;
    queue.shutdown().await;

    let Message::Job(event_job) = message else {
        panic!("Expected bare job on per-job complete address, got {:?}", message);
    };
    assert_eq!(event_job.id, job.id);

    let stored = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Complete);
    assert_eq!(stored.result, Some(json!({ "sum": 5 })));
    assert!(stored.duration.unwrap() >= 50);
    assert!(stored.started_at.is_some());
}

#[tokio::test]
async fn test_remove_on_complete() {
    setup_logger();
    let store = MemoryStore::default();
    let queue = start_queue(&store).await;
    let mut completed = queue.events().subscribe(Address::Global(EventKind::Complete));
    let removed = queue
        .create_job(NewJob::new("cleanup", json!({})).remove_on_complete(true))
        .await
        .unwrap();
    let kept = queue
        .create_job(NewJob::new("cleanup", json!({})))
        .await
        .unwrap();

    queue.process("cleanup", 1, Recorder::default()).await.unwrap();
    next_message(&mut completed).await;
    next_message(&mut completed).await;
    queue.shutdown().await;

    assert!(queue.get_job(removed.id).await.unwrap().is_none());
    let complete_set = store.keys().type_state_set("cleanup", JobState::Complete);
    assert_eq!(store.members(&complete_set), vec![fifo_member(kept.id)]);
    let kept = queue.get_job(kept.id).await.unwrap().unwrap();
    assert_eq!(kept.state, JobState::Complete);
}

#[tokio::test]
async fn test_shutdown_keeps_late_signal() {
    setup_logger();
    let store = MemoryStore::default();
    let options = QueueOptions::default()
        .with_worker(worker_options().with_block_timeout(Duration::from_secs(2)));
    let queue = Queue::connect(store.clone(), options).await.unwrap();
    let mut started = queue.events().subscribe(Address::Global(EventKind::Start));
    let recorder = Recorder::default();

    queue.process("email", 1, recorder.clone()).await.unwrap();
    // Let the worker block on the empty signal list.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (drained, created) = tokio::join!(
        queue.shutdown(),
        queue.create_job(NewJob::new("email", json!({})))
    );
    let job = created.unwrap();

    assert!(drained);
    assert!(started.try_recv().is_none());
    assert!(recorder.seen().is_empty());
    let stored = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Inactive);
    assert_eq!(store.signal_count("email"), 1);
    let pending = store.keys().type_state_set("email", JobState::Inactive);
    assert_eq!(store.members(&pending), vec![fifo_member(job.id)]);
}

#[tokio::test]
async fn test_handler_panic_fails_job() {
    setup_logger();
    let store = MemoryStore::default();
    let queue = start_queue(&store).await;
    let mut failed = queue.events().subscribe(Address::Global(EventKind::Failed));
    let job = queue
        .create_job(NewJob::new("explode", json!({})))
        .await
        .unwrap();

    queue.process("explode", 1, Panics).await.unwrap();
    let envelope = envelope(next_message(&mut failed).await);

    assert_eq!(envelope.job.as_ref().map(|j| j.id), Some(job.id));
    assert_eq!(extra_message(&envelope), "Job handler panicked: kaboom");

    // The worker survives the panic.
    let next = queue
        .create_job(NewJob::new("explode", json!({})))
        .await
        .unwrap();
    let envelope = self::envelope(next_message(&mut failed).await);
    assert_eq!(envelope.job.map(|j| j.id), Some(next.id));
    queue.shutdown().await;
}

#[tokio::test]
async fn test_explicit_failure_signal() {
    setup_logger();
    let store = MemoryStore::default();
    let queue = start_queue(&store).await;
    let job = queue
        .create_job(NewJob::new("quota", json!({})))
        .await
        .unwrap();
    let mut failed = queue.events().subscribe(Address::Job(EventKind::Failed, job.id));

    queue.process("quota", 1, SignalsFailure).await.unwrap();
    let envelope = envelope(next_message(&mut failed).await);
    queue.shutdown().await;

    assert_eq!(extra_message(&envelope), "quota exceeded");
    let stored = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.error.as_deref(), Some("quota exceeded"));
}

#[tokio::test]
async fn test_payload_mismatch_fails_job() {
    setup_logger();
    let store = MemoryStore::default();
    let queue = start_queue(&store).await;
    let job = queue
        .create_job(NewJob::new("sum", json!({ "a": "two" })))
        .await
        .unwrap();
    let mut failed = queue.events().subscribe(Address::Job(EventKind::Failed, job.id));

    queue.process("sum", 1, Adder).await.unwrap();
    let envelope = envelope(next_message(&mut failed).await);
    queue.shutdown().await;

    assert!(extra_message(&envelope).starts_with("Failed to deserialize payload"));
}

#[tokio::test]
async fn test_missing_record_reported_and_skipped() {
    setup_logger();
    let store = MemoryStore::default();
    let queue = start_queue(&store).await;
    let mut errors = queue.events().subscribe(Address::Global(EventKind::Error));
    let mut completed = queue.events().subscribe(Address::Global(EventKind::Complete));

    let pending = store.keys().type_state_set("email", JobState::Inactive);
    store.insert_member(&pending, Priority::CRITICAL.score(), &fifo_member(999));
    store
        .push(&store.keys().signal_list("email"), SIGNAL)
        .await
        .unwrap();
    queue.process("email", 1, Recorder::default()).await.unwrap();

    let envelope = envelope(next_message(&mut errors).await);
    assert!(envelope.job.is_none());
    assert_eq!(
        envelope.extra,
        Some(json!({ "message": "job_not_exist", "jid": 999 }))
    );

    let job = queue
        .create_job(NewJob::new("email", json!({})))
        .await
        .unwrap();
    let done = self::envelope(next_message(&mut completed).await);
    assert_eq!(done.job.map(|j| j.id), Some(job.id));
    queue.shutdown().await;
}

/// The first attempt hands its completion handle to a task that reports success after the
/// attempt already failed. The second attempt fails for real.
struct LeaksFirstHandle;

#[async_trait]
impl JobProcessor for LeaksFirstHandle {
    type Payload = Value;
    type Error = anyhow::Error;

    async fn handle(&self, job: Job, _payload: Value, done: JobDone) -> Result<(), Self::Error> {
        if job.attempts == 0 {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                done.complete_with(json!("from first attempt"));
            });
            return Err(anyhow::anyhow!("first attempt"));
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        done.fail("second attempt");
        Ok(())
    }
}

#[tokio::test]
async fn test_earlier_attempt_cannot_finish_retry() {
    setup_logger();
    let store = MemoryStore::default();
    let queue = start_queue(&store).await;
    let job = queue
        .create_job(NewJob::new("leaky", json!({})).with_max_attempts(2))
        .await
        .unwrap();
    let mut completed = queue.events().subscribe(Address::Job(EventKind::Complete, job.id));
    let mut failed = queue.events().subscribe(Address::Job(EventKind::Failed, job.id));

    queue.process("leaky", 1, LeaksFirstHandle).await.unwrap();
    let envelope = envelope(next_message(&mut failed).await);
    queue.shutdown().await;

    assert_eq!(extra_message(&envelope), "second attempt");
    assert!(completed.try_recv().is_none());
    let stored = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.result, None);
    assert_eq!(stored.attempts, 2);
    assert_eq!(stored.error.as_deref(), Some("second attempt"));
}

#[tokio::test]
async fn test_job_timeout() {
    setup_logger();
    let store = MemoryStore::default();
    let options = QueueOptions::default()
        .with_worker(worker_options().with_job_timeout(Duration::from_millis(50)));
    let queue = Queue::connect(store.clone(), options).await.unwrap();
    let job = queue
        .create_job(NewJob::new("slow", json!({})))
        .await
        .unwrap();
    let mut failed = queue.events().subscribe(Address::Job(EventKind::Failed, job.id));

    queue.process("slow", 1, Hangs).await.unwrap();
    let envelope = envelope(next_message(&mut failed).await);
    assert!(queue.shutdown().await);

    assert!(extra_message(&envelope).starts_with("Job failed to complete within"));
}

/// Operations of [`FlakyBackend`] that fail once when armed.
#[derive(Default)]
struct Faults {
    blocking_pop: AtomicBool,
    pop_min: AtomicBool,
    get_job: AtomicBool,
    complete: AtomicBool,
}

fn trip(armed: &AtomicBool, operation: &str) -> Result<(), BackendError> {
    if armed.swap(false, Ordering::SeqCst) {
        return Err(BackendError::Store(anyhow::anyhow!(
            "connection reset during {operation}"
        )));
    }
    Ok(())
}

/// Delegates to a memory store, failing armed operations once.
struct FlakyBackend {
    store: MemoryStore,
    faults: Arc<Faults>,
}

#[async_trait]
impl Backend for FlakyBackend {
    fn keys(&self) -> &Keys {
        self.store.keys()
    }

    async fn blocking_pop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BackendError> {
        trip(&self.faults.blocking_pop, "blocking pop")?;
        self.store.blocking_pop(key, timeout).await
    }

    async fn pop_min(&self, key: &str) -> Result<Option<(String, i64)>, BackendError> {
        trip(&self.faults.pop_min, "pop min")?;
        self.store.pop_min(key).await
    }

    async fn restore_member(
        &self,
        key: &str,
        member: &str,
        score: i64,
    ) -> Result<(), BackendError> {
        self.store.restore_member(key, member, score).await
    }

    async fn push(&self, key: &str, value: &str) -> Result<(), BackendError> {
        self.store.push(key, value).await
    }

    async fn next_id(&self) -> Result<JobId, BackendError> {
        self.store.next_id().await
    }

    async fn add_job(&self, job: &Job) -> Result<(), BackendError> {
        self.store.add_job(job).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        trip(&self.faults.get_job, "get job")?;
        self.store.get_job(id).await
    }

    async fn set_fields(
        &self,
        id: JobId,
        fields: &[(&'static str, String)],
    ) -> Result<(), BackendError> {
        self.store.set_fields(id, fields).await
    }

    async fn transition(&self, job: &Job, from: JobState) -> Result<(), BackendError> {
        if job.state == JobState::Complete {
            trip(&self.faults.complete, "complete")?;
        }
        self.store.transition(job, from).await
    }

    async fn record_failed_attempt(&self, id: JobId, error: &str) -> Result<Job, BackendError> {
        self.store.record_failed_attempt(id, error).await
    }

    async fn remove_job(&self, job: &Job) -> Result<(), BackendError> {
        self.store.remove_job(job).await
    }
}

/// A single worker over a [`FlakyBackend`], with its own bus.
struct FlakyWorker {
    store: MemoryStore,
    faults: Arc<Faults>,
    bus: EventBus,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl FlakyWorker {
    fn start(arm: impl FnOnce(&Faults)) -> Self {
        let store = MemoryStore::default();
        let faults = Arc::new(Faults::default());
        arm(&faults);
        let bus = EventBus::new();
        let shutdown = CancellationToken::new();
        let backend = FlakyBackend {
            store: store.clone(),
            faults: faults.clone(),
        };
        let worker = Worker::new(
            "email",
            backend,
            bus.clone(),
            WrappedJobHandler::new(Recorder::default()).shared(),
            shutdown.clone(),
            worker_options(),
        );
        let handle = tokio::spawn(worker.run());
        Self {
            store,
            faults,
            bus,
            shutdown,
            handle,
        }
    }

    async fn add_job(&self) -> Job {
        let id = self.store.next_id().await.unwrap();
        let job = NewJob::new("email", json!({})).into_job(id, Utc::now());
        self.store.add_job(&job).await.unwrap();
        job
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(WAIT, self.handle).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_transient_pop_error_rearms() {
    setup_logger();
    let worker = FlakyWorker::start(|faults| faults.blocking_pop.store(true, Ordering::SeqCst));
    let mut errors = worker.bus.subscribe(Address::Global(EventKind::Error));
    let mut completed = worker.bus.subscribe(Address::Global(EventKind::Complete));
    let job = worker.add_job().await;

    let error = envelope(next_message(&mut errors).await);
    assert!(extra_message(&error).contains("connection reset"));

    let done = envelope(next_message(&mut completed).await);
    assert_eq!(done.job.map(|j| j.id), Some(job.id));

    let store = worker.store.clone();
    worker.stop().await;
    // The original signal was consumed by the job, the re-armed one is left over.
    assert!(store.signal_count("email") <= 1);
}

#[tokio::test]
async fn test_transient_pop_min_error_keeps_signal() {
    setup_logger();
    let worker = FlakyWorker::start(|faults| faults.pop_min.store(true, Ordering::SeqCst));
    let mut errors = worker.bus.subscribe(Address::Global(EventKind::Error));
    let mut completed = worker.bus.subscribe(Address::Global(EventKind::Complete));
    let job = worker.add_job().await;

    let error = envelope(next_message(&mut errors).await);
    assert!(extra_message(&error).contains("during pop min"));

    // No new signal is pushed, the job is claimed through the re-armed one.
    let done = envelope(next_message(&mut completed).await);
    assert_eq!(done.job.map(|j| j.id), Some(job.id));
    assert!(!worker.faults.pop_min.load(Ordering::SeqCst));
    worker.stop().await;
}

#[tokio::test]
async fn test_transient_load_error_restores_claim() {
    setup_logger();
    let worker = FlakyWorker::start(|faults| faults.get_job.store(true, Ordering::SeqCst));
    let mut errors = worker.bus.subscribe(Address::Global(EventKind::Error));
    let mut completed = worker.bus.subscribe(Address::Global(EventKind::Complete));
    let job = worker.add_job().await;

    let error = envelope(next_message(&mut errors).await);
    assert!(error.job.is_none());
    assert!(extra_message(&error).contains("during get job"));

    let done = envelope(next_message(&mut completed).await);
    assert_eq!(done.job.map(|j| j.id), Some(job.id));

    let store = worker.store.clone();
    worker.stop().await;
    let pending = store.keys().type_state_set("email", JobState::Inactive);
    assert!(store.members(&pending).is_empty());
    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Complete);
}

#[tokio::test]
async fn test_completion_store_error_reported() {
    setup_logger();
    let worker = FlakyWorker::start(|faults| faults.complete.store(true, Ordering::SeqCst));
    let mut errors = worker.bus.subscribe(Address::Global(EventKind::Error));
    let mut completed = worker.bus.subscribe(Address::Global(EventKind::Complete));
    let stuck = worker.add_job().await;

    let error = envelope(next_message(&mut errors).await);
    assert_eq!(error.job.as_ref().map(|j| j.id), Some(stuck.id));
    assert!(extra_message(&error).contains("during complete"));

    // The worker keeps claiming.
    let next = worker.add_job().await;
    let done = envelope(next_message(&mut completed).await);
    assert_eq!(done.job.map(|j| j.id), Some(next.id));

    let store = worker.store.clone();
    worker.stop().await;
    let stored = store.get_job(stuck.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Active);
}

#[tokio::test]
async fn test_illegal_activation_reported() {
    setup_logger();
    let store = MemoryStore::default();
    let queue = start_queue(&store).await;
    let mut errors = queue.events().subscribe(Address::Global(EventKind::Error));
    let mut completed = queue.events().subscribe(Address::Global(EventKind::Complete));

    // A finished job whose pending index entry was never cleaned up.
    let id = store.next_id().await.unwrap();
    let finished = NewJob::new("email", json!({})).into_job(id, Utc::now());
    store.add_job(&finished).await.unwrap();
    store
        .set_fields(id, &[(fields::STATE, JobState::Complete.as_str().to_string())])
        .await
        .unwrap();

    queue.process("email", 1, Recorder::default()).await.unwrap();

    let error = envelope(next_message(&mut errors).await);
    assert_eq!(error.job.as_ref().map(|j| j.id), Some(id));
    assert_eq!(
        extra_message(&error),
        format!("Job {id} cannot move from 'complete' to 'active'")
    );

    let next = queue
        .create_job(NewJob::new("email", json!({})))
        .await
        .unwrap();
    let done = envelope(next_message(&mut completed).await);
    assert_eq!(done.job.map(|j| j.id), Some(next.id));
    queue.shutdown().await;

    let stored = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Complete);
}

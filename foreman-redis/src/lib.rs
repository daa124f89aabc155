//! Redis implementation of the Backend trait from foreman

pub mod backend;

pub use backend::{RedisBackend, RedisConnector};

#[cfg(test)]
mod test {
    use crate::backend::{RedisBackend, RedisConnector};
    use async_trait::async_trait;
    use foreman::prelude::*;
    use serde_json::Value;
    use std::time::Duration;
    use uuid::Uuid;

    #[allow(dead_code)]
    pub fn setup_logger() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .try_init();
    }

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    /// Every test gets its own key prefix, so tests can share one server.
    fn connector() -> RedisConnector {
        let keys = Keys::new(format!("foreman-test-{}", Uuid::now_v7()));
        RedisConnector::open(&redis_url(), keys).unwrap()
    }

    async fn make_backend() -> RedisBackend {
        connector().connect().await.unwrap()
    }

    struct Echo;

    #[async_trait]
    impl JobProcessor for Echo {
        type Payload = Value;
        type Error = anyhow::Error;

        async fn handle(&self, _job: Job, payload: Value, done: JobDone) -> Result<(), Self::Error> {
            done.complete_with(payload);
            Ok(())
        }
    }

    #[tokio::test]
    #[ignore = "requires a running redis server (set REDIS_URL)"]
    async fn queue_round_trip() {
        setup_logger();
        let options = QueueOptions::default().with_worker(
            WorkerOptions::default().with_block_timeout(Duration::from_millis(200)),
        );
        let queue = Queue::connect(connector(), options).await.unwrap();
        let mut completed = queue.events().subscribe(Address::Global(EventKind::Complete));

        queue.process("echo", 2, Echo).await.unwrap();
        let job = queue
            .create_job(NewJob::new("echo", json!({ "hello": "redis" })))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), completed.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(queue.shutdown().await);

        let stored = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Complete);
        assert_eq!(stored.result, Some(json!({ "hello": "redis" })));
    }

    #[tokio::test]
    #[ignore = "requires a running redis server (set REDIS_URL)"]
    async fn set_fields_on_missing_job() {
        let backend = make_backend().await;
        let id = backend.next_id().await.unwrap();

        let result = backend
            .set_fields(id, &[(foreman::core::job::fields::ERROR, "x".to_string())])
            .await;

        assert!(matches!(result, Err(BackendError::JobNotFound(_))));
        assert!(backend.get_job(id).await.unwrap().is_none());
    }

    // Generate the shared backend specs for Redis
    foreman::generate_backend_spec_tests! {
        backend = "redis",
        test_attr = #[tokio::test] #[ignore = "requires a running redis server (set REDIS_URL)"],
        setup = make_backend().await
    }
}

#![doc = include_str!("../README.md")]

pub mod core;

/// Shared test specifications for backend implementations.
///
/// These test functions ensure consistent behavior across all Backend implementations
/// (in-memory, Redis, etc.). Backend tests should instantiate them through
/// [`generate_backend_spec_tests!`].
#[doc(hidden)]
pub mod backend_spec;

#[doc(hidden)]
pub use paste;

/// In-process backend.
#[cfg(feature = "memory")]
pub mod memory;

/// Default implementation of the worker engine and the queue facade.
#[cfg(feature = "runner")]
pub mod runner {
    pub mod queue;
    pub mod worker;
    pub mod wrapped_job;
}

/// Re-exports to simplify importing this crate types.
pub mod prelude {
    pub use super::core::{
        backend::{Backend, BackendError, Connector, Keys},
        event_bus::{Address, EventBus, Execution, Message, Subscription},
        events::{EventEnvelope, EventKind},
        job::{Job, JobId, JobState, NewJob, Priority},
        job_processor::{JobDone, JobError, JobProcessor},
        lifecycle::LifecycleError,
        CancellationToken, Duration, Utc,
    };
    #[cfg(feature = "runner")]
    pub use super::runner::{
        queue::{Queue, QueueError, QueueOptions},
        worker::{Worker, WorkerOptions},
    };
    pub use serde::{Deserialize, Serialize};
    pub use serde_json::json;
}

//! Implementation agnostic types and traits for implementing backends and workers, plus re-exports of 3rd party types/crates used in public interface.

/// An alias for `chrono::DateTime<chrono::Utc>`
pub type DateTime = chrono::DateTime<chrono::Utc>;
pub use chrono::{Duration, Utc};
pub use serde_json;
pub use tokio_util::sync::CancellationToken;

pub mod backend;
pub mod event_bus;
pub mod events;
pub mod job;
pub mod job_processor;
pub mod lifecycle;

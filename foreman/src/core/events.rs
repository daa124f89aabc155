//! Lifecycle event kinds and the addresses each kind is published to.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::event_bus::{Address, EventBus, Message};
use crate::core::job::Job;

/// Lifecycle events emitted by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Complete,
    Failed,
    FailedAttempt,
    Error,
}

/// What a per-job address receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPayload {
    /// The bare persisted job.
    Job,
    /// The same `{job, extra}` envelope the global address gets.
    Envelope,
}

/// Addresses an event kind is published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Only the global `job_<event>` address.
    GlobalOnly,
    /// The global address plus the per-job `(event, id)` address.
    GlobalAndJob(JobPayload),
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Start,
        EventKind::Complete,
        EventKind::Failed,
        EventKind::FailedAttempt,
        EventKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Complete => "complete",
            EventKind::Failed => "failed",
            EventKind::FailedAttempt => "failed_attempt",
            EventKind::Error => "error",
        }
    }

    pub fn routing(self) -> Routing {
        match self {
            EventKind::Start | EventKind::Complete => Routing::GlobalAndJob(JobPayload::Job),
            EventKind::Failed | EventKind::FailedAttempt => {
                Routing::GlobalAndJob(JobPayload::Envelope)
            }
            EventKind::Error => Routing::GlobalOnly,
        }
    }
}

/// Payload of global event addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub job: Option<Job>,
    pub extra: Option<Value>,
}

/// Build the `extra` payload carrying an error message.
pub fn message_extra(message: impl ToString) -> Value {
    serde_json::json!({ "message": message.to_string() })
}

/// Publish `kind` for `job` according to its routing. Returns the addresses published to.
///
/// `job` may be `None` only for [`EventKind::Error`]; other kinds without a job reach the
/// global address alone.
pub fn emit_job_event(
    bus: &EventBus,
    kind: EventKind,
    job: Option<&Job>,
    extra: Option<Value>,
) -> Vec<Address> {
    let envelope = EventEnvelope {
        job: job.cloned(),
        extra,
    };
    let mut published = Vec::with_capacity(2);

    let job_address = match (kind.routing(), job) {
        (Routing::GlobalAndJob(payload), Some(job)) => Some((payload, job)),
        _ => None,
    };
    if let Some((payload, job)) = job_address {
        let message = match payload {
            JobPayload::Job => Message::Job(Box::new(job.clone())),
            JobPayload::Envelope => Message::Event(envelope.clone()),
        };
        let address = Address::Job(kind, job.id);
        bus.publish(address, message);
        published.push(address);
    }

    let global = Address::Global(kind);
    bus.publish(global, Message::Event(envelope));
    published.insert(0, global);

    tracing::debug!(
        event = kind.as_str(),
        jid = job.map(|j| j.id),
        "Emitted job event"
    );
    published
}

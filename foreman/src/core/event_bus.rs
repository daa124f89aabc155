//! In-process publish/subscribe channel for lifecycle events and completion signals.
//!
//! Every message is delivered to each live subscriber of the address it was published to,
//! at most once. Dropping a [`Subscription`] unregisters it, so late messages for an address
//! nobody listens to any more are discarded.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::events::{EventEnvelope, EventKind};
use crate::core::job::{Job, JobId};

/// Where a message is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// Type-agnostic `job_<event>` address.
    Global(EventKind),
    /// Point-to-point address for one job's `event`.
    Job(EventKind, JobId),
    /// Success completion signal of one execution.
    Done(Execution),
    /// Failure completion signal of one execution.
    DoneFail(Execution),
}

/// One run of a job.
///
/// A retried job keeps its id but runs under a fresh execution, so a signal sent by a handle
/// of an earlier run reaches nobody.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Execution {
    pub job_id: JobId,
    pub run: Uuid,
}

impl Execution {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            run: Uuid::now_v7(),
        }
    }
}

impl fmt::Display for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.job_id, self.run)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Global(kind) => write!(f, "job_{}", kind.as_str()),
            Address::Job(kind, id) => write!(f, "job.{}.{id}", kind.as_str()),
            Address::Done(execution) => write!(f, "done.{execution}"),
            Address::DoneFail(execution) => write!(f, "done_fail.{execution}"),
        }
    }
}

/// Payload carried over the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `{job, extra}` envelope of a lifecycle event.
    Event(EventEnvelope),
    /// The bare persisted job.
    Job(Box<Job>),
    /// Success signal with the optional result of the job.
    Done(Option<Value>),
    /// Failure signal with the error description.
    Failed(String),
}

struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<Address, Vec<Subscriber>>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<Address, Vec<Subscriber>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn unsubscribe(&self, address: &Address, id: u64) {
        let mut subscribers = self.lock();
        if let Some(list) = subscribers.get_mut(address) {
            list.retain(|s| s.id != id);
            if list.is_empty() {
                subscribers.remove(address);
            }
        }
    }
}

/// Cheaply cloneable handle to a shared in-process bus.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `message` to every subscriber of `address`. Returns the number of deliveries.
    pub fn publish(&self, address: Address, message: Message) -> usize {
        let mut subscribers = self.registry.lock();
        let Some(list) = subscribers.get_mut(&address) else {
            return 0;
        };

        // Drop receivers that went away without unsubscribing.
        list.retain(|s| s.sender.send(message.clone()).is_ok());
        let delivered = list.len();
        if list.is_empty() {
            subscribers.remove(&address);
        }
        tracing::trace!(%address, delivered, "Published message");
        delivered
    }

    pub fn subscribe(&self, address: Address) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .lock()
            .entry(address)
            .or_default()
            .push(Subscriber { id, sender });

        Subscription {
            id,
            address,
            receiver,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Number of live subscriptions on `address`.
    pub fn subscriber_count(&self, address: &Address) -> usize {
        self.registry.lock().get(address).map_or(0, Vec::len)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("addresses", &self.registry.lock().len())
            .finish()
    }
}

/// Receiving end of one address. Unregisters itself when dropped.
pub struct Subscription {
    id: u64,
    address: Address,
    receiver: mpsc::UnboundedReceiver<Message>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn address(&self) -> Address {
        self.address
    }

    /// Wait for the next message. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Take a message that is already queued, if any.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.address, self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        assert_eq!(Address::Global(EventKind::FailedAttempt).to_string(), "job_failed_attempt");
        assert_eq!(Address::Job(EventKind::Start, 9).to_string(), "job.start.9");

        let execution = Execution {
            job_id: 9,
            run: Uuid::nil(),
        };
        assert_eq!(
            Address::Done(execution).to_string(),
            "done.9.00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            Address::DoneFail(execution).to_string(),
            "done_fail.9.00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_executions_of_one_job_differ() {
        let first = Execution::new(5);
        let second = Execution::new(5);
        assert_eq!(first.job_id, second.job_id);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_publish_fans_out() {
        let bus = EventBus::new();
        let execution = Execution::new(1);
        let mut first = bus.subscribe(Address::Done(execution));
        let mut second = bus.subscribe(Address::Done(execution));
        let mut other = bus.subscribe(Address::Done(Execution::new(1)));

        let delivered = bus.publish(Address::Done(execution), Message::Done(None));

        assert_eq!(delivered, 2);
        assert_eq!(first.recv().await, Some(Message::Done(None)));
        assert_eq!(second.recv().await, Some(Message::Done(None)));
        assert_eq!(other.try_recv(), None);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(
            bus.publish(
                Address::DoneFail(Execution::new(1)),
                Message::Failed("boom".into())
            ),
            0
        );
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::new();
        let address = Address::Done(Execution::new(3));
        let subscription = bus.subscribe(address);
        assert_eq!(bus.subscriber_count(&address), 1);

        drop(subscription);

        assert_eq!(bus.subscriber_count(&address), 0);
        assert_eq!(bus.publish(address, Message::Done(None)), 0);
    }

    #[test]
    fn test_subscription_outlives_bus() {
        let bus = EventBus::new();
        let mut subscription = bus.subscribe(Address::Done(Execution::new(4)));
        drop(bus);
        assert_eq!(subscription.try_recv(), None);
        drop(subscription);
    }
}

//! Per-project and per-run publish/subscribe
//!
//! Topics are lazily created `tokio::sync::broadcast` channels held in a
//! concurrent map. Delivery is best-effort and at-most-once per subscriber:
//! there is no durability and no backpressure, slow subscribers drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::errors::EventBusError;
use super::types::{ProjectEvent, RunEvent};

/// Delivery counters, readable as a consistent-enough snapshot for logs.
#[derive(Debug, Default)]
pub struct BusCounters {
    published: AtomicU64,
    dropped: AtomicU64,
    peak_subscribers: AtomicUsize,
}

/// Point-in-time view of [`BusCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusSnapshot {
    pub published: u64,
    pub dropped: u64,
    pub peak_subscribers: usize,
}

impl BusCounters {
    fn record(&self, subscriber_count: usize) {
        self.published.fetch_add(1, Ordering::Relaxed);
        if subscriber_count == 0 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.peak_subscribers
            .fetch_max(subscriber_count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BusSnapshot {
        BusSnapshot {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            peak_subscribers: self.peak_subscribers.load(Ordering::Relaxed),
        }
    }
}

/// Event fan-out for run streams and project status updates.
#[derive(Debug)]
pub struct EventBus {
    capacity: usize,
    run_topics: DashMap<String, broadcast::Sender<RunEvent>>,
    project_topics: DashMap<String, broadcast::Sender<ProjectEvent>>,
    counters: BusCounters,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            run_topics: DashMap::new(),
            project_topics: DashMap::new(),
            counters: BusCounters::default(),
        })
    }

    /// Publish an event on a run's live stream.
    ///
    /// Returns the number of subscribers that received it. Zero subscribers
    /// is not an error; the event is simply dropped.
    pub fn publish_run_event(&self, run_id: &str, event: RunEvent) -> usize {
        let delivered = match self.run_topics.get(run_id) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        };
        self.counters.record(delivered);
        if delivered == 0 {
            self.prune_run_topic(run_id);
        }
        delivered
    }

    /// Publish a status update on a project topic.
    pub fn publish_project_event(&self, project_id: &str, event: ProjectEvent) -> usize {
        let delivered = match self.project_topics.get(project_id) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        };
        self.counters.record(delivered);
        if delivered == 0 {
            self.prune_project_topic(project_id);
        }
        delivered
    }

    /// Subscribe to a run's live event stream.
    #[must_use]
    pub fn subscribe_run(&self, run_id: &str) -> Subscription<RunEvent> {
        let receiver = self
            .run_topics
            .entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Subscription { receiver }
    }

    /// Subscribe to a project's status updates.
    #[must_use]
    pub fn subscribe_project(&self, project_id: &str) -> Subscription<ProjectEvent> {
        let receiver = self
            .project_topics
            .entry(project_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Subscription { receiver }
    }

    pub fn counters(&self) -> &BusCounters {
        &self.counters
    }

    /// Drop a run topic once no subscriber remains. Detached subscribers are
    /// cleaned up eagerly on the next publish.
    fn prune_run_topic(&self, run_id: &str) {
        let removed = self
            .run_topics
            .remove_if(run_id, |_, sender| sender.receiver_count() == 0);
        if removed.is_some() {
            log::debug!("pruned idle run topic {run_id}");
        }
    }

    fn prune_project_topic(&self, project_id: &str) {
        self.project_topics
            .remove_if(project_id, |_, sender| sender.receiver_count() == 0);
    }
}

/// Live subscription to a topic.
///
/// Dropping the subscription (or calling [`Subscription::cancel`]) detaches
/// the subscriber; the bus prunes the topic on the next publish.
pub struct Subscription<T: Clone> {
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// Receive the next event.
    pub async fn recv(&mut self) -> Result<T, EventBusError> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Closed) => Err(EventBusError::Closed),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                Err(EventBusError::Lagged(skipped))
            }
        }
    }

    /// Receive without blocking. `Ok(None)` means no event is buffered.
    pub fn try_recv(&mut self) -> Result<Option<T>, EventBusError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(EventBusError::Closed),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                Err(EventBusError::Lagged(skipped))
            }
        }
    }

    /// Convert into a `Stream` of events for async iteration.
    #[must_use]
    pub fn into_stream(self) -> BroadcastStream<T> {
        BroadcastStream::new(self.receiver)
    }

    /// Detach from the topic.
    pub fn cancel(self) {
        drop(self);
    }
}

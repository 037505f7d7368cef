//! Fan-out of published events and the bounded history behind it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::payloads::{DEFAULT_HISTORY_CAPACITY, Event, EventEnvelope, EventId};

/// Live feed handed to subscribers; lagging readers see `Lagged` items.
pub type EventStream = BroadcastStream<EventEnvelope>;

#[derive(Debug)]
struct History {
    next_id: EventId,
    capacity: usize,
    retained: VecDeque<EventEnvelope>,
}

impl History {
    fn record(&mut self, event: Event) -> EventEnvelope {
        let envelope = EventEnvelope {
            id: self.next_id,
            timestamp: Utc::now(),
            event,
        };
        self.next_id += 1;
        if self.retained.len() >= self.capacity {
            self.retained.pop_front();
        }
        self.retained.push_back(envelope.clone());
        envelope
    }
}

/// Cloneable handle to one process-wide event stream.
///
/// Identifiers are assigned under the history lock, so retained envelopes
/// are always in id order.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    history: Arc<Mutex<History>>,
}

impl EventBus {
    /// Bus retaining the last `capacity` events (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            history: Arc::new(Mutex::new(History {
                next_id: 1,
                capacity,
                retained: VecDeque::with_capacity(capacity),
            })),
        }
    }

    /// Bus with [`DEFAULT_HISTORY_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Live feed of events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Record `event` and deliver it to current subscribers.
    pub fn publish(&self, event: Event) -> EventId {
        let envelope = self.history().record(event);
        let id = envelope.id;
        // Err only means nobody is listening.
        let _ = self.sender.send(envelope);
        id
    }

    /// Id of the newest retained event.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        self.history().retained.back().map(|envelope| envelope.id)
    }

    /// Retained events newer than `id`, oldest first.
    #[must_use]
    pub fn backlog_since(&self, id: EventId) -> Vec<EventEnvelope> {
        self.history()
            .retained
            .iter()
            .skip_while(|envelope| envelope.id <= id)
            .cloned()
            .collect()
    }

    /// Retained events concerning one operation, oldest first.
    #[must_use]
    pub fn history_for(&self, operation_id: Uuid) -> Vec<EventEnvelope> {
        self.history()
            .retained
            .iter()
            .filter(|envelope| envelope.event.operation_id() == Some(operation_id))
            .cloned()
            .collect()
    }

    fn history(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[test]
    fn backlog_resumes_after_a_known_id() {
        let bus = EventBus::with_capacity(8);
        let paused = bus.publish(Event::QueuePaused);
        let resumed = bus.publish(Event::QueueResumed);

        assert_eq!(paused, 1);
        assert_eq!(bus.last_event_id(), Some(resumed));
        let backlog = bus.backlog_since(paused);
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].event, Event::QueueResumed);
    }

    #[test]
    fn history_keeps_only_the_newest_events() {
        let bus = EventBus::with_capacity(2);
        bus.publish(Event::QueuePaused);
        bus.publish(Event::QueueResumed);
        let stopped = bus.publish(Event::QueueStopped);

        let ids: Vec<EventId> = bus.backlog_since(0).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(bus.last_event_id(), Some(stopped));
    }

    #[test]
    fn history_for_selects_one_operation() {
        let bus = EventBus::new();
        let (mine, other) = (Uuid::new_v4(), Uuid::new_v4());
        bus.publish(Event::OperationQueued {
            operation_id: mine,
            kind: "transfer".into(),
            priority: "normal".into(),
        });
        bus.publish(Event::OperationCancelled {
            operation_id: other,
        });
        bus.publish(Event::QueuePaused);
        bus.publish(Event::OperationCancelled { operation_id: mine });

        let kinds: Vec<&str> = bus
            .history_for(mine)
            .iter()
            .map(|envelope| envelope.event.kind())
            .collect();
        assert_eq!(kinds, vec!["operation_queued", "operation_cancelled"]);
    }

    #[tokio::test]
    async fn subscribers_receive_new_events() -> anyhow::Result<()> {
        let bus = EventBus::new();
        bus.publish(Event::QueuePaused);
        let mut stream = bus.subscribe();
        let id = bus.publish(Event::OperationCancelled {
            operation_id: Uuid::nil(),
        });

        let envelope = stream
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("stream closed"))??;
        assert_eq!(envelope.id, id);
        assert!(matches!(envelope.event, Event::OperationCancelled { .. }));
        Ok(())
    }
}

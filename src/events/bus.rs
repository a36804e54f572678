//! In-process event bus with per-task replay.
//!
//! Every event gets the next value of a bus-wide sequence counter. Each task
//! keeps a capped ring buffer so reconnecting observers can catch up with
//! `events_since`; a gap larger than the cap cannot be recovered. Fan-out
//! never blocks: a subscriber whose queue is full misses the event.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::{DEFAULT_EVENT_REPLAY_CAPACITY, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::events::model::{Event, EventType};

/// Identifier of a live subscription.
pub type SubscriberId = u64;

/// A subscriber's receiving end.
pub struct Subscription {
    pub id: SubscriberId,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Next event, or `None` once unsubscribed or the bus shut down.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> ReceiverStream<Event> {
        ReceiverStream::new(self.rx)
    }
}

#[derive(Default)]
struct BusState {
    subscribers: HashMap<SubscriberId, mpsc::Sender<Event>>,
    next_subscriber: SubscriberId,
    buffers: HashMap<Uuid, VecDeque<Event>>,
    latest: HashMap<Uuid, Event>,
    closed: bool,
}

/// Pub/sub keyed by task id.
pub struct EventBus {
    sequence: AtomicI64,
    replay_capacity: usize,
    subscriber_capacity: usize,
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new(replay_capacity: usize, subscriber_capacity: usize) -> Self {
        Self {
            sequence: AtomicI64::new(0),
            replay_capacity: replay_capacity.max(1),
            subscriber_capacity: subscriber_capacity.max(1),
            state: Mutex::new(BusState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish an event for a task and return it with its sequence id.
    pub fn publish(&self, task_id: Uuid, event_type: EventType, data: impl Into<String>) -> Event {
        let mut state = self.state();

        // Assigned under the lock so every buffer stays in id order.
        let id = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event {
            id,
            task_id,
            event_type,
            data: data.into(),
        };

        let buffer = state.buffers.entry(task_id).or_default();
        buffer.push_back(event.clone());
        while buffer.len() > self.replay_capacity {
            buffer.pop_front();
        }

        match event_type {
            EventType::AgentUpdate => {
                state.latest.insert(task_id, event.clone());
            }
            EventType::StatusChange if event.ends_run() => {
                state.latest.remove(&task_id);
            }
            _ => {}
        }

        let mut dropped = 0usize;
        state.subscribers.retain(|_, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if dropped > 0 {
            trace!(event_id = id, dropped, "Subscriber queues full, event dropped for them");
        }

        event
    }

    /// Register a new subscriber receiving every subsequent event.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        let mut state = self.state();
        state.next_subscriber += 1;
        let id = state.next_subscriber;
        if state.closed {
            // Sender dropped here: the subscription is closed from the start.
            return Subscription { id, rx };
        }
        state.subscribers.insert(id, tx);
        debug!(subscriber = id, "Event subscriber added");
        Subscription { id, rx }
    }

    /// Remove a subscriber; its queue is closed. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.state().subscribers.remove(&id).is_some() {
            debug!(subscriber = id, "Event subscriber removed");
        }
    }

    /// Close every subscriber queue. Later calls do nothing.
    pub fn shutdown(&self) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        state.closed = true;
        let count = state.subscribers.len();
        state.subscribers.clear();
        debug!(subscribers = count, "Event bus shut down");
    }

    /// Buffered events for a task with id greater than `last_seen`, oldest first.
    pub fn events_since(&self, task_id: Uuid, last_seen: i64) -> Vec<Event> {
        self.state()
            .buffers
            .get(&task_id)
            .map(|buffer| buffer.iter().filter(|e| e.id > last_seen).cloned().collect())
            .unwrap_or_default()
    }

    /// Last `agent_update` for a task whose run has not ended.
    pub fn latest_state(&self, task_id: Uuid) -> Option<Event> {
        self.state().latest.get(&task_id).cloned()
    }

    /// Drop replay state for a task.
    pub fn forget(&self, task_id: Uuid) {
        let mut state = self.state();
        state.buffers.remove(&task_id);
        state.latest.remove(&task_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.state().subscribers.len()
    }

    /// Highest sequence id issued so far.
    pub fn last_id(&self) -> i64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_REPLAY_CAPACITY, DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

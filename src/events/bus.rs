// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-session bounded event queue.
//!
//! Producers (read loops, the process manager, the driver) call
//! [`EventBus::publish`], which stamps the per-agent sequence number and
//! enqueues in one critical section, so delivery order per agent always
//! matches sequence order. A single consumer drains with [`EventBus::next`].
//!
//! When the queue is at capacity, room is made by dropping the oldest `log`
//! event, then the oldest `progress` event. An incoming `log`/`progress` event
//! with nothing of equal or lower priority to evict is itself dropped.
//! `status`, `result` and `error` events are never dropped and may push the
//! queue past its capacity.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::trace;

use super::types::{EventKind, EventPayload, ProgressEvent};

/// What happened to a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Enqueued with this sequence number.
    Queued(u64),
    /// Discarded under backpressure.
    Dropped,
    /// The bus was closed.
    Closed,
}

/// Events discarded under backpressure, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounts {
    pub log: u64,
    pub progress: u64,
}

impl DropCounts {
    fn record(&mut self, kind: EventKind) {
        match kind {
            EventKind::Log => self.log += 1,
            EventKind::Progress => self.progress += 1,
            _ => {}
        }
        #[cfg(feature = "telemetry")]
        crate::telemetry::GLOBAL_METRICS.record_event_dropped();
    }

    pub fn total(&self) -> u64 {
        self.log + self.progress
    }
}

#[derive(Debug, Default)]
struct BusState {
    queue: VecDeque<ProgressEvent>,
    sequences: HashMap<String, u64>,
    dropped: DropCounts,
    closed: bool,
}

impl BusState {
    /// Make room for one event of `incoming` kind. Returns false when the
    /// incoming event itself should be dropped.
    fn make_room(&mut self, incoming: EventKind) -> bool {
        for victim in [EventKind::Log, EventKind::Progress] {
            if let Some(idx) = self.queue.iter().position(|e| e.kind == victim) {
                self.queue.remove(idx);
                self.dropped.record(victim);
                return true;
            }
            if incoming == victim {
                self.dropped.record(victim);
                return false;
            }
        }
        true
    }

    fn next_sequence(&mut self, agent: &str) -> u64 {
        let counter = self.sequences.entry(agent.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }
}

#[derive(Debug)]
struct BusInner {
    session_id: String,
    capacity: usize,
    state: Mutex<BusState>,
    notify: Notify,
}

/// Cloneable handle to one session's event queue.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus holding up to `capacity` droppable events.
    pub fn new(session_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                session_id: session_id.into(),
                capacity: capacity.max(1),
                state: Mutex::new(BusState::default()),
                notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Stamp and enqueue an event from `agent`.
    pub fn publish(&self, agent: &str, payload: EventPayload) -> PublishOutcome {
        let kind = payload.kind();
        let outcome = {
            let mut state = self.state();
            if state.closed {
                return PublishOutcome::Closed;
            }
            if state.queue.len() >= self.inner.capacity && !state.make_room(kind) {
                PublishOutcome::Dropped
            } else {
                let sequence = state.next_sequence(agent);
                let event =
                    ProgressEvent::new(self.inner.session_id.clone(), agent, sequence, payload);
                state.queue.push_back(event);
                PublishOutcome::Queued(sequence)
            }
        };

        match outcome {
            PublishOutcome::Queued(sequence) => {
                trace!(agent, sequence, kind = kind.as_str(), "Event queued");
                #[cfg(feature = "telemetry")]
                crate::telemetry::GLOBAL_METRICS.record_event_published();
                self.inner.notify.notify_one();
            }
            _ => trace!(agent, kind = kind.as_str(), "Event dropped"),
        }
        outcome
    }

    /// Wait for the next event. Returns `None` once the bus is closed and drained.
    pub async fn next(&self) -> Option<ProgressEvent> {
        loop {
            {
                let mut state = self.state();
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Take the next event without waiting.
    pub fn try_next(&self) -> Option<ProgressEvent> {
        self.state().queue.pop_front()
    }

    /// Put undelivered events back at the head of the queue, keeping their
    /// order and sequence numbers. Capacity is not enforced: these events were
    /// already admitted once. Works on a closed bus.
    pub fn requeue_front(&self, events: Vec<ProgressEvent>) {
        if events.is_empty() {
            return;
        }
        let count = events.len();
        {
            let mut state = self.state();
            for event in events.into_iter().rev() {
                state.queue.push_front(event);
            }
        }
        trace!(count, "Events requeued");
        self.inner.notify.notify_one();
    }

    /// Take every buffered event.
    pub fn drain(&self) -> Vec<ProgressEvent> {
        self.state().queue.drain(..).collect()
    }

    /// Stop accepting events. Buffered events stay readable.
    pub fn close(&self) {
        self.state().closed = true;
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> DropCounts {
        self.state().dropped
    }
}

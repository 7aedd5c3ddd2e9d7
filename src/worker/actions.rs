//! Worker-internal action queue.
//!
//! Cross-cutting actions (kill a task, remove or add a listener trigger,
//! retire a finished task, relay a message) go through one priority queue
//! drained by a small pool of tasks. Lower priority value runs first; equal
//! priorities run FIFO.
//!
//! Relays sharing a correlation id (a task's ack, then its reply) are handed
//! out one at a time: the next one waits until [`ActionQueue::release`]
//! reports the previous one published.

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, Notify};

use crate::broker::Message;
use crate::trigger::TriggerRegistration;
use crate::types::{CorrelationId, Result, TriggerId};

/// Reply channel of an action whose caller waits for the outcome.
pub type Responder = oneshot::Sender<Result<Value>>;

#[derive(Debug)]
pub enum Action {
    KillTask {
        correlation_id: CorrelationId,
        respond: Responder,
    },
    RemoveTrigger {
        trigger_id: TriggerId,
        respond: Responder,
    },
    AddTrigger {
        registration: TriggerRegistration,
        respond: Responder,
    },
    RetireTask {
        correlation_id: CorrelationId,
    },
    Relay {
        queue: String,
        message: Message,
    },
}

impl Action {
    /// Lower runs first.
    pub fn priority(&self) -> u8 {
        match self {
            Action::KillTask { .. } => 0,
            Action::RemoveTrigger { .. } => 1,
            Action::AddTrigger { .. } => 2,
            Action::RetireTask { .. } => 3,
            Action::Relay { .. } => 4,
        }
    }

    /// Relays of one correlation id leave in push order.
    pub fn order_key(&self) -> Option<&CorrelationId> {
        match self {
            Action::Relay { message, .. } => message.correlation_id.as_ref(),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::KillTask { .. } => "kill_task",
            Action::RemoveTrigger { .. } => "remove_trigger",
            Action::AddTrigger { .. } => "add_trigger",
            Action::RetireTask { .. } => "retire_task",
            Action::Relay { .. } => "relay",
        }
    }
}

/// Heap entry; ordering ignores the action itself.
#[derive(Debug)]
struct PriorityItem {
    priority: u8,
    sequence: u64, // FIFO within same priority
    action: Action,
}

impl Ord for PriorityItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is max-heap, so reverse both keys
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for PriorityItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PriorityItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for PriorityItem {}

/// Clones share the same queue.
#[derive(Debug, Clone, Default)]
pub struct ActionQueue {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    available: Notify,
    sequence: AtomicU64,
}

#[derive(Debug, Default)]
struct State {
    heap: BinaryHeap<PriorityItem>,
    /// Order keys of relays handed out and not yet released.
    in_flight: HashSet<CorrelationId>,
}

impl State {
    /// Best item whose order key is free; skipped items go back.
    fn take(&mut self) -> Option<Action> {
        let mut skipped = Vec::new();
        let mut taken = None;
        while let Some(item) = self.heap.pop() {
            match item.action.order_key() {
                Some(key) if self.in_flight.contains(key) => skipped.push(item),
                key => {
                    if let Some(key) = key {
                        self.in_flight.insert(key.clone());
                    }
                    taken = Some(item.action);
                    break;
                }
            }
        }
        self.heap.extend(skipped);
        taken
    }
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, action: Action) {
        let item = PriorityItem {
            priority: action.priority(),
            sequence: self.inner.sequence.fetch_add(1, AtomicOrdering::Relaxed),
            action,
        };
        self.inner.state.lock().await.heap.push(item);
        self.inner.available.notify_one();
    }

    /// Push an action carrying `respond` and wait for its outcome.
    pub async fn request<F>(&self, build: F) -> Result<Value>
    where
        F: FnOnce(Responder) -> Action,
    {
        let (respond, outcome) = oneshot::channel();
        self.push(build(respond)).await;
        outcome
            .await
            .map_err(|_| crate::types::Error::cancelled("action dropped before completion"))?
    }

    /// Highest-priority runnable action, waiting while there is none.
    /// A relay with an order key must be [released](Self::release) once
    /// executed.
    pub async fn pop(&self) -> Action {
        loop {
            let notified = self.inner.available.notified();
            if let Some(action) = self.inner.state.lock().await.take() {
                return action;
            }
            notified.await;
        }
    }

    /// The relay holding `key` is done; the next one may go.
    pub async fn release(&self, key: &CorrelationId) {
        if self.inner.state.lock().await.in_flight.remove(key) {
            self.inner.available.notify_one();
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.heap.len()
    }
}

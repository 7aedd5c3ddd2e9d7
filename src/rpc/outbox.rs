//! At-least-once publishing.
//!
//! A publish that hits a connection failure is queued in memory and
//! retried by a background flusher with reconnect backoff. While anything is
//! queued, new publishes line up behind it so per-caller order holds.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::broker::{BrokerHandle, Message};
use crate::types::{ReconnectPolicy, Result};

/// What happened to a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    Queued,
}

#[derive(Debug, Clone)]
pub struct Outbox {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    broker: BrokerHandle,
    policy: ReconnectPolicy,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<(String, Message)>,
    flushing: bool,
}

impl Outbox {
    pub fn new(broker: BrokerHandle, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                policy,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn broker(&self) -> &BrokerHandle {
        &self.inner.broker
    }

    /// Publish now, or queue on a connection failure. Non-transient errors are
    /// returned to the caller.
    pub async fn publish(&self, queue: &str, message: Message) -> Result<PublishOutcome> {
        let mut state = self.inner.state.lock().await;
        if !state.pending.is_empty() {
            state.pending.push_back((queue.to_string(), message));
            self.ensure_flusher(&mut state);
            return Ok(PublishOutcome::Queued);
        }

        match self.inner.broker.publish(queue, message.clone()).await {
            Ok(()) => Ok(PublishOutcome::Published),
            Err(e) if e.is_transient() => {
                tracing::warn!(queue, error = %e, "publish failed, queued for retry");
                state.pending.push_back((queue.to_string(), message));
                self.ensure_flusher(&mut state);
                Ok(PublishOutcome::Queued)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn pending(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    fn ensure_flusher(&self, state: &mut State) {
        if state.flushing {
            return;
        }
        state.flushing = true;
        tokio::spawn(flush(Arc::clone(&self.inner)));
    }
}

async fn flush(inner: Arc<Inner>) {
    let mut attempt = 0u32;
    loop {
        let Some(delay) = inner.policy.delay_for(attempt) else {
            let mut state = inner.state.lock().await;
            tracing::error!(
                pending = state.pending.len(),
                attempts = attempt,
                "outbox retries exhausted; messages stay queued until the next publish"
            );
            state.flushing = false;
            return;
        };
        tokio::time::sleep(delay).await;
        attempt += 1;

        let mut state = inner.state.lock().await;
        while let Some((queue, message)) = state.pending.front().cloned() {
            match inner.broker.publish(&queue, message).await {
                Ok(()) => {
                    state.pending.pop_front();
                    attempt = 0;
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(queue = %queue, attempt, error = %e, "outbox flush deferred");
                    break;
                }
                Err(e) => {
                    tracing::error!(queue = %queue, error = %e, "outbox message rejected by broker, dropped");
                    state.pending.pop_front();
                }
            }
        }
        if state.pending.is_empty() {
            tracing::info!("outbox drained");
            state.flushing = false;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use serde_json::json;
    use std::time::Duration;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            max_attempts: None,
        }
    }

    #[tokio::test]
    async fn test_publishes_directly_when_available() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q").await.unwrap();
        let outbox = Outbox::new(Arc::new(broker.clone()), policy());
        let delivery = outbox.publish("q", Message::new(json!(1))).await.unwrap();
        assert_eq!(delivery, PublishOutcome::Published);
    }

    #[tokio::test]
    async fn test_queues_during_outage_and_flushes_in_order() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q").await.unwrap();
        let mut consumer = broker.consume("q").await.unwrap();
        let outbox = Outbox::new(Arc::new(broker.clone()), policy());

        broker.set_available(false);
        for i in 0..3 {
            let delivery = outbox.publish("q", Message::new(json!(i))).await.unwrap();
            assert_eq!(delivery, PublishOutcome::Queued);
        }
        assert_eq!(outbox.pending().await, 3);

        broker.set_available(true);
        // Published behind the queued ones even though the broker is back.
        outbox.publish("q", Message::new(json!(3))).await.unwrap();

        for expected in 0..4 {
            let message = tokio::time::timeout(Duration::from_secs(2), consumer.next())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(message.body, json!(expected));
        }
        assert_eq!(outbox.pending().await, 0);
    }

    #[tokio::test]
    async fn test_bounded_policy_keeps_messages() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q").await.unwrap();
        let outbox = Outbox::new(
            Arc::new(broker.clone()),
            ReconnectPolicy {
                max_attempts: Some(2),
                ..policy()
            },
        );
        broker.set_available(false);
        outbox.publish("q", Message::new(json!(1))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(outbox.pending().await, 1);
    }
}

//! Message broker boundary.
//!
//! Named durable queues with competing consumers. Envelopes are JSON bodies;
//! the correlation id and reply destination travel as metadata next to the
//! body, never inside it.
//!
//! Implementations:
//!   - [`MemoryBroker`]: in-process queues (tests, single-process deployments)
//!   - [`BrokerServer`]: exposes a `MemoryBroker` over framed TCP
//!   - [`RemoteBroker`]: client of a `BrokerServer`

pub mod codec;
mod memory;
mod remote;
mod server;

pub use memory::MemoryBroker;
pub use remote::RemoteBroker;
pub use server::BrokerServer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::types::{CorrelationId, Result};

/// A message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub body: Value,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    /// Queue the receiver should reply to.
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl Message {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            correlation_id: None,
            reply_to: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }
}

/// Broker operations used by the orchestrator, worker and scheduler.
#[async_trait]
pub trait Broker: Send + Sync + std::fmt::Debug {
    /// Declare a durable queue. Idempotent.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Delete a queue; attached consumers drain then end.
    async fn delete_queue(&self, queue: &str) -> Result<()>;

    /// Publish to a queue. Messages for undeclared queues are dropped.
    async fn publish(&self, queue: &str, message: Message) -> Result<()>;

    /// Attach a competing consumer, declaring the queue if needed.
    async fn consume(&self, queue: &str) -> Result<Consumer>;
}

/// Shared broker handle.
pub type BrokerHandle = Arc<dyn Broker>;

/// Receiving end of a queue subscription.
#[derive(Debug)]
pub struct Consumer {
    queue: String,
    source: Source,
}

#[derive(Debug)]
enum Source {
    /// Competing consumers pull from one shared receiver.
    Shared(Arc<Mutex<mpsc::UnboundedReceiver<Message>>>),
    /// Dedicated channel fed by a forwarding task.
    Channel(mpsc::Receiver<Message>),
}

impl Consumer {
    pub(crate) fn shared(queue: &str, receiver: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>) -> Self {
        Self {
            queue: queue.to_string(),
            source: Source::Shared(receiver),
        }
    }

    pub(crate) fn channel(queue: &str, receiver: mpsc::Receiver<Message>) -> Self {
        Self {
            queue: queue.to_string(),
            source: Source::Channel(receiver),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Next message, or `None` once the queue is gone.
    pub async fn next(&mut self) -> Option<Message> {
        match &mut self.source {
            Source::Shared(receiver) => receiver.lock().await.recv().await,
            Source::Channel(receiver) => receiver.recv().await,
        }
    }

    /// Non-blocking receive.
    pub fn try_next(&mut self) -> Option<Message> {
        match &mut self.source {
            Source::Shared(receiver) => receiver.try_lock().ok()?.try_recv().ok(),
            Source::Channel(receiver) => receiver.try_recv().ok(),
        }
    }
}

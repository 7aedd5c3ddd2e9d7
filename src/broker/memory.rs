//! In-process broker.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

use super::{Broker, Consumer, Message};
use crate::types::{Error, Result};

#[derive(Debug, Clone)]
struct Queue {
    tx: mpsc::UnboundedSender<Message>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

/// Durable in-memory queues. Messages buffer until a consumer takes them;
/// consumers of one queue compete, waiting consumers are served in turn.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    queues: Arc<RwLock<HashMap<String, Queue>>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate an outage: while unavailable, every operation fails with
    /// a connection error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn queue_names(&self) -> Vec<String> {
        self.queues.read().await.keys().cloned().collect()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::connection("broker unavailable"))
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.check_available()?;
        self.queues
            .write()
            .await
            .entry(queue.to_string())
            .or_insert_with(Queue::new);
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.check_available()?;
        self.queues.write().await.remove(queue);
        Ok(())
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<()> {
        self.check_available()?;
        let queues = self.queues.read().await;
        match queues.get(queue) {
            Some(q) => {
                // The receiver lives in the same entry, so send cannot fail
                // while the queue is declared.
                if q.tx.send(message).is_err() {
                    tracing::warn!(queue, "queue receiver closed, message dropped");
                }
            }
            None => tracing::warn!(queue, "publish to undeclared queue, message dropped"),
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Consumer> {
        self.check_available()?;
        let mut queues = self.queues.write().await;
        let q = queues.entry(queue.to_string()).or_insert_with(Queue::new);
        Ok(Consumer::shared(queue, Arc::clone(&q.rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_buffers_until_consumed() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q").await.unwrap();
        broker.publish("q", Message::new(json!(1))).await.unwrap();
        broker.publish("q", Message::new(json!(2))).await.unwrap();

        let mut consumer = broker.consume("q").await.unwrap();
        assert_eq!(consumer.next().await.unwrap().body, json!(1));
        assert_eq!(consumer.next().await.unwrap().body, json!(2));
        assert!(consumer.try_next().is_none());
    }

    #[tokio::test]
    async fn test_undeclared_queue_drops() {
        let broker = MemoryBroker::new();
        broker.publish("nowhere", Message::new(json!(1))).await.unwrap();
        let mut consumer = broker.consume("nowhere").await.unwrap();
        assert!(consumer.try_next().is_none());
    }

    #[tokio::test]
    async fn test_competing_consumers_each_get_one() {
        let broker = MemoryBroker::new();
        let mut a = broker.consume("q").await.unwrap();
        let mut b = broker.consume("q").await.unwrap();

        let first = tokio::spawn(async move { a.next().await });
        let second = tokio::spawn(async move { b.next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        broker.publish("q", Message::new(json!("x"))).await.unwrap();
        broker.publish("q", Message::new(json!("y"))).await.unwrap();

        let mut bodies = vec![
            first.await.unwrap().unwrap().body,
            second.await.unwrap().unwrap().body,
        ];
        bodies.sort_by_key(|v| v.to_string());
        assert_eq!(bodies, vec![json!("x"), json!("y")]);
    }

    #[tokio::test]
    async fn test_unavailable_broker_fails_publish() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q").await.unwrap();
        broker.set_available(false);
        let err = broker.publish("q", Message::new(json!(1))).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        broker.set_available(true);
        assert!(broker.publish("q", Message::new(json!(1))).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_ends_consumers() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.consume("q").await.unwrap();
        broker.publish("q", Message::new(json!(1))).await.unwrap();
        broker.delete_queue("q").await.unwrap();
        assert!(consumer.next().await.is_some());
        assert!(consumer.next().await.is_none());
    }
}

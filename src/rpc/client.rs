//! Correlation-id request/reply over the broker.

use serde_json::Value;
use std::time::Duration;

use super::messages::{ControlReply, EventMessage};
use super::outbox::{Outbox, PublishOutcome};
use crate::broker::{BrokerHandle, Consumer, Message};
use crate::types::{CorrelationId, Error, Result};

/// Issues blocking calls, non-blocking calls and notifications.
#[derive(Debug, Clone)]
pub struct RpcClient {
    broker: BrokerHandle,
    outbox: Outbox,
}

impl RpcClient {
    pub fn new(broker: BrokerHandle, outbox: Outbox) -> Self {
        Self { broker, outbox }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Open a private reply queue, publish `body` to `queue` tagged with a
    /// fresh correlation id, and return a handle for the reply.
    pub async fn begin(&self, queue: &str, body: Value) -> Result<PendingCall> {
        let correlation_id = CorrelationId::new();
        let reply_queue = format!("sortie.reply.{}", correlation_id);
        self.broker.declare_queue(&reply_queue).await?;
        let consumer = self.broker.consume(&reply_queue).await?;

        let message = Message::new(body)
            .with_correlation(correlation_id.clone())
            .with_reply_to(reply_queue.clone());
        if let Err(e) = self.broker.publish(queue, message).await {
            let _ = self.broker.delete_queue(&reply_queue).await;
            return Err(e);
        }
        tracing::debug!(queue, correlation_id = %correlation_id, "rpc request published");

        Ok(PendingCall {
            correlation_id,
            reply_queue,
            consumer: Some(consumer),
            broker: self.broker.clone(),
        })
    }

    /// Blocking call: the reply message, or RpcTimeout after `timeout`.
    pub async fn call(&self, queue: &str, body: Value, timeout: Duration) -> Result<Message> {
        self.begin(queue, body).await?.wait(timeout).await
    }

    /// Send a control event and unwrap its [`ControlReply`]; a reported
    /// failure is mapped through `on_failure`.
    pub async fn call_control<F>(
        &self,
        queue: &str,
        event: &EventMessage,
        timeout: Duration,
        on_failure: F,
    ) -> Result<Value>
    where
        F: FnOnce(String) -> Error,
    {
        let reply = self.call(queue, event.to_body()?, timeout).await?;
        ControlReply::from_body(&reply.body)?
            .into_result()
            .map_err(on_failure)
    }

    /// Fire-and-forget through the outbox.
    pub async fn notify(&self, queue: &str, body: Value) -> Result<PublishOutcome> {
        self.outbox.publish(queue, Message::new(body)).await
    }

    /// Publish a message whose reply arrives on a shared queue.
    pub async fn send(&self, queue: &str, message: Message) -> Result<PublishOutcome> {
        self.outbox.publish(queue, message).await
    }
}

/// An outstanding call. Dropping it deletes the reply queue.
#[derive(Debug)]
pub struct PendingCall {
    correlation_id: CorrelationId,
    reply_queue: String,
    consumer: Option<Consumer>,
    broker: BrokerHandle,
}

impl PendingCall {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Non-blocking: the reply if it has arrived. Replies with a foreign
    /// correlation id are discarded.
    pub fn poll(&mut self) -> Option<Message> {
        let consumer = self.consumer.as_mut()?;
        while let Some(message) = consumer.try_next() {
            if message.correlation_id.as_ref() == Some(&self.correlation_id) {
                return Some(message);
            }
            discard(&self.correlation_id, &message);
        }
        None
    }

    /// Wait for the reply until `timeout` elapses.
    pub async fn wait(mut self, timeout: Duration) -> Result<Message> {
        let correlation_id = self.correlation_id.clone();
        let Some(mut consumer) = self.consumer.take() else {
            return Err(Error::internal("pending call already consumed"));
        };

        let received = tokio::time::timeout(timeout, async {
            while let Some(message) = consumer.next().await {
                if message.correlation_id.as_ref() == Some(&correlation_id) {
                    return Some(message);
                }
                discard(&correlation_id, &message);
            }
            None
        })
        .await;

        match received {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(Error::connection(format!(
                "reply queue for {} closed",
                correlation_id
            ))),
            Err(_) => Err(Error::rpc_timeout(format!(
                "no reply for {} within {:?}",
                correlation_id, timeout
            ))),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        let broker = self.broker.clone();
        let queue = std::mem::take(&mut self.reply_queue);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = broker.delete_queue(&queue).await {
                    tracing::debug!(queue = %queue, error = %e, "reply queue cleanup failed");
                }
            });
        }
    }
}

fn discard(expected: &CorrelationId, message: &Message) {
    tracing::warn!(
        expected = %expected,
        received = ?message.correlation_id,
        "discarding reply with unknown correlation id"
    );
}

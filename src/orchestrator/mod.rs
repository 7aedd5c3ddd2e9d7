//! Orchestrator listener.
//!
//! Declares the payload-response and event queues and runs a pool of
//! competing consumers on each:
//!   - payload replies → correlation lookup → [`Engine::handle_reply`]
//!   - `trigger_stage`, `scheduled_stage`, `scheduled_run` → engine
//!
//! Every message is handled on its own task: a reply waiting out the
//! correlation grace period, or an event stuck on a worker RPC, never holds
//! a consumer. Handler failures are logged; a malformed message never stops
//! a consumer.

mod handlers;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::broker::{BrokerHandle, Message};
use crate::engine::Engine;
use crate::types::Result;

type Handler = for<'a> fn(&'a Engine, Message) -> BoxFuture<'a, Result<()>>;

fn payload_handler(engine: &Engine, message: Message) -> BoxFuture<'_, Result<()>> {
    handlers::handle_payload_reply(engine, message).boxed()
}

fn event_handler(engine: &Engine, message: Message) -> BoxFuture<'_, Result<()>> {
    handlers::handle_event(engine, message).boxed()
}

#[derive(Debug)]
pub struct Orchestrator {
    engine: Engine,
    broker: BrokerHandle,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(engine: Engine, broker: BrokerHandle) -> Self {
        Self {
            engine,
            broker,
            cancel: CancellationToken::new(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Declare the queues and spawn the consumers. Returns once every
    /// consumer is attached; the handles finish after [`Self::shutdown`].
    pub async fn start(&self) -> Result<Vec<JoinHandle<()>>> {
        let config = self.engine.config();
        let queues: [(&str, &'static str, Handler); 2] = [
            (config.payload_response_queue.as_str(), "payload_response", payload_handler as Handler),
            (config.event_queue.as_str(), "event", event_handler as Handler),
        ];

        let mut handles = Vec::new();
        for (queue, kind, handler) in queues {
            self.broker.declare_queue(queue).await?;
            for index in 0..config.consumers.max(1) {
                let consumer = self.broker.consume(queue).await?;
                let engine = self.engine.clone();
                let cancel = self.cancel.clone();
                handles.push(tokio::spawn(
                    consume(engine, consumer, cancel, kind, index, handler).in_current_span(),
                ));
            }
        }
        tracing::info!(
            payload_response_queue = %config.payload_response_queue,
            event_queue = %config.event_queue,
            consumers = config.consumers,
            "orchestrator listening"
        );
        Ok(handles)
    }

    /// Serve until cancelled.
    pub async fn run(&self) -> Result<()> {
        let handles = self.start().await?;
        futures::future::join_all(handles).await;
        tracing::info!("orchestrator stopped");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn consume(
    engine: Engine,
    mut consumer: crate::broker::Consumer,
    cancel: CancellationToken,
    kind: &'static str,
    index: usize,
    handler: Handler,
) {
    tracing::debug!(queue = consumer.queue(), kind, index, "consumer started");
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = consumer.next() => match message {
                Some(message) => message,
                None => {
                    tracing::warn!(queue = consumer.queue(), "queue closed");
                    break;
                }
            },
        };
        let engine = engine.clone();
        tokio::spawn(
            async move {
                if let Err(e) = handler(&engine, message).await {
                    tracing::warn!(kind, error = %e, "message handling failed");
                }
            }
            .in_current_span(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::rpc::{Outbox, RpcClient};
    use crate::store::Store;
    use crate::types::{CorrelationId, OrchestratorConfig, ReconnectPolicy};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn orchestrator(config: OrchestratorConfig) -> (Orchestrator, BrokerHandle) {
        let handle: BrokerHandle = Arc::new(MemoryBroker::new());
        let rpc = RpcClient::new(handle.clone(), Outbox::new(handle.clone(), ReconnectPolicy::default()));
        let engine = Engine::new(Store::new(), rpc, config);
        (Orchestrator::new(engine, handle.clone()), handle)
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_unknown_event_is_dropped() {
        let (orchestrator, handle) = orchestrator(OrchestratorConfig::default());
        let handles = orchestrator.start().await.unwrap();

        handle
            .publish(
                &OrchestratorConfig::default().event_queue,
                Message::new(json!({"event_type": "bogus", "event_payload": {}})),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(logs_contain("unknown event dropped"));

        orchestrator.shutdown();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_unknown_reply_does_not_hold_consumer() {
        let config = OrchestratorConfig {
            consumers: 1,
            correlation_grace: Duration::from_secs(5),
            correlation_retry_interval: Duration::from_millis(100),
            ..OrchestratorConfig::default()
        };
        let queue = config.payload_response_queue.clone();
        let (orchestrator, handle) = orchestrator(config);
        let handles = orchestrator.start().await.unwrap();

        // Unknown correlation: resolved only after the grace period.
        let stale = Message::new(json!({"result": "ok", "output": "late"})).with_correlation(CorrelationId::new());
        handle.publish(&queue, stale).await.unwrap();
        handle
            .publish(&queue, Message::new(json!({"result": "ok", "output": "anonymous"})))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(logs_contain("payload reply without correlation id dropped"));

        orchestrator.shutdown();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        }
    }
}

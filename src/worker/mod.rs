//! Worker service.
//!
//! A worker owns two queues named after it:
//!   - **payload**: each request becomes a task running one module process
//!   - **control**: health checks, module validation, trigger management
//!     and task kills, answered with a [`ControlReply`]
//!
//! Task and listener registries are only mutated through the
//! [`ActionQueue`], drained by `action_workers` tasks.

pub mod actions;
pub mod listener;
pub mod modules;
mod task;

pub use task::{run_task, TaskInfo, TaskRegistry};

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerHandle, Consumer, Message};
use crate::rpc::{events, worker_control_queue, worker_payload_queue, ControlReply, EventMessage, Outbox};
use crate::trigger::TriggerRegistration;
use crate::types::{CorrelationId, Error, Result, TriggerId, WorkerConfig};
use actions::{Action, ActionQueue, Responder};
use listener::{HttpSessionInventory, ListenerRegistry, SessionInventory};
use modules::{ModuleRegistry, ProcessExecutor};

/// Worker handle. Clones share the same registries.
#[derive(Debug, Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: WorkerConfig,
    broker: BrokerHandle,
    outbox: Outbox,
    executor: ProcessExecutor,
    tasks: TaskRegistry,
    listeners: ListenerRegistry,
    actions: ActionQueue,
    cancel: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct ModuleArgs {
    module: String,
}

#[derive(Debug, Deserialize)]
struct TriggerArgs {
    trigger_id: TriggerId,
}

#[derive(Debug, Deserialize)]
struct CorrelationArgs {
    correlation_id: CorrelationId,
}

impl Worker {
    /// Build a worker; session listeners poll `session_inventory_url` when set.
    pub fn new(broker: BrokerHandle, outbox: Outbox, config: WorkerConfig) -> Result<Self> {
        let inventory = match &config.session_inventory_url {
            Some(url) => {
                let inventory = HttpSessionInventory::new(url.clone(), config.session_poll_interval)?;
                Some(Arc::new(inventory) as Arc<dyn SessionInventory>)
            }
            None => None,
        };
        Ok(Self::with_inventory(broker, outbox, config, inventory))
    }

    pub fn with_inventory(
        broker: BrokerHandle,
        outbox: Outbox,
        config: WorkerConfig,
        inventory: Option<Arc<dyn SessionInventory>>,
    ) -> Self {
        let actions = ActionQueue::new();
        let executor = ProcessExecutor::new(ModuleRegistry::new(&config.modules_dir), config.module_timeout);
        let listeners = ListenerRegistry::new(actions.clone(), inventory, config.session_poll_interval);
        Self {
            inner: Arc::new(Inner {
                config,
                broker,
                outbox,
                executor,
                tasks: TaskRegistry::new(),
                listeners,
                actions,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.inner.tasks
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Declare both queues, attach the consumers and start the action
    /// workers. The handles finish after [`Self::shutdown`].
    pub async fn start(&self) -> Result<Vec<JoinHandle<()>>> {
        let config = &self.inner.config;
        let payload_queue = worker_payload_queue(&config.name);
        let control_queue = worker_control_queue(&config.name);

        let mut handles = Vec::new();
        for index in 0..config.action_workers.max(1) {
            handles.push(tokio::spawn(drain_actions(Arc::clone(&self.inner), index)));
        }
        for (queue, kind) in [(&payload_queue, Kind::Payload), (&control_queue, Kind::Control)] {
            self.inner.broker.declare_queue(queue).await?;
            for index in 0..config.consumers.max(1) {
                let consumer = self.inner.broker.consume(queue).await?;
                handles.push(tokio::spawn(consume(self.clone(), consumer, kind, index)));
            }
        }
        tracing::info!(
            worker = %config.name,
            %payload_queue,
            %control_queue,
            consumers = config.consumers,
            "worker listening"
        );
        Ok(handles)
    }

    /// Serve until cancelled.
    pub async fn run(&self) -> Result<()> {
        let handles = self.start().await?;
        futures::future::join_all(handles).await;
        tracing::info!(worker = %self.name(), "worker stopped");
        Ok(())
    }

    /// Stop consuming, cancel running tasks and tear down every listener.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tasks.cancel_all().await;
        self.inner.listeners.stop_all().await;
    }

    /// Execute one control event.
    pub async fn handle_control(&self, event: &EventMessage) -> Result<Value> {
        let inner = &self.inner;
        match event.event_type.as_str() {
            events::HEALTH_CHECK => Ok(json!({
                "name": inner.config.name,
                "tasks": inner.tasks.list().await.len(),
            })),
            events::VALIDATE_MODULE => {
                let args: ModuleArgs = event.payload()?;
                inner.executor.registry().resolve(&args.module).await?;
                Ok(json!({"module": args.module}))
            }
            events::ADD_TRIGGER => {
                let registration: TriggerRegistration = event.payload()?;
                inner
                    .actions
                    .request(|respond| Action::AddTrigger { registration, respond })
                    .await
            }
            events::REMOVE_TRIGGER => {
                let args: TriggerArgs = event.payload()?;
                inner
                    .actions
                    .request(|respond| Action::RemoveTrigger {
                        trigger_id: args.trigger_id,
                        respond,
                    })
                    .await
            }
            events::LIST_TRIGGERS => Ok(serde_json::to_value(inner.listeners.list().await)?),
            events::KILL_STEP_EXECUTION => {
                let args: CorrelationArgs = event.payload()?;
                inner
                    .actions
                    .request(|respond| Action::KillTask {
                        correlation_id: args.correlation_id,
                        respond,
                    })
                    .await
            }
            other => Err(Error::validation(format!("unknown control event '{}'", other))),
        }
    }

    async fn respond(&self, message: Message) {
        let outcome = match EventMessage::from_body(&message.body) {
            Ok(event) => self.handle_control(&event).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            tracing::warn!(worker = %self.name(), error = %e, "control event failed");
        }

        let (Some(reply_to), Some(correlation_id)) = (message.reply_to, message.correlation_id) else {
            return;
        };
        let body = match serde_json::to_value(ControlReply::from_outcome(outcome)) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode control reply");
                return;
            }
        };
        let reply = Message::new(body).with_correlation(correlation_id);
        if let Err(e) = self.inner.outbox.publish(&reply_to, reply).await {
            tracing::warn!(reply_to = %reply_to, error = %e, "control reply not delivered");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Payload,
    Control,
}

async fn consume(worker: Worker, mut consumer: Consumer, kind: Kind, index: usize) {
    let cancel = worker.cancel_token();
    tracing::debug!(queue = consumer.queue(), ?kind, index, "consumer started");
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
        let worker = worker.clone();
        match kind {
            Kind::Payload => {
                tokio::spawn(async move {
                    let inner = &worker.inner;
                    run_task(&inner.executor, &inner.tasks, &inner.actions, message).await;
                });
            }
            Kind::Control => {
                tokio::spawn(async move { worker.respond(message).await });
            }
        }
    }
}

async fn drain_actions(inner: Arc<Inner>, index: usize) {
    tracing::debug!(index, "action worker started");
    loop {
        let action = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            action = inner.actions.pop() => action,
        };
        tracing::trace!(action = action.name(), index, "action");
        let order_key = action.order_key().cloned();
        execute(&inner, action).await;
        if let Some(key) = order_key {
            inner.actions.release(&key).await;
        }
    }
}

async fn execute(inner: &Inner, action: Action) {
    match action {
        Action::KillTask { correlation_id, respond } => {
            let outcome = inner.tasks.kill(&correlation_id).await;
            answer(respond, outcome.map(|()| json!({"correlation_id": correlation_id})));
        }
        Action::RemoveTrigger { trigger_id, respond } => {
            let outcome = inner.listeners.remove(&trigger_id).await;
            answer(respond, outcome.map(|()| json!({"trigger_id": trigger_id})));
        }
        Action::AddTrigger { registration, respond } => {
            let trigger_id = registration.trigger_id.clone();
            let outcome = match inner.listeners.add(registration).await {
                Ok(key) => serde_json::to_value(key)
                    .map(|listener| json!({"trigger_id": trigger_id, "listener": listener}))
                    .map_err(Error::from),
                Err(e) => Err(e),
            };
            answer(respond, outcome);
        }
        Action::RetireTask { correlation_id } => {
            if inner.tasks.retire(&correlation_id).await {
                tracing::debug!(correlation_id = %correlation_id, "task retired");
            }
        }
        Action::Relay { queue, message } => {
            if let Err(e) = inner.outbox.publish(&queue, message).await {
                tracing::error!(queue = %queue, error = %e, "relay failed");
            }
        }
    }
}

fn answer(respond: Responder, outcome: Result<Value>) {
    if respond.send(outcome).is_err() {
        tracing::debug!("action requester went away");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::rpc::RpcClient;
    use crate::types::ReconnectPolicy;
    use std::time::Duration;

    fn worker(broker: &MemoryBroker, modules_dir: &std::path::Path, action_workers: usize) -> (Worker, RpcClient) {
        let handle: BrokerHandle = Arc::new(broker.clone());
        let outbox = Outbox::new(handle.clone(), ReconnectPolicy::default());
        let config = WorkerConfig {
            name: "w1".into(),
            consumers: 1,
            action_workers,
            modules_dir: modules_dir.to_path_buf(),
            ..WorkerConfig::default()
        };
        let worker = Worker::with_inventory(handle.clone(), outbox.clone(), config, None);
        (worker, RpcClient::new(handle, outbox))
    }

    async fn control(rpc: &RpcClient, event_type: &str, payload: Value) -> std::result::Result<Value, String> {
        let event = EventMessage::new(event_type, payload);
        let reply = rpc
            .call(&worker_control_queue("w1"), event.to_body().unwrap(), Duration::from_secs(2))
            .await
            .unwrap();
        ControlReply::from_body(&reply.body).unwrap().into_result()
    }

    #[tokio::test]
    async fn test_control_events() {
        let broker = MemoryBroker::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("scan"), "#!/bin/sh\n").unwrap();
        let (worker, rpc) = worker(&broker, dir.path(), 1);
        let handles = worker.start().await.unwrap();

        let health = control(&rpc, events::HEALTH_CHECK, json!({})).await.unwrap();
        assert_eq!(health["name"], json!("w1"));

        assert!(control(&rpc, events::VALIDATE_MODULE, json!({"module": "scan"})).await.is_ok());
        assert!(control(&rpc, events::VALIDATE_MODULE, json!({"module": "nope"})).await.is_err());

        let err = control(
            &rpc,
            events::KILL_STEP_EXECUTION,
            json!({"correlation_id": CorrelationId::new()}),
        )
        .await
        .unwrap_err();
        assert!(err.contains("not found"));

        assert!(control(&rpc, "bogus", json!({})).await.is_err());
        assert_eq!(control(&rpc, events::LIST_TRIGGERS, json!({})).await.unwrap(), json!([]));

        worker.shutdown().await;
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_trigger_lifecycle_over_control_queue() {
        let broker = MemoryBroker::new();
        let dir = tempfile::tempdir().unwrap();
        let (worker, rpc) = worker(&broker, dir.path(), 1);
        let _handles = worker.start().await.unwrap();

        let trigger_id = TriggerId::new();
        let registration = json!({
            "trigger_id": trigger_id,
            "reply_queue": "events",
            "listener": {
                "kind": "http",
                "host": "127.0.0.1",
                "port": 0,
                "routes": [{"path": "/hook", "method": "GET"}],
            },
        });
        let added = control(&rpc, events::ADD_TRIGGER, registration).await.unwrap();
        assert_eq!(added["trigger_id"], json!(trigger_id));
        assert_eq!(worker.listeners().list().await.len(), 1);

        control(&rpc, events::REMOVE_TRIGGER, json!({"trigger_id": trigger_id}))
            .await
            .unwrap();
        assert!(worker.listeners().list().await.is_empty());
        assert!(control(&rpc, events::REMOVE_TRIGGER, json!({"trigger_id": trigger_id}))
            .await
            .is_err());

        worker.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ack_precedes_reply_with_many_action_workers() {
        use std::os::unix::fs::PermissionsExt;

        let broker = MemoryBroker::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quick");
        std::fs::write(&path, "#!/bin/sh\nprintf '{\"result\":\"ok\",\"output\":\"done\"}'\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        let (worker, _rpc) = worker(&broker, dir.path(), 4);
        let _handles = worker.start().await.unwrap();

        broker.declare_queue("replies").await.unwrap();
        let mut replies = broker.consume("replies").await.unwrap();
        let ids: Vec<CorrelationId> = (0..8).map(|_| CorrelationId::new()).collect();
        for id in &ids {
            let request = Message::new(json!({"module": "quick", "arguments": {}, "ack_queue": "replies"}))
                .with_correlation(id.clone())
                .with_reply_to("replies");
            broker.publish(&worker_payload_queue("w1"), request).await.unwrap();
        }

        let mut acked = std::collections::HashSet::new();
        for _ in 0..ids.len() * 2 {
            let message = tokio::time::timeout(Duration::from_secs(5), replies.next())
                .await
                .unwrap()
                .unwrap();
            let id = message.correlation_id.clone().unwrap();
            if message.body.get("status") == Some(&json!("accepted")) {
                assert!(acked.insert(id));
            } else {
                assert!(acked.contains(&id), "reply for {} overtook its ack", id);
            }
        }
        assert_eq!(acked.len(), ids.len());
        worker.shutdown().await;
    }
}

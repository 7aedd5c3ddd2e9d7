//! Remote-session detection listener.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{notify_fired, SharedTriggers};
use crate::trigger::ListenerSpec;
use crate::types::{Error, Result, TriggerId};
use crate::worker::actions::ActionQueue;

/// Source of currently open remote sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionInventory: Send + Sync + std::fmt::Debug {
    /// Every known session as a JSON object.
    async fn sessions(&self) -> Result<Vec<Value>>;
}

/// Inventory served over HTTP: `GET <url>` returns a JSON array of sessions,
/// or an object of sessions keyed by id.
#[derive(Debug, Clone)]
pub struct HttpSessionInventory {
    client: reqwest::Client,
    url: String,
}

impl HttpSessionInventory {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal(format!("http client: {}", e)))?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl SessionInventory for HttpSessionInventory {
    async fn sessions(&self) -> Result<Vec<Value>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| Error::connection(format!("session inventory: {}", e)))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::validation(format!("session inventory reply: {}", e)))?;
        Ok(match body {
            Value::Array(sessions) => sessions,
            Value::Object(sessions) => sessions
                .into_iter()
                .map(|(id, mut session)| {
                    if let Value::Object(fields) = &mut session {
                        fields.entry("id").or_insert(Value::String(id));
                    }
                    session
                })
                .collect(),
            _ => Vec::new(),
        })
    }
}

/// Polls the inventory and fires each attached trigger once, on the first
/// session matching its filter. A fired trigger is dropped from the
/// listener.
#[derive(Debug)]
pub struct SessionListener {
    cancel: CancellationToken,
}

impl SessionListener {
    pub fn start(
        inventory: Arc<dyn SessionInventory>,
        interval: Duration,
        triggers: SharedTriggers,
        actions: ActionQueue,
    ) -> Self {
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = poll_once(inventory.as_ref(), &triggers, &actions).await {
                            tracing::warn!(error = %e, "session poll failed");
                        }
                    }
                }
            }
        });
        Self { cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// One inventory round. Returns how many triggers fired.
pub(crate) async fn poll_once(
    inventory: &dyn SessionInventory,
    triggers: &SharedTriggers,
    actions: &ActionQueue,
) -> Result<usize> {
    let sessions = inventory.sessions().await?;
    let mut fired: Vec<(TriggerId, String, Map<String, Value>)> = Vec::new();
    {
        let mut triggers = triggers.write().await;
        triggers.retain(|trigger_id, trigger| {
            let ListenerSpec::Session(args) = &trigger.spec else {
                return true;
            };
            let Some(session) = sessions.iter().find(|session| args.matches(session)) else {
                return true;
            };
            let parameters = match session {
                Value::Object(fields) => fields.clone(),
                other => Map::from_iter([("session".to_string(), other.clone())]),
            };
            fired.push((trigger_id.clone(), trigger.reply_queue.clone(), parameters));
            false
        });
    }
    for (trigger_id, reply_queue, parameters) in &fired {
        notify_fired(actions, trigger_id, reply_queue, parameters.clone()).await?;
    }
    Ok(fired.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::SessionArgs;
    use crate::worker::actions::Action;
    use crate::worker::listener::ListenerTrigger;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    fn triggers(filter: &[(&str, &str)]) -> (TriggerId, SharedTriggers) {
        let trigger_id = TriggerId::new();
        let spec = ListenerSpec::Session(SessionArgs {
            filter: filter.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        });
        let shared = Arc::new(RwLock::new(HashMap::from([(
            trigger_id.clone(),
            ListenerTrigger {
                reply_queue: "events".into(),
                spec,
            },
        )])));
        (trigger_id, shared)
    }

    #[tokio::test]
    async fn test_fires_once_on_first_match() {
        let mut inventory = MockSessionInventory::new();
        inventory
            .expect_sessions()
            .times(2)
            .returning(|| Ok(vec![json!({"id": 4, "user": "root", "host": "10.0.0.9"})]));
        let (trigger_id, shared) = triggers(&[("user", "root")]);
        let actions = ActionQueue::new();

        assert_eq!(poll_once(&inventory, &shared, &actions).await.unwrap(), 1);
        assert_eq!(poll_once(&inventory, &shared, &actions).await.unwrap(), 0);
        assert!(shared.read().await.is_empty());

        match actions.pop().await {
            Action::Relay { message, .. } => {
                let fired: crate::trigger::TriggerFired = crate::rpc::EventMessage::from_body(&message.body)
                    .unwrap()
                    .payload()
                    .unwrap();
                assert_eq!(fired.trigger_id, trigger_id);
                assert_eq!(fired.parameters.get("host"), Some(&json!("10.0.0.9")));
            }
            other => panic!("unexpected {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_no_match_keeps_trigger() {
        let mut inventory = MockSessionInventory::new();
        inventory
            .expect_sessions()
            .returning(|| Ok(vec![json!({"user": "guest"})]));
        let (_, shared) = triggers(&[("user", "root")]);
        let actions = ActionQueue::new();

        assert_eq!(poll_once(&inventory, &shared, &actions).await.unwrap(), 0);
        assert_eq!(shared.read().await.len(), 1);
        assert_eq!(actions.len().await, 0);
    }

    #[tokio::test]
    async fn test_inventory_failure_is_reported() {
        let mut inventory = MockSessionInventory::new();
        inventory
            .expect_sessions()
            .returning(|| Err(Error::connection("down")));
        let (_, shared) = triggers(&[("user", "root")]);
        let err = poll_once(&inventory, &shared, &ActionQueue::new()).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }
}

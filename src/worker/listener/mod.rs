//! Long-lived listeners realizing event triggers.
//!
//! Listeners are keyed by identity:
//!   - **HTTP**: the bound address; every trigger on it shares one server
//!   - **Session**: the filter; triggers with the same filter share one poller
//!
//! A listener starts with its first trigger and stops when its last trigger
//! is removed. Fire notifications leave through the action queue.

mod http;
mod session;

pub use http::HttpListener;
pub use session::{HttpSessionInventory, SessionInventory, SessionListener};

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use super::actions::{Action, ActionQueue};
use crate::broker::Message;
use crate::rpc::{events, EventMessage};
use crate::trigger::{ListenerSpec, TriggerFired, TriggerRegistration};
use crate::types::{Error, Result, TriggerId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ListenerKey {
    Http { host: String, port: u16 },
    Session { filter: BTreeMap<String, String> },
}

impl ListenerKey {
    pub fn of(spec: &ListenerSpec) -> Self {
        match spec {
            ListenerSpec::Http(args) => ListenerKey::Http {
                host: args.host.clone(),
                port: args.port,
            },
            ListenerSpec::Session(args) => ListenerKey::Session {
                filter: args.filter.clone(),
            },
        }
    }
}

/// A trigger attached to a listener.
#[derive(Debug, Clone)]
pub struct ListenerTrigger {
    pub reply_queue: String,
    pub spec: ListenerSpec,
}

/// Triggers of one listener, shared with its serving task.
pub type SharedTriggers = Arc<RwLock<HashMap<TriggerId, ListenerTrigger>>>;

/// Queue a `trigger_stage` notification for `trigger_id`.
pub(crate) async fn notify_fired(
    actions: &ActionQueue,
    trigger_id: &TriggerId,
    reply_queue: &str,
    parameters: Map<String, Value>,
) -> Result<()> {
    let fired = TriggerFired {
        trigger_id: trigger_id.clone(),
        parameters,
    };
    let body = EventMessage::new(events::TRIGGER_STAGE, serde_json::to_value(&fired)?).to_body()?;
    actions
        .push(Action::Relay {
            queue: reply_queue.to_string(),
            message: Message::new(body),
        })
        .await;
    tracing::info!(trigger_id = %trigger_id, "trigger fired");
    Ok(())
}

#[derive(Debug)]
enum Running {
    Http(HttpListener),
    Session(SessionListener),
}

impl Running {
    fn stop(&self) {
        match self {
            Running::Http(listener) => listener.stop(),
            Running::Session(listener) => listener.stop(),
        }
    }

    fn addr(&self) -> Option<SocketAddr> {
        match self {
            Running::Http(listener) => Some(listener.addr()),
            Running::Session(_) => None,
        }
    }
}

#[derive(Debug)]
struct Entry {
    running: Running,
    triggers: SharedTriggers,
}

/// One row of `list_triggers`.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerListing {
    pub trigger_id: TriggerId,
    pub listener: ListenerKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<SocketAddr>,
}

#[derive(Debug)]
pub struct ListenerRegistry {
    actions: ActionQueue,
    inventory: Option<Arc<dyn SessionInventory>>,
    poll_interval: Duration,
    listeners: Mutex<HashMap<ListenerKey, Entry>>,
}

impl ListenerRegistry {
    pub fn new(actions: ActionQueue, inventory: Option<Arc<dyn SessionInventory>>, poll_interval: Duration) -> Self {
        Self {
            actions,
            inventory,
            poll_interval,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a trigger, starting its listener if none serves the key yet.
    pub async fn add(&self, registration: TriggerRegistration) -> Result<ListenerKey> {
        registration.listener.check()?;
        let key = ListenerKey::of(&registration.listener);
        let trigger = ListenerTrigger {
            reply_queue: registration.reply_queue,
            spec: registration.listener,
        };

        let mut listeners = self.listeners.lock().await;
        if let Some(entry) = listeners.get(&key) {
            entry.triggers.write().await.insert(registration.trigger_id.clone(), trigger);
            tracing::info!(trigger_id = %registration.trigger_id, listener = ?key, "trigger joined listener");
            return Ok(key);
        }

        let triggers: SharedTriggers = Arc::new(RwLock::new(HashMap::new()));
        triggers.write().await.insert(registration.trigger_id.clone(), trigger);
        let running = match &key {
            ListenerKey::Http { host, port } => Running::Http(
                HttpListener::bind(host, *port, triggers.clone(), self.actions.clone()).await?,
            ),
            ListenerKey::Session { .. } => {
                let Some(inventory) = self.inventory.clone() else {
                    return Err(Error::validation("no session inventory configured"));
                };
                Running::Session(SessionListener::start(
                    inventory,
                    self.poll_interval,
                    triggers.clone(),
                    self.actions.clone(),
                ))
            }
        };
        tracing::info!(trigger_id = %registration.trigger_id, listener = ?key, "listener started");
        listeners.insert(key.clone(), Entry { running, triggers });
        Ok(key)
    }

    /// Detach a trigger; the listener stops with its last trigger.
    ///
    /// Session triggers drop themselves once fired, so every emptied
    /// listener is swept here, not only the one that held `trigger_id`.
    pub async fn remove(&self, trigger_id: &TriggerId) -> Result<()> {
        let mut listeners = self.listeners.lock().await;
        let mut found = false;
        let mut emptied = Vec::new();
        for (key, entry) in listeners.iter() {
            let mut triggers = entry.triggers.write().await;
            if triggers.remove(trigger_id).is_some() {
                found = true;
            }
            if triggers.is_empty() {
                emptied.push(key.clone());
            }
        }
        for key in emptied {
            if let Some(entry) = listeners.remove(&key) {
                entry.running.stop();
                tracing::info!(listener = ?key, "listener stopped");
            }
        }
        if !found {
            return Err(Error::not_found(format!("trigger {}", trigger_id)));
        }
        Ok(())
    }

    pub async fn list(&self) -> Vec<TriggerListing> {
        let listeners = self.listeners.lock().await;
        let mut listing = Vec::new();
        for (key, entry) in listeners.iter() {
            for trigger_id in entry.triggers.read().await.keys() {
                listing.push(TriggerListing {
                    trigger_id: trigger_id.clone(),
                    listener: key.clone(),
                    addr: entry.running.addr(),
                });
            }
        }
        listing.sort_by(|a, b| a.trigger_id.cmp(&b.trigger_id));
        listing
    }

    pub async fn stop_all(&self) {
        for (_, entry) in self.listeners.lock().await.drain() {
            entry.running.stop();
        }
    }
}

//! Inbound HTTP listener.

use axum::extract::{FromRequest, Query, Request, State};
use axum::http::StatusCode;
use axum::{Form, Router};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::{notify_fired, SharedTriggers};
use crate::trigger::ListenerSpec;
use crate::types::{Error, Result};
use crate::worker::actions::ActionQueue;

#[derive(Debug, Clone)]
struct HttpState {
    triggers: SharedTriggers,
    actions: ActionQueue,
}

/// An axum server answering every path; requests are matched against the
/// routes of the attached triggers.
#[derive(Debug)]
pub struct HttpListener {
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl HttpListener {
    pub async fn bind(host: &str, port: u16, triggers: SharedTriggers, actions: ActionQueue) -> Result<Self> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| Error::validation(format!("cannot listen on {}:{}: {}", host, port, e)))?;
        let addr = listener.local_addr()?;
        let app = Router::new()
            .fallback(handle_request)
            .with_state(HttpState { triggers, actions });

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::warn!(%addr, error = %e, "http listener failed");
            }
        });
        tracing::info!(%addr, "http listener bound");
        Ok(Self { addr, cancel })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn handle_request(State(state): State<HttpState>, request: Request) -> StatusCode {
    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let mut params: BTreeMap<String, String> = Query::try_from_uri(request.uri())
        .map(|Query(query)| query)
        .unwrap_or_default();
    if let Ok(Form(form)) = Form::<BTreeMap<String, String>>::from_request(request, &state).await {
        params.extend(form);
    }

    let mut fired = Vec::new();
    for (trigger_id, trigger) in state.triggers.read().await.iter() {
        let ListenerSpec::Http(args) = &trigger.spec else {
            continue;
        };
        if let Some(captured) = args.routes.iter().find_map(|route| route.matches(&method, &path, &params)) {
            fired.push((trigger_id.clone(), trigger.reply_queue.clone(), captured));
        }
    }

    if fired.is_empty() {
        tracing::debug!(%method, %path, "no route matched");
        return StatusCode::NOT_FOUND;
    }
    for (trigger_id, reply_queue, captured) in fired {
        if let Err(e) = notify_fired(&state.actions, &trigger_id, &reply_queue, captured).await {
            tracing::warn!(trigger_id = %trigger_id, error = %e, "fire notification failed");
        }
    }
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::EventMessage;
    use crate::trigger::{HttpArgs, HttpParameter, HttpRoute, TriggerFired};
    use crate::types::TriggerId;
    use crate::worker::actions::Action;
    use crate::worker::listener::ListenerTrigger;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    #[tokio::test]
    async fn test_matching_request_fires_trigger() {
        let trigger_id = TriggerId::new();
        let spec = ListenerSpec::Http(HttpArgs {
            host: "127.0.0.1".into(),
            port: 0,
            routes: vec![HttpRoute {
                path: "/callback".into(),
                method: "GET".into(),
                parameters: vec![HttpParameter {
                    name: "token".into(),
                    value: None,
                }],
            }],
        });
        let triggers: SharedTriggers = Arc::new(RwLock::new(HashMap::from([(
            trigger_id.clone(),
            ListenerTrigger {
                reply_queue: "events".into(),
                spec,
            },
        )])));
        let actions = ActionQueue::new();
        let listener = HttpListener::bind("127.0.0.1", 0, triggers, actions.clone()).await.unwrap();
        let base = format!("http://{}", listener.addr());
        let client = reqwest::Client::new();

        let missed = client.get(format!("{}/callback", base)).send().await.unwrap();
        assert_eq!(missed.status(), reqwest::StatusCode::NOT_FOUND);
        assert_eq!(actions.len().await, 0);

        let hit = client
            .get(format!("{}/callback?token=abc", base))
            .send()
            .await
            .unwrap();
        assert_eq!(hit.status(), reqwest::StatusCode::OK);

        match actions.pop().await {
            Action::Relay { queue, message } => {
                assert_eq!(queue, "events");
                let event = EventMessage::from_body(&message.body).unwrap();
                let fired: TriggerFired = event.payload().unwrap();
                assert_eq!(fired.trigger_id, trigger_id);
                assert_eq!(fired.parameters.get("token"), Some(&serde_json::json!("abc")));
            }
            other => panic!("unexpected {}", other.name()),
        }
        listener.stop();
    }
}

//! Client of a [`BrokerServer`](super::BrokerServer).

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use super::codec::{
    decode, encode, read_frame, write_frame, Delivery, Operation, Request, Response, MSG_DELIVERY,
    MSG_ERROR, MSG_REQUEST, MSG_RESPONSE,
};
use super::{Broker, Consumer, Message};
use crate::types::{BrokerConfig, Error, Result};

const CONSUMER_BUFFER: usize = 64;

/// Broker reached over TCP. Control operations share one lazily
/// (re)established connection; every consumer owns its own connection and
/// reconnects according to the configured [`ReconnectPolicy`](crate::types::ReconnectPolicy).
#[derive(Debug, Clone)]
pub struct RemoteBroker {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: BrokerConfig,
    control: Mutex<Option<Connection>>,
    next_id: AtomicU64,
}

#[derive(Debug)]
struct Connection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(config: &BrokerConfig) -> Result<Self> {
        let connect = TcpStream::connect(&config.listen_addr);
        let stream = tokio::time::timeout(Duration::from_secs(config.write_timeout_secs), connect)
            .await
            .map_err(|_| Error::connection(format!("connect to {} timed out", config.listen_addr)))?
            .map_err(|e| Error::connection(format!("connect to {}: {}", config.listen_addr, e)))?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self { reader, writer })
    }

    /// Send one request and wait for its acknowledgement.
    async fn request(&mut self, config: &BrokerConfig, request: &Request) -> Result<()> {
        let payload = encode(request)?;
        tokio::time::timeout(
            Duration::from_secs(config.write_timeout_secs),
            write_frame(&mut self.writer, MSG_REQUEST, &payload),
        )
        .await
        .map_err(|_| Error::connection("broker write timed out"))?
        .map_err(|e| Error::connection(format!("broker write: {}", e)))?;

        let frame = tokio::time::timeout(
            Duration::from_secs(config.read_timeout_secs),
            read_frame(&mut self.reader, config.max_frame_bytes),
        )
        .await
        .map_err(|_| Error::connection("broker reply timed out"))?
        .map_err(|e| Error::connection(format!("broker read: {}", e)))?;

        match frame {
            None => Err(Error::connection("broker closed the connection")),
            Some((MSG_RESPONSE, payload)) => {
                let response: Response = decode(&payload)?;
                if response.id != request.id {
                    return Err(Error::internal(format!(
                        "broker answered request {} while {} was pending",
                        response.id, request.id
                    )));
                }
                Ok(())
            }
            Some((MSG_ERROR, payload)) => {
                let response: Response = decode(&payload)?;
                Err(response
                    .error
                    .map(Error::from)
                    .unwrap_or_else(|| Error::internal("broker error without detail")))
            }
            Some((kind, _)) => Err(Error::internal(format!(
                "unexpected frame type 0x{:02X} on control connection",
                kind
            ))),
        }
    }
}

impl RemoteBroker {
    /// Connect the control channel to `config.listen_addr`.
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        let connection = Connection::open(&config).await?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                control: Mutex::new(Some(connection)),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    fn request(&self, op: Operation) -> Request {
        Request {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            op,
        }
    }

    async fn control(&self, op: Operation) -> Result<()> {
        let request = self.request(op);
        let mut control = self.inner.control.lock().await;
        if control.is_none() {
            *control = Some(Connection::open(&self.inner.config).await?);
        }
        let connection = control
            .as_mut()
            .ok_or_else(|| Error::connection("no broker connection"))?;
        let result = connection.request(&self.inner.config, &request).await;
        if matches!(result, Err(Error::Connection(_)) | Err(Error::Io(_))) {
            // Next call reconnects.
            *control = None;
        }
        result
    }

    async fn subscribe(config: &BrokerConfig, id: u64, queue: &str) -> Result<Connection> {
        let mut connection = Connection::open(config).await?;
        let request = Request {
            id,
            op: Operation::Consume {
                queue: queue.to_string(),
            },
        };
        connection.request(config, &request).await?;
        Ok(connection)
    }
}

#[async_trait]
impl Broker for RemoteBroker {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.control(Operation::Declare {
            queue: queue.to_string(),
        })
        .await
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.control(Operation::Delete {
            queue: queue.to_string(),
        })
        .await
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<()> {
        self.control(Operation::Publish {
            queue: queue.to_string(),
            message,
        })
        .await
    }

    async fn consume(&self, queue: &str) -> Result<Consumer> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Self::subscribe(&self.inner.config, id, queue).await?;
        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        tokio::spawn(pump(
            connection,
            queue.to_string(),
            self.inner.config.clone(),
            Arc::clone(&self.inner),
            tx,
        ));
        Ok(Consumer::channel(queue, rx))
    }
}

/// Relay deliveries into the consumer channel, reconnecting on loss.
async fn pump(
    mut connection: Connection,
    queue: String,
    config: BrokerConfig,
    inner: Arc<Inner>,
    tx: mpsc::Sender<Message>,
) {
    loop {
        let lost = tokio::select! {
            _ = tx.closed() => return,
            lost = relay(&mut connection, &queue, &config, &tx) => lost,
        };
        if !lost {
            return;
        }

        tracing::warn!(queue = %queue, "broker subscription lost, reconnecting");
        let mut attempt = 0u32;
        connection = loop {
            let Some(delay) = config.reconnect.delay_for(attempt) else {
                tracing::error!(queue = %queue, attempts = attempt, "giving up on broker subscription");
                return;
            };
            tokio::time::sleep(delay).await;
            attempt += 1;
            if tx.is_closed() {
                return;
            }
            let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
            match RemoteBroker::subscribe(&config, id, &queue).await {
                Ok(connection) => {
                    tracing::info!(queue = %queue, attempts = attempt, "broker subscription restored");
                    break connection;
                }
                Err(e) => tracing::debug!(queue = %queue, attempt, error = %e, "reconnect failed"),
            }
        };
    }
}

/// Returns `true` when the connection was lost, `false` when the consumer
/// went away.
async fn relay(
    connection: &mut Connection,
    queue: &str,
    config: &BrokerConfig,
    tx: &mpsc::Sender<Message>,
) -> bool {
    loop {
        let frame = match read_frame(&mut connection.reader, config.max_frame_bytes).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return true,
            Err(e) => {
                tracing::debug!(queue, error = %e, "subscription read failed");
                return true;
            }
        };
        match frame {
            (MSG_DELIVERY, payload) => match decode::<Delivery>(&payload) {
                Ok(delivery) => {
                    if tx.send(delivery.message).await.is_err() {
                        return false;
                    }
                }
                Err(e) => tracing::warn!(queue, error = %e, "undecodable delivery dropped"),
            },
            (kind, _) => tracing::debug!(queue, kind, "ignoring frame on subscription"),
        }
    }
}

//! TCP broker server: accept loop and per-connection handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::codec::{
    decode, encode, read_frame, write_frame, Delivery, Operation, Request, Response, WireError,
    MSG_DELIVERY, MSG_ERROR, MSG_REQUEST, MSG_RESPONSE,
};
use super::{Broker, MemoryBroker};
use crate::types::{BrokerConfig, Error};

/// Outgoing frames are funneled through one writer task per connection.
type FrameTx = mpsc::Sender<(u8, Vec<u8>)>;

/// Serves a [`MemoryBroker`] to remote clients.
#[derive(Debug)]
pub struct BrokerServer {
    broker: MemoryBroker,
    config: BrokerConfig,
    cancel: CancellationToken,
}

impl BrokerServer {
    pub fn new(broker: MemoryBroker, config: BrokerConfig) -> Self {
        Self {
            broker,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.config.listen_addr).await
    }

    /// Run until cancelled or a fatal accept error occurs.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));
        tracing::info!(
            addr = %listener.local_addr()?,
            max_connections = self.config.max_connections,
            "broker server listening"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("broker server shutting down");
                    break;
                }
                accept = listener.accept() => {
                    let (stream, peer) = accept?;

                    let permit = match Arc::clone(&semaphore).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(%peer, max = self.config.max_connections, "connection rejected: at capacity");
                            drop(stream);
                            continue;
                        }
                    };

                    tracing::debug!(%peer, "broker connection");
                    let broker = self.broker.clone();
                    let cancel = self.cancel.child_token();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, broker, cancel, config, permit).await {
                            tracing::warn!(%peer, error = %e, "broker connection error");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: MemoryBroker,
    cancel: CancellationToken,
    config: BrokerConfig,
    _permit: OwnedSemaphorePermit,
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let read_timeout = Duration::from_secs(config.read_timeout_secs);
    let write_timeout = Duration::from_secs(config.write_timeout_secs);

    let (frame_tx, mut frame_rx) = mpsc::channel::<(u8, Vec<u8>)>(256);
    let writer_cancel = cancel.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            let (kind, payload) = tokio::select! {
                _ = writer_cancel.cancelled() => break,
                frame = frame_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let written = tokio::time::timeout(write_timeout, write_frame(&mut writer, kind, &payload)).await;
            match written {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(%peer, error = %e, "write failed");
                    break;
                }
                Err(_) => {
                    tracing::warn!(%peer, timeout_secs = write_timeout.as_secs(), "write timeout, dropping connection");
                    break;
                }
            }
        }
        writer_cancel.cancel();
    });

    let mut subscribed = false;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_with_idle_timeout(&mut reader, config.max_frame_bytes, read_timeout, subscribed) => frame,
        };
        let (kind, payload) = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                tracing::debug!(%peer, "read timeout, dropping connection");
                break;
            }
            Err(e) => {
                cancel.cancel();
                drop(frame_tx);
                let _ = writer_task.await;
                return Err(e);
            }
        };

        if kind != MSG_REQUEST {
            send_error(&frame_tx, 0, "INVALID_ARGUMENT", format!("unexpected message type: 0x{:02X}", kind)).await;
            continue;
        }
        let request: Request = match decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                send_error(&frame_tx, 0, "INVALID_ARGUMENT", e.to_string()).await;
                continue;
            }
        };

        let mut subscription = None;
        let result = match request.op {
            Operation::Declare { queue } => broker.declare_queue(&queue).await,
            Operation::Delete { queue } => broker.delete_queue(&queue).await,
            Operation::Publish { queue, message } => broker.publish(&queue, message).await,
            Operation::Consume { queue } => broker.consume(&queue).await.map(|consumer| {
                subscription = Some(consumer);
            }),
        };

        match result {
            Ok(()) => {
                let response = Response {
                    id: request.id,
                    ok: true,
                    error: None,
                };
                if frame_tx.send((MSG_RESPONSE, encode(&response)?)).await.is_err() {
                    break;
                }
                // Acknowledge before the first delivery can be queued.
                if let Some(consumer) = subscription {
                    subscribed = true;
                    tokio::spawn(forward(consumer, broker.clone(), frame_tx.clone(), cancel.clone()));
                }
            }
            Err(e) => send_error(&frame_tx, request.id, e.to_ipc_error_code(), e.to_string()).await,
        }
    }

    cancel.cancel();
    drop(frame_tx);
    let _ = writer_task.await;
    Ok(())
}

/// Subscribed connections are legitimately idle for long periods.
async fn read_with_idle_timeout<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
    idle: Duration,
    subscribed: bool,
) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    if subscribed {
        return read_frame(reader, max_frame_bytes).await;
    }
    tokio::time::timeout(idle, read_frame(reader, max_frame_bytes))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout"))?
}

/// Push queue messages to the client. A message that cannot be handed to the
/// writer goes back to the queue.
async fn forward(
    mut consumer: super::Consumer,
    broker: MemoryBroker,
    frame_tx: FrameTx,
    cancel: CancellationToken,
) {
    let queue = consumer.queue().to_string();
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = consumer.next() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let delivery = Delivery {
            queue: queue.clone(),
            message,
        };
        let payload = match encode(&delivery) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(queue = %queue, error = %e, "dropping unencodable message");
                continue;
            }
        };
        if frame_tx.send((MSG_DELIVERY, payload)).await.is_err() || cancel.is_cancelled() {
            requeue(&broker, &queue, delivery.message).await;
            break;
        }
    }
}

async fn requeue(broker: &MemoryBroker, queue: &str, message: super::Message) {
    if let Err(e) = broker.publish(queue, message).await {
        tracing::error!(queue, error = %e, "failed to requeue undelivered message");
    }
}

async fn send_error(frame_tx: &FrameTx, id: u64, code: &str, message: String) {
    let response = Response {
        id,
        ok: false,
        error: Some(WireError {
            code: code.to_string(),
            message,
        }),
    };
    match encode(&response) {
        Ok(payload) => {
            let _ = frame_tx.send((MSG_ERROR, payload)).await;
        }
        Err(e) => tracing::error!(error = %e, "failed to encode error response"),
    }
}

impl From<WireError> for Error {
    fn from(wire: WireError) -> Self {
        match wire.code.as_str() {
            "UNAVAILABLE" => Error::connection(wire.message),
            "NOT_FOUND" => Error::not_found(wire.message),
            "INVALID_ARGUMENT" => Error::validation(wire.message),
            _ => Error::internal(wire.message),
        }
    }
}

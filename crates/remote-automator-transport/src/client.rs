//! Websocket RPC client for the automation target.
//!
//! Requests carry auto-incrementing IDs and responses are correlated back to
//! the caller. Frames without an ID are events and are broadcast to
//! subscribers.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde_json::Value;
use tokio::{
    net::TcpStream,
    sync::{Mutex, broadcast, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};

use crate::protocol::{Event, Incoming, Request, Response};

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// Transport error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("connecting to {endpoint} timed out after {duration:?}")]
    ConnectTimeout { endpoint: String, duration: Duration },
    #[error("`{method}` timed out after {duration:?}")]
    Timeout { method: String, duration: Duration },
    #[error("`{method}` failed: {message}")]
    Remote { method: String, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection closed")]
    Closed,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Client side of the automation websocket.
pub struct WsClient {
    endpoint: String,
    next_id: AtomicU64,
    pending: Pending,
    writer: Mutex<WsSink>,
    events: broadcast::Sender<Event>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl WsClient {
    /// Dial `endpoint`, optionally bounding the handshake.
    ///
    /// # Errors
    /// Returns error if the socket cannot be opened in time.
    pub async fn connect(endpoint: &str, timeout: Option<Duration>) -> Result<Self, TransportError> {
        tracing::debug!(endpoint, "connecting to automation websocket");

        let handshake = tokio_tungstenite::connect_async(endpoint);
        let result = match timeout {
            Some(duration) => tokio::time::timeout(duration, handshake)
                .await
                .map_err(|_| TransportError::ConnectTimeout {
                    endpoint: endpoint.to_string(),
                    duration,
                })?,
            None => handshake.await,
        };
        let (stream, _) = result.map_err(|e| TransportError::Connect {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        let (writer, reader) = stream.split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(1024);
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            events.clone(),
            Arc::clone(&closed),
        ));

        tracing::debug!(endpoint, "automation websocket established");

        Ok(Self {
            endpoint: endpoint.to_string(),
            next_id: AtomicU64::new(1),
            pending,
            writer: Mutex::new(writer),
            events,
            closed,
            reader,
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the socket has closed, locally or remotely.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Receiver for events arriving from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Call `method` with the default timeout.
    ///
    /// # Errors
    /// Returns error on timeout, remote failure or a closed socket.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        self.call_with_timeout(method, params, DEFAULT_CALL_TIMEOUT).await
    }

    /// Call `method` and wait at most `timeout` for its response.
    ///
    /// # Errors
    /// Returns error on timeout, remote failure or a closed socket.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let json = serde_json::to_string(&Request::new(id, method, params))?;

        // Register before sending so a fast reply is not lost.
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        tracing::trace!(id, method, "sending request");
        let sent = self.writer.lock().await.send(Message::Text(json.into())).await;
        if let Err(e) = sent {
            self.pending.lock().await.remove(&id);
            return Err(TransportError::Protocol(format!("failed to send `{method}`: {e}")));
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(TransportError::Timeout {
                    method: method.to_string(),
                    duration: timeout,
                });
            }
        };

        if let Some(err) = response.error {
            return Err(TransportError::Remote {
                method: method.to_string(),
                message: err.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Send a close frame and stop reading.
    ///
    /// # Errors
    /// Returns error if the close frame cannot be sent.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = {
            let mut writer = self.writer.lock().await;
            match writer.send(Message::Close(None)).await {
                Ok(()) => writer.close().await,
                Err(e) => Err(e),
            }
        };
        self.reader.abort();
        self.pending.lock().await.clear();
        result.map_err(|e| TransportError::Protocol(format!("failed to close websocket: {e}")))
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut reader: SplitStream<WsStream>,
    pending: Pending,
    events: broadcast::Sender<Event>,
    closed: Arc<AtomicBool>,
) {
    while let Some(msg) = reader.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Binary(b)) => match String::from_utf8(b.to_vec()) {
                Ok(s) => s,
                Err(_) => {
                    tracing::debug!("ignoring non-UTF-8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => {
                tracing::debug!("websocket closed by target");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "websocket read error, stopping reader");
                break;
            }
        };

        match Incoming::parse(&text) {
            Ok(Incoming::Response(response)) => {
                if let Some(tx) = pending.lock().await.remove(&response.id) {
                    let _ = tx.send(response);
                } else {
                    tracing::debug!(id = response.id, "response for unknown request");
                }
            }
            Ok(Incoming::Event(event)) => {
                // No subscribers is fine.
                let _ = events.send(event);
            }
            Err(e) => tracing::warn!(error = %e, "unparseable frame from target"),
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every waiting call with `Closed`.
    pending.lock().await.clear();
}

//! DevTools WebSocket transport for a single page target.
//!
//! [`CdpClient`] owns the socket. Outgoing commands get a fresh id and park a
//! oneshot in the pending table; the reader task resolves it when the
//! matching reply arrives. Everything without an id is an event and goes to
//! the session's event feed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::FetchError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Outbound = SplitSink<Socket, Message>;
type Inbound = SplitStream<Socket>;
type Waiters = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Receiving half of a session's event feed.
pub type EventReceiver = mpsc::UnboundedReceiver<CdpEvent>;

/// An unsolicited message from the browser, e.g. `Network.responseReceived`.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

/// The `error` member of a failed command reply.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpResponseError {
    pub code: i64,
    pub message: String,
    pub data: Option<String>,
}

/// Outcome of one command as reported by the browser.
#[derive(Debug, Clone)]
pub struct Reply {
    pub id: u64,
    pub outcome: Result<Value, CdpResponseError>,
}

impl Reply {
    fn closed(id: u64) -> Self {
        Self {
            id,
            outcome: Err(CdpResponseError {
                code: -1,
                message: "DevTools connection closed".to_string(),
                data: None,
            }),
        }
    }

    fn into_result(self) -> Result<Value, FetchError> {
        self.outcome.map_err(|err| FetchError::CdpError {
            code: err.code,
            message: err.message,
            data: err.data,
        })
    }
}

/// A decoded inbound frame.
#[derive(Debug)]
pub enum Incoming {
    Reply(Reply),
    Event(CdpEvent),
}

/// Classify a decoded JSON frame. Frames with neither an `id` nor a
/// `method` yield `None`.
pub fn classify(frame: Value) -> Option<Incoming> {
    let Value::Object(mut map) = frame else {
        return None;
    };

    if let Some(id) = map.get("id").and_then(Value::as_u64) {
        let outcome = match map.remove("error") {
            Some(err) => Err(serde_json::from_value(err).unwrap_or(CdpResponseError {
                code: 0,
                message: "unparseable error object".to_string(),
                data: None,
            })),
            None => Ok(map.remove("result").unwrap_or(Value::Null)),
        };
        return Some(Incoming::Reply(Reply { id, outcome }));
    }

    let method = match map.remove("method")? {
        Value::String(m) => m,
        _ => return None,
    };
    let params = map.remove("params").unwrap_or(Value::Null);
    Some(Incoming::Event(CdpEvent { method, params }))
}

/// Serialize one outgoing command frame.
pub fn encode_command(id: u64, method: &str, params: Value) -> String {
    serde_json::json!({ "id": id, "method": method, "params": params }).to_string()
}

/// Issues CDP commands against a page target.
///
/// The fetch engine talks to the browser only through this trait.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Send `method` and wait at most `timeout` for the reply.
    async fn send_command(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, FetchError>;
}

/// A live DevTools connection.
pub struct CdpClient {
    ids: AtomicU64,
    waiters: Waiters,
    outbound: Mutex<Outbound>,
    events: std::sync::Mutex<Option<EventReceiver>>,
    reader: JoinHandle<()>,
}

impl CdpClient {
    /// Connect to `ws://127.0.0.1:{port}/devtools/page/{target}`.
    pub async fn connect(ws_url: &str) -> Result<Self, FetchError> {
        tracing::info!(url = ws_url, "attaching to page target");

        let (socket, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| FetchError::ConnectionFailed {
                url: ws_url.to_string(),
                reason: e.to_string(),
            })?;
        let (outbound, inbound) = socket.split();

        let waiters: Waiters = Arc::default();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_frames(inbound, Arc::clone(&waiters), event_tx));

        Ok(Self {
            ids: AtomicU64::new(1),
            waiters,
            outbound: Mutex::new(outbound),
            events: std::sync::Mutex::new(Some(event_rx)),
            reader,
        })
    }

    /// Hand out the event feed. Only the first caller gets it.
    pub fn take_events(&self) -> Option<EventReceiver> {
        self.events.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Send a close frame and stop reading.
    pub async fn close(&self) {
        if let Err(e) = self.outbound.lock().await.close().await {
            tracing::debug!(error = %e, "close frame not delivered");
        }
        self.reader.abort();
    }
}

async fn read_frames(
    mut inbound: Inbound,
    waiters: Waiters,
    events: mpsc::UnboundedSender<CdpEvent>,
) {
    while let Some(next) = inbound.next().await {
        let text = match next {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Binary(b)) => match String::from_utf8(b.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => {
                tracing::debug!("browser closed the DevTools socket");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "DevTools socket read failed");
                break;
            }
        };

        let frame: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "dropping non-JSON DevTools frame");
                continue;
            }
        };

        match classify(frame) {
            Some(Incoming::Reply(reply)) => {
                let waiter = waiters.lock().await.remove(&reply.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => tracing::debug!(id = reply.id, "reply for unknown command"),
                }
            }
            // The feed may already be gone after the listener stopped.
            Some(Incoming::Event(event)) => {
                let _ = events.send(event);
            }
            None => {}
        }
    }

    fail_pending(&waiters).await;
}

/// Resolve every outstanding command with a "connection closed" error.
async fn fail_pending(waiters: &Waiters) {
    for (id, tx) in waiters.lock().await.drain() {
        let _ = tx.send(Reply::closed(id));
    }
}

#[async_trait]
impl CommandChannel for CdpClient {
    async fn send_command(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, FetchError> {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        let frame = encode_command(id, method, params);
        tracing::debug!(id, method, "-> cdp");

        // Registered before the write so an immediate reply finds its waiter.
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(id, tx);

        let written = self.outbound.lock().await.send(Message::Text(frame.into())).await;
        if let Err(e) = written {
            self.waiters.lock().await.remove(&id);
            return Err(FetchError::protocol(format!("write of {method} failed: {e}")));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply.into_result(),
            Ok(Err(_)) => Err(FetchError::protocol(format!(
                "reader dropped the reply slot for {method}"
            ))),
            Err(_) => {
                self.waiters.lock().await.remove(&id);
                Err(FetchError::Timeout {
                    method: method.to_string(),
                    duration: timeout,
                })
            }
        }
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

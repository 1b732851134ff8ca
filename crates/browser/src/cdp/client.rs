//! CDP Client - The Core Communication Layer
//!
//! Design decisions:
//! 1. Single WebSocket per browser connection (no per-session WS overhead)
//! 2. Async message passing - no locks on send/receive path
//! 3. Request/response matching via ID, events broadcast to subscribers
//! 4. Fail fast - no retries, no queuing. Let the caller decide.

use dashmap::DashMap;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::protocol::*;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Every in-flight command is bounded; a browser that stops answering
/// surfaces as `CDPError::Timeout` instead of a hung future.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum CDPError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CDP protocol error: {code} - {message}")]
    Protocol { code: i32, message: String },

    #[error("Request timeout")]
    Timeout,

    #[error("Connection closed")]
    Closed,
}

/// Result type for CDP operations
pub type Result<T> = std::result::Result<T, CDPError>;

/// Event subscriber callback
pub type EventCallback = Arc<dyn Fn(CDPEvent) + Send + Sync>;

/// Handle for removing a subscription once the caller is done waiting.
pub type SubscriptionId = u64;

/// Event fan-out registry. Subscriptions carry a token so one-shot waiters
/// can remove themselves instead of accumulating dead callbacks.
#[derive(Default)]
struct EventSubscribers {
    next_token: AtomicU64,
    by_method: DashMap<String, Vec<(SubscriptionId, EventCallback)>>,
}

impl std::fmt::Debug for EventSubscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscribers")
            .field("next_token", &self.next_token)
            .field("methods", &self.by_method.len())
            .finish()
    }
}

impl EventSubscribers {
    fn register(&self, method: impl Into<String>, callback: EventCallback) -> SubscriptionId {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.by_method
            .entry(method.into())
            .or_default()
            .push((token, callback));
        token
    }

    fn remove(&self, method: &str, token: SubscriptionId) {
        if let Some(mut callbacks) = self.by_method.get_mut(method) {
            callbacks.retain(|(id, _)| *id != token);
        }
    }

    fn dispatch(&self, event: &CDPEvent) {
        if let Some(callbacks) = self.by_method.get(&event.method) {
            for (_, callback) in callbacks.value() {
                callback(event.clone());
            }
        }
    }
}

/// CDP Client - manages single WebSocket connection to browser
#[derive(Debug)]
pub struct CDPClient {
    /// Monotonic request ID counter
    next_id: AtomicU64,

    /// Pending requests waiting for responses
    /// Key: request_id, Value: oneshot sender for response
    pending: Arc<DashMap<RequestId, oneshot::Sender<CDPResponse>>>,

    /// Event subscribers keyed by method name
    subscribers: Arc<EventSubscribers>,

    /// WebSocket write half (wrapped for concurrent sending)
    ws_sink: Arc<RwLock<WsSink>>,

    /// Flipped by the reader task when the socket dies
    connected: Arc<AtomicBool>,
}

impl CDPClient {
    /// Connect to Chrome DevTools Protocol endpoint
    pub async fn connect(ws_url: &str) -> Result<Arc<Self>> {
        let (ws_stream, _) = connect_async(ws_url).await?;
        let (sink, mut stream) = ws_stream.split();

        let client = Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            subscribers: Arc::new(EventSubscribers::default()),
            ws_sink: Arc::new(RwLock::new(sink)),
            connected: Arc::new(AtomicBool::new(true)),
        });

        // Reader task: lives until the socket closes, then fails all
        // outstanding requests so callers see Closed instead of hanging.
        let client_clone = client.clone();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Err(e) = client_clone.handle_message(&text) {
                            tracing::error!("Failed to handle message: {}", e);
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by browser");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            client_clone.connected.store(false, Ordering::SeqCst);
            client_clone.pending.clear();
        });

        Ok(client)
    }

    /// Whether the reader task still has a live socket underneath it.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send CDP request and wait for response (bounded by [`COMMAND_TIMEOUT`])
    pub async fn send_request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        session_id: Option<SessionId>,
    ) -> Result<Value> {
        if !self.is_connected() {
            return Err(CDPError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = CDPRequest {
            id,
            method: method.into(),
            params,
            session_id,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        // Serialize and send
        let json = serde_json::to_string(&request)?;
        let mut sink = self.ws_sink.write().await;
        let sent = sink.send(Message::Text(json)).await;
        drop(sink); // Release lock immediately
        if let Err(e) = sent {
            self.pending.remove(&id);
            return Err(CDPError::WebSocket(e));
        }

        // Wait for response
        let response = match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(CDPError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                return Err(CDPError::Timeout);
            }
        };

        if let Some(error) = response.error {
            return Err(CDPError::Protocol {
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Subscribe to CDP events. Keep the returned token to unsubscribe.
    pub fn subscribe(&self, method: impl Into<String>, callback: EventCallback) -> SubscriptionId {
        self.subscribers.register(method, callback)
    }

    /// Remove a subscription registered with [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, method: &str, token: SubscriptionId) {
        self.subscribers.remove(method, token);
    }

    /// Wait for a single occurrence of `method`, optionally filtered to one
    /// session, bounded by `timeout`. The subscription is removed on every
    /// exit path.
    pub async fn wait_for_event(
        &self,
        method: &str,
        session_id: Option<SessionId>,
        timeout: Duration,
    ) -> Result<CDPEvent> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let slot_clone = slot.clone();
        let token = self.subscribe(
            method,
            Arc::new(move |event: CDPEvent| {
                if let Some(ref wanted) = session_id {
                    if event.session_id.as_ref() != Some(wanted) {
                        return;
                    }
                }
                if let Ok(mut guard) = slot_clone.try_lock() {
                    if let Some(tx) = guard.take() {
                        let _ = tx.send(event);
                    }
                }
            }),
        );

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(CDPError::Closed),
            Err(_) => Err(CDPError::Timeout),
        };

        self.unsubscribe(method, token);
        result
    }

    /// Handle incoming WebSocket message
    fn handle_message(&self, text: &str) -> Result<()> {
        let msg: CDPMessage = serde_json::from_str(text)?;

        match msg {
            CDPMessage::Response(response) => {
                if let Some((_, tx)) = self.pending.remove(&response.id) {
                    let _ = tx.send(response); // Ignore send errors (receiver dropped)
                } else {
                    tracing::warn!("Received response for unknown request: {}", response.id);
                }
            }
            CDPMessage::Event(event) => {
                self.subscribers.dispatch(&event);
            }
        }

        Ok(())
    }

    /// Close connection gracefully
    pub async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let mut sink = self.ws_sink.write().await;
        sink.close().await?;
        Ok(())
    }
}

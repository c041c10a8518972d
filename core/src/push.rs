/// Push channel client: one long-lived WebSocket subscription to the server's event stream
///
/// The channel task owns the socket. It reconnects with capped exponential
/// backoff after a drop and stops for good when the server rejects the token.
/// Consumers register callbacks with `on_message`; reconnects are invisible to
/// them.
use crate::config::Config;
use crate::error::{FluxError, Result};
use crate::messenger_types::{Message, PushFrame};
use crate::session::Session;
use crate::utils::Backoff;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

const OUTBOUND_CAPACITY: usize = 64;
const MIN_KEEPALIVE: Duration = Duration::from_millis(100);

/// Connection state of the push channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Dialing the server
    Connecting,
    /// Socket open, frames flowing
    Connected,
    /// Waiting `delay` before reconnect attempt number `attempt`
    Reconnecting { attempt: u32, delay: Duration },
    /// Closed by the owner
    Closed,
    /// Gave up; no further reconnects
    Failed(String),
}

impl ChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Failed(_))
    }
}

/// Connection policy, normally taken from `Config`
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_multiplier: f64,
    pub max_reconnect_attempts: Option<u32>,
}

impl From<&Config> for ChannelOptions {
    fn from(config: &Config) -> Self {
        Self {
            connect_timeout: config.request_timeout,
            keepalive_interval: config.keepalive_interval,
            reconnect_initial_delay: config.reconnect_initial_delay,
            reconnect_max_delay: config.reconnect_max_delay,
            reconnect_multiplier: config.reconnect_multiplier,
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }
}

type Handler = Arc<dyn Fn(PushFrame) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    next_id: AtomicU64,
    map: Mutex<HashMap<u64, Handler>>,
}

impl Handlers {
    fn insert(&self, handler: Handler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, handler);
        id
    }

    fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn snapshot(&self) -> Vec<Handler> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Handler>> {
        // A panicking handler must not take the whole channel down.
        self.map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle for one `on_message` registration. Dropping it detaches the handler.
pub struct Subscription {
    handlers: Weak<Handlers>,
    id: u64,
}

impl Subscription {
    /// Detach the handler; the channel itself keeps running
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.upgrade() {
            handlers.remove(self.id);
        }
    }
}

pub struct PushChannel {
    handlers: Arc<Handlers>,
    outbound: mpsc::Sender<String>,
    state: watch::Receiver<ChannelState>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PushChannel {
    /// Open the channel for a signed-in session
    pub fn connect(config: &Config, session: &Session) -> Self {
        Self::connect_url(config.push_url(session.token()), ChannelOptions::from(config))
    }

    /// Open the channel against a full `ws://` URL
    pub fn connect_url(url: String, options: ChannelOptions) -> Self {
        let handlers = Arc::new(Handlers::default());
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = ChannelTask {
            endpoint: redact(&url),
            url,
            options,
            handlers: handlers.clone(),
            outbound: outbound_rx,
            state: state_tx,
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(task.run());

        Self {
            handlers,
            outbound: outbound_tx,
            state: state_rx,
            shutdown: shutdown_tx,
            task: Some(handle),
        }
    }

    /// Register a callback for inbound frames
    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(PushFrame) + Send + Sync + 'static,
    {
        let id = self.handlers.insert(Arc::new(handler));
        Subscription {
            handlers: Arc::downgrade(&self.handlers),
            id,
        }
    }

    /// Queue an outbound JSON frame; it is written once the socket is up.
    ///
    /// Delivery is at most once: a frame whose write fails is dropped, not
    /// replayed after the reconnect.
    pub async fn send<T: Serialize>(&self, payload: &T) -> Result<()> {
        if self.state.borrow().is_terminal() {
            return Err(FluxError::ChannelClosed);
        }
        let text = serde_json::to_string(payload).map_err(FluxError::Serialization)?;
        self.outbound
            .send(text)
            .await
            .map_err(|_| FluxError::ChannelClosed)
    }

    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Close gracefully and wait for the channel task to finish
    pub async fn close(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Decode one inbound text frame. Unknown frame types are skipped.
pub fn decode_frame(text: &str) -> Option<PushFrame> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!("Dropping non-JSON push frame: {}", e);
            return None;
        }
    };
    match value.get("type").and_then(Value::as_str) {
        Some("new_message") => match serde_json::from_value::<PushFrame>(value) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("Dropping malformed new_message frame: {}", e);
                None
            }
        },
        Some(other) => {
            debug!("Ignoring push frame of type {}", other);
            None
        }
        // The chat hub also writes stored rows without a wrapper.
        None => match serde_json::from_value::<Message>(value) {
            Ok(message) if message.id.is_some() => Some(PushFrame::NewMessage { message }),
            Ok(_) => {
                debug!("Ignoring id-less system frame");
                None
            }
            Err(_) => {
                debug!("Ignoring untyped push frame");
                None
            }
        },
    }
}

fn redact(url: &str) -> String {
    url.split('?').next().unwrap_or(url).to_string()
}

// ─── Channel task ────────────────────────────────────────────────────────────

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

struct ChannelTask {
    url: String,
    endpoint: String,
    options: ChannelOptions,
    handlers: Arc<Handlers>,
    outbound: mpsc::Receiver<String>,
    state: watch::Sender<ChannelState>,
    shutdown: watch::Receiver<bool>,
}

impl ChannelTask {
    async fn run(mut self) {
        let mut backoff = Backoff::new(
            self.options.reconnect_initial_delay,
            self.options.reconnect_max_delay,
            self.options.reconnect_multiplier,
        );

        loop {
            if self.shutdown_requested() {
                break;
            }
            self.state.send_replace(ChannelState::Connecting);

            match timeout(self.options.connect_timeout, connect_async(self.url.as_str())).await {
                Ok(Ok((socket, _response))) => {
                    self.state.send_replace(ChannelState::Connected);
                    info!("Push channel connected to {}", self.endpoint);
                    let connected_at = Instant::now();
                    match self.pump(socket).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Dropped(reason) => {
                            warn!("Push channel to {} dropped: {}", self.endpoint, reason);
                        }
                    }
                    // Only a session that stayed up earns a fresh backoff; a server
                    // that accepts and drops at once keeps the delay growing.
                    if connected_at.elapsed() >= self.options.reconnect_max_delay {
                        backoff.reset();
                    }
                }
                Ok(Err(WsError::Http(response)))
                    if matches!(response.status().as_u16(), 401 | 403) =>
                {
                    let reason = format!("handshake rejected with HTTP {}", response.status().as_u16());
                    error!("Push channel to {} failed permanently: {}", self.endpoint, reason);
                    self.state.send_replace(ChannelState::Failed(reason));
                    return;
                }
                Ok(Err(e)) => {
                    warn!("Push channel connect to {} failed: {}", self.endpoint, e);
                }
                Err(_) => {
                    warn!("Push channel connect to {} timed out", self.endpoint);
                }
            }

            if let Some(max) = self.options.max_reconnect_attempts {
                if backoff.attempts() >= max {
                    let reason = format!("gave up after {} reconnect attempts", max);
                    error!("Push channel to {} failed: {}", self.endpoint, reason);
                    self.state.send_replace(ChannelState::Failed(reason));
                    return;
                }
            }

            let delay = backoff.next_delay();
            self.state.send_replace(ChannelState::Reconnecting {
                attempt: backoff.attempts(),
                delay,
            });
            debug!("Push channel reconnect #{} in {:?}", backoff.attempts(), delay);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = wait_shutdown(&mut self.shutdown) => {}
            }
        }

        self.state.send_replace(ChannelState::Closed);
        info!("Push channel to {} closed", self.endpoint);
    }

    async fn pump(&mut self, socket: Socket) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();

        let mut keepalive = interval(self.options.keepalive_interval.max(MIN_KEEPALIVE));
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
        keepalive.tick().await;

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.dispatch(&text),
                    Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => self.dispatch(&text),
                        Err(_) => debug!("Ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        return SessionEnd::Dropped(format!("closed by server ({:?})", frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                    None => return SessionEnd::Dropped("stream ended".to_string()),
                },
                outbound = self.outbound.recv() => match outbound {
                    Some(text) => {
                        // The frame may have reached the server; it is not resent.
                        if let Err(e) = sink.send(WsMessage::Text(text)).await {
                            warn!("Dropping outbound frame after write error: {}", e);
                            return SessionEnd::Dropped(e.to_string());
                        }
                    }
                    // Every sender is gone: the owning handle was dropped.
                    None => return SessionEnd::Shutdown,
                },
                _ = keepalive.tick() => {
                    if let Err(e) = sink.send(WsMessage::Ping(Vec::new())).await {
                        return SessionEnd::Dropped(format!("keepalive failed: {}", e));
                    }
                }
                _ = wait_shutdown(&mut self.shutdown) => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let Some(frame) = decode_frame(text) else {
            return;
        };
        for handler in self.handlers.snapshot() {
            handler(frame.clone());
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_typed_frame() {
        let frame = decode_frame(
            r#"{"type":"new_message","message":{"id":3,"sender_id":7,"receiver_id":1,"content":"yo","created_at":"2024-03-01T10:00:00Z"}}"#,
        );
        assert!(matches!(frame, Some(PushFrame::NewMessage { ref message }) if message.id == Some(3)));
    }

    #[test]
    fn test_decode_ignores_unknown_and_garbage() {
        assert!(decode_frame(r#"{"type":"typing","user_id":7}"#).is_none());
        assert!(decode_frame("not json").is_none());
        assert!(decode_frame(r#"{"type":"new_message"}"#).is_none());
        assert!(decode_frame(r#"{"hello":"world"}"#).is_none());
    }

    #[test]
    fn test_decode_bare_hub_rows() {
        let row = r#"{"ID":12,"CreatedAt":"2024-03-01T10:00:00Z","sender_id":7,"receiver_id":1,"content":"hi"}"#;
        assert!(matches!(decode_frame(row), Some(PushFrame::NewMessage { ref message }) if message.id == Some(12)));

        let greeting = r#"{"ID":0,"CreatedAt":"0001-01-01T00:00:00Z","sender_id":0,"receiver_id":1,"content":"Connected to chat server"}"#;
        assert!(decode_frame(greeting).is_none());
    }

    #[test]
    fn test_redact_strips_token() {
        assert_eq!(redact("ws://h:1/ws/connect?token=secret"), "ws://h:1/ws/connect");
    }

    #[test]
    fn test_subscription_drop_detaches_handler() {
        let handlers = Arc::new(Handlers::default());
        let id = handlers.insert(Arc::new(|_frame| {}));
        let sub = Subscription {
            handlers: Arc::downgrade(&handlers),
            id,
        };
        assert_eq!(handlers.snapshot().len(), 1);
        sub.cancel();
        assert!(handlers.snapshot().is_empty());
    }
}

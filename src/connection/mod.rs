//! Transport lifecycle, message queueing, and reconnect orchestration (spec
//! §4.6). Timers themselves (connection-timeout, reconnect delay) are not
//! owned here: per the single-worker-task model, this is a plain owned
//! struct with `&mut self` methods that hands back durations/deadlines for
//! the worker task to arm as `tokio::time::sleep` futures in its `select!`
//! loop, the same way the teacher's `worker()` is the only place that
//! `.await`s.

pub mod reconnect;
pub mod transport;

use std::collections::VecDeque;

use serde_json::Value as JsonValue;

pub use self::{
    reconnect::{
        NetworkDetector,
        ReconnectConfig,
        ReconnectManager,
        ReconnectState,
        ReconnectStatus,
        ScheduleOutcome,
        TrackedSubscription,
    },
    transport::{
        validate_transport_url,
        Transport,
        TransportEvent,
        WireMessage,
        CLOSE_NORMAL,
    },
};
use crate::{
    error::TransportError,
    guard::guard,
    value::Timestamp,
};

#[cfg(any(test, feature = "testing"))]
pub use self::transport::testing::FakeTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// How an inbound binary frame should be surfaced to callers that inspect
/// it (spec §6 "Configuration surface", `binaryType`). Native Rust frames
/// are always carried as [`WireMessage::Binary`]/[`WireMessage::Text`]
/// regardless of this setting; it exists so config round-trips and
/// cross-implementation parity checks see the same field other clients do,
/// not because this crate dispatches on it internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryType {
    ArrayBuffer,
    Blob,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub reconnect: bool,
    pub connection_timeout_ms: u64,
    pub parse_json: bool,
    pub queue_when_disconnected: bool,
    pub max_queue_size: usize,
    /// Sub-protocols offered in the WebSocket handshake's
    /// `Sec-WebSocket-Protocol` header, in preference order.
    pub protocols: Vec<String>,
    pub binary_type: BinaryType,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect: false,
            connection_timeout_ms: 30_000,
            parse_json: true,
            queue_when_disconnected: false,
            max_queue_size: 100,
            protocols: Vec::new(),
            binary_type: BinaryType::ArrayBuffer,
        }
    }
}

/// What `on_message` decoded an inbound frame into, per spec §4.6: "attempt
/// parse and fall back to raw string on failure".
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedMessage {
    Json(JsonValue),
    Text(String),
    Binary(bytes::Bytes),
}

/// What a caller should do with a message handed to
/// [`ConnectionManager::send`].
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Connected: the caller should actually write this to the transport.
    Send(WireMessage),
    /// Not connected but queued for the next successful connect.
    Queued,
}

type MessageListener = Box<dyn Fn(&ParsedMessage) + Send + Sync>;

/// Drives one transport connection's lifecycle, its outbound message queue,
/// and (if enabled) the composed [`ReconnectManager`] (spec §4.6).
pub struct ConnectionManager {
    config: ConnectionConfig,
    state: ConnectionState,
    queue: VecDeque<WireMessage>,
    disposed: bool,
    message_handler: Option<MessageListener>,
    message_listeners: Vec<MessageListener>,
    reconnect: ReconnectManager,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, reconnect_config: ReconnectConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            queue: VecDeque::new(),
            disposed: false,
            message_handler: None,
            message_listeners: Vec::new(),
            reconnect: ReconnectManager::new(reconnect_config),
        }
    }

    pub fn reconnect(&mut self) -> &mut ReconnectManager {
        &mut self.reconnect
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_message_handler(&mut self, handler: impl Fn(&ParsedMessage) + Send + Sync + 'static) {
        self.message_handler = Some(Box::new(handler));
    }

    pub fn add_message_listener(&mut self, listener: impl Fn(&ParsedMessage) + Send + Sync + 'static) {
        self.message_listeners.push(Box::new(listener));
    }

    /// Rejects if already Connected, already Connecting, or disposed.
    /// Returns the deadline (in caller time units) by which the worker
    /// should arm a connection-timeout timer.
    pub fn connect(&mut self, now: Timestamp) -> Result<Timestamp, TransportError> {
        if self.disposed {
            return Err(TransportError::Disposed);
        }
        if self.state != ConnectionState::Disconnected {
            return Err(TransportError::AlreadyConnected);
        }
        self.state = ConnectionState::Connecting;
        Ok(now + self.config.connection_timeout_ms as i64)
    }

    /// Forces a close and returns a timeout error; called by the worker
    /// when its connection-timeout timer fires before `on_open`.
    pub fn on_connect_timeout(&mut self, now: Timestamp) -> TransportError {
        self.state = ConnectionState::Disconnected;
        self.reconnect.mark_disconnected(now, Some(TransportError::ConnectTimeout.to_string()));
        TransportError::ConnectTimeout
    }

    /// Transitions to Connected and drains the outbound queue (FIFO) for
    /// the worker to actually write to the transport.
    pub fn on_open(&mut self, now: Timestamp) -> (Vec<WireMessage>, Option<Vec<TrackedSubscription>>) {
        self.state = ConnectionState::Connected;
        let restore = self.reconnect.mark_connected(now);
        (self.queue.drain(..).collect(), restore)
    }

    /// Parses (if configured) and dispatches an inbound frame: primary
    /// handler first, then fan-out listeners.
    pub fn on_message(&self, message: &WireMessage) -> ParsedMessage {
        let parsed = match message {
            WireMessage::Binary(bytes) => ParsedMessage::Binary(bytes.clone()),
            WireMessage::Text(text) => {
                if self.config.parse_json {
                    match serde_json::from_str(text) {
                        Ok(json) => ParsedMessage::Json(json),
                        Err(_) => ParsedMessage::Text(text.clone()),
                    }
                } else {
                    ParsedMessage::Text(text.clone())
                }
            },
        };
        if let Some(handler) = &self.message_handler {
            guard(|| handler(&parsed));
        }
        for listener in &self.message_listeners {
            guard(|| listener(&parsed));
        }
        parsed
    }

    /// Clears the timeout (implicitly: the worker stops waiting on it once
    /// this returns) and transitions to Disconnected. Schedules a reconnect
    /// iff we were Connected, reconnect is enabled, and `code != 1000`.
    pub fn on_close(&mut self, code: u16, reason: Option<String>, now: Timestamp) -> Option<u64> {
        let was_connected = self.state == ConnectionState::Connected;
        self.state = ConnectionState::Disconnected;
        self.reconnect.mark_disconnected(now, reason);

        if was_connected && self.config.reconnect && code != CLOSE_NORMAL {
            match self.reconnect.schedule(now) {
                ScheduleOutcome::Scheduled(delay_ms) => Some(delay_ms),
                _ => None,
            }
        } else {
            None
        }
    }

    /// Requires Connected; otherwise enqueues (if `queue_when_disconnected`)
    /// or rejects. The oldest entry is dropped when the queue is full.
    pub fn send(&mut self, message: WireMessage) -> Result<SendOutcome, TransportError> {
        if self.disposed {
            return Err(TransportError::Disposed);
        }
        if self.state == ConnectionState::Connected {
            return Ok(SendOutcome::Send(message));
        }
        if !self.config.queue_when_disconnected {
            return Err(TransportError::NotConnected);
        }
        if self.queue.len() >= self.config.max_queue_size {
            self.queue.pop_front();
        }
        self.queue.push_back(message);
        Ok(SendOutcome::Queued)
    }

    /// Re-queues at the front after a per-send transport failure, so the
    /// next flush retries it first.
    pub fn requeue_front(&mut self, message: WireMessage) {
        self.queue.push_front(message);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Safe at any time; idempotent.
    pub fn close(&mut self, now: Timestamp) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Disconnected;
        self.reconnect.mark_disconnected(now, None);
    }

    /// Terminal: clears the queue and listeners and rejects any further
    /// `connect`/`send`.
    pub fn dispose(&mut self) {
        self.disposed = true;
        self.state = ConnectionState::Disconnected;
        self.queue.clear();
        self.message_handler = None;
        self.message_listeners.clear();
        self.reconnect.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(
            ConnectionConfig {
                reconnect: true,
                ..ConnectionConfig::default()
            },
            ReconnectConfig::default(),
        )
    }

    #[test]
    fn connect_rejects_when_already_connecting() {
        let mut m = manager();
        m.connect(0).unwrap();
        assert_eq!(m.connect(0), Err(TransportError::AlreadyConnected));
    }

    #[test]
    fn connect_rejects_when_disposed() {
        let mut m = manager();
        m.dispose();
        assert_eq!(m.connect(0), Err(TransportError::Disposed));
    }

    #[test]
    fn close_code_1000_does_not_schedule_reconnect() {
        let mut m = manager();
        m.connect(0).unwrap();
        m.on_open(0);
        assert_eq!(m.state(), ConnectionState::Connected);
        let scheduled = m.on_close(CLOSE_NORMAL, None, 1);
        assert_eq!(scheduled, None);
        assert_eq!(m.reconnect().state(), ReconnectState::Disconnected);
    }

    #[test]
    fn close_code_non_1000_schedules_reconnect_when_enabled() {
        let mut m = manager();
        m.connect(0).unwrap();
        m.on_open(0);
        let scheduled = m.on_close(1006, Some("abnormal".to_string()), 1);
        assert!(scheduled.is_some());
        assert_eq!(m.reconnect().state(), ReconnectState::Reconnecting);
    }

    #[test]
    fn send_requires_connected_without_queueing() {
        let mut m = manager();
        assert_eq!(m.send(WireMessage::Text("hi".to_string())), Err(TransportError::NotConnected));
    }

    #[test]
    fn send_queues_and_drops_oldest_when_full() {
        let mut m = ConnectionManager::new(
            ConnectionConfig {
                queue_when_disconnected: true,
                max_queue_size: 2,
                ..ConnectionConfig::default()
            },
            ReconnectConfig::default(),
        );
        m.send(WireMessage::Text("a".to_string())).unwrap();
        m.send(WireMessage::Text("b".to_string())).unwrap();
        m.send(WireMessage::Text("c".to_string())).unwrap();
        assert_eq!(m.queue_len(), 2);
        m.connect(0).unwrap();
        let (flushed, _) = m.on_open(0);
        assert_eq!(
            flushed,
            vec![WireMessage::Text("b".to_string()), WireMessage::Text("c".to_string())]
        );
    }

    #[test]
    fn on_message_falls_back_to_text_on_invalid_json() {
        let m = manager();
        let parsed = m.on_message(&WireMessage::Text("not json".to_string()));
        assert_eq!(parsed, ParsedMessage::Text("not json".to_string()));
        let parsed = m.on_message(&WireMessage::Text("{\"a\":1}".to_string()));
        assert_eq!(parsed, ParsedMessage::Json(serde_json::json!({"a": 1})));
    }

    #[test]
    fn close_is_idempotent() {
        let mut m = manager();
        m.connect(0).unwrap();
        m.on_open(0);
        m.close(1);
        m.close(2);
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn dispose_rejects_subsequent_connect_and_clears_queue() {
        let mut m = ConnectionManager::new(
            ConnectionConfig {
                queue_when_disconnected: true,
                ..ConnectionConfig::default()
            },
            ReconnectConfig::default(),
        );
        m.send(WireMessage::Text("queued".to_string())).unwrap();
        m.dispose();
        assert_eq!(m.queue_len(), 0);
        assert_eq!(m.connect(0), Err(TransportError::Disposed));
    }
}

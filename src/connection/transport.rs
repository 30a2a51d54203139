//! The opaque bidirectional transport the connection manager drives (spec
//! §4.6 "Transport contract"). Generalizes the teacher's `SyncProtocol`
//! trait (`open`/`send`/`reconnect` over a `futures::mpsc` response channel)
//! into the fuller open/send/close + event-channel contract the spec
//! describes, and swaps the channel for `tokio::sync::mpsc` to match the
//! rest of this crate's single-worker-task architecture.

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::error::TransportError;

/// A message as it travels across the wire: either JSON text or an opaque
/// binary frame (spec §4.6, "`send` accepts text or binary").
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Text(String),
    Binary(bytes::Bytes),
}

/// Events a transport pushes back to its owner after `open`. `Open` fires
/// at most once; `Close` is terminal.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Open,
    Message(WireMessage),
    Error(String),
    Close { code: u16, reason: Option<String> },
}

/// Normal, graceful close, per spec §4.6 / §6 "Close codes".
pub const CLOSE_NORMAL: u16 = 1000;

#[async_trait]
pub trait Transport: Send {
    /// Opens a connection to `url`, pushing subsequent events to
    /// `events`. `protocols` is offered as the WebSocket handshake's
    /// `Sec-WebSocket-Protocol` header, in preference order, when
    /// non-empty (spec §6 "Configuration surface", `protocols`). May fail
    /// synchronously (returned `Err`) or asynchronously (an `Error`/`Close`
    /// event after a synchronously successful return).
    async fn open(url: &Url, events: mpsc::Sender<TransportEvent>, protocols: &[String]) -> Result<Self, TransportError>
    where
        Self: Sized;

    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError>;

    async fn close(&mut self, code: u16, reason: Option<String>);
}

/// Validates that `url` is a non-empty, parseable `ws://`/`wss://` address
/// (spec §6, grounded on the teacher's `deployment_to_ws_url` scheme check).
pub fn validate_transport_url(url: &str) -> Result<Url, TransportError> {
    if url.trim().is_empty() {
        return Err(TransportError::InvalidUrl("url is empty".to_string()));
    }
    let parsed = Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(TransportError::InvalidUrl(format!("unsupported scheme `{other}`"))),
    }
}

/// Production transport, backed by `tokio-tungstenite` (the teacher's
/// websocket crate).
pub struct WebSocketTransport {
    sink: futures::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        tokio_tungstenite::tungstenite::Message,
    >,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(url: &Url, events: mpsc::Sender<TransportEvent>, protocols: &[String]) -> Result<Self, TransportError>
    where
        Self: Sized,
    {
        use futures::StreamExt;
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if !protocols.is_empty() {
            let value = protocols.join(", ");
            let header_value = value.parse().map_err(|e: tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue| {
                TransportError::Io(e.to_string())
            })?;
            request.headers_mut().insert("sec-websocket-protocol", header_value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let (sink, mut read) = stream.split();

        let _ = events.send(TransportEvent::Open).await;
        tokio::spawn(async move {
            use tokio_tungstenite::tungstenite::Message as WsMessage;
            while let Some(frame) = read.next().await {
                let event = match frame {
                    Ok(WsMessage::Text(text)) => TransportEvent::Message(WireMessage::Text(text.to_string())),
                    Ok(WsMessage::Binary(bytes)) => TransportEvent::Message(WireMessage::Binary(bytes)),
                    Ok(WsMessage::Close(frame)) => TransportEvent::Close {
                        code: frame.as_ref().map_or(CLOSE_NORMAL, |f| f.code.into()),
                        reason: frame.map(|f| f.reason.to_string()),
                    },
                    Ok(_) => continue,
                    Err(e) => TransportEvent::Error(e.to_string()),
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(Self { sink })
    }

    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        use futures::SinkExt;

        let frame = match message {
            WireMessage::Text(text) => tokio_tungstenite::tungstenite::Message::Text(text.into()),
            WireMessage::Binary(bytes) => tokio_tungstenite::tungstenite::Message::Binary(bytes),
        };
        self.sink.send(frame).await.map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: Option<String>) {
        use futures::SinkExt;

        let frame = tokio_tungstenite::tungstenite::protocol::CloseFrame {
            code: code.into(),
            reason: reason.unwrap_or_default().into(),
        };
        let _ = self
            .sink
            .send(tokio_tungstenite::tungstenite::Message::Close(Some(frame)))
            .await;
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// In-memory transport for unit tests, in the same relationship the
    /// teacher has between `WebSocketManager` and `TestProtocolManager`.
    pub struct FakeTransport {
        sent: Arc<Mutex<Vec<WireMessage>>>,
        events: mpsc::Sender<TransportEvent>,
    }

    impl FakeTransport {
        pub fn sent_messages(&self) -> Vec<WireMessage> {
            self.sent.lock().clone()
        }

        /// Test hook: pushes an event as if the remote end had sent it.
        pub async fn push_event(&self, event: TransportEvent) {
            let _ = self.events.send(event).await;
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn open(_url: &Url, events: mpsc::Sender<TransportEvent>, _protocols: &[String]) -> Result<Self, TransportError> {
            let _ = events.send(TransportEvent::Open).await;
            Ok(Self {
                sent: Arc::new(Mutex::new(Vec::new())),
                events,
            })
        }

        async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
            self.sent.lock().push(message);
            Ok(())
        }

        async fn close(&mut self, code: u16, reason: Option<String>) {
            let _ = self.events.send(TransportEvent::Close { code, reason }).await;
        }
    }

    #[tokio::test]
    async fn fake_transport_records_sent_messages() {
        let (tx, _rx) = mpsc::channel(8);
        let url = Url::parse("wss://example.test").unwrap();
        let mut transport = FakeTransport::open(&url, tx, &[]).await.unwrap();
        transport.send(WireMessage::Text("hello".to_string())).await.unwrap();
        assert_eq!(transport.sent_messages(), vec![WireMessage::Text("hello".to_string())]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_transport_url_accepts_ws_and_wss() {
        assert!(validate_transport_url("ws://localhost:8080").is_ok());
        assert!(validate_transport_url("wss://example.com").is_ok());
    }

    #[test]
    fn validate_transport_url_rejects_empty_and_http() {
        assert!(validate_transport_url("").is_err());
        assert!(validate_transport_url("http://example.com").is_err());
    }
}

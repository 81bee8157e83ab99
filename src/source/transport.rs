//! Feed transport.
//!
//! [`FeedTransport`] opens connections, [`FeedConnection`] is one live
//! session. The production implementation is a websocket client
//! ([`WsTransport`]); tests drive the source with scripted fakes.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Close code for a normal, intentional close.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code used when the peer went away without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Close code reported when a close frame carried no status.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Errors raised by a feed transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connect timed out after {0}ms")]
    Timeout(u64),

    #[error("send failed: {0}")]
    Send(String),
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Connection lost without a proper close handshake.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_ABNORMAL, reason)
    }

    /// A clean close ends the source; anything else reconnects.
    pub fn is_clean(&self) -> bool {
        self.code == CLOSE_NORMAL
    }
}

/// One inbound frame, reduced to what the source cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedFrame {
    Text(String),
    Closed(CloseInfo),
    /// Ping/pong and other control traffic.
    Other,
}

/// A live feed session.
#[async_trait]
pub trait FeedConnection: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound frame. Must be cancel-safe.
    async fn recv(&mut self) -> FeedFrame;

    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Best-effort close handshake.
    async fn close(&mut self, code: u16, reason: &str);
}

/// Opens feed sessions.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn FeedConnection>, TransportError>;
}

/// Websocket transport backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn FeedConnection>, TransportError> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        debug!(url = %url, status = %response.status(), "Websocket handshake complete");
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedConnection for WsConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> FeedFrame {
        match self.stream.next().await {
            Some(Ok(Message::Text(text))) => FeedFrame::Text(text),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => FeedFrame::Text(text),
                Err(_) => FeedFrame::Other,
            },
            Some(Ok(Message::Close(Some(frame)))) => {
                FeedFrame::Closed(CloseInfo::new(u16::from(frame.code), frame.reason.to_string()))
            }
            Some(Ok(Message::Close(None))) => {
                FeedFrame::Closed(CloseInfo::new(CLOSE_NO_STATUS, "closed without status"))
            }
            Some(Ok(_)) => FeedFrame::Other,
            Some(Err(e)) => FeedFrame::Closed(CloseInfo::abnormal(e.to_string())),
            None => FeedFrame::Closed(CloseInfo::abnormal("stream ended")),
        }
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.stream
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        if let Err(e) = self.stream.close(Some(frame)).await {
            debug!(error = %e, "Websocket close handshake failed");
        }
    }
}

//! Core event types for tokenscope.
//!
//! A [`TokenEvent`] is created when the feed delivers a token creation or
//! migration message. It is immutable after creation and is moved from stage
//! to stage, so whichever stage holds it owns it.
//!
//! # Feed format
//!
//! ```json
//! {
//!   "signature": "5Kq...",
//!   "mint": "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU",
//!   "txType": "create",
//!   "name": "Example",
//!   "symbol": "EXM",
//!   "twitter": "https://x.com/example"
//! }
//! ```
//!
//! Control messages (`{"message": "Successfully subscribed ..."}`) are
//! surfaced separately so the source can match subscription confirmations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Lifecycle category of a token event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A new token was created.
    Creation,
    /// A token migrated to a new pool / market.
    Migration,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creation => "creation",
            Self::Migration => "migration",
        }
    }

    /// Map a feed `txType` to a kind. Trades and unknown types are not
    /// lifecycle events.
    fn from_tx_type(tx_type: &str) -> Option<Self> {
        match tx_type {
            "create" | "creation" => Some(Self::Creation),
            "migrate" | "migration" => Some(Self::Migration),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A token lifecycle event flowing through the pipeline.
///
/// # Fields
///
/// - `id`: entity identifier (the token mint address), unique per token
/// - `kind`: creation or migration
/// - `discovered_at`: when the feed message was parsed
/// - `payload`: the raw feed message, kept opaque
/// - `operation_id`: unique per event, carried through every log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEvent {
    pub id: String,

    pub kind: EventKind,

    #[serde(rename = "discoveredAt")]
    pub discovered_at: DateTime<Utc>,

    pub payload: Value,

    #[serde(rename = "operationId")]
    pub operation_id: String,
}

impl TokenEvent {
    /// Create an event discovered now, with a fresh operation id.
    pub fn new(id: impl Into<String>, kind: EventKind, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind,
            discovered_at: Utc::now(),
            payload,
            operation_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Set the discovery timestamp
    pub fn with_discovered_at(mut self, discovered_at: DateTime<Utc>) -> Self {
        self.discovered_at = discovered_at;
        self
    }

    /// Set the operation ID
    pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = operation_id.into();
        self
    }

    /// Read a top-level string field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// Token symbol if the feed provided one.
    pub fn symbol(&self) -> Option<&str> {
        self.payload_str("symbol")
    }

    /// Token display name if the feed provided one.
    pub fn name(&self) -> Option<&str> {
        self.payload_str("name")
    }
}

/// Result of parsing one inbound feed message.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    /// A creation or migration event.
    Token(TokenEvent),
    /// A server control message (subscription confirmation, notice).
    Control(String),
    /// Valid JSON that carries nothing the pipeline consumes (trades, errors).
    Ignored,
}

/// Errors that make a feed message unusable.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,
}

/// Parse a raw feed message into at most one [`TokenEvent`].
pub fn parse_feed_message(text: &str) -> Result<FeedMessage, ParseError> {
    let value: Value = serde_json::from_str(text)?;
    let obj = value.as_object().ok_or(ParseError::NotAnObject)?;

    let mint = obj.get("mint").and_then(|v| v.as_str()).filter(|s| !s.is_empty());
    let kind = obj
        .get("txType")
        .and_then(|v| v.as_str())
        .and_then(EventKind::from_tx_type);

    if let (Some(mint), Some(kind)) = (mint, kind) {
        let id = mint.to_string();
        return Ok(FeedMessage::Token(TokenEvent::new(id, kind, value)));
    }

    if mint.is_none() {
        if let Some(message) = obj.get("message").and_then(|v| v.as_str()) {
            return Ok(FeedMessage::Control(message.to_string()));
        }
    }

    Ok(FeedMessage::Ignored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_creation() {
        let text = r#"{
            "signature": "sig1",
            "mint": "Mint111",
            "txType": "create",
            "name": "Example",
            "symbol": "EXM"
        }"#;

        match parse_feed_message(text).unwrap() {
            FeedMessage::Token(event) => {
                assert_eq!(event.id, "Mint111");
                assert_eq!(event.kind, EventKind::Creation);
                assert_eq!(event.symbol(), Some("EXM"));
                assert_eq!(event.name(), Some("Example"));
                assert!(!event.operation_id.is_empty());
            }
            other => panic!("expected token event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_migration() {
        let text = r#"{"mint": "Mint222", "txType": "migrate", "pool": "pump-amm"}"#;

        match parse_feed_message(text).unwrap() {
            FeedMessage::Token(event) => assert_eq!(event.kind, EventKind::Migration),
            other => panic!("expected token event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_control_message() {
        let text = r#"{"message": "Successfully subscribed to token creation events."}"#;

        match parse_feed_message(text).unwrap() {
            FeedMessage::Control(msg) => assert!(msg.contains("token creation")),
            other => panic!("expected control message, got {:?}", other),
        }
    }

    #[test]
    fn test_trades_are_ignored() {
        let text = r#"{"mint": "Mint333", "txType": "buy", "solAmount": 1.5}"#;
        assert!(matches!(parse_feed_message(text).unwrap(), FeedMessage::Ignored));

        let text = r#"{"txType": "create"}"#;
        assert!(matches!(parse_feed_message(text).unwrap(), FeedMessage::Ignored));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_feed_message("not json"),
            Err(ParseError::Json(_))
        ));
        assert!(matches!(
            parse_feed_message("[1, 2, 3]"),
            Err(ParseError::NotAnObject)
        ));
    }

    #[test]
    fn test_event_serialize() {
        let event = TokenEvent::new("Mint444", EventKind::Creation, json!({"symbol": "ABC"}))
            .with_operation_id("op-1");

        let json_str = serde_json::to_string(&event).unwrap();
        assert!(json_str.contains("discoveredAt"));
        assert!(json_str.contains("operationId"));
        assert!(json_str.contains("\"kind\":\"creation\""));
    }
}

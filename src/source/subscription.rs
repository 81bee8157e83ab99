//! Feed subscriptions and their confirmations.
//!
//! Every configured subscription is sent on each (re)connect. Some feeds
//! acknowledge a subscription with a control message; when a subscription
//! declares the text it expects, [`ConfirmationTracker`] reports the ones
//! still unconfirmed once the window closes. A missing confirmation is only
//! logged: events keep flowing regardless.

use crate::config::SubscriptionConfig;
use serde_json::{json, Value};

/// Build the wire message for one subscription.
pub fn subscription_message(subscription: &SubscriptionConfig) -> String {
    let mut message = json!({ "method": subscription.method });
    if !subscription.keys.is_empty() {
        message["keys"] = Value::from(subscription.keys.clone());
    }
    message.to_string()
}

/// Tracks which subscriptions have been acknowledged on the current session.
#[derive(Debug, Default)]
pub struct ConfirmationTracker {
    /// (method, expected text lowercased)
    pending: Vec<(String, String)>,
}

impl ConfirmationTracker {
    pub fn new(subscriptions: &[SubscriptionConfig]) -> Self {
        let pending = subscriptions
            .iter()
            .filter_map(|s| {
                s.confirm_contains
                    .as_ref()
                    .filter(|needle| !needle.is_empty())
                    .map(|needle| (s.method.clone(), needle.to_lowercase()))
            })
            .collect();
        Self { pending }
    }

    /// Match a control message. Returns the method it confirmed, if any.
    pub fn observe(&mut self, message: &str) -> Option<String> {
        let message = message.to_lowercase();
        let index = self
            .pending
            .iter()
            .position(|(_, needle)| message.contains(needle.as_str()))?;
        Some(self.pending.remove(index).0)
    }

    /// Take the methods still unconfirmed. Subsequent calls return nothing.
    pub fn take_unconfirmed(&mut self) -> Vec<String> {
        self.pending.drain(..).map(|(method, _)| method).collect()
    }

    pub fn is_settled(&self) -> bool {
        self.pending.is_empty()
    }
}

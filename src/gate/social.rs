//! Social reference extraction.
//!
//! Finds the social link a token advertises in its feed payload and
//! classifies the platform it points at. The platform drives the
//! auto-qualification policy of the gate.

use crate::event::TokenEvent;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Social platform a link points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitter,
    Telegram,
    Discord,
    Website,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Twitter => "twitter",
            Self::Telegram => "telegram",
            Self::Discord => "discord",
            Self::Website => "website",
        }
    }

    /// Classify a URL by host. Anything unrecognised is a plain website.
    pub fn from_url(url: &Url) -> Self {
        let host = url
            .host_str()
            .unwrap_or("")
            .trim_start_matches("www.")
            .to_ascii_lowercase();

        match host.as_str() {
            "x.com" | "twitter.com" | "mobile.twitter.com" => Self::Twitter,
            "t.me" | "telegram.me" | "telegram.org" => Self::Telegram,
            "discord.gg" | "discord.com" => Self::Discord,
            _ => Self::Website,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A social reference advertised by a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialLink {
    pub url: String,
    pub platform: Platform,
}

impl SocialLink {
    /// Parse and classify a raw link. Bare hosts get an `https://` scheme.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        let url = Url::parse(raw)
            .or_else(|_| Url::parse(&format!("https://{}", raw)))
            .ok()?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return None;
        }
        url.host_str()?;

        Some(Self {
            platform: Platform::from_url(&url),
            url: url.to_string(),
        })
    }
}

/// Source of the social link for an event.
pub trait SocialLinkExtractor: Send + Sync {
    fn extract(&self, event: &TokenEvent) -> Option<SocialLink>;
}

/// Reads well-known link fields from the feed payload, in priority order.
#[derive(Debug, Clone)]
pub struct PayloadLinkExtractor {
    fields: Vec<String>,
}

impl PayloadLinkExtractor {
    pub fn new() -> Self {
        Self::with_fields(["twitter", "telegram", "discord", "website"])
    }

    pub fn with_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for PayloadLinkExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl SocialLinkExtractor for PayloadLinkExtractor {
    fn extract(&self, event: &TokenEvent) -> Option<SocialLink> {
        self.fields
            .iter()
            .filter_map(|field| event.payload_str(field))
            .find_map(SocialLink::parse)
    }
}

//! Result sinks.
//!
//! A sink receives every finished [`AggregateReport`], degraded ones
//! included. The [`ResultSink`] trait defines the interface all sinks
//! implement; a [`SinkSet`] publishes to each configured sink in turn and
//! collects failures without stopping.
//!
//! ## Built-in sinks
//!
//! - [`LogSink`]: structured report logging
//! - [`WebhookSink`]: HTTP POST as plain JSON or a Discord embed
//!
//! ## Creating a sink
//!
//! ```rust,ignore
//! use tokenscope::sinks::{ResultSink, SinkReceipt, SinkError};
//! use tokenscope::analysis::AggregateReport;
//! use async_trait::async_trait;
//!
//! struct Archive;
//!
//! #[async_trait]
//! impl ResultSink for Archive {
//!     fn name(&self) -> &str {
//!         "archive"
//!     }
//!
//!     async fn publish(&self, report: &AggregateReport) -> Result<SinkReceipt, SinkError> {
//!         Ok(SinkReceipt::success("archive", "Stored"))
//!     }
//! }
//! ```

pub mod log;
pub mod webhook;

use crate::analysis::AggregateReport;
use crate::config::SinksConfig;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub use log::LogSink;
pub use webhook::{WebhookFormat, WebhookSink};

/// Errors that can occur while publishing a report.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink timed out after {0}ms")]
    Timeout(u64),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("publish failed: {0}")]
    Failed(String),
}

/// Result of a successful publish.
#[derive(Debug, Clone)]
pub struct SinkReceipt {
    pub sink_name: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
}

impl SinkReceipt {
    pub fn success(sink_name: &str, message: impl Into<String>) -> Self {
        Self {
            sink_name: sink_name.to_string(),
            message: message.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(
        sink_name: &str,
        message: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            sink_name: sink_name.to_string(),
            message: message.into(),
            metadata: Some(metadata),
        }
    }
}

/// Destination for finished reports.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Unique sink name (e.g. "log", "webhook:alerts").
    fn name(&self) -> &str;

    async fn publish(&self, report: &AggregateReport) -> Result<SinkReceipt, SinkError>;
}

/// One failed sink within a [`PublishResult`].
#[derive(Debug)]
pub struct SinkFailure {
    pub sink_name: String,
    pub error: SinkError,
}

/// Outcome of publishing one report to every sink.
#[derive(Debug, Default)]
pub struct PublishResult {
    pub delivered: Vec<SinkReceipt>,
    pub errors: Vec<SinkFailure>,
}

impl PublishResult {
    /// True when every sink accepted the report.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn failure_count(&self) -> usize {
        self.errors.len()
    }
}

/// All configured sinks.
#[derive(Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn ResultSink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the sinks described in configuration.
    pub fn from_config(config: &SinksConfig) -> Self {
        let mut set = Self::new();

        if let Some(log) = &config.log {
            set.add(Arc::new(LogSink::with_prefix(log.prefix.clone())));
        }

        for (name, hook) in &config.webhook {
            let sink = WebhookSink::new(name.clone(), hook.url.clone())
                .with_timeout(Duration::from_millis(hook.timeout_ms))
                .with_retries(hook.retries)
                .with_format(WebhookFormat::parse(&hook.format).unwrap_or_default());
            set.add(Arc::new(sink));
        }

        set
    }

    pub fn add(&mut self, sink: Arc<dyn ResultSink>) {
        debug!(sink = %sink.name(), "Registering result sink");
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Publish to every sink, in order. A failing sink does not stop the rest.
    pub async fn publish(&self, report: &AggregateReport) -> PublishResult {
        let mut result = PublishResult::default();

        for sink in &self.sinks {
            match sink.publish(report).await {
                Ok(receipt) => result.delivered.push(receipt),
                Err(error) => {
                    warn!(
                        id = %report.event.id,
                        sink = %sink.name(),
                        error = %error,
                        "Report publish failed"
                    );
                    result.errors.push(SinkFailure {
                        sink_name: sink.name().to_string(),
                        error,
                    });
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisTask, RiskBands};
    use crate::event::{EventKind, TokenEvent};
    use crate::gate::EngagementSnapshot;
    use chrono::Utc;
    use serde_json::json;

    struct Failing;

    #[async_trait]
    impl ResultSink for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn publish(&self, _report: &AggregateReport) -> Result<SinkReceipt, SinkError> {
            Err(SinkError::Failed("disk full".to_string()))
        }
    }

    pub(crate) fn sample_report(tasks: Vec<AnalysisTask>) -> AggregateReport {
        let now = Utc::now();
        AggregateReport::compose(
            TokenEvent::new("Mint111", EventKind::Creation, json!({"symbol": "EXM"})),
            EngagementSnapshot::default(),
            tasks,
            &RiskBands::default(),
            None,
            now,
            now,
        )
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_other_sinks() {
        let mut set = SinkSet::new();
        set.add(Arc::new(Failing));
        set.add(Arc::new(LogSink::new()));

        let result = set.publish(&sample_report(Vec::new())).await;
        assert!(!result.is_success());
        assert_eq!(result.failure_count(), 1);
        assert_eq!(result.errors[0].sink_name, "failing");
        assert_eq!(result.delivered.len(), 1);
        assert_eq!(result.delivered[0].sink_name, "log");
    }

    #[test]
    fn test_from_config() {
        let config: SinksConfig = toml::from_str(
            r#"
            [log]
            prefix = "audit"

            [webhook.alerts]
            url = "https://discord.com/api/webhooks/1/abc"
            format = "discord"
            "#,
        )
        .unwrap();

        let set = SinkSet::from_config(&config);
        assert_eq!(set.len(), 2);
        assert!(set.names().contains(&"webhook:alerts"));
    }

    #[test]
    fn test_receipt() {
        let receipt = SinkReceipt::success("log", "Done");
        assert!(receipt.metadata.is_none());

        let receipt = SinkReceipt::with_metadata("webhook", "Done", json!({"status": 204}));
        assert!(receipt.metadata.is_some());
    }
}

//! Webhook sink - HTTP POST of finished reports.
//!
//! Sends each report to an external endpoint, either as the plain report
//! JSON or as a Discord embed.
//!
//! ```rust,ignore
//! use tokenscope::sinks::{WebhookFormat, WebhookSink};
//! use std::time::Duration;
//!
//! let sink = WebhookSink::new("alerts", "https://discord.com/api/webhooks/...")
//!     .with_timeout(Duration::from_secs(10))
//!     .with_retries(2)
//!     .with_format(WebhookFormat::Discord);
//! ```

use super::{ResultSink, SinkError, SinkReceipt};
use crate::analysis::{AggregateReport, RiskLevel, TaskOutcome};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of retries on 5xx errors
const DEFAULT_RETRIES: u32 = 1;

/// Wait before the first retry; the n-th retry waits n times this.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Flag fields per Discord embed.
const MAX_FLAG_FIELDS: usize = 6;

/// Payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WebhookFormat {
    #[default]
    Json,
    Discord,
}

impl WebhookFormat {
    pub fn parse(format: &str) -> Option<Self> {
        match format {
            "json" => Some(Self::Json),
            "discord" => Some(Self::Discord),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Discord => "discord",
        }
    }
}

/// Embed color by risk level
fn discord_color(level: RiskLevel) -> u32 {
    match level {
        RiskLevel::Low => 0x57F287,     // Green
        RiskLevel::Medium => 0xFEE75C,  // Yellow
        RiskLevel::High => 0xED4245,    // Red
        RiskLevel::Unknown => 0x99AAB5, // Gray
    }
}

/// Sink that POSTs reports to an HTTP endpoint.
///
/// Retries on 5xx and transport errors, never on 4xx.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    name: String,
    url: String,
    client: Client,
    timeout: Duration,
    retries: u32,
    retry_delay: Duration,
    format: WebhookFormat,
}

impl WebhookSink {
    /// `name` identifies the sink in logs as `webhook:<name>`.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: format!("webhook:{}", name.into()),
            url: url.into(),
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            format: WebhookFormat::Json,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set number of retries on 5xx errors
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_format(mut self, format: WebhookFormat) -> Self {
        self.format = format;
        self
    }

    fn build_payload(&self, report: &AggregateReport) -> Result<Value, SinkError> {
        match self.format {
            WebhookFormat::Json => Ok(serde_json::to_value(report)?),
            WebhookFormat::Discord => Ok(self.build_discord_payload(report)),
        }
    }

    fn build_discord_payload(&self, report: &AggregateReport) -> Value {
        let event = &report.event;
        let title = match (event.name(), event.symbol()) {
            (Some(name), Some(symbol)) => format!("{} (${})", name, symbol),
            (None, Some(symbol)) => format!("${}", symbol),
            (Some(name), None) => name.to_string(),
            (None, None) => event.id.clone(),
        };

        let score = report
            .score
            .map(|s| format!("{:.1}", s))
            .unwrap_or_else(|| "n/a".to_string());

        let description = if report.degraded {
            format!("**{}** {} (no analyzer succeeded)", report.risk_level, event.kind)
        } else {
            format!("**{}** risk, score **{}**", report.risk_level, score)
        };

        let mut fields = vec![
            json!({"name": "Mint", "value": event.id, "inline": false}),
            json!({"name": "Kind", "value": event.kind.as_str(), "inline": true}),
            json!({"name": "Score", "value": score, "inline": true}),
            json!({"name": "Analyzers", "value": self.analyzer_summary(report), "inline": true}),
        ];

        if let Some(link) = &report.engagement.link {
            let metric = report
                .engagement
                .metric
                .map(|m| m.to_string())
                .unwrap_or_else(|| "auto".to_string());
            fields.push(json!({
                "name": "Engagement",
                "value": format!("{} ({})", metric, link.platform),
                "inline": true
            }));
        }

        for flag in report.flags.iter().take(MAX_FLAG_FIELDS) {
            let value = if flag.message.is_empty() {
                "-"
            } else {
                flag.message.as_str()
            };
            fields.push(json!({"name": flag.code, "value": value, "inline": false}));
        }

        json!({
            "embeds": [{
                "title": title,
                "description": description,
                "color": discord_color(report.risk_level),
                "fields": fields,
                "timestamp": report.ended_at.to_rfc3339(),
                "footer": {"text": format!("op {}", event.operation_id)}
            }]
        })
    }

    /// "2 ok / 1 failed / 0 timed out"
    fn analyzer_summary(&self, report: &AggregateReport) -> String {
        let mut ok = 0;
        let mut failed = 0;
        let mut timed_out = 0;
        for task in report.per_task_results.values() {
            match task.outcome {
                TaskOutcome::Success { .. } => ok += 1,
                TaskOutcome::Failure { .. } => failed += 1,
                TaskOutcome::Timeout => timed_out += 1,
            }
        }
        format!("{} ok / {} failed / {} timed out", ok, failed, timed_out)
    }

    /// Execute the webhook request with retries
    async fn send_request(&self, payload: &Value) -> Result<reqwest::Response, SinkError> {
        let mut last_error = None;
        let mut attempts = 0;

        while attempts <= self.retries {
            if attempts > 0 {
                let delay = self.retry_delay * attempts;
                debug!(
                    attempt = attempts,
                    max_retries = self.retries,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying webhook request"
                );
                tokio::time::sleep(delay).await;
            }

            let result = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .json(payload)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    // Client error - don't retry
                    if status.is_client_error() {
                        warn!(status = %status, sink = %self.name, "Webhook returned client error");
                        return Ok(response);
                    }

                    warn!(
                        status = %status,
                        sink = %self.name,
                        attempt = attempts,
                        "Webhook returned server error, will retry"
                    );
                    last_error = Some(SinkError::Failed(format!("Server error: {}", status)));
                }
                Err(e) if e.is_timeout() => {
                    warn!(sink = %self.name, attempt = attempts, "Webhook request timed out");
                    last_error = Some(SinkError::Timeout(self.timeout.as_millis() as u64));
                }
                Err(e) => {
                    warn!(error = %e, sink = %self.name, attempt = attempts, "Webhook request failed");
                    last_error = Some(SinkError::Http(e));
                }
            }

            attempts += 1;
        }

        Err(last_error.unwrap_or_else(|| SinkError::Failed("Unknown error".into())))
    }
}

#[async_trait]
impl ResultSink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, report: &AggregateReport) -> Result<SinkReceipt, SinkError> {
        debug!(
            sink = %self.name,
            id = %report.event.id,
            format = self.format.as_str(),
            "Sending webhook"
        );

        let payload = self.build_payload(report)?;
        let response = self.send_request(&payload).await?;
        let status = response.status();

        if status.is_success() {
            info!(
                sink = %self.name,
                status = %status,
                id = %report.event.id,
                "Webhook delivered successfully"
            );

            Ok(SinkReceipt::with_metadata(
                self.name(),
                format!("Webhook delivered ({})", status),
                json!({
                    "status": status.as_u16(),
                    "format": self.format.as_str(),
                }),
            ))
        } else {
            error!(
                sink = %self.name,
                status = %status,
                id = %report.event.id,
                "Webhook delivery failed"
            );

            Err(SinkError::Failed(format!("Webhook returned status {}", status)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisTask, AnalyzerOutput, RiskFlag};
    use crate::sinks::tests::sample_report;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn scored(score: f64) -> AnalysisTask {
        AnalysisTask {
            analyzer: "contract".to_string(),
            outcome: TaskOutcome::Success {
                output: AnalyzerOutput::new(score)
                    .with_flag(RiskFlag::high("MINT_AUTHORITY", "mint authority not revoked")),
            },
            duration_ms: 12,
        }
    }

    #[test]
    fn test_webhook_builder() {
        let sink = WebhookSink::new("alerts", "https://example.com/webhook")
            .with_timeout(Duration::from_secs(3))
            .with_retries(3);

        assert_eq!(sink.name(), "webhook:alerts");
        assert_eq!(sink.timeout, Duration::from_secs(3));
        assert_eq!(sink.retries, 3);
        assert_eq!(sink.retry_delay, DEFAULT_RETRY_DELAY);
        assert_eq!(sink.format, WebhookFormat::Json);
    }

    /// Local endpoint answering every POST with `status`; returns its URL and
    /// the hit counter.
    async fn endpoint(status: u16) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = axum::Router::new().route(
            "/hook",
            axum::routing::post(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    axum::http::StatusCode::from_u16(status).unwrap()
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        (format!("http://{}/hook", addr), hits)
    }

    #[tokio::test]
    async fn test_server_errors_retry_with_growing_delay() {
        let (url, hits) = endpoint(503).await;
        let sink = WebhookSink::new("alerts", url)
            .with_retries(2)
            .with_retry_delay(Duration::from_millis(30));

        let start = std::time::Instant::now();
        let result = sink.publish(&sample_report(vec![scored(75.0)])).await;

        assert!(matches!(result, Err(SinkError::Failed(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        // 30ms before the first retry, 60ms before the second.
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let (url, hits) = endpoint(404).await;
        let sink = WebhookSink::new("alerts", url)
            .with_retries(2)
            .with_retry_delay(Duration::from_millis(30));

        let result = sink.publish(&sample_report(vec![scored(75.0)])).await;

        assert!(result.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(WebhookFormat::parse("discord"), Some(WebhookFormat::Discord));
        assert_eq!(WebhookFormat::parse("json"), Some(WebhookFormat::Json));
        assert_eq!(WebhookFormat::parse("xml"), None);
    }

    #[test]
    fn test_discord_color() {
        assert_eq!(discord_color(RiskLevel::High), 0xED4245);
        assert_eq!(discord_color(RiskLevel::Low), 0x57F287);
        assert_eq!(discord_color(RiskLevel::Unknown), 0x99AAB5);
    }

    #[test]
    fn test_json_payload_is_report() {
        let sink = WebhookSink::new("raw", "https://example.com/webhook");
        let payload = sink.build_payload(&sample_report(vec![scored(75.0)])).unwrap();

        assert_eq!(payload["event"]["id"], "Mint111");
        assert_eq!(payload["riskLevel"], "HIGH");
        assert_eq!(payload["overallSuccess"], true);
    }

    #[test]
    fn test_discord_payload_structure() {
        let sink = WebhookSink::new("alerts", "https://discord.com/webhook")
            .with_format(WebhookFormat::Discord);
        let payload = sink.build_payload(&sample_report(vec![scored(75.0)])).unwrap();

        let embed = &payload["embeds"][0];
        assert_eq!(embed["title"], "$EXM");
        assert_eq!(embed["color"], 0xED4245);
        assert!(embed["description"].as_str().unwrap().contains("HIGH"));

        let fields = embed["fields"].as_array().unwrap();
        assert!(fields.iter().any(|f| f["name"] == "MINT_AUTHORITY"));
        assert!(fields
            .iter()
            .any(|f| f["value"] == "1 ok / 0 failed / 0 timed out"));
    }

    #[test]
    fn test_discord_payload_degraded() {
        let sink = WebhookSink::new("alerts", "https://discord.com/webhook")
            .with_format(WebhookFormat::Discord);
        let payload = sink.build_payload(&sample_report(Vec::new())).unwrap();

        let embed = &payload["embeds"][0];
        assert_eq!(embed["color"], 0x99AAB5);
        assert!(embed["description"].as_str().unwrap().contains("UNKNOWN"));
    }
}

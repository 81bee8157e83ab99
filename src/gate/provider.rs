//! Engagement metric providers.
//!
//! The [`EngagementProvider`] trait is the seam to whatever computes social
//! engagement numbers. [`HttpEngagementProvider`] talks to a metrics service
//! over HTTP:
//!
//! ```text
//! GET {base}/quick?url=<link>  ->  {"metric": 150, "timestamp": "..."}
//! GET {base}/full?url=<link>   ->  {"metric": 180, "secondaryMetric": 5400, "timestamp": "..."}
//! ```
//!
//! A 404 or a null metric means "no data" and maps to `Ok(None)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors from an engagement check. All of them reject the event at the gate.
#[derive(Error, Debug)]
pub enum EngagementError {
    #[error("engagement check timed out after {0}ms")]
    Timeout(u64),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("engagement check failed: {0}")]
    Failed(String),
}

/// Result of the cheap popularity check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuickMetric {
    pub metric: u64,
    pub timestamp: DateTime<Utc>,
}

/// Result of the slower enrichment check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullMetric {
    pub metric: u64,
    pub secondary_metric: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Source of social engagement numbers.
#[async_trait]
pub trait EngagementProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Low-latency popularity check for a social link.
    async fn quick_check(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Option<QuickMetric>, EngagementError>;

    /// Higher-latency enrichment (e.g. impression counts).
    async fn full_check(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Option<FullMetric>, EngagementError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricResponse {
    metric: Option<u64>,
    #[serde(default)]
    secondary_metric: Option<u64>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Engagement provider backed by an HTTP metrics service.
#[derive(Debug, Clone)]
pub struct HttpEngagementProvider {
    base_url: String,
    client: Client,
}

impl HttpEngagementProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    async fn fetch(
        &self,
        path: &str,
        url: &str,
        timeout: Duration,
    ) -> Result<Option<MetricResponse>, EngagementError> {
        let endpoint = format!("{}/{}", self.base_url, path);

        let response = self
            .client
            .get(&endpoint)
            .query(&[("url", url)])
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngagementError::Timeout(timeout.as_millis() as u64)
                } else {
                    EngagementError::Http(e)
                }
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
            debug!(endpoint = %endpoint, link = %url, "No engagement data");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(EngagementError::Failed(format!(
                "{} returned status {}",
                endpoint, status
            )));
        }

        Ok(Some(response.json::<MetricResponse>().await?))
    }
}

#[async_trait]
impl EngagementProvider for HttpEngagementProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn quick_check(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Option<QuickMetric>, EngagementError> {
        let response = self.fetch("quick", url, timeout).await?;
        Ok(response.and_then(|r| {
            r.metric.map(|metric| QuickMetric {
                metric,
                timestamp: r.timestamp.unwrap_or_else(Utc::now),
            })
        }))
    }

    async fn full_check(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Option<FullMetric>, EngagementError> {
        let response = self.fetch("full", url, timeout).await?;
        Ok(response.and_then(|r| {
            r.metric.map(|metric| FullMetric {
                metric,
                secondary_metric: r.secondary_metric,
                timestamp: r.timestamp.unwrap_or_else(Utc::now),
            })
        }))
    }
}

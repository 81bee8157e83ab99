//! HTTP analyzer adapter.
//!
//! Delegates one analysis to an external service:
//!
//! ```text
//! GET {url}/{entity_id}
//!
//! {"success": true, "score": 62.5, "flags": [...], "data": {...}}
//! {"success": false, "error": "rpc unavailable"}
//! ```
//!
//! The request is dropped as soon as the run is cancelled.

use super::{AnalysisContext, Analyzer, AnalyzerError, AnalyzerOutput, RiskFlag};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct AnalyzerResponse {
    success: bool,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    flags: Vec<RiskFlag>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<String>,
}

impl AnalyzerResponse {
    fn into_output(self) -> Result<AnalyzerOutput, AnalyzerError> {
        if !self.success {
            return Err(AnalyzerError::Rejected(
                self.error.unwrap_or_else(|| "no error given".to_string()),
            ));
        }

        let score = self
            .score
            .ok_or_else(|| AnalyzerError::Failed("response has no score".to_string()))?;

        let mut output = AnalyzerOutput::new(score).with_data(self.data);
        output.flags = self.flags;
        Ok(output)
    }
}

/// Analyzer backed by an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpAnalyzer {
    name: String,
    url: String,
    client: Client,
    timeout: Duration,
}

impl HttpAnalyzer {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            url: url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
            timeout,
        }
    }

    fn endpoint(&self, entity_id: &str) -> String {
        format!("{}/{}", self.url, entity_id)
    }

    async fn request(&self, entity_id: &str) -> Result<AnalyzerOutput, AnalyzerError> {
        let endpoint = self.endpoint(entity_id);
        debug!(analyzer = %self.name, endpoint = %endpoint, "Requesting analysis");

        let response = self
            .client
            .get(&endpoint)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(AnalyzerError::Failed(format!(
                "{} returned status {}",
                endpoint, status
            )));
        }

        // Client errors may still carry a {"success": false, "error": ...} body.
        response.json::<AnalyzerResponse>().await?.into_output()
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: AnalysisContext) -> Result<AnalyzerOutput, AnalyzerError> {
        tokio::select! {
            result = self.request(ctx.entity_id()) => result,
            _ = ctx.cancel.cancelled() => Err(AnalyzerError::Cancelled),
        }
    }
}

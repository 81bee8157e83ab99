//! Log sink - structured logging of finished reports.
//!
//! ```rust,ignore
//! use tokenscope::sinks::LogSink;
//!
//! let sink = LogSink::with_prefix("audit");
//! ```

use super::{ResultSink, SinkError, SinkReceipt};
use crate::analysis::AggregateReport;
use async_trait::async_trait;
use tracing::{info, warn};

/// Sink that writes each report as one structured log line.
#[derive(Debug, Clone)]
pub struct LogSink {
    prefix: String,
}

impl LogSink {
    pub fn new() -> Self {
        Self {
            prefix: "report".to_string(),
        }
    }

    /// The prefix tells several log sinks apart (e.g. "audit", "debug").
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, report: &AggregateReport) -> Result<SinkReceipt, SinkError> {
        let flags: Vec<&str> = report.flags.iter().map(|f| f.code.as_str()).collect();
        let symbol = report.event.symbol().unwrap_or("?");

        if report.degraded {
            warn!(
                prefix = %self.prefix,
                id = %report.event.id,
                operation_id = %report.event.operation_id,
                kind = %report.event.kind,
                analyzers = report.per_task_results.len(),
                flags = ?flags,
                "[{}] Degraded report for {} ({})",
                self.prefix,
                symbol,
                report.event.id
            );
        } else {
            info!(
                prefix = %self.prefix,
                id = %report.event.id,
                operation_id = %report.event.operation_id,
                kind = %report.event.kind,
                score = ?report.score,
                risk_level = %report.risk_level,
                engagement = ?report.engagement.metric,
                flags = ?flags,
                "[{}] {} ({}): {}",
                self.prefix,
                symbol,
                report.event.id,
                report.risk_level
            );
        }

        Ok(SinkReceipt::success(
            self.name(),
            format!(
                "Logged report for {} with prefix '{}'",
                report.event.id, self.prefix
            ),
        ))
    }
}

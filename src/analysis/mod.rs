//! Risk analysis.
//!
//! Analyzers are independent risk checks run in parallel for every
//! qualified event. The [`Analyzer`] trait defines the interface each one
//! implements; the [`AnalysisOrchestrator`] fans them out under a global
//! timeout and folds the outcomes into an [`AggregateReport`].
//!
//! ## Creating an analyzer
//!
//! ```rust,ignore
//! use tokenscope::analysis::{Analyzer, AnalyzerOutput, AnalyzerError, AnalysisContext};
//! use async_trait::async_trait;
//!
//! struct HolderConcentration;
//!
//! #[async_trait]
//! impl Analyzer for HolderConcentration {
//!     fn name(&self) -> &str {
//!         "holders"
//!     }
//!
//!     async fn run(&self, ctx: AnalysisContext) -> Result<AnalyzerOutput, AnalyzerError> {
//!         Ok(AnalyzerOutput::new(35.0))
//!     }
//! }
//! ```

pub mod cancel;
pub mod http;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod slots;

use crate::event::TokenEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

pub use cancel::{CancelReason, CancellationToken};
pub use http::HttpAnalyzer;
pub use orchestrator::AnalysisOrchestrator;
pub use registry::AnalyzerRegistry;
pub use report::{AggregateReport, AnalysisTask, RiskBands, RiskLevel, TaskOutcome};
pub use slots::{AnalysisPermit, AnalyzingSet, SlotError};

/// Errors an analyzer can report. All of them become a `Failure` outcome.
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("analyzer reported failure: {0}")]
    Rejected(String),

    #[error("analyzer cancelled")]
    Cancelled,

    #[error("analysis failed: {0}")]
    Failed(String),
}

/// How bad a flag is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    High,
}

/// A named risk indicator raised by an analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFlag {
    pub code: String,
    pub severity: Severity,
    #[serde(default)]
    pub message: String,
    /// Analyzer that raised the flag. Filled in during aggregation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl RiskFlag {
    pub fn new(code: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            severity,
            message: message.into(),
            source: None,
        }
    }

    pub fn high(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, Severity::High, message)
    }

    pub fn is_high(&self) -> bool {
        self.severity == Severity::High
    }
}

/// Result of a successful analyzer run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerOutput {
    /// Risk sub-score in `[0, 100]`; higher is riskier.
    pub score: f64,
    #[serde(default)]
    pub flags: Vec<RiskFlag>,
    #[serde(default)]
    pub data: Value,
}

impl AnalyzerOutput {
    pub fn new(score: f64) -> Self {
        Self {
            score: score.clamp(0.0, 100.0),
            flags: Vec::new(),
            data: Value::Null,
        }
    }

    pub fn with_flag(mut self, flag: RiskFlag) -> Self {
        self.flags.push(flag);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Everything an analyzer gets for one run.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub event: Arc<TokenEvent>,
    /// Cancelled when the global timeout fires or an operator cancels.
    pub cancel: CancellationToken,
}

impl AnalysisContext {
    pub fn new(event: Arc<TokenEvent>, cancel: CancellationToken) -> Self {
        Self { event, cancel }
    }

    pub fn entity_id(&self) -> &str {
        &self.event.id
    }

    pub fn payload(&self) -> &Value {
        &self.event.payload
    }
}

/// A single risk check.
///
/// Analyzers are spawned as independent tasks and must be `Send + Sync`.
/// Long-running analyzers should watch `ctx.cancel` and stop early.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Unique analyzer type name (e.g. "contract", "holders").
    fn name(&self) -> &str;

    async fn run(&self, ctx: AnalysisContext) -> Result<AnalyzerOutput, AnalyzerError>;
}

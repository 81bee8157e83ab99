//! Aggregated analysis results and risk scoring.
//!
//! ## Scoring
//!
//! - `score` is the mean of the successful analyzers' sub-scores. Failed and
//!   timed-out analyzers are left out, never counted as zero.
//! - `risk_level` is the higher of the score band and the flag band. Band
//!   boundaries belong to the higher band.
//! - A report with no successful analyzer is `degraded`: no score, risk level
//!   `UNKNOWN`, and an `INSUFFICIENT_DATA` flag. It is still published.

use super::cancel::CancelReason;
use super::{AnalyzerOutput, RiskFlag, Severity};
use crate::config::ScoringConfig;
use crate::event::TokenEvent;
use crate::gate::EngagementSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Flag code attached to degraded reports.
pub const INSUFFICIENT_DATA: &str = "INSUFFICIENT_DATA";

/// Settled state of one analyzer run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TaskOutcome {
    Success { output: AnalyzerOutput },
    Failure { error: String },
    Timeout,
}

/// One analyzer's contribution to a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisTask {
    pub analyzer: String,
    pub outcome: TaskOutcome,
    pub duration_ms: u64,
}

impl AnalysisTask {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Success { .. })
    }

    pub fn output(&self) -> Option<&AnalyzerOutput> {
        match &self.outcome {
            TaskOutcome::Success { output } => Some(output),
            _ => None,
        }
    }
}

/// Overall risk classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    /// No analyzer succeeded.
    Unknown,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Score and flag thresholds for [`RiskLevel`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskBands {
    pub medium_threshold: f64,
    pub high_threshold: f64,
    /// Number of high-severity flags that force `HIGH`. Zero disables it.
    pub high_flag_escalation: usize,
}

impl RiskBands {
    pub fn from_config(config: &ScoringConfig) -> Self {
        Self {
            medium_threshold: config.medium_threshold,
            high_threshold: config.high_threshold,
            high_flag_escalation: config.high_flag_escalation,
        }
    }

    pub fn level(&self, score: f64, high_flags: usize) -> RiskLevel {
        let by_score = if score >= self.high_threshold {
            RiskLevel::High
        } else if score >= self.medium_threshold {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        let by_flags = if self.high_flag_escalation > 0 && high_flags >= self.high_flag_escalation
        {
            RiskLevel::High
        } else if high_flags > 0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        by_score.max(by_flags)
    }
}

impl Default for RiskBands {
    fn default() -> Self {
        Self::from_config(&ScoringConfig::default())
    }
}

/// Mean of the successful sub-scores, `None` when nothing succeeded.
pub fn aggregate_score<'a, I>(tasks: I) -> Option<f64>
where
    I: IntoIterator<Item = &'a AnalysisTask>,
{
    let (sum, count) = tasks
        .into_iter()
        .filter_map(AnalysisTask::output)
        .fold((0.0, 0usize), |(sum, count), output| (sum + output.score, count + 1));

    (count > 0).then(|| sum / count as f64)
}

/// Final result for one event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateReport {
    pub event: TokenEvent,
    pub engagement: EngagementSnapshot,
    /// Exactly one entry per enabled analyzer.
    pub per_task_results: BTreeMap<String, AnalysisTask>,
    pub overall_success: bool,
    pub degraded: bool,
    pub score: Option<f64>,
    pub risk_level: RiskLevel,
    pub flags: Vec<RiskFlag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<CancelReason>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl AggregateReport {
    /// Fold settled tasks into a report.
    pub fn compose(
        event: TokenEvent,
        engagement: EngagementSnapshot,
        tasks: Vec<AnalysisTask>,
        bands: &RiskBands,
        cancelled: Option<CancelReason>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        let score = aggregate_score(&tasks);
        let overall_success = score.is_some();

        let mut flags: Vec<RiskFlag> = tasks
            .iter()
            .filter_map(|task| task.output().map(|output| (task, output)))
            .flat_map(|(task, output)| {
                output.flags.iter().cloned().map(move |mut flag| {
                    flag.source.get_or_insert_with(|| task.analyzer.clone());
                    flag
                })
            })
            .collect();

        let risk_level = match score {
            Some(score) => {
                let high_flags = flags.iter().filter(|f| f.is_high()).count();
                bands.level(score, high_flags)
            }
            None => {
                flags.push(RiskFlag::new(
                    INSUFFICIENT_DATA,
                    Severity::Warning,
                    format!("no analyzer succeeded ({} attempted)", tasks.len()),
                ));
                RiskLevel::Unknown
            }
        };

        let per_task_results = tasks
            .into_iter()
            .map(|task| (task.analyzer.clone(), task))
            .collect();

        Self {
            event,
            engagement,
            per_task_results,
            overall_success,
            degraded: !overall_success,
            score,
            risk_level,
            flags,
            cancelled,
            started_at,
            ended_at,
        }
    }

    pub fn success_count(&self) -> usize {
        self.count(|o| matches!(o, TaskOutcome::Success { .. }))
    }

    pub fn failure_count(&self) -> usize {
        self.count(|o| matches!(o, TaskOutcome::Failure { .. }))
    }

    pub fn timeout_count(&self) -> usize {
        self.count(|o| matches!(o, TaskOutcome::Timeout))
    }

    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }

    fn count(&self, pred: impl Fn(&TaskOutcome) -> bool) -> usize {
        self.per_task_results
            .values()
            .filter(|t| pred(&t.outcome))
            .count()
    }
}

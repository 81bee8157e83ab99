//! Analysis orchestrator.
//!
//! Runs every analyzer enabled for an event's kind in parallel and folds the
//! outcomes into an [`AggregateReport`].
//!
//! ```text
//! analyze(permit, event)
//!     │
//!     ├─ spawn contract ──┐
//!     ├─ spawn holders  ──┼─ join_all ─► compose report
//!     └─ spawn liquidity ─┘      ▲
//!                                │
//!        global timer ── cancel token ── operator cancel
//! ```
//!
//! Each analyzer runs in its own task, so an error or a panic only turns its
//! own outcome into `Failure`. When the token is cancelled every unsettled
//! analyzer is recorded as `Timeout` and its task is detached; whatever it
//! returns later is discarded.

use super::cancel::{CancelReason, CancellationToken};
use super::registry::AnalyzerRegistry;
use super::report::{AggregateReport, AnalysisTask, RiskBands, TaskOutcome};
use super::slots::{AnalysisPermit, AnalyzingSet, SlotError};
use super::{AnalysisContext, Analyzer};
use crate::config::{AnalysisConfig, ScoringConfig};
use crate::event::TokenEvent;
use crate::gate::EngagementSnapshot;
use chrono::Utc;
use futures::future::join_all;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Fans analyzers out under a global timeout with a concurrency ceiling.
pub struct AnalysisOrchestrator {
    registry: Arc<AnalyzerRegistry>,
    slots: Arc<AnalyzingSet>,
    timeout: Duration,
    bands: RiskBands,
}

impl AnalysisOrchestrator {
    pub fn new(registry: AnalyzerRegistry, max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            registry: Arc::new(registry),
            slots: AnalyzingSet::new(max_concurrent),
            timeout,
            bands: RiskBands::default(),
        }
    }

    pub fn from_config(
        analysis: &AnalysisConfig,
        scoring: &ScoringConfig,
        registry: AnalyzerRegistry,
    ) -> Self {
        Self::new(registry, analysis.max_concurrent, analysis.timeout())
            .with_bands(RiskBands::from_config(scoring))
    }

    pub fn with_bands(mut self, bands: RiskBands) -> Self {
        self.bands = bands;
        self
    }

    /// Claim an analysis slot for an entity.
    pub fn try_begin(&self, id: &str) -> Result<AnalysisPermit, SlotError> {
        self.slots.try_begin(id)
    }

    /// Run all enabled analyzers for `event` and build its report.
    ///
    /// Always returns a report; a report with no successful analyzer is
    /// marked degraded. The permit's slot stays taken until the caller drops
    /// it.
    pub async fn analyze(
        &self,
        permit: &AnalysisPermit,
        event: TokenEvent,
        engagement: EngagementSnapshot,
    ) -> AggregateReport {
        debug_assert_eq!(permit.id(), event.id);

        let started_at = Utc::now();
        let token = permit.token().clone();
        let analyzers = self.registry.for_kind(event.kind);

        info!(
            id = %event.id,
            operation_id = %event.operation_id,
            kind = %event.kind,
            analyzers = analyzers.len(),
            timeout_ms = self.timeout.as_millis() as u64,
            "Analysis started"
        );

        let event = Arc::new(event);
        let tasks = if token.is_cancelled() {
            // Cancelled while waiting for enrichment; nothing is started.
            info!(
                id = %event.id,
                reason = ?token.reason(),
                "Analysis cancelled before start, skipping analyzers"
            );
            analyzers
                .iter()
                .map(|analyzer| AnalysisTask {
                    analyzer: analyzer.name().to_string(),
                    outcome: TaskOutcome::Timeout,
                    duration_ms: 0,
                })
                .collect()
        } else {
            self.fan_out(&event, analyzers, &token).await
        };

        let ended_at = Utc::now();
        let event = Arc::try_unwrap(event).unwrap_or_else(|shared| (*shared).clone());

        let report = AggregateReport::compose(
            event,
            engagement,
            tasks,
            &self.bands,
            token.reason(),
            started_at,
            ended_at,
        );

        info!(
            id = %report.event.id,
            operation_id = %report.event.operation_id,
            succeeded = report.success_count(),
            failed = report.failure_count(),
            timed_out = report.timeout_count(),
            score = ?report.score,
            risk_level = %report.risk_level,
            degraded = report.degraded,
            duration_ms = report.duration_ms(),
            "Analysis finished"
        );

        report
    }

    async fn fan_out(
        &self,
        event: &Arc<TokenEvent>,
        analyzers: Vec<Arc<dyn Analyzer>>,
        token: &CancellationToken,
    ) -> Vec<AnalysisTask> {
        let runs = analyzers.into_iter().map(|analyzer| {
            run_analyzer(analyzer, AnalysisContext::new(Arc::clone(event), token.clone()))
        });
        let all = join_all(runs);
        tokio::pin!(all);

        tokio::select! {
            tasks = &mut all => tasks,
            _ = tokio::time::sleep(self.timeout) => {
                if token.cancel(CancelReason::Timeout) {
                    warn!(
                        id = %event.id,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Analysis timed out, discarding unsettled analyzers"
                    );
                }
                all.await
            }
        }
    }

    /// Claim a slot and analyze in one call.
    pub async fn analyze_event(
        &self,
        event: TokenEvent,
        engagement: EngagementSnapshot,
    ) -> Result<AggregateReport, SlotError> {
        let permit = self.try_begin(&event.id)?;
        Ok(self.analyze(&permit, event, engagement).await)
    }

    /// Operator cancellation of a running analysis.
    pub fn cancel(&self, id: &str) -> bool {
        let cancelled = self.slots.cancel(id, CancelReason::Operator);
        if cancelled {
            info!(id = %id, "Analysis cancelled by operator");
        }
        cancelled
    }

    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        self.slots.cancel_all(reason)
    }

    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Ids of the events currently being analyzed.
    pub fn in_flight_ids(&self) -> Vec<String> {
        self.slots.ids()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn registry(&self) -> &AnalyzerRegistry {
        &self.registry
    }
}

/// Run one analyzer in its own task and settle it into an [`AnalysisTask`].
async fn run_analyzer(analyzer: Arc<dyn Analyzer>, ctx: AnalysisContext) -> AnalysisTask {
    let name = analyzer.name().to_string();
    let id = ctx.entity_id().to_string();
    let token: CancellationToken = ctx.cancel.clone();
    let start = Instant::now();

    let mut handle = tokio::spawn(async move { analyzer.run(ctx).await });

    let outcome = tokio::select! {
        biased;
        joined = &mut handle => match joined {
            Ok(Ok(output)) => TaskOutcome::Success { output },
            Ok(Err(e)) => TaskOutcome::Failure { error: e.to_string() },
            Err(e) if e.is_panic() => TaskOutcome::Failure {
                error: format!("analyzer panicked: {}", panic_message(e.into_panic())),
            },
            Err(e) => TaskOutcome::Failure { error: e.to_string() },
        },
        _ = token.cancelled() => TaskOutcome::Timeout,
    };

    let duration_ms = start.elapsed().as_millis() as u64;
    match &outcome {
        TaskOutcome::Success { output } => {
            debug!(id = %id, analyzer = %name, score = output.score, duration_ms, "Analyzer succeeded")
        }
        TaskOutcome::Failure { error } => {
            warn!(id = %id, analyzer = %name, error = %error, duration_ms, "Analyzer failed")
        }
        TaskOutcome::Timeout => {
            warn!(id = %id, analyzer = %name, duration_ms, "Analyzer did not settle before cancellation")
        }
    }

    AnalysisTask {
        analyzer: name,
        outcome,
        duration_ms,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::report::{RiskLevel, INSUFFICIENT_DATA};
    use crate::analysis::{AnalyzerError, AnalyzerOutput};
    use crate::event::EventKind;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Score(f64),
        Fail,
        Panic,
        /// Never returns and ignores cancellation.
        Hang,
    }

    struct Stub {
        name: &'static str,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl Stub {
        fn new(name: &'static str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Analyzer for Stub {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, _ctx: AnalysisContext) -> Result<AnalyzerOutput, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Score(score) => Ok(AnalyzerOutput::new(score)),
                Behavior::Fail => Err(AnalyzerError::Failed("upstream 500".to_string())),
                Behavior::Panic => panic!("analyzer bug"),
                Behavior::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    fn orchestrator(analyzers: Vec<Arc<Stub>>, timeout: Duration) -> AnalysisOrchestrator {
        let mut registry = AnalyzerRegistry::new();
        let names: Vec<&str> = analyzers.iter().map(|a| a.name).collect();
        for analyzer in analyzers {
            registry.register(analyzer);
        }
        registry.enable(EventKind::Creation, &names);
        AnalysisOrchestrator::new(registry, 3, timeout)
    }

    fn event(id: &str) -> TokenEvent {
        TokenEvent::new(id, EventKind::Creation, json!({"symbol": "EXM"}))
    }

    #[tokio::test]
    async fn test_partial_failure_scores_successes_only() {
        let orchestrator = orchestrator(
            vec![
                Stub::new("contract", Behavior::Score(80.0)),
                Stub::new("holders", Behavior::Fail),
            ],
            Duration::from_secs(5),
        );

        let report = orchestrator
            .analyze_event(event("Mint111"), EngagementSnapshot::default())
            .await
            .unwrap();

        assert_eq!(report.score, Some(80.0));
        assert!(report.overall_success);
        assert!(!report.degraded);
        assert_eq!(report.per_task_results.len(), 2);
        assert!(matches!(
            report.per_task_results["holders"].outcome,
            TaskOutcome::Failure { .. }
        ));
        assert_eq!(orchestrator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_all_failed_is_degraded() {
        let orchestrator = orchestrator(
            vec![
                Stub::new("contract", Behavior::Fail),
                Stub::new("holders", Behavior::Fail),
            ],
            Duration::from_secs(5),
        );

        let report = orchestrator
            .analyze_event(event("Mint111"), EngagementSnapshot::default())
            .await
            .unwrap();

        assert!(report.degraded);
        assert!(!report.overall_success);
        assert_eq!(report.risk_level, RiskLevel::Unknown);
        assert!(report.flags.iter().any(|f| f.code == INSUFFICIENT_DATA));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let orchestrator = orchestrator(
            vec![
                Stub::new("contract", Behavior::Panic),
                Stub::new("holders", Behavior::Score(20.0)),
            ],
            Duration::from_secs(5),
        );

        let report = orchestrator
            .analyze_event(event("Mint111"), EngagementSnapshot::default())
            .await
            .unwrap();

        match &report.per_task_results["contract"].outcome {
            TaskOutcome::Failure { error } => assert!(error.contains("analyzer bug")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(report.score, Some(20.0));
    }

    #[tokio::test]
    async fn test_global_timeout_settles_hung_analyzers() {
        let timeout = Duration::from_millis(50);
        let orchestrator = orchestrator(
            vec![
                Stub::new("contract", Behavior::Hang),
                Stub::new("holders", Behavior::Score(30.0)),
            ],
            timeout,
        );

        let start = Instant::now();
        let report = orchestrator
            .analyze_event(event("Mint111"), EngagementSnapshot::default())
            .await
            .unwrap();

        assert!(start.elapsed() < timeout + Duration::from_millis(500));
        assert_eq!(report.per_task_results["contract"].outcome, TaskOutcome::Timeout);
        assert!(report.per_task_results["holders"].is_success());
        assert_eq!(report.cancelled, Some(CancelReason::Timeout));
        assert!(report.overall_success);
    }

    #[tokio::test]
    async fn test_operator_cancel() {
        let orchestrator = Arc::new(orchestrator(
            vec![Stub::new("contract", Behavior::Hang)],
            Duration::from_secs(30),
        ));

        let running = Arc::clone(&orchestrator);
        let handle = tokio::spawn(async move {
            running
                .analyze_event(event("Mint111"), EngagementSnapshot::default())
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(orchestrator.in_flight(), 1);
        assert!(orchestrator.cancel("Mint111"));

        let report = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.cancelled, Some(CancelReason::Operator));
        assert!(report.degraded);
        assert!(!orchestrator.cancel("Mint111"));
    }

    #[tokio::test]
    async fn test_ceiling_refuses_extra_analysis() {
        let orchestrator = AnalysisOrchestrator::new(AnalyzerRegistry::new(), 1, Duration::from_secs(1));

        let _held = orchestrator.try_begin("a").unwrap();
        let refused = orchestrator
            .analyze_event(event("b"), EngagementSnapshot::default())
            .await;
        assert!(matches!(refused, Err(SlotError::Full { capacity: 1 })));
    }

    #[tokio::test]
    async fn test_analyzers_run_once_each() {
        let contract = Stub::new("contract", Behavior::Score(10.0));
        let holders = Stub::new("holders", Behavior::Score(10.0));
        let orchestrator = orchestrator(
            vec![Arc::clone(&contract), Arc::clone(&holders)],
            Duration::from_secs(5),
        );

        orchestrator
            .analyze_event(event("Mint111"), EngagementSnapshot::default())
            .await
            .unwrap();
        assert_eq!(contract.calls.load(Ordering::SeqCst), 1);
        assert_eq!(holders.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_analyzers() {
        let contract = Stub::new("contract", Behavior::Score(10.0));
        let holders = Stub::new("holders", Behavior::Score(20.0));
        let orchestrator = orchestrator(
            vec![Arc::clone(&contract), Arc::clone(&holders)],
            Duration::from_secs(5),
        );

        let permit = orchestrator.try_begin("Mint111").unwrap();
        assert!(orchestrator.cancel("Mint111"));

        let report = orchestrator
            .analyze(&permit, event("Mint111"), EngagementSnapshot::default())
            .await;

        assert_eq!(contract.calls.load(Ordering::SeqCst), 0);
        assert_eq!(holders.calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.per_task_results.len(), 2);
        assert_eq!(report.timeout_count(), 2);
        assert_eq!(report.cancelled, Some(CancelReason::Operator));
        assert!(report.degraded);
    }
}

//! Pipeline wiring.
//!
//! ```text
//! EventSource ─mpsc─► ingest ─► Deduplicator ─► EngagementGate ─► WorkQueue
//!                                                                   │
//!                              drain timer (single-flight batches) ◄┘
//!                                   │
//!                        AnalyzingSet full? ── yes ─► requeue front after delay
//!                                   │ no
//!                    enrich ─► AnalysisOrchestrator ─► SinkSet
//! ```
//!
//! Each event walks the [`Stage`] state machine; every transition is logged
//! with the event id and operation id.

use crate::analysis::{
    AnalysisOrchestrator, AnalysisPermit, AnalyzerRegistry, CancelReason, SlotError,
};
use crate::config::TokenscopeConfig;
use crate::dedup::Deduplicator;
use crate::event::TokenEvent;
use crate::gate::{EngagementGate, EngagementProvider, GateDecision, HttpEngagementProvider};
use crate::queue::{QueueItem, WorkQueue};
use crate::shutdown::ShutdownSignal;
use crate::sinks::SinkSet;
use crate::source::{EventSource, SourceError, SourceEvent};
use crate::stats::PipelineStats;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Time cancelled analyses get to publish once the grace period is over.
const CANCELLED_PUBLISH_GRACE: Duration = Duration::from_secs(2);

/// Per-event lifecycle.
///
/// `Skipped`, `Rejected`, `Published` and `Dropped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Deduped,
    Skipped,
    Gated,
    Qualified,
    Rejected,
    Queued,
    Draining,
    Analyzing,
    Aggregated,
    Published,
    Dropped,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Deduped => "deduped",
            Self::Skipped => "skipped",
            Self::Gated => "gated",
            Self::Qualified => "qualified",
            Self::Rejected => "rejected",
            Self::Queued => "queued",
            Self::Draining => "draining",
            Self::Analyzing => "analyzing",
            Self::Aggregated => "aggregated",
            Self::Published => "published",
            Self::Dropped => "dropped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Skipped | Self::Rejected | Self::Published | Self::Dropped
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that end [`Pipeline::run`].
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("feed task failed: {0}")]
    SourceTask(#[from] tokio::task::JoinError),
}

/// Timers and sizes of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub drain_interval: Duration,
    pub requeue_delay: Duration,
    pub max_item_age: Duration,
    pub high_water_mark: usize,
    pub eviction_interval: Duration,
    pub channel_capacity: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &TokenscopeConfig) -> Self {
        Self {
            batch_size: config.queue.batch_size,
            drain_interval: config.queue.drain_interval(),
            requeue_delay: config.queue.requeue_delay(),
            max_item_age: config.queue.max_item_age(),
            high_water_mark: config.dedup.high_water_mark,
            eviction_interval: config.dedup.eviction_interval(),
            channel_capacity: config.feed.channel_capacity,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&TokenscopeConfig::default())
    }
}

/// What one drain tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    pub dispatched: usize,
    pub expired: usize,
    pub requeued: usize,
    /// Another drain was still running; nothing was taken.
    pub skipped: bool,
}

/// The event pipeline. Shared as `Arc<Pipeline>`.
pub struct Pipeline {
    dedup: Deduplicator,
    gate: EngagementGate,
    queue: WorkQueue,
    orchestrator: AnalysisOrchestrator,
    sinks: SinkSet,
    stats: PipelineStats,
    settings: PipelineSettings,
    tasks: Mutex<JoinSet<()>>,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        gate: EngagementGate,
        orchestrator: AnalysisOrchestrator,
        sinks: SinkSet,
    ) -> Arc<Self> {
        Arc::new(Self {
            dedup: Deduplicator::new(settings.high_water_mark),
            queue: WorkQueue::new(settings.max_item_age),
            gate,
            orchestrator,
            sinks,
            stats: PipelineStats::new(),
            settings,
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    /// Build every stage from configuration.
    pub fn from_config(config: &TokenscopeConfig) -> Arc<Self> {
        let provider = config.gate.provider_url.as_ref().map(|url| {
            let provider: Arc<dyn EngagementProvider> =
                Arc::new(HttpEngagementProvider::new(url.clone()));
            provider
        });
        if provider.is_none() {
            warn!("No engagement provider configured; only auto-qualified platforms will pass");
        }

        let registry = AnalyzerRegistry::from_config(&config.analysis);
        let orchestrator =
            AnalysisOrchestrator::from_config(&config.analysis, &config.scoring, registry);

        Self::new(
            PipelineSettings::from_config(config),
            EngagementGate::from_config(&config.gate, provider),
            orchestrator,
            SinkSet::from_config(&config.sinks),
        )
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }

    pub fn orchestrator(&self) -> &AnalysisOrchestrator {
        &self.orchestrator
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Background tasks (gate checks, analyses, pending requeues) still running.
    pub fn in_flight_tasks(&self) -> usize {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Dedup, gate and enqueue one event. Returns the stage it stopped at.
    pub async fn handle_event(&self, event: TokenEvent) -> Stage {
        PipelineStats::incr(&self.stats.events_received);
        debug!(id = %event.id, operation_id = %event.operation_id, stage = %Stage::Received, "Event received");

        if !self.dedup.admit(&event.id) {
            PipelineStats::incr(&self.stats.duplicates);
            debug!(id = %event.id, stage = %Stage::Skipped, "Duplicate event skipped");
            return Stage::Skipped;
        }

        match self.gate.quick_check(&event).await {
            GateDecision::Rejected(reason) => {
                PipelineStats::incr(&self.stats.rejected);
                debug!(
                    id = %event.id,
                    operation_id = %event.operation_id,
                    stage = %Stage::Rejected,
                    reason = %reason,
                    "Event rejected at gate"
                );
                Stage::Rejected
            }
            GateDecision::Qualified(engagement) => {
                PipelineStats::incr(&self.stats.qualified);
                info!(
                    id = %event.id,
                    operation_id = %event.operation_id,
                    stage = %Stage::Queued,
                    metric = ?engagement.metric,
                    auto_qualified = engagement.auto_qualified,
                    "Event qualified"
                );
                self.queue.enqueue(QueueItem::new(event, engagement));
                Stage::Queued
            }
        }
    }

    /// Take one batch off the queue and dispatch it to analysis.
    pub fn drain_once(self: &Arc<Self>) -> DrainOutcome {
        let Some(permit) = self.queue.begin_drain() else {
            debug!("Drain still in progress, skipping tick");
            return DrainOutcome {
                skipped: true,
                ..Default::default()
            };
        };

        let batch = permit.take(self.settings.batch_size);
        let mut outcome = DrainOutcome {
            expired: batch.expired.len(),
            ..Default::default()
        };

        PipelineStats::add(&self.stats.expired, batch.expired.len() as u64);
        for item in &batch.expired {
            info!(
                id = %item.event.id,
                operation_id = %item.event.operation_id,
                stage = %Stage::Dropped,
                age_secs = item.age().as_secs(),
                "Stale item dropped"
            );
        }

        let mut refused = Vec::new();
        for item in batch.ready {
            match self.orchestrator.try_begin(&item.event.id) {
                Ok(slot) => {
                    outcome.dispatched += 1;
                    PipelineStats::incr(&self.stats.analyses_started);
                    debug!(id = %item.event.id, stage = %Stage::Draining, "Dispatching to analysis");
                    let this = Arc::clone(self);
                    self.spawn_tracked(async move { this.process(slot, item).await });
                }
                Err(SlotError::Full { capacity }) => {
                    debug!(id = %item.event.id, capacity, "Analysis capacity reached");
                    refused.push(item);
                }
                Err(SlotError::AlreadyAnalyzing) => {
                    PipelineStats::incr(&self.stats.duplicates);
                    debug!(id = %item.event.id, stage = %Stage::Skipped, "Already being analyzed");
                }
            }
        }
        drop(permit);

        if !refused.is_empty() {
            outcome.requeued = refused.len();
            PipelineStats::add(&self.stats.requeued, refused.len() as u64);
            info!(
                requeued = refused.len(),
                delay_ms = self.settings.requeue_delay.as_millis() as u64,
                "Analysis capacity reached, requeueing"
            );

            let this = Arc::clone(self);
            let delay = self.settings.requeue_delay;
            self.spawn_tracked(async move {
                tokio::time::sleep(delay).await;
                for item in refused.into_iter().rev() {
                    this.queue.requeue_front(item);
                }
            });
        }

        outcome
    }

    /// Clear the dedup cache if it has grown past its mark.
    pub fn evict(&self) -> usize {
        let evicted = self.dedup.evict_if_over_capacity();
        PipelineStats::add(&self.stats.dedup_evictions, evicted as u64);
        evicted
    }

    async fn process(&self, slot: AnalysisPermit, item: QueueItem) {
        let QueueItem {
            event,
            mut engagement,
            ..
        } = item;

        self.gate.enrich(&event, &mut engagement).await;

        debug!(id = %event.id, operation_id = %event.operation_id, stage = %Stage::Analyzing, "Analyzing");
        let report = self.orchestrator.analyze(&slot, event, engagement).await;
        debug!(id = %report.event.id, stage = %Stage::Aggregated, "Report aggregated");

        if report.degraded {
            PipelineStats::incr(&self.stats.degraded_reports);
        }

        let result = self.sinks.publish(&report).await;
        drop(slot);

        PipelineStats::incr(&self.stats.reports_published);
        PipelineStats::add(&self.stats.publish_failures, result.failure_count() as u64);
        info!(
            id = %report.event.id,
            operation_id = %report.event.operation_id,
            stage = %Stage::Published,
            risk_level = %report.risk_level,
            delivered = result.delivered.len(),
            failed = result.failure_count(),
            "Report published"
        );
    }

    fn spawn_tracked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    fn on_source_event(self: &Arc<Self>, event: SourceEvent) {
        match event {
            SourceEvent::Token(event) => {
                let this = Arc::clone(self);
                self.spawn_tracked(async move {
                    this.handle_event(event).await;
                });
            }
            SourceEvent::Connected => debug!("Feed session started"),
            SourceEvent::Disconnected { code, reason } => {
                debug!(code, reason = %reason, "Feed session ended")
            }
            SourceEvent::MaxAttemptsReached { attempts } => {
                error!(attempts, "Feed reconnect attempts exhausted")
            }
        }
    }

    /// Wait for background work. When `grace` runs out, running analyses are
    /// cancelled and given a short window to publish their reports.
    ///
    /// Returns `true` if everything finished within `grace`.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());

        let finished = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if finished {
            return true;
        }

        let cancelled = self.orchestrator.cancel_all(CancelReason::Shutdown);
        warn!(
            cancelled,
            remaining = tasks.len(),
            grace_secs = grace.as_secs(),
            "Grace period elapsed, cancelling running analyses"
        );

        let settled = tokio::time::timeout(CANCELLED_PUBLISH_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !settled {
            warn!(remaining = tasks.len(), "Abandoning in-flight work");
        }
        false
    }

    /// Run until shutdown or until the feed source stops.
    ///
    /// Only a fatal connection loss is returned as an error.
    pub async fn run(
        self: Arc<Self>,
        source: EventSource,
        shutdown: ShutdownSignal,
    ) -> Result<(), PipelineError> {
        let (tx, mut rx) = mpsc::channel(self.settings.channel_capacity);
        let source_shutdown = shutdown.clone();
        let mut source_task = tokio::spawn(async move { source.run(tx, source_shutdown).await });

        let mut shutdown_rx = shutdown.subscribe();

        let mut drain = tokio::time::interval(self.settings.drain_interval);
        drain.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut eviction = tokio::time::interval(self.settings.eviction_interval);
        eviction.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            batch_size = self.settings.batch_size,
            drain_interval_ms = self.settings.drain_interval.as_millis() as u64,
            max_concurrent = self.orchestrator.capacity(),
            sinks = ?self.sinks.names(),
            "Pipeline started"
        );

        let source_result = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break None,
                event = rx.recv() => match event {
                    Some(event) => self.on_source_event(event),
                    None => break Some((&mut source_task).await),
                },
                _ = drain.tick() => {
                    self.drain_once();
                }
                _ = eviction.tick() => {
                    self.evict();
                }
            }
        };

        let joined = match source_result {
            Some(joined) => Some(joined),
            None => tokio::time::timeout(shutdown.timeout(), source_task).await.ok(),
        };
        let result = match joined {
            Some(joined) => joined.map_err(PipelineError::from).and_then(|r| Ok(r?)),
            None => {
                warn!("Feed source did not stop in time");
                Ok(())
            }
        };

        info!(
            in_flight = self.in_flight_tasks(),
            queued = self.queue.len(),
            "Pipeline stopping, waiting for in-flight work"
        );
        self.wait_idle(shutdown.timeout()).await;

        let abandoned = self.queue.len();
        if abandoned > 0 {
            warn!(abandoned, "Queued items discarded at shutdown");
        }

        let stats = self.stats.snapshot();
        info!(
            received = stats.events_received,
            qualified = stats.qualified,
            published = stats.reports_published,
            "Pipeline stopped"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{
        AggregateReport, AnalysisContext, Analyzer, AnalyzerError, AnalyzerOutput,
    };
    use crate::event::EventKind;
    use crate::gate::{EngagementError, FullMetric, QuickMetric};
    use crate::sinks::{ResultSink, SinkError, SinkReceipt};
    use crate::source::{FeedConnection, FeedFrame, FeedTransport, ReconnectPolicy, TransportError};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProvider {
        metric: u64,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EngagementProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn quick_check(
            &self,
            _url: &str,
            _timeout: Duration,
        ) -> Result<Option<QuickMetric>, EngagementError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(QuickMetric {
                metric: self.metric,
                timestamp: Utc::now(),
            }))
        }

        async fn full_check(
            &self,
            _url: &str,
            _timeout: Duration,
        ) -> Result<Option<FullMetric>, EngagementError> {
            Ok(None)
        }
    }

    struct SpyAnalyzer {
        score: Option<f64>,
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Analyzer for SpyAnalyzer {
        fn name(&self) -> &str {
            "contract"
        }

        async fn run(&self, _ctx: AnalysisContext) -> Result<AnalyzerOutput, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match self.score {
                Some(score) => Ok(AnalyzerOutput::new(score)),
                None => Err(AnalyzerError::Failed("rpc down".to_string())),
            }
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        reports: Mutex<Vec<AggregateReport>>,
    }

    #[async_trait]
    impl ResultSink for CollectingSink {
        fn name(&self) -> &str {
            "collect"
        }

        async fn publish(&self, report: &AggregateReport) -> Result<SinkReceipt, SinkError> {
            self.reports.lock().push(report.clone());
            Ok(SinkReceipt::success("collect", "stored"))
        }
    }

    struct Harness {
        pipeline: Arc<Pipeline>,
        provider: Arc<FixedProvider>,
        analyzer: Arc<SpyAnalyzer>,
        sink: Arc<CollectingSink>,
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            batch_size: 5,
            drain_interval: Duration::from_millis(10),
            requeue_delay: Duration::from_millis(20),
            max_item_age: Duration::from_secs(60),
            high_water_mark: 1_000,
            eviction_interval: Duration::from_secs(60),
            channel_capacity: 64,
        }
    }

    fn harness(
        settings: PipelineSettings,
        metric: u64,
        analyzer_score: Option<f64>,
        analyzer_delay: Duration,
        max_concurrent: usize,
    ) -> Harness {
        let provider = Arc::new(FixedProvider {
            metric,
            calls: AtomicUsize::new(0),
        });
        let analyzer = Arc::new(SpyAnalyzer {
            score: analyzer_score,
            delay: analyzer_delay,
            calls: AtomicUsize::new(0),
        });
        let sink = Arc::new(CollectingSink::default());

        let mut registry = AnalyzerRegistry::new();
        registry.register(analyzer.clone() as Arc<dyn Analyzer>);
        registry.enable(EventKind::Creation, &["contract"]);

        let gate = EngagementGate::new(Some(provider.clone() as Arc<dyn EngagementProvider>))
            .with_min_quick_metric(100);
        let orchestrator =
            AnalysisOrchestrator::new(registry, max_concurrent, Duration::from_secs(5));

        let mut sinks = SinkSet::new();
        sinks.add(sink.clone() as Arc<dyn ResultSink>);

        Harness {
            pipeline: Pipeline::new(settings, gate, orchestrator, sinks),
            provider,
            analyzer,
            sink,
        }
    }

    fn event(id: &str) -> TokenEvent {
        TokenEvent::new(
            id,
            EventKind::Creation,
            json!({"symbol": "EXM", "twitter": "https://x.com/example"}),
        )
    }

    #[tokio::test]
    async fn test_happy_path_publishes_one_report() {
        let h = harness(settings(), 150, Some(42.0), Duration::ZERO, 3);

        assert_eq!(h.pipeline.handle_event(event("Mint111")).await, Stage::Queued);
        let outcome = h.pipeline.drain_once();
        assert_eq!(outcome.dispatched, 1);
        assert!(h.pipeline.wait_idle(Duration::from_secs(2)).await);

        let reports = h.sink.reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].score, Some(42.0));
        assert_eq!(reports[0].engagement.metric, Some(150));

        let stats = h.pipeline.stats().snapshot();
        assert_eq!(stats.qualified, 1);
        assert_eq!(stats.reports_published, 1);
        assert_eq!(h.pipeline.orchestrator().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_below_threshold_never_analyzed() {
        let h = harness(settings(), 50, Some(42.0), Duration::ZERO, 3);

        assert_eq!(h.pipeline.handle_event(event("Mint111")).await, Stage::Rejected);
        assert_eq!(h.pipeline.drain_once().dispatched, 0);
        assert!(h.pipeline.wait_idle(Duration::from_secs(1)).await);

        assert_eq!(h.analyzer.calls.load(Ordering::SeqCst), 0);
        assert!(h.sink.reports.lock().is_empty());
        assert_eq!(h.pipeline.stats().snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn test_duplicates_skip_the_gate() {
        let h = harness(settings(), 150, Some(42.0), Duration::ZERO, 3);

        assert_eq!(h.pipeline.handle_event(event("Mint111")).await, Stage::Queued);
        assert_eq!(h.pipeline.handle_event(event("Mint111")).await, Stage::Skipped);

        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.pipeline.queue().len(), 1);
        assert_eq!(h.pipeline.stats().snapshot().duplicates, 1);
    }

    #[tokio::test]
    async fn test_ceiling_requeues_instead_of_dropping() {
        let h = harness(settings(), 150, Some(10.0), Duration::from_millis(100), 1);

        h.pipeline.handle_event(event("Mint111")).await;
        h.pipeline.handle_event(event("Mint222")).await;

        let outcome = h.pipeline.drain_once();
        assert_eq!(outcome.dispatched, 1);
        assert_eq!(outcome.requeued, 1);
        assert!(h.pipeline.queue().is_empty());

        // Back in the queue once the requeue delay has passed.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(h.pipeline.queue().len(), 1);

        assert!(h.pipeline.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(h.pipeline.drain_once().dispatched, 1);
        assert!(h.pipeline.wait_idle(Duration::from_secs(2)).await);

        let mut ids: Vec<String> = h
            .sink
            .reports
            .lock()
            .iter()
            .map(|r| r.event.id.clone())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["Mint111", "Mint222"]);
        assert_eq!(h.pipeline.stats().snapshot().requeued, 1);
    }

    #[tokio::test]
    async fn test_wait_idle_covers_pending_requeue() {
        let h = harness(settings(), 150, Some(10.0), Duration::ZERO, 1);

        h.pipeline.handle_event(event("Mint111")).await;
        h.pipeline.handle_event(event("Mint222")).await;

        let held = h.pipeline.orchestrator().try_begin("Other").unwrap();
        let outcome = h.pipeline.drain_once();
        assert_eq!(outcome.requeued, 2);
        assert_eq!(h.pipeline.in_flight_tasks(), 1);

        assert!(h.pipeline.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(h.pipeline.queue().len(), 2);
        assert_eq!(h.pipeline.in_flight_tasks(), 0);
        drop(held);

        assert_eq!(h.pipeline.drain_once().dispatched, 1);
    }

    #[tokio::test]
    async fn test_stale_items_never_analyzed() {
        let mut settings = settings();
        settings.max_item_age = Duration::from_millis(10);
        let h = harness(settings, 150, Some(42.0), Duration::ZERO, 3);

        h.pipeline.handle_event(event("Mint111")).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let outcome = h.pipeline.drain_once();
        assert_eq!(outcome.expired, 1);
        assert_eq!(outcome.dispatched, 0);
        assert!(h.pipeline.wait_idle(Duration::from_secs(1)).await);

        assert_eq!(h.analyzer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.pipeline.stats().snapshot().expired, 1);
    }

    #[tokio::test]
    async fn test_degraded_report_still_published() {
        let h = harness(settings(), 150, None, Duration::ZERO, 3);

        h.pipeline.handle_event(event("Mint111")).await;
        h.pipeline.drain_once();
        assert!(h.pipeline.wait_idle(Duration::from_secs(2)).await);

        let reports = h.sink.reports.lock();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].degraded);
        assert_eq!(h.pipeline.stats().snapshot().degraded_reports, 1);
    }

    #[tokio::test]
    async fn test_drain_is_single_flight() {
        let h = harness(settings(), 150, Some(42.0), Duration::ZERO, 3);
        h.pipeline.handle_event(event("Mint111")).await;

        let held = h.pipeline.queue().begin_drain().unwrap();
        assert!(h.pipeline.drain_once().skipped);
        drop(held);

        assert_eq!(h.pipeline.drain_once().dispatched, 1);
    }

    #[test]
    fn test_stage_terminals() {
        assert!(Stage::Published.is_terminal());
        assert!(Stage::Dropped.is_terminal());
        assert!(!Stage::Queued.is_terminal());
        assert_eq!(Stage::Analyzing.to_string(), "analyzing");
    }

    struct OneSession {
        frames: Mutex<Option<Vec<FeedFrame>>>,
    }

    struct Frames(std::collections::VecDeque<FeedFrame>);

    #[async_trait]
    impl FeedConnection for Frames {
        async fn send(&mut self, _text: String) -> Result<(), TransportError> {
            Ok(())
        }

        async fn recv(&mut self) -> FeedFrame {
            match self.0.pop_front() {
                Some(frame) => frame,
                None => std::future::pending().await,
            }
        }

        async fn ping(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&mut self, _code: u16, _reason: &str) {}
    }

    #[async_trait]
    impl FeedTransport for OneSession {
        async fn connect(&self, _url: &str) -> Result<Box<dyn FeedConnection>, TransportError> {
            match self.frames.lock().take() {
                Some(frames) => Ok(Box::new(Frames(frames.into()))),
                None => Err(TransportError::Connect("refused".to_string())),
            }
        }
    }

    fn token_frame(mint: &str) -> FeedFrame {
        FeedFrame::Text(
            json!({"mint": mint, "txType": "create", "twitter": "https://x.com/example"})
                .to_string(),
        )
    }

    #[tokio::test]
    async fn test_run_end_to_end_until_shutdown() {
        let h = harness(settings(), 150, Some(55.0), Duration::ZERO, 3);
        let transport = Arc::new(OneSession {
            frames: Mutex::new(Some(vec![
                token_frame("Mint111"),
                token_frame("Mint111"),
                token_frame("Mint222"),
            ])),
        });
        let source = EventSource::new("wss://feed.test", transport);
        let shutdown = ShutdownSignal::with_timeout(Duration::from_secs(2));

        let trigger = shutdown.clone();
        let sink = Arc::clone(&h.sink);
        tokio::spawn(async move {
            for _ in 0..100 {
                if sink.reports.lock().len() >= 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            trigger.trigger();
        });

        Arc::clone(&h.pipeline).run(source, shutdown).await.unwrap();

        assert_eq!(h.sink.reports.lock().len(), 2);
        let stats = h.pipeline.stats().snapshot();
        assert_eq!(stats.events_received, 3);
        assert_eq!(stats.duplicates, 1);
    }

    #[tokio::test]
    async fn test_run_returns_fatal_connection_loss() {
        let h = harness(settings(), 150, Some(55.0), Duration::ZERO, 3);
        let transport = Arc::new(OneSession {
            frames: Mutex::new(None),
        });
        let source = EventSource::new("wss://feed.test", transport).with_policy(ReconnectPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_attempts: 1,
        });

        let result = Arc::clone(&h.pipeline)
            .run(source, ShutdownSignal::new())
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::Source(SourceError::FatalConnectionLoss { attempts: 1 }))
        ));
    }
}

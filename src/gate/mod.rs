//! Engagement gate.
//!
//! The gate is the pipeline's cost control: a cheap, low-timeout check that
//! decides whether an event deserves the expensive analyzer fan-out.
//!
//! ## Two phases
//!
//! 1. [`EngagementGate::quick_check`] runs on every admitted event. A missing
//!    link, a missing metric, a metric below the minimum, or any provider
//!    error / timeout rejects the event. Nothing is retried.
//! 2. [`EngagementGate::enrich`] runs only for qualified events, right before
//!    analysis. It may raise the snapshot's numbers but never lowers them.
//!
//! Platforms listed in the [`AutoQualifyPolicy`] skip the quantitative
//! check entirely.

pub mod provider;
pub mod social;

use crate::config::GateConfig;
use crate::event::TokenEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use provider::{
    EngagementError, EngagementProvider, FullMetric, HttpEngagementProvider, QuickMetric,
};
pub use social::{PayloadLinkExtractor, Platform, SocialLink, SocialLinkExtractor};

/// Engagement numbers attached to a qualified event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementSnapshot {
    pub link: Option<SocialLink>,
    pub metric: Option<u64>,
    pub secondary_metric: Option<u64>,
    pub auto_qualified: bool,
    pub enriched: bool,
    pub checked_at: Option<DateTime<Utc>>,
}

impl EngagementSnapshot {
    /// Merge an enrichment result. Values only ever go up.
    pub fn merge_full(&mut self, full: &FullMetric) {
        self.metric = Some(self.metric.map_or(full.metric, |m| m.max(full.metric)));
        self.secondary_metric = match (self.secondary_metric, full.secondary_metric) {
            (Some(old), Some(new)) => Some(old.max(new)),
            (old, new) => old.or(new),
        };
        self.enriched = true;
        self.checked_at = Some(full.timestamp);
    }
}

/// Why the gate turned an event away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The event advertises no usable social link.
    NoSocialLink,
    /// The provider had no metric for the link.
    NoMetric,
    /// The metric is below the configured minimum.
    BelowThreshold { metric: u64, minimum: u64 },
    /// The check errored or timed out. Treated exactly like a low metric.
    CheckFailed(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSocialLink => write!(f, "no social link"),
            Self::NoMetric => write!(f, "no engagement metric"),
            Self::BelowThreshold { metric, minimum } => {
                write!(f, "metric {} below minimum {}", metric, minimum)
            }
            Self::CheckFailed(e) => write!(f, "check failed: {}", e),
        }
    }
}

/// Outcome of the quick check.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Qualified(EngagementSnapshot),
    Rejected(RejectReason),
}

impl GateDecision {
    pub fn is_qualified(&self) -> bool {
        matches!(self, Self::Qualified(_))
    }
}

/// Platforms that qualify without a metric check.
#[derive(Debug, Clone, Default)]
pub struct AutoQualifyPolicy {
    platforms: HashSet<Platform>,
}

impl AutoQualifyPolicy {
    pub fn new<I: IntoIterator<Item = Platform>>(platforms: I) -> Self {
        Self {
            platforms: platforms.into_iter().collect(),
        }
    }

    pub fn applies(&self, platform: Platform) -> bool {
        self.platforms.contains(&platform)
    }
}

/// Default minimum quick-check metric.
const DEFAULT_MIN_QUICK_METRIC: u64 = 100;

/// Default quick-check timeout.
const DEFAULT_QUICK_TIMEOUT: Duration = Duration::from_secs(3);

/// Default full-check timeout.
const DEFAULT_FULL_TIMEOUT: Duration = Duration::from_secs(10);

/// Two-phase engagement gate.
pub struct EngagementGate {
    provider: Option<Arc<dyn EngagementProvider>>,
    extractor: Arc<dyn SocialLinkExtractor>,
    auto_qualify: AutoQualifyPolicy,
    min_quick_metric: u64,
    quick_timeout: Duration,
    full_timeout: Duration,
    full_check_enabled: bool,
}

impl EngagementGate {
    /// Create a gate with default thresholds and the payload link extractor.
    ///
    /// Without a provider only auto-qualified platforms pass.
    pub fn new(provider: Option<Arc<dyn EngagementProvider>>) -> Self {
        Self {
            provider,
            extractor: Arc::new(PayloadLinkExtractor::new()),
            auto_qualify: AutoQualifyPolicy::default(),
            min_quick_metric: DEFAULT_MIN_QUICK_METRIC,
            quick_timeout: DEFAULT_QUICK_TIMEOUT,
            full_timeout: DEFAULT_FULL_TIMEOUT,
            full_check_enabled: true,
        }
    }

    /// Build a gate from configuration.
    pub fn from_config(config: &GateConfig, provider: Option<Arc<dyn EngagementProvider>>) -> Self {
        Self::new(provider)
            .with_min_quick_metric(config.min_quick_metric)
            .with_quick_timeout(config.quick_check_timeout())
            .with_full_timeout(config.full_check_timeout())
            .with_full_check(config.full_check_enabled)
            .with_auto_qualify(AutoQualifyPolicy::new(
                config.auto_qualify_platforms.iter().copied(),
            ))
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn SocialLinkExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_auto_qualify(mut self, policy: AutoQualifyPolicy) -> Self {
        self.auto_qualify = policy;
        self
    }

    pub fn with_min_quick_metric(mut self, minimum: u64) -> Self {
        self.min_quick_metric = minimum;
        self
    }

    pub fn with_quick_timeout(mut self, timeout: Duration) -> Self {
        self.quick_timeout = timeout;
        self
    }

    pub fn with_full_timeout(mut self, timeout: Duration) -> Self {
        self.full_timeout = timeout;
        self
    }

    pub fn with_full_check(mut self, enabled: bool) -> Self {
        self.full_check_enabled = enabled;
        self
    }

    /// Cheap qualification check. Never retries and never takes longer than
    /// the quick-check timeout.
    pub async fn quick_check(&self, event: &TokenEvent) -> GateDecision {
        let Some(link) = self.extractor.extract(event) else {
            return GateDecision::Rejected(RejectReason::NoSocialLink);
        };

        if self.auto_qualify.applies(link.platform) {
            info!(
                id = %event.id,
                operation_id = %event.operation_id,
                platform = %link.platform,
                "Auto-qualified by platform policy"
            );
            return GateDecision::Qualified(EngagementSnapshot {
                link: Some(link),
                auto_qualified: true,
                checked_at: Some(Utc::now()),
                ..Default::default()
            });
        }

        let Some(provider) = &self.provider else {
            return GateDecision::Rejected(RejectReason::CheckFailed(
                "no engagement provider configured".to_string(),
            ));
        };

        let result = tokio::time::timeout(
            self.quick_timeout,
            provider.quick_check(&link.url, self.quick_timeout),
        )
        .await
        .unwrap_or_else(|_| {
            Err(EngagementError::Timeout(
                self.quick_timeout.as_millis() as u64,
            ))
        });

        let quick = match result {
            Ok(Some(quick)) => quick,
            Ok(None) => return GateDecision::Rejected(RejectReason::NoMetric),
            Err(e) => {
                debug!(
                    id = %event.id,
                    link = %link.url,
                    error = %e,
                    "Quick check failed"
                );
                return GateDecision::Rejected(RejectReason::CheckFailed(e.to_string()));
            }
        };

        if quick.metric < self.min_quick_metric {
            return GateDecision::Rejected(RejectReason::BelowThreshold {
                metric: quick.metric,
                minimum: self.min_quick_metric,
            });
        }

        GateDecision::Qualified(EngagementSnapshot {
            link: Some(link),
            metric: Some(quick.metric),
            checked_at: Some(quick.timestamp),
            ..Default::default()
        })
    }

    /// Enrichment check for a qualified event. Failures leave the snapshot
    /// untouched.
    pub async fn enrich(&self, event: &TokenEvent, snapshot: &mut EngagementSnapshot) {
        if !self.full_check_enabled {
            return;
        }
        let (Some(provider), Some(link)) = (&self.provider, &snapshot.link) else {
            return;
        };

        let result = tokio::time::timeout(
            self.full_timeout,
            provider.full_check(&link.url, self.full_timeout),
        )
        .await
        .unwrap_or_else(|_| {
            Err(EngagementError::Timeout(
                self.full_timeout.as_millis() as u64,
            ))
        });

        match result {
            Ok(Some(full)) => {
                snapshot.merge_full(&full);
                debug!(
                    id = %event.id,
                    metric = ?snapshot.metric,
                    secondary_metric = ?snapshot.secondary_metric,
                    "Engagement enriched"
                );
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    id = %event.id,
                    operation_id = %event.operation_id,
                    error = %e,
                    "Full engagement check failed, keeping quick-check snapshot"
                );
            }
        }
    }
}

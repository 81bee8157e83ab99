//! Live token feed.
//!
//! [`EventSource`] holds one persistent connection to the upstream feed,
//! subscribes to the configured streams and forwards every lifecycle event
//! to the pipeline as a [`SourceEvent::Token`].
//!
//! # Reconnection
//!
//! ```text
//! connect ─ ok ─► Connected ─► session ─► Disconnected{code, reason}
//!    │                                          │
//!  error                               clean (1000)? ── yes ─► stop
//!    │                                          │ no
//!    └──────────────► attempt += 1 ◄────────────┘
//!                          │
//!            attempt > max? ── yes ─► MaxAttemptsReached ─► FatalConnectionLoss
//!                          │ no
//!                sleep min(base * attempt, max_delay)
//! ```
//!
//! The attempt counter resets on every successful connect.

pub mod subscription;
pub mod transport;

use crate::config::{FeedConfig, SubscriptionConfig};
use crate::event::{parse_feed_message, FeedMessage, TokenEvent};
use crate::shutdown::{ShutdownListener, ShutdownSignal};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub use subscription::{subscription_message, ConfirmationTracker};
pub use transport::{
    CloseInfo, FeedConnection, FeedFrame, FeedTransport, TransportError, WsTransport, CLOSE_NORMAL,
};

/// Lifecycle notifications and events emitted by the source.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Connected,
    Disconnected { code: u16, reason: String },
    Token(TokenEvent),
    MaxAttemptsReached { attempts: u32 },
}

/// Errors that stop the source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("feed connection lost after {attempts} reconnect attempts")]
    FatalConnectionLoss { attempts: u32 },

    #[error("event channel closed")]
    ChannelClosed,
}

/// Linear backoff with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

/// Feed counters.
#[derive(Debug, Default)]
pub struct FeedStats {
    connected: AtomicBool,
    connects: AtomicU64,
    disconnects: AtomicU64,
    messages: AtomicU64,
    tokens: AtomicU64,
    control_messages: AtomicU64,
    ignored: AtomicU64,
    unparseable: AtomicU64,
    unconfirmed_subscriptions: AtomicU64,
}

impl FeedStats {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> FeedStatsSnapshot {
        FeedStatsSnapshot {
            connected: self.is_connected(),
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            tokens: self.tokens.load(Ordering::Relaxed),
            control_messages: self.control_messages.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            unparseable: self.unparseable.load(Ordering::Relaxed),
            unconfirmed_subscriptions: self.unconfirmed_subscriptions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`FeedStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedStatsSnapshot {
    pub connected: bool,
    pub connects: u64,
    pub disconnects: u64,
    pub messages: u64,
    pub tokens: u64,
    pub control_messages: u64,
    pub ignored: u64,
    pub unparseable: u64,
    pub unconfirmed_subscriptions: u64,
}

enum SessionEnd {
    Shutdown,
    Closed(CloseInfo),
}

/// Persistent connection to the token feed.
pub struct EventSource {
    url: String,
    transport: Arc<dyn FeedTransport>,
    subscriptions: Vec<SubscriptionConfig>,
    policy: ReconnectPolicy,
    heartbeat_interval: Duration,
    connect_timeout: Duration,
    confirmation_window: Duration,
    stats: Arc<FeedStats>,
}

impl EventSource {
    pub fn new(url: impl Into<String>, transport: Arc<dyn FeedTransport>) -> Self {
        Self {
            url: url.into(),
            transport,
            subscriptions: Vec::new(),
            policy: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            confirmation_window: Duration::from_secs(5),
            stats: Arc::new(FeedStats::default()),
        }
    }

    pub fn from_config(config: &FeedConfig, transport: Arc<dyn FeedTransport>) -> Self {
        Self::new(config.url.clone(), transport)
            .with_subscriptions(config.subscriptions.clone())
            .with_policy(ReconnectPolicy {
                base_delay: Duration::from_millis(config.base_reconnect_delay_ms),
                max_delay: Duration::from_millis(config.max_reconnect_delay_ms),
                max_attempts: config.max_reconnect_attempts,
            })
            .with_heartbeat_interval(config.heartbeat_interval())
            .with_connect_timeout(config.connect_timeout())
            .with_confirmation_window(config.confirmation_window())
    }

    pub fn with_subscriptions(mut self, subscriptions: Vec<SubscriptionConfig>) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_confirmation_window(mut self, window: Duration) -> Self {
        self.confirmation_window = window;
        self
    }

    pub fn stats(&self) -> Arc<FeedStats> {
        Arc::clone(&self.stats)
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Run until shutdown, a clean close, or fatal connection loss.
    pub async fn run(
        &self,
        tx: mpsc::Sender<SourceEvent>,
        shutdown: ShutdownSignal,
    ) -> Result<(), SourceError> {
        let mut shutdown_rx = shutdown.subscribe();
        let mut attempts: u32 = 0;

        loop {
            let connect = tokio::time::timeout(self.connect_timeout, self.transport.connect(&self.url));
            let connected = tokio::select! {
                _ = shutdown_rx.recv() => return Ok(()),
                result = connect => result.unwrap_or_else(|_| {
                    Err(TransportError::Timeout(self.connect_timeout.as_millis() as u64))
                }),
            };

            match connected {
                Ok(conn) => {
                    attempts = 0;
                    self.stats.connected.store(true, Ordering::Relaxed);
                    self.stats.connects.fetch_add(1, Ordering::Relaxed);
                    info!(url = %self.url, "Feed connected");
                    emit(&tx, SourceEvent::Connected).await?;

                    let end = self.session(conn, &tx, &mut shutdown_rx).await;
                    self.stats.connected.store(false, Ordering::Relaxed);

                    let close = match end? {
                        SessionEnd::Shutdown => {
                            info!("Feed source stopped for shutdown");
                            return Ok(());
                        }
                        SessionEnd::Closed(close) => close,
                    };

                    self.stats.disconnects.fetch_add(1, Ordering::Relaxed);
                    emit(
                        &tx,
                        SourceEvent::Disconnected {
                            code: close.code,
                            reason: close.reason.clone(),
                        },
                    )
                    .await?;

                    if close.is_clean() {
                        info!(reason = %close.reason, "Feed closed cleanly, not reconnecting");
                        return Ok(());
                    }
                    warn!(code = close.code, reason = %close.reason, "Feed disconnected");
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "Feed connect failed");
                }
            }

            attempts += 1;
            if attempts > self.policy.max_attempts {
                let attempts = self.policy.max_attempts;
                error!(attempts, "Max reconnect attempts reached, giving up");
                emit(&tx, SourceEvent::MaxAttemptsReached { attempts }).await?;
                return Err(SourceError::FatalConnectionLoss { attempts });
            }

            let delay = self.policy.delay_for(attempts);
            info!(
                attempt = attempts,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to feed"
            );

            tokio::select! {
                _ = shutdown_rx.recv() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn session(
        &self,
        mut conn: Box<dyn FeedConnection>,
        tx: &mpsc::Sender<SourceEvent>,
        shutdown_rx: &mut ShutdownListener,
    ) -> Result<SessionEnd, SourceError> {
        for subscription in &self.subscriptions {
            if let Err(e) = conn.send(subscription_message(subscription)).await {
                warn!(method = %subscription.method, error = %e, "Subscription send failed");
                return Ok(SessionEnd::Closed(CloseInfo::abnormal(e.to_string())));
            }
            debug!(method = %subscription.method, "Subscription sent");
        }

        let mut tracker = ConfirmationTracker::new(&self.subscriptions);
        let mut confirmation_checked = tracker.is_settled();
        let confirmation_deadline = tokio::time::sleep(self.confirmation_window);
        tokio::pin!(confirmation_deadline);

        let mut heartbeat = interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    conn.close(CLOSE_NORMAL, "shutdown").await;
                    return Ok(SessionEnd::Shutdown);
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = conn.ping().await {
                        return Ok(SessionEnd::Closed(CloseInfo::abnormal(e.to_string())));
                    }
                }
                _ = &mut confirmation_deadline, if !confirmation_checked => {
                    confirmation_checked = true;
                    for method in tracker.take_unconfirmed() {
                        self.stats.unconfirmed_subscriptions.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            method = %method,
                            window_ms = self.confirmation_window.as_millis() as u64,
                            "Subscription not confirmed, continuing anyway"
                        );
                    }
                }
                frame = conn.recv() => match frame {
                    FeedFrame::Text(text) => self.handle_message(&text, &mut tracker, tx).await?,
                    FeedFrame::Closed(close) => return Ok(SessionEnd::Closed(close)),
                    FeedFrame::Other => {}
                },
            }
        }
    }

    async fn handle_message(
        &self,
        text: &str,
        tracker: &mut ConfirmationTracker,
        tx: &mpsc::Sender<SourceEvent>,
    ) -> Result<(), SourceError> {
        self.stats.messages.fetch_add(1, Ordering::Relaxed);

        match parse_feed_message(text) {
            Ok(FeedMessage::Token(event)) => {
                self.stats.tokens.fetch_add(1, Ordering::Relaxed);
                debug!(
                    id = %event.id,
                    kind = %event.kind,
                    operation_id = %event.operation_id,
                    "Token event received"
                );
                emit(tx, SourceEvent::Token(event)).await?;
            }
            Ok(FeedMessage::Control(message)) => {
                self.stats.control_messages.fetch_add(1, Ordering::Relaxed);
                match tracker.observe(&message) {
                    Some(method) => info!(method = %method, "Subscription confirmed"),
                    None => debug!(message = %message, "Feed control message"),
                }
            }
            Ok(FeedMessage::Ignored) => {
                self.stats.ignored.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.unparseable.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "Unparseable feed message");
            }
        }
        Ok(())
    }
}

async fn emit(tx: &mpsc::Sender<SourceEvent>, event: SourceEvent) -> Result<(), SourceError> {
    tx.send(event).await.map_err(|_| SourceError::ChannelClosed)
}

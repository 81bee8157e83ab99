//! # Tokenscope
//!
//! Watches a token-launch feed, keeps only launches with real social
//! engagement, and runs a set of risk analyzers on each of them in parallel.
//!
//! ## Architecture
//!
//! ```text
//! Feed -> EventSource -> Deduplicator -> EngagementGate -> WorkQueue
//!      -> AnalysisOrchestrator -> ResultSinks
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Token events and feed message parsing
//! - [`source`]: Websocket feed client with reconnect and heartbeat
//! - [`dedup`]: At-most-once admission per token id
//! - [`gate`]: Two-phase social engagement gate
//! - [`queue`]: FIFO work queue with single-flight batch drains
//! - [`analysis`]: Analyzer trait, registry and the parallel orchestrator
//! - [`sinks`]: Result sink trait and built-in sinks
//! - [`pipeline`]: Stage wiring and the main run loop
//! - [`status`]: Health, metrics and operator cancel endpoints
//! - [`config`]: TOML configuration
//! - [`shutdown`]: Graceful shutdown signal

pub mod analysis;
pub mod config;
pub mod dedup;
pub mod event;
pub mod gate;
pub mod pipeline;
pub mod queue;
pub mod shutdown;
pub mod sinks;
pub mod source;
pub mod stats;
pub mod status;

// Re-export commonly used types at crate root
pub use analysis::{AggregateReport, AnalysisOrchestrator, Analyzer, AnalyzerRegistry};
pub use config::TokenscopeConfig;
pub use event::{EventKind, TokenEvent};
pub use pipeline::{Pipeline, PipelineError};
pub use shutdown::ShutdownSignal;
pub use sinks::ResultSink;
pub use source::EventSource;

//! Analyzer registry.
//!
//! Maps each event kind to the ordered list of analyzers it enables:
//!
//! ```text
//! Kind       | Analyzers
//! -----------|------------------------------
//! creation   | contract, holders
//! migration  | contract, holders, liquidity
//! ```
//!
//! Analyzers are registered once by name; categories then refer to them by
//! name. Names without a registered analyzer are skipped with a warning, so
//! the enabled set of a kind is always fully runnable.

use super::{Analyzer, HttpAnalyzer};
use crate::config::AnalysisConfig;
use crate::event::EventKind;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Capability-set lookup from event kind to analyzers.
#[derive(Default)]
pub struct AnalyzerRegistry {
    analyzers: HashMap<String, Arc<dyn Analyzer>>,
    categories: HashMap<EventKind, Vec<String>>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build HTTP analyzers and categories from configuration.
    pub fn from_config(config: &AnalysisConfig) -> Self {
        let mut registry = Self::new();

        for (name, endpoint) in &config.analyzers {
            registry.register(Arc::new(HttpAnalyzer::new(
                name.clone(),
                endpoint.url.clone(),
                Duration::from_millis(endpoint.timeout_ms),
            )));
        }

        registry.enable(EventKind::Creation, &config.categories.creation);
        registry.enable(EventKind::Migration, &config.categories.migration);
        registry
    }

    /// Register an analyzer under its own name, replacing any previous one.
    pub fn register(&mut self, analyzer: Arc<dyn Analyzer>) {
        debug!(analyzer = %analyzer.name(), "Registering analyzer");
        self.analyzers.insert(analyzer.name().to_string(), analyzer);
    }

    /// Set the analyzers enabled for `kind`, in order. Unknown and repeated
    /// names are dropped.
    pub fn enable<S: AsRef<str>>(&mut self, kind: EventKind, names: &[S]) {
        let mut enabled: Vec<String> = Vec::with_capacity(names.len());

        for name in names.iter().map(AsRef::as_ref) {
            if !self.analyzers.contains_key(name) {
                warn!(kind = %kind, analyzer = %name, "No analyzer registered under this name, skipping");
                continue;
            }
            if !enabled.iter().any(|n| n == name) {
                enabled.push(name.to_string());
            }
        }

        if enabled.is_empty() {
            warn!(kind = %kind, "No analyzers enabled; reports for this kind will be degraded");
        }
        self.categories.insert(kind, enabled);
    }

    /// Analyzers enabled for an event kind, in configured order.
    pub fn for_kind(&self, kind: EventKind) -> Vec<Arc<dyn Analyzer>> {
        self.enabled_names(kind)
            .iter()
            .filter_map(|name| self.analyzers.get(name).cloned())
            .collect()
    }

    pub fn enabled_names(&self, kind: EventKind) -> &[String] {
        self.categories
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Analyzer>> {
        self.analyzers.get(name).cloned()
    }

    /// All registered analyzer names.
    pub fn list(&self) -> Vec<&str> {
        self.analyzers.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisContext, AnalyzerError, AnalyzerOutput};
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl Analyzer for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn run(&self, _ctx: AnalysisContext) -> Result<AnalyzerOutput, AnalyzerError> {
            Ok(AnalyzerOutput::new(0.0))
        }
    }

    fn registry() -> AnalyzerRegistry {
        let mut registry = AnalyzerRegistry::new();
        registry.register(Arc::new(Named("contract")));
        registry.register(Arc::new(Named("holders")));
        registry.register(Arc::new(Named("liquidity")));
        registry
    }

    #[test]
    fn test_for_kind_keeps_order() {
        let mut registry = registry();
        registry.enable(EventKind::Migration, &["liquidity", "contract", "holders"]);

        let names: Vec<String> = registry
            .for_kind(EventKind::Migration)
            .iter()
            .map(|a| a.name().to_string())
            .collect();
        assert_eq!(names, vec!["liquidity", "contract", "holders"]);
    }

    #[test]
    fn test_unknown_and_duplicate_names_dropped() {
        let mut registry = registry();
        registry.enable(EventKind::Creation, &["contract", "sentiment", "contract"]);

        assert_eq!(registry.enabled_names(EventKind::Creation), ["contract"]);
    }

    #[test]
    fn test_unconfigured_kind_is_empty() {
        let registry = registry();
        assert!(registry.for_kind(EventKind::Creation).is_empty());
        assert!(registry.get("holders").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn test_from_config() {
        let config: AnalysisConfig = toml::from_str(
            r#"
            [categories]
            creation = ["contract"]
            migration = ["contract", "missing"]

            [analyzers.contract]
            url = "http://localhost:9100/contract"
            "#,
        )
        .unwrap();

        let registry = AnalyzerRegistry::from_config(&config);
        assert_eq!(registry.list(), vec!["contract"]);
        assert_eq!(registry.enabled_names(EventKind::Migration), ["contract"]);
    }
}

//! Source-system filtering for batch runs.
//! Restricts a run to the listed source systems; everything else stays pending.

use log::{debug, info};
use std::env;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceFilterConfig {
    pub enabled: bool,
    pub allowed_sources: Vec<String>,
}

impl SourceFilterConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let enabled = env::var("SOURCE_FILTER_ENABLED")
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        let allowed_sources = if enabled {
            Self::parse_list(&env::var("ALLOWED_SOURCES").unwrap_or_default())
        } else {
            Vec::new()
        };

        debug!("Source filter config: enabled={}, sources={:?}", enabled, allowed_sources);

        Self { enabled, allowed_sources }
    }

    /// Filter from an explicit comma-separated list (CLI flag).
    pub fn from_list(list: &str) -> Self {
        let allowed_sources = Self::parse_list(list);
        Self {
            enabled: !allowed_sources.is_empty(),
            allowed_sources,
        }
    }

    fn parse_list(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Check if filtering is effectively enabled (both flag and sources present)
    pub fn is_active(&self) -> bool {
        self.enabled && !self.allowed_sources.is_empty()
    }

    pub fn allows(&self, source_system: &str) -> bool {
        !self.is_active() || self.allowed_sources.iter().any(|s| s == source_system)
    }

    /// Keeps the allowed sources, preserving order.
    pub fn apply(&self, sources: Vec<String>) -> Vec<String> {
        sources.into_iter().filter(|s| self.allows(s)).collect()
    }

    pub fn log_config(&self) {
        if self.is_active() {
            info!("🔍 Source filtering ENABLED");
            info!("   Allowed sources: {:?}", self.allowed_sources);
        } else {
            info!("🔍 Source filtering DISABLED - processing every configured source");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_config_from_env() {
        env::remove_var("SOURCE_FILTER_ENABLED");
        env::remove_var("ALLOWED_SOURCES");
        let config = SourceFilterConfig::from_env();
        assert!(!config.enabled);
        assert!(config.allowed_sources.is_empty());

        env::set_var("SOURCE_FILTER_ENABLED", "true");
        env::set_var("ALLOWED_SOURCES", "clinic_booking, web_form,,");
        let config = SourceFilterConfig::from_env();
        assert!(config.enabled);
        assert_eq!(config.allowed_sources, vec!["clinic_booking", "web_form"]);

        env::remove_var("SOURCE_FILTER_ENABLED");
        env::remove_var("ALLOWED_SOURCES");
    }

    #[test]
    fn test_apply_keeps_only_allowed() {
        let filter = SourceFilterConfig::from_list("web_form");
        let sources = vec!["clinic_booking".to_string(), "web_form".to_string()];
        assert_eq!(filter.apply(sources.clone()), vec!["web_form"]);
        assert_eq!(SourceFilterConfig::default().apply(sources.clone()), sources);
    }

    #[test]
    fn test_enabled_without_sources_is_inactive() {
        let filter = SourceFilterConfig {
            enabled: true,
            allowed_sources: Vec::new(),
        };
        assert!(!filter.is_active());
        assert!(filter.allows("anything"));
    }
}

//! Cache Settings
//!
//! The knobs a host usually keeps in its configuration file. Intervals are
//! given in milliseconds so the struct deserializes from plain JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings of one cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Name used in logs and errors
    pub name: String,
    /// Count hits and misses of `get`
    pub record_stats: bool,
    /// Refresh synchronously while constructing the cache
    pub start_with_refresh: bool,
    /// Period of the background refresh; `None` disables it
    pub refresh_interval_ms: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            name: "cache".to_string(),
            record_stats: false,
            start_with_refresh: false,
            refresh_interval_ms: None,
        }
    }
}

impl CacheSettings {
    /// Loaded up front, then polled every `interval`.
    pub fn polling(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            record_stats: false,
            start_with_refresh: true,
            refresh_interval_ms: Some(interval.as_millis() as u64),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_stats(mut self, record_stats: bool) -> Self {
        self.record_stats = record_stats;
        self
    }

    pub fn with_initial_refresh(mut self, start_with_refresh: bool) -> Self {
        self.start_with_refresh = start_with_refresh;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.refresh_interval_ms = interval.map(|i| i.as_millis() as u64);
        self
    }

    /// Background refresh period. A zero interval counts as disabled.
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = CacheSettings::default();
        assert_eq!(settings.name, "cache");
        assert!(!settings.record_stats);
        assert!(!settings.start_with_refresh);
        assert_eq!(settings.refresh_interval(), None);
    }

    #[test]
    fn test_partial_json() {
        let settings: CacheSettings =
            serde_json::from_str(r#"{"name": "products", "refresh_interval_ms": 1500}"#).unwrap();
        assert_eq!(settings.name, "products");
        assert!(!settings.record_stats);
        assert_eq!(settings.refresh_interval(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_zero_interval_disables_refresh() {
        let settings = CacheSettings::default().with_refresh_interval(Some(Duration::ZERO));
        assert_eq!(settings.refresh_interval(), None);
    }

    #[test]
    fn test_polling_preset() {
        let settings = CacheSettings::polling("bams", Duration::from_secs(2)).with_stats(true);
        assert!(settings.start_with_refresh);
        assert!(settings.record_stats);
        assert_eq!(settings.refresh_interval(), Some(Duration::from_secs(2)));
    }
}

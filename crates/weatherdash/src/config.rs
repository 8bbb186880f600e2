//! Runtime configuration.
//!
//! Loaded from an optional YAML file, then overridden from the
//! environment:
//!
//! ```yaml
//! feed:
//!   source: script            # or "datagov"
//!   script: "python3 scripts/live_datagov_fetch.py"
//!   station_id: "S109"
//!   poll_interval_ms: 60000   # never below the 60s floor
//!   timeout_ms: 30000
//!   retention_hours: 24
//!
//! forecast:
//!   python: python3
//!   script: scripts/forecast_xgb.py
//!   model: models/xgb_3models_robust.joblib
//!   min_context_rows: 6
//!
//! dispatch:
//!   candidates: ["claude-sonnet-4-20250514", "claude-3-5-haiku-20241022"]
//!   retries_per_model: 2
//!   backoff_base_ms: 500
//!   backoff_cap_ms: 8000
//!   effort:
//!     chat: [medium, low, minimal]
//!     insight: [high, medium, low]
//! ```

use crate::dispatch::EffortLevel;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upstream rate limit: the feed is never polled more often than this.
pub const POLL_FLOOR: Duration = Duration::from_secs(60);

/// Longest accepted history window, one century.
pub const MAX_RETENTION_HOURS: u64 = 24 * 366 * 100;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub feed: FeedConfig,
    pub forecast: ForecastConfig,
    pub dispatch: DispatchConfig,
    pub sensors: SensorConfig,
}

/// Where feed payloads come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedSourceKind {
    /// Run the feed-fetch script and parse its stdout
    #[default]
    Script,
    /// Query the data.gov.sg real-time API directly
    Datagov,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub source: FeedSourceKind,
    /// Command line of the feed-fetch script
    pub script: String,
    pub station_id: String,
    /// Optional data.gov.sg API key
    pub api_key: Option<String>,
    pub api_base: String,
    /// Requested poll interval; raised to [`POLL_FLOOR`] when lower
    pub poll_interval_ms: u64,
    /// Subprocess / HTTP timeout for one fetch
    pub timeout_ms: u64,
    pub retention_hours: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            source: FeedSourceKind::Script,
            script: "python3 scripts/live_datagov_fetch.py".to_string(),
            station_id: "S109".to_string(),
            api_key: None,
            api_base: "https://api-open.data.gov.sg/v2/real-time/api".to_string(),
            poll_interval_ms: POLL_FLOOR.as_millis() as u64,
            timeout_ms: 30_000,
            retention_hours: 24,
        }
    }
}

impl FeedConfig {
    /// Poll interval actually used, never below [`POLL_FLOOR`].
    pub fn effective_poll_interval(&self) -> Duration {
        let requested = Duration::from_millis(self.poll_interval_ms);
        if requested < POLL_FLOOR {
            log::warn!(
                "[Config] feed poll interval {}ms is below the {}ms floor, using the floor",
                self.poll_interval_ms,
                POLL_FLOOR.as_millis()
            );
            POLL_FLOOR
        } else {
            requested
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    pub python: String,
    pub script: String,
    /// Model artifact handed to the script via `--model`
    pub model: String,
    pub timeout_ms: u64,
    /// Rows required before the script is invoked at all
    pub min_context_rows: usize,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            script: "scripts/forecast_xgb.py".to_string(),
            model: "models/xgb_3models_robust.joblib".to_string(),
            timeout_ms: 20_000,
            min_context_rows: 6,
        }
    }
}

impl ForecastConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Effort levels tried in order across retries of one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EffortConfig {
    pub chat: Vec<EffortLevel>,
    pub insight: Vec<EffortLevel>,
}

impl Default for EffortConfig {
    fn default() -> Self {
        Self {
            chat: vec![EffortLevel::Medium, EffortLevel::Low, EffortLevel::Minimal],
            insight: vec![EffortLevel::High, EffortLevel::Medium, EffortLevel::Low],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Models in fallback order
    pub candidates: Vec<String>,
    pub retries_per_model: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Upper bound of the uniform jitter added to each backoff
    pub jitter_ms: u64,
    pub effort: EffortConfig,
    pub max_tokens: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            candidates: vec![
                "claude-sonnet-4-20250514".to_string(),
                "claude-3-5-haiku-20241022".to_string(),
            ],
            retries_per_model: 2,
            backoff_base_ms: 500,
            backoff_cap_ms: 8_000,
            jitter_ms: 250,
            effort: EffortConfig::default(),
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Fixed part of the online threshold
    pub online_threshold_ms: u64,
    /// Number of recent samples used for the median interval
    pub recency_window: usize,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            online_threshold_ms: 15_000,
            recency_window: 20,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// File (if any) + environment overrides, validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("WEATHERDASH_FEED_SOURCE") {
            match v.to_lowercase().as_str() {
                "script" => self.feed.source = FeedSourceKind::Script,
                "datagov" => self.feed.source = FeedSourceKind::Datagov,
                other => log::warn!("[Config] ignoring unknown feed source '{}'", other),
            }
        }
        if let Some(v) = get("WEATHERDASH_FEED_SCRIPT") {
            self.feed.script = v;
        }
        if let Some(v) = get("DATAGOV_STATION_ID") {
            self.feed.station_id = v;
        }
        if let Some(v) = get("DATAGOV_API_KEY") {
            self.feed.api_key = Some(v);
        }
        parse_into(&get, "WEATHERDASH_POLL_INTERVAL_MS", &mut self.feed.poll_interval_ms);
        parse_into(&get, "WEATHERDASH_FEED_TIMEOUT_MS", &mut self.feed.timeout_ms);
        parse_into(&get, "WEATHERDASH_RETENTION_HOURS", &mut self.feed.retention_hours);

        if let Some(v) = get("WEATHERDASH_FORECAST_MODEL") {
            self.forecast.model = v;
        }
        if let Some(v) = get("WEATHERDASH_FORECAST_SCRIPT") {
            self.forecast.script = v;
        }
        parse_into(&get, "WEATHERDASH_FORECAST_TIMEOUT_MS", &mut self.forecast.timeout_ms);

        if let Some(v) = get("WEATHERDASH_MODELS") {
            let models: Vec<String> = v
                .split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
            if !models.is_empty() {
                self.dispatch.candidates = models;
            }
        }
        parse_into(&get, "WEATHERDASH_RETRIES_PER_MODEL", &mut self.dispatch.retries_per_model);
        parse_into(&get, "WEATHERDASH_SENSOR_ONLINE_MS", &mut self.sensors.online_threshold_ms);
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feed.source == FeedSourceKind::Script && self.feed.script.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "feed.script must not be empty when feed.source is 'script'".to_string(),
            ));
        }
        if self.feed.station_id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "feed.station_id must not be empty".to_string(),
            ));
        }
        if self.feed.timeout_ms == 0 || self.forecast.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.feed.retention_hours == 0 {
            return Err(ConfigError::ValidationError(
                "feed.retention_hours must be at least 1".to_string(),
            ));
        }
        if self.feed.retention_hours > MAX_RETENTION_HOURS {
            return Err(ConfigError::ValidationError(format!(
                "feed.retention_hours ({}) exceeds {}",
                self.feed.retention_hours, MAX_RETENTION_HOURS
            )));
        }
        if self.dispatch.candidates.is_empty() {
            return Err(ConfigError::ValidationError(
                "dispatch.candidates must list at least one model".to_string(),
            ));
        }
        if self.dispatch.backoff_base_ms > self.dispatch.backoff_cap_ms {
            return Err(ConfigError::ValidationError(format!(
                "dispatch.backoff_base_ms ({}) exceeds backoff_cap_ms ({})",
                self.dispatch.backoff_base_ms, self.dispatch.backoff_cap_ms
            )));
        }
        if self.dispatch.effort.chat.is_empty() || self.dispatch.effort.insight.is_empty() {
            return Err(ConfigError::ValidationError(
                "dispatch.effort lists must not be empty".to_string(),
            ));
        }
        if self.sensors.recency_window < 2 {
            return Err(ConfigError::ValidationError(
                "sensors.recency_window must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_into<T, G>(get: &G, key: &str, target: &mut T)
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        match raw.parse() {
            Ok(v) => *target = v,
            Err(_) => log::warn!("[Config] ignoring non-numeric {}={}", key, raw),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.feed.effective_poll_interval(), POLL_FLOOR);
        assert_eq!(config.feed.retention(), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn retention_is_capped() {
        let mut config = Config::default();
        config.feed.retention_hours = MAX_RETENTION_HOURS;
        assert!(config.validate().is_ok());

        config.feed.retention_hours = 10_000_000_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
        // Saturates instead of overflowing.
        config.feed.retention_hours = u64::MAX;
        assert_eq!(config.feed.retention(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn poll_interval_below_floor_uses_floor() {
        let feed = FeedConfig {
            poll_interval_ms: 5_000,
            ..Default::default()
        };
        assert_eq!(feed.effective_poll_interval(), POLL_FLOOR);
    }

    #[test]
    fn poll_interval_above_floor_is_kept() {
        let feed = FeedConfig {
            poll_interval_ms: 300_000,
            ..Default::default()
        };
        assert_eq!(feed.effective_poll_interval(), Duration::from_secs(300));
    }

    #[test]
    fn parse_partial_yaml_keeps_defaults() {
        let yaml = r#"
feed:
  source: datagov
  station_id: S24
dispatch:
  candidates: ["model-a", "model-b"]
  effort:
    chat: [low]
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.feed.source, FeedSourceKind::Datagov);
        assert_eq!(config.feed.station_id, "S24");
        assert_eq!(config.feed.retention_hours, 24);
        assert_eq!(config.dispatch.candidates, vec!["model-a", "model-b"]);
        assert_eq!(config.dispatch.effort.chat, vec![EffortLevel::Low]);
        // Untouched list keeps its default.
        assert_eq!(config.dispatch.effort.insight.len(), 3);
        assert_eq!(config.dispatch.retries_per_model, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_invalid_yaml_fails() {
        let result = Config::parse("feed: [unclosed");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn from_file_reads_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "forecast:\n  min_context_rows: 12").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.forecast.min_context_rows, 12);
    }

    #[test]
    fn from_missing_file_is_io_error() {
        let result = Config::from_file("/nonexistent/weatherdash.yaml");
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("WEATHERDASH_FEED_SOURCE", "datagov"),
            ("DATAGOV_STATION_ID", "S50"),
            ("DATAGOV_API_KEY", "secret"),
            ("WEATHERDASH_POLL_INTERVAL_MS", "120000"),
            ("WEATHERDASH_MODELS", "m1, m2 ,,m3"),
            ("WEATHERDASH_RETRIES_PER_MODEL", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env_from(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.feed.source, FeedSourceKind::Datagov);
        assert_eq!(config.feed.station_id, "S50");
        assert_eq!(config.feed.api_key.as_deref(), Some("secret"));
        assert_eq!(config.feed.poll_interval_ms, 120_000);
        assert_eq!(config.dispatch.candidates, vec!["m1", "m2", "m3"]);
        // Non-numeric override is ignored.
        assert_eq!(config.dispatch.retries_per_model, 2);
    }

    #[test]
    fn validate_rejects_empty_candidates() {
        let mut config = Config::default();
        config.dispatch.candidates.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn validate_rejects_inverted_backoff_bounds() {
        let mut config = Config::default();
        config.dispatch.backoff_base_ms = 10_000;
        config.dispatch.backoff_cap_ms = 1_000;
        assert!(config.validate().is_err());
    }
}

//! Forecast model caller.
//!
//! The model runs out of process: `<python> <script> --model <artifact>
//! --mode hourly|weekly`, a `{now, rows}` request on stdin and a
//! `{predictions}` response on stdout. Failures are reported, not retried.

use crate::config::ForecastConfig;
use crate::feed::payload::parse_timestamp;
use crate::invoke::{self, Invocation, InvocationError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum ForecastError {
    #[error("insufficient context: have {have} rows, need at least {need}")]
    InsufficientContext { have: usize, need: usize },

    #[error(transparent)]
    Invocation(#[from] InvocationError),
}

pub type Result<T> = std::result::Result<T, ForecastError>;

/// Forecast horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForecastMode {
    Hourly,
    Weekly,
}

impl ForecastMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForecastMode::Hourly => "hourly",
            ForecastMode::Weekly => "weekly",
        }
    }
}

impl fmt::Display for ForecastMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ForecastMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(ForecastMode::Hourly),
            "weekly" => Ok(ForecastMode::Weekly),
            other => Err(format!("unknown forecast mode '{}'", other)),
        }
    }
}

/// One historical row of model input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextRow {
    #[serde(serialize_with = "serialize_instant")]
    pub time: DateTime<Utc>,
    /// Measured features (`temp`, `humi`, `pres`, ...)
    #[serde(flatten)]
    pub features: Map<String, Value>,
}

impl ContextRow {
    /// Build from a loosely-typed row. `None` when `time` is missing or unparseable.
    pub fn from_json(raw: &Value) -> Option<Self> {
        let obj = raw.as_object()?;
        let time = obj.get("time").and_then(parse_timestamp)?;
        let features = obj
            .iter()
            .filter(|(k, _)| k.as_str() != "time")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Some(Self { time, features })
    }
}

/// Stdin document for the model script.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastRequest {
    #[serde(serialize_with = "serialize_instant")]
    pub now: DateTime<Utc>,
    pub rows: Vec<ContextRow>,
}

impl ForecastRequest {
    pub fn new(now: DateTime<Utc>, mut rows: Vec<ContextRow>) -> Self {
        rows.sort_by_key(|r| r.time);
        Self { now, rows }
    }

    /// Keep only rows with a usable time, sorted ascending.
    pub fn from_json_rows(now: DateTime<Utc>, raw: &[Value]) -> Self {
        let rows: Vec<ContextRow> = raw.iter().filter_map(ContextRow::from_json).collect();
        if rows.len() < raw.len() {
            log::debug!(
                "[Forecast] dropped {} context rows without a valid time",
                raw.len() - rows.len()
            );
        }
        Self::new(now, rows)
    }
}

/// One predicted step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub time: String,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResponse {
    pub predictions: Vec<Prediction>,
}

/// Boundary shape: predictions or a warning, never an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastOutcome {
    pub predictions: Option<Vec<Prediction>>,
    pub warning: Option<String>,
}

pub struct Forecaster {
    python: String,
    script: String,
    model: String,
    timeout: std::time::Duration,
    min_context_rows: usize,
}

impl Forecaster {
    pub fn new(config: &ForecastConfig) -> Self {
        Self {
            python: config.python.clone(),
            script: config.script.clone(),
            model: config.model.clone(),
            timeout: config.timeout(),
            min_context_rows: config.min_context_rows,
        }
    }

    /// The invocation used for a mode.
    pub fn invocation(&self, mode: ForecastMode) -> Invocation {
        Invocation::new(format!("forecast-{}", mode), &self.python, self.timeout).with_args([
            self.script.as_str(),
            "--model",
            self.model.as_str(),
            "--mode",
            mode.as_str(),
        ])
    }

    pub async fn forecast(
        &self,
        mode: ForecastMode,
        request: &ForecastRequest,
    ) -> Result<ForecastResponse> {
        let have = request.rows.len();
        if have < self.min_context_rows {
            return Err(ForecastError::InsufficientContext {
                have,
                need: self.min_context_rows,
            });
        }

        let invocation = self.invocation(mode);
        log::debug!(
            "[Forecast] {} forecast from {} rows via {}",
            mode,
            have,
            self.model
        );
        let response: ForecastResponse = invoke::invoke(&invocation, Some(request)).await?;
        log::info!(
            "[Forecast] {} forecast returned {} predictions",
            mode,
            response.predictions.len()
        );
        Ok(response)
    }

    pub async fn forecast_or_warning(
        &self,
        mode: ForecastMode,
        request: &ForecastRequest,
    ) -> ForecastOutcome {
        match self.forecast(mode, request).await {
            Ok(response) => ForecastOutcome {
                predictions: Some(response.predictions),
                warning: None,
            },
            Err(e) => {
                log::warn!("[Forecast] {} forecast unavailable: {}", mode, e);
                ForecastOutcome {
                    predictions: None,
                    warning: Some(e.to_string()),
                }
            }
        }
    }
}

fn serialize_instant<S: serde::Serializer>(
    t: &DateTime<Utc>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

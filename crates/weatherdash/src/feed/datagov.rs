//! Native client for the data.gov.sg real-time weather API.
//!
//! Produces the same JSON document as the feed-fetch script so both go
//! through one normalizer. Each endpoint is tried with the API key first
//! and then anonymously; the per-mode failures are joined into one error.

use super::payload::{parse_number, parse_text, parse_timestamp};
use super::{FeedError, FeedSource, Quantity};
use crate::config::FeedConfig;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

/// The API sits behind a WAF that rejects default client user agents.
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

/// Longest error body excerpt kept in an error message.
const ERROR_SNIPPET_CHARS: usize = 180;

/// One station's value at one reading time.
#[derive(Debug, Clone, PartialEq)]
pub struct StationPoint {
    pub time: DateTime<Utc>,
    pub value: f64,
    pub station_id: Option<String>,
}

pub struct DataGovSource {
    client: reqwest::Client,
    api_base: String,
    station_id: String,
    api_key: Option<String>,
}

impl DataGovSource {
    pub fn new(config: &FeedConfig) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FeedError::Upstream(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            station_id: config.station_id.clone(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
        })
    }

    async fn fetch_endpoint(&self, quantity: Quantity) -> Result<Value, FeedError> {
        let path = quantity.endpoint();
        let mut modes: Vec<(&str, Option<&str>)> = Vec::with_capacity(2);
        if let Some(key) = self.api_key.as_deref() {
            modes.push(("with API key", Some(key)));
        }
        modes.push(("without API key", None));

        let mut errors = Vec::new();
        for (label, key) in modes {
            if let Some(data) = self.attempt(path, key, label, &mut errors).await? {
                return Ok(data);
            }
        }

        Err(FeedError::Upstream(format!(
            "{} API request failed. {}",
            path,
            errors.join("; ")
        )))
    }

    /// `Ok(None)` means this auth mode failed at the HTTP level and the
    /// next one may be tried; a malformed body is fatal.
    async fn attempt(
        &self,
        path: &str,
        api_key: Option<&str>,
        label: &str,
        errors: &mut Vec<String>,
    ) -> Result<Option<Value>, FeedError> {
        let url = format!("{}/{}", self.api_base, path);
        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .header("Accept-Language", "en-US,en;q=0.9")
            .header("Cache-Control", "no-cache")
            .header("Pragma", "no-cache");
        if let Some(key) = api_key {
            request = request.header("X-Api-Key", key);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                errors.push(format!("{}: timed out", label));
                return Ok(None);
            }
            Err(e) => {
                errors.push(format!("{}: {}", label, e));
                return Ok(None);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body
                .trim()
                .replace('\n', " ")
                .chars()
                .take(ERROR_SNIPPET_CHARS)
                .collect();
            if snippet.is_empty() {
                errors.push(format!("{}: status {}", label, status.as_u16()));
            } else {
                errors.push(format!("{}: status {} ({})", label, status.as_u16(), snippet));
            }
            return Ok(None);
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| FeedError::Contract(format!("{} API returned invalid JSON: {}", path, e)))?;

        extract_data(path, payload).map(Some)
    }
}

#[async_trait]
impl FeedSource for DataGovSource {
    fn name(&self) -> &str {
        "datagov"
    }

    async fn fetch(&self) -> Result<Value, FeedError> {
        let (rain, speed, direction) = tokio::try_join!(
            self.fetch_endpoint(Quantity::Rainfall),
            self.fetch_endpoint(Quantity::WindSpeed),
            self.fetch_endpoint(Quantity::WindDirection),
        )?;

        let series = [
            (Quantity::Rainfall, extract_series(&rain, &self.station_id)),
            (Quantity::WindSpeed, extract_series(&speed, &self.station_id)),
            (Quantity::WindDirection, extract_series(&direction, &self.station_id)),
        ];
        Ok(build_payload(&self.station_id, &series, Utc::now()))
    }
}

fn extract_data(path: &str, payload: Value) -> Result<Value, FeedError> {
    let Value::Object(mut obj) = payload else {
        return Err(FeedError::Contract(format!(
            "{} API payload must be a JSON object",
            path
        )));
    };
    match obj.remove("data") {
        Some(data @ Value::Object(_)) => Ok(data),
        _ => Err(FeedError::Contract(format!(
            "{} API payload missing data object",
            path
        ))),
    }
}

/// Pick one value per reading batch: the preferred station when it
/// reported, otherwise the first station with a numeric value.
pub fn extract_series(data: &Value, preferred_station: &str) -> Vec<StationPoint> {
    let Some(readings) = data.get("readings").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut series: Vec<StationPoint> = readings
        .iter()
        .filter_map(|reading| {
            let time = reading.get("timestamp").and_then(parse_timestamp)?;
            let stations = reading.get("data")?.as_array()?;

            let mut selected: Option<(Option<String>, f64)> = None;
            for entry in stations {
                let Some(value) = entry.get("value").and_then(parse_number) else {
                    continue;
                };
                let station = entry.get("stationId").and_then(parse_text);
                if !preferred_station.is_empty() && station.as_deref() == Some(preferred_station) {
                    selected = Some((station, value));
                    break;
                }
                if selected.is_none() {
                    selected = Some((station, value));
                }
            }

            selected.map(|(station_id, value)| StationPoint {
                time,
                value,
                station_id,
            })
        })
        .collect();

    series.sort_by_key(|p| p.time);
    series
}

/// Assemble the feed-fetch JSON document from per-quantity series.
pub fn build_payload(
    requested_station: &str,
    series: &[(Quantity, Vec<StationPoint>)],
    fetched_at: DateTime<Utc>,
) -> Value {
    let iso = |t: &DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::AutoSi, true);

    let mut out = Map::new();
    let mut resolved_station: Option<String> = None;

    for (quantity, points) in series {
        let latest = points.last();
        if resolved_station.is_none() {
            resolved_station = latest.and_then(|p| p.station_id.clone());
        }
        out.insert(
            quantity.key().to_string(),
            json!({
                "timestamp": latest.map(|p| iso(&p.time)),
                "value": latest.map(|p| p.value),
                "unit": quantity.default_unit(),
                "stationId": latest.and_then(|p| p.station_id.clone()),
            }),
        );
        out.insert(
            quantity.series_key().to_string(),
            Value::Array(
                points
                    .iter()
                    .map(|p| json!({"time": iso(&p.time), "value": p.value}))
                    .collect(),
            ),
        );
    }

    out.insert(
        "stationId".to_string(),
        json!(resolved_station.unwrap_or_else(|| requested_station.to_string())),
    );
    out.insert("requestedStationId".to_string(), json!(requested_station));
    out.insert("fetchedAt".to_string(), json!(iso(&fetched_at)));
    Value::Object(out)
}

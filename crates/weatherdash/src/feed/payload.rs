//! Feed payload normalization.
//!
//! The upstream shape is never trusted: every field goes through its own
//! parse-with-fallback function and a missing or malformed field becomes
//! `None`. A bad timestamp drops one series point, not the payload.

use super::{FeedError, Quantity};
use crate::series::TimeSeriesPoint;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

/// Naive layouts accepted after RFC 3339 fails. Interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Latest reading plus optional history for one quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantityReading {
    pub quantity: Quantity,
    /// The payload carried this quantity at all
    pub present: bool,
    pub latest_value: Option<f64>,
    pub latest_timestamp: Option<DateTime<Utc>>,
    pub unit: String,
    pub station_id: Option<String>,
    pub series: Vec<TimeSeriesPoint>,
    /// Series entries dropped for an unusable time or value
    pub dropped_points: usize,
}

impl QuantityReading {
    fn empty(quantity: Quantity) -> Self {
        Self {
            quantity,
            present: false,
            latest_value: None,
            latest_timestamp: None,
            unit: quantity.default_unit().to_string(),
            station_id: None,
            series: Vec::new(),
            dropped_points: 0,
        }
    }

    /// Points to merge: the series, or a single point synthesized from the
    /// latest reading when the upstream sent no series.
    pub fn effective_series(&self) -> Vec<TimeSeriesPoint> {
        if !self.series.is_empty() {
            return self.series.clone();
        }
        match (self.latest_timestamp, self.latest_value) {
            (Some(ts), Some(value)) => vec![TimeSeriesPoint::new(ts, value)],
            _ => Vec::new(),
        }
    }
}

/// A normalized feed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedPayload {
    pub station_id: Option<String>,
    pub requested_station_id: Option<String>,
    pub fetched_at: DateTime<Utc>,
    readings: [QuantityReading; 3],
}

impl FeedPayload {
    pub fn reading(&self, quantity: Quantity) -> &QuantityReading {
        &self.readings[quantity.index()]
    }

    pub fn readings(&self) -> impl Iterator<Item = &QuantityReading> {
        self.readings.iter()
    }
}

/// Normalize a raw feed payload. Only a non-object payload is rejected.
pub fn normalize(raw: &Value, fetched_fallback: DateTime<Utc>) -> Result<FeedPayload, FeedError> {
    let obj = raw.as_object().ok_or_else(|| {
        FeedError::Contract(format!(
            "feed payload must be a JSON object, got {}",
            json_kind(raw)
        ))
    })?;

    let field = |key: &str| obj.get(key).unwrap_or(&Value::Null);

    let readings = Quantity::ALL.map(|q| parse_reading(q, field(q.key()), field(q.series_key())));

    Ok(FeedPayload {
        station_id: parse_text(field("stationId")),
        requested_station_id: parse_text(field("requestedStationId")),
        fetched_at: parse_timestamp(field("fetchedAt")).unwrap_or(fetched_fallback),
        readings,
    })
}

fn parse_reading(quantity: Quantity, latest: &Value, series: &Value) -> QuantityReading {
    let mut reading = QuantityReading::empty(quantity);

    if let Some(obj) = latest.as_object() {
        reading.present = true;
        reading.latest_value = obj.get("value").and_then(parse_number);
        reading.latest_timestamp = obj
            .get("timestamp")
            .or_else(|| obj.get("time"))
            .and_then(parse_timestamp);
        if let Some(unit) = obj.get("unit").and_then(parse_text) {
            reading.unit = unit;
        }
        reading.station_id = obj.get("stationId").and_then(parse_text);
    }

    if let Some(entries) = series.as_array() {
        reading.present = true;
        for entry in entries {
            match parse_point(entry) {
                Some(point) => reading.series.push(point),
                None => reading.dropped_points += 1,
            }
        }
        reading.series.sort_by_key(|p| p.timestamp);
    }

    if reading.dropped_points > 0 {
        log::debug!(
            "[Feed] dropped {} malformed {} series points",
            reading.dropped_points,
            quantity
        );
    }

    reading
}

fn parse_point(entry: &Value) -> Option<TimeSeriesPoint> {
    let obj = entry.as_object()?;
    let timestamp = obj
        .get("time")
        .or_else(|| obj.get("timestamp"))
        .and_then(parse_timestamp)?;
    let value = obj.get("value").and_then(parse_number)?;
    Some(TimeSeriesPoint::new(timestamp, value))
}

/// Parse an instant from RFC 3339, an offset-less date-time (taken as UTC)
/// or epoch milliseconds.
pub fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    // "2024-01-01 08:00:00+08:00" and "+0800" style offsets
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(text, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Parse a finite number from a JSON number or numeric string.
pub fn parse_number(raw: &Value) -> Option<f64> {
    let value = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    value.is_finite().then_some(value)
}

/// Parse a non-empty identifier from a string or number.
pub fn parse_text(raw: &Value) -> Option<String> {
    match raw {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fallback() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn parses_full_payload() {
        let raw = json!({
            "stationId": "S109",
            "requestedStationId": "S109",
            "fetchedAt": "2024-01-01T00:10:00Z",
            "rainfall": {"timestamp": "2024-01-01T00:05:00Z", "value": 0.4, "unit": "mm", "stationId": "S109"},
            "rainfallSeries": [
                {"time": "2024-01-01T00:05:00Z", "value": 0.4},
                {"time": "2024-01-01T00:00:00Z", "value": 0.2}
            ],
            "windspeed": {"timestamp": "2024-01-01T00:05:00Z", "value": "5.1", "unit": "knots"},
            "winddirection": {"timestamp": "2024-01-01T00:05:00Z", "value": 270}
        });
        let payload = normalize(&raw, fallback()).unwrap();

        assert_eq!(payload.station_id.as_deref(), Some("S109"));
        assert_eq!(
            payload.fetched_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap()
        );

        let rain = payload.reading(Quantity::Rainfall);
        assert_eq!(rain.latest_value, Some(0.4));
        assert_eq!(rain.series.len(), 2);
        // Sorted ascending regardless of upstream order.
        assert!(rain.series[0].timestamp < rain.series[1].timestamp);

        let speed = payload.reading(Quantity::WindSpeed);
        assert_eq!(speed.latest_value, Some(5.1));

        let direction = payload.reading(Quantity::WindDirection);
        assert_eq!(direction.latest_value, Some(270.0));
        assert_eq!(direction.unit, "degrees");
    }

    #[test]
    fn missing_fields_degrade_to_none() {
        let payload = normalize(&json!({}), fallback()).unwrap();
        assert_eq!(payload.station_id, None);
        assert_eq!(payload.fetched_at, fallback());
        for reading in payload.readings() {
            assert_eq!(reading.latest_value, None);
            assert_eq!(reading.latest_timestamp, None);
            assert_eq!(reading.unit, reading.quantity.default_unit());
            assert!(reading.series.is_empty());
        }
    }

    #[test]
    fn non_object_payload_is_contract_violation() {
        let err = normalize(&json!([1, 2, 3]), fallback()).unwrap_err();
        assert!(matches!(err, FeedError::Contract(_)));
    }

    #[test]
    fn malformed_points_are_dropped_individually() {
        let raw = json!({
            "rainfallSeries": [
                {"time": "2024-01-01T00:00:00Z", "value": 1.0},
                {"time": "yesterday-ish", "value": 2.0},
                {"time": "2024-01-01T00:10:00Z", "value": "NaN"},
                {"time": "2024-01-01T00:15:00Z"},
                "not an object",
                {"time": "2024-01-01T00:20:00Z", "value": "3.5"}
            ]
        });
        let payload = normalize(&raw, fallback()).unwrap();
        let rain = payload.reading(Quantity::Rainfall);
        assert_eq!(rain.series.len(), 2);
        assert_eq!(rain.dropped_points, 4);
        assert_eq!(rain.series[1].value, 3.5);
    }

    #[test]
    fn synthesizes_point_from_latest_when_series_empty() {
        let raw = json!({
            "rainfall": {"timestamp": "2024-01-01T00:00:00Z", "value": 3.2, "unit": "mm"},
            "rainfallSeries": []
        });
        let payload = normalize(&raw, fallback()).unwrap();
        let series = payload.reading(Quantity::Rainfall).effective_series();
        assert_eq!(
            series,
            vec![TimeSeriesPoint::new(
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                3.2
            )]
        );
    }

    #[test]
    fn no_synthesis_without_timestamp() {
        let raw = json!({"rainfall": {"timestamp": null, "value": 3.2}});
        let payload = normalize(&raw, fallback()).unwrap();
        assert!(payload.reading(Quantity::Rainfall).effective_series().is_empty());
    }

    #[test]
    fn timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for raw in [
            json!("2024-01-01T00:00:00Z"),
            json!("2024-01-01T08:00:00+08:00"),
            json!("2024-01-01T00:00:00.000Z"),
            json!("2024-01-01T00:00:00"),
            json!("2024-01-01 00:00:00"),
            json!("2024-01-01 08:00:00+08:00"),
            json!(" 2024-01-01T00:00 "),
            json!(1_704_067_200_000_i64),
        ] {
            assert_eq!(parse_timestamp(&raw), Some(expected), "input: {}", raw);
        }

        for raw in [json!(""), json!("01/01/2024"), json!(null), json!(true)] {
            assert_eq!(parse_timestamp(&raw), None, "input: {}", raw);
        }
    }

    #[test]
    fn number_coercion() {
        assert_eq!(parse_number(&json!(1.5)), Some(1.5));
        assert_eq!(parse_number(&json!(" 2 ")), Some(2.0));
        assert_eq!(parse_number(&json!("inf")), None);
        assert_eq!(parse_number(&json!("abc")), None);
        assert_eq!(parse_number(&json!(null)), None);
    }

    #[test]
    fn numeric_station_ids_become_text() {
        assert_eq!(parse_text(&json!(109)), Some("109".to_string()));
        assert_eq!(parse_text(&json!("  ")), None);
    }
}

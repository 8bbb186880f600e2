//! Time-series point store.
//!
//! A series is kept sorted ascending by timestamp with at most one point
//! per timestamp. Merges key on the exact instant: two points a
//! millisecond apart are distinct entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single sample in a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    #[serde(rename = "time")]
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl TimeSeriesPoint {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Sorted, timestamp-unique series of points.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointStore {
    points: Vec<TimeSeriesPoint>,
}

impl PointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a point, or overwrite the value of the point with the same
    /// timestamp (last write wins).
    pub fn upsert(&mut self, point: TimeSeriesPoint) {
        match self
            .points
            .binary_search_by(|p| p.timestamp.cmp(&point.timestamp))
        {
            Ok(idx) => self.points[idx].value = point.value,
            Err(idx) => self.points.insert(idx, point),
        }
    }

    /// Upsert every point in order. Returns how many new timestamps were added.
    pub fn merge<I>(&mut self, points: I) -> usize
    where
        I: IntoIterator<Item = TimeSeriesPoint>,
    {
        let before = self.points.len();
        for point in points {
            self.upsert(point);
        }
        self.points.len() - before
    }

    /// Drop every point strictly older than `cutoff`. Returns the number removed.
    pub fn prune_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        // Sorted, so everything to prune is a prefix.
        let keep_from = self.points.partition_point(|p| p.timestamp < cutoff);
        self.points.drain(..keep_from);
        keep_from
    }

    pub fn latest(&self) -> Option<&TimeSeriesPoint> {
        self.points.last()
    }

    pub fn points(&self) -> &[TimeSeriesPoint] {
        &self.points
    }

    pub fn to_vec(&self) -> Vec<TimeSeriesPoint> {
        self.points.clone()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

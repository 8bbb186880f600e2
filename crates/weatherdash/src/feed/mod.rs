//! Rate-limited feed mirror.
//!
//! A [`FeedCache`] owns the only copy of the feed state. One background
//! task polls the upstream [`FeedSource`] on a floored interval; readers
//! get cloned [`FeedSnapshot`]s and never see a half-applied refresh.

pub mod cache;
pub mod datagov;
pub mod payload;
pub mod recency;
pub mod source;

pub use cache::{FeedCache, FeedSnapshot, QuantitySnapshot};
pub use datagov::DataGovSource;
pub use payload::{FeedPayload, QuantityReading};
pub use recency::SensorRecency;
pub use source::{FeedSource, ScriptFeedSource};

use crate::config::{FeedConfig, FeedSourceKind};
use crate::invoke::{Invocation, InvocationError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Errors from one feed fetch. Recorded in the snapshot, never raised to readers.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error("upstream unavailable: {0}")]
    Upstream(String),

    #[error("contract violation: {0}")]
    Contract(String),
}

/// A monitored quantity published by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantity {
    Rainfall,
    WindSpeed,
    WindDirection,
}

impl Quantity {
    pub const ALL: [Quantity; 3] = [
        Quantity::Rainfall,
        Quantity::WindSpeed,
        Quantity::WindDirection,
    ];

    /// Key of the latest-reading object in the payload.
    pub fn key(&self) -> &'static str {
        match self {
            Quantity::Rainfall => "rainfall",
            Quantity::WindSpeed => "windspeed",
            Quantity::WindDirection => "winddirection",
        }
    }

    /// Key of the optional series array in the payload.
    pub fn series_key(&self) -> &'static str {
        match self {
            Quantity::Rainfall => "rainfallSeries",
            Quantity::WindSpeed => "windspeedSeries",
            Quantity::WindDirection => "winddirectionSeries",
        }
    }

    pub fn default_unit(&self) -> &'static str {
        match self {
            Quantity::Rainfall => "mm",
            Quantity::WindSpeed => "knots",
            Quantity::WindDirection => "degrees",
        }
    }

    /// data.gov.sg real-time endpoint name.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Quantity::Rainfall => "rainfall",
            Quantity::WindSpeed => "wind-speed",
            Quantity::WindDirection => "wind-direction",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Quantity::Rainfall => 0,
            Quantity::WindSpeed => 1,
            Quantity::WindDirection => 2,
        }
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Build the configured upstream source.
pub fn source_from_config(config: &FeedConfig) -> Result<Arc<dyn FeedSource>, FeedError> {
    match config.source {
        FeedSourceKind::Script => {
            let invocation =
                Invocation::from_command_line("feed-fetch", &config.script, config.timeout())
                    .ok_or_else(|| FeedError::Contract("feed.script is empty".to_string()))?;
            let source = ScriptFeedSource::new(invocation)
                .with_station(&config.station_id, config.api_key.as_deref());
            Ok(Arc::new(source))
        }
        FeedSourceKind::Datagov => Ok(Arc::new(DataGovSource::new(config)?)),
    }
}

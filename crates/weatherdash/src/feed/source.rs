//! Upstream feed sources.

use super::FeedError;
use crate::invoke::{self, Invocation};
use async_trait::async_trait;
use serde_json::Value;

/// Something that can produce one raw feed payload.
///
/// Implementations return the JSON shape of the feed-fetch contract; the
/// cache normalizes it.
#[async_trait]
pub trait FeedSource: Send + Sync + 'static {
    /// Short name for log lines.
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<Value, FeedError>;
}

/// Runs the feed-fetch script: no stdin, JSON on stdout.
pub struct ScriptFeedSource {
    invocation: Invocation,
}

impl ScriptFeedSource {
    pub fn new(invocation: Invocation) -> Self {
        Self { invocation }
    }

    /// Pass the station through to the script the way it expects it.
    pub fn with_station(mut self, station_id: &str, api_key: Option<&str>) -> Self {
        self.invocation = self.invocation.with_env("DATAGOV_STATION_ID", station_id);
        if let Some(key) = api_key {
            self.invocation = self.invocation.with_env("DATAGOV_API_KEY", key);
        }
        self
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }
}

#[async_trait]
impl FeedSource for ScriptFeedSource {
    fn name(&self) -> &str {
        &self.invocation.name
    }

    async fn fetch(&self) -> Result<Value, FeedError> {
        let raw: Value = invoke::invoke(&self.invocation, None::<&Value>).await?;
        Ok(raw)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::invoke::InvocationError;
    use std::time::Duration;

    #[tokio::test]
    async fn script_source_passes_station_env() {
        let inv = Invocation::new("feed", "sh", Duration::from_secs(5)).with_args([
            "-c",
            r#"printf '{"requestedStationId": "%s"}' "$DATAGOV_STATION_ID""#,
        ]);
        let source = ScriptFeedSource::new(inv).with_station("S24", None);
        let raw = source.fetch().await.unwrap();
        assert_eq!(raw["requestedStationId"], "S24");
    }

    #[tokio::test]
    async fn script_failure_surfaces_as_invocation_error() {
        let inv = Invocation::new("feed", "sh", Duration::from_secs(5))
            .with_args(["-c", "echo 'rainfall API request failed' >&2; exit 1"]);
        let err = ScriptFeedSource::new(inv).fetch().await.unwrap_err();
        match err {
            FeedError::Invocation(InvocationError::ProcessFailed { message, .. }) => {
                assert!(message.contains("rainfall API request failed"));
            }
            other => panic!("expected ProcessFailed, got {:?}", other),
        }
    }
}

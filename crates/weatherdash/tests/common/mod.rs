//! Shared mocks for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use weatherdash::config::DispatchConfig;
use weatherdash::dispatch::{ChunkStream, EffortLevel, ServiceCall, ServiceError, TextService};
use weatherdash::feed::{FeedError, FeedSource};

// ── Feed ────────────────────────────────────────────────────────────

/// Feed source that counts fetches and takes `delay` to answer.
pub struct CountingSource {
    pub fetches: AtomicUsize,
    pub delay: Duration,
    fail: bool,
}

impl CountingSource {
    pub fn new(delay: Duration) -> Self {
        Self {
            fetches: AtomicUsize::new(0),
            delay,
            fail: false,
        }
    }

    pub fn failing(delay: Duration) -> Self {
        Self {
            fail: true,
            ..Self::new(delay)
        }
    }

    pub fn count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedSource for CountingSource {
    fn name(&self) -> &str {
        "counting"
    }

    async fn fetch(&self) -> Result<Value, FeedError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(FeedError::Upstream(format!("fetch {} failed", n)));
        }
        let now = chrono::Utc::now().to_rfc3339();
        Ok(json!({
            "stationId": "S109",
            "rainfall": {"timestamp": now, "value": n as f64, "unit": "mm"},
        }))
    }
}

// ── Dispatch ────────────────────────────────────────────────────────

/// What the mock service does for one `open` call.
#[derive(Debug, Clone)]
pub enum Behavior {
    Fail { status: u16, message: &'static str },
    Stream(Vec<&'static str>),
    /// Chunks spaced by a delay
    Paced(Vec<&'static str>, Duration),
    /// Chunks followed by a mid-stream API error
    BreakAfter(Vec<&'static str>, u16),
    /// `open` never completes
    Hang,
}

impl Behavior {
    pub fn fail(status: u16) -> Self {
        Behavior::Fail {
            status,
            message: "mock failure",
        }
    }
}

/// Scripted [`TextService`]. Each model replays its behaviors in order
/// and repeats the last one.
#[derive(Default)]
pub struct MockService {
    plans: Mutex<HashMap<String, VecDeque<Behavior>>>,
    calls: Mutex<Vec<(String, EffortLevel)>>,
}

impl MockService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, model: &str, behaviors: Vec<Behavior>) -> Self {
        self.plans
            .lock()
            .unwrap()
            .insert(model.to_string(), behaviors.into());
        self
    }

    /// `(model, effort)` of every `open` call, in order.
    pub fn calls(&self) -> Vec<(String, EffortLevel)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn models_called(&self) -> Vec<String> {
        self.calls().into_iter().map(|(m, _)| m).collect()
    }

    fn next_behavior(&self, model: &str) -> Behavior {
        let mut plans = self.plans.lock().unwrap();
        let queue = plans.entry(model.to_string()).or_default();
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue
                .front()
                .cloned()
                .unwrap_or(Behavior::Fail {
                    status: 404,
                    message: "unknown model",
                })
        }
    }
}

fn owned(chunks: Vec<&'static str>) -> Vec<Result<String, ServiceError>> {
    chunks.into_iter().map(|c| Ok(c.to_string())).collect()
}

impl TextService for MockService {
    fn open(
        &self,
        call: &ServiceCall,
    ) -> impl std::future::Future<Output = Result<ChunkStream, ServiceError>> + Send {
        self.calls
            .lock()
            .unwrap()
            .push((call.model.clone(), call.effort));
        let behavior = self.next_behavior(&call.model);

        async move {
            match behavior {
                Behavior::Fail { status, message } => Err(ServiceError::Api {
                    status,
                    message: message.to_string(),
                }),
                Behavior::Stream(chunks) => {
                    Ok(Box::pin(stream::iter(owned(chunks))) as ChunkStream)
                }
                Behavior::Paced(chunks, delay) => {
                    let paced = stream::iter(owned(chunks)).then(move |c| async move {
                        tokio::time::sleep(delay).await;
                        c
                    });
                    Ok(Box::pin(paced) as ChunkStream)
                }
                Behavior::BreakAfter(chunks, status) => {
                    let mut items = owned(chunks);
                    items.push(Err(ServiceError::Api {
                        status,
                        message: "overloaded mid-stream".to_string(),
                    }));
                    items.push(Ok("after error".to_string()));
                    Ok(Box::pin(stream::iter(items)) as ChunkStream)
                }
                Behavior::Hang => std::future::pending().await,
            }
        }
    }
}

pub fn dispatch_config(models: &[&str], retries: u32) -> DispatchConfig {
    DispatchConfig {
        candidates: models.iter().map(|m| m.to_string()).collect(),
        retries_per_model: retries,
        backoff_base_ms: 500,
        backoff_cap_ms: 8_000,
        jitter_ms: 250,
        ..DispatchConfig::default()
    }
}

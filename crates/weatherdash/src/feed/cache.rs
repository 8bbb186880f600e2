//! Feed cache with a single-refresh gate.
//!
//! All state mutation happens in [`CacheInner::run_refresh`], and at most
//! one of those runs at a time per cache: a second caller that arrives
//! while a refresh is in flight awaits the same shared future. Locks are
//! only taken for synchronous sections and never held across `.await`.

use super::payload::{self, FeedPayload};
use super::{FeedSource, Quantity};
use crate::config::FeedConfig;
use crate::series::{PointStore, TimeSeriesPoint};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

type SharedRefresh = Shared<BoxFuture<'static, FeedSnapshot>>;

/// Read-only view of one quantity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantitySnapshot {
    pub unit: String,
    pub latest_value: Option<f64>,
    pub latest_timestamp: Option<DateTime<Utc>>,
    pub station_id: Option<String>,
    pub series: Vec<TimeSeriesPoint>,
}

/// Read-only view of the whole feed, handed out by value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSnapshot {
    pub station_id: Option<String>,
    pub requested_station_id: String,
    pub fetched_at: Option<DateTime<Utc>>,
    pub rainfall: QuantitySnapshot,
    pub windspeed: QuantitySnapshot,
    pub winddirection: QuantitySnapshot,
    pub poll_interval_ms: u64,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl FeedSnapshot {
    pub fn quantity(&self, quantity: Quantity) -> &QuantitySnapshot {
        match quantity {
            Quantity::Rainfall => &self.rainfall,
            Quantity::WindSpeed => &self.windspeed,
            Quantity::WindDirection => &self.winddirection,
        }
    }

    /// True once any refresh has succeeded.
    pub fn has_data(&self) -> bool {
        self.last_success_at.is_some()
    }
}

#[derive(Debug)]
struct QuantityState {
    unit: String,
    latest_value: Option<f64>,
    latest_timestamp: Option<DateTime<Utc>>,
    station_id: Option<String>,
    store: PointStore,
}

impl QuantityState {
    fn new(quantity: Quantity) -> Self {
        Self {
            unit: quantity.default_unit().to_string(),
            latest_value: None,
            latest_timestamp: None,
            station_id: None,
            store: PointStore::new(),
        }
    }

    fn snapshot(&self) -> QuantitySnapshot {
        QuantitySnapshot {
            unit: self.unit.clone(),
            latest_value: self.latest_value,
            latest_timestamp: self.latest_timestamp,
            station_id: self.station_id.clone(),
            series: self.store.to_vec(),
        }
    }
}

#[derive(Debug)]
struct FeedState {
    station_id: Option<String>,
    requested_station_id: String,
    fetched_at: Option<DateTime<Utc>>,
    quantities: [QuantityState; 3],
    last_error: Option<String>,
    last_success_at: Option<DateTime<Utc>>,
    /// Monotonic completion time of the last refresh, successful or not
    last_attempt: Option<Instant>,
}

impl FeedState {
    fn new(requested_station_id: String) -> Self {
        Self {
            station_id: None,
            requested_station_id,
            fetched_at: None,
            quantities: Quantity::ALL.map(QuantityState::new),
            last_error: None,
            last_success_at: None,
            last_attempt: None,
        }
    }

    /// `retention` of `None` keeps every point.
    fn apply(
        &mut self,
        payload: FeedPayload,
        now: DateTime<Utc>,
        retention: Option<chrono::Duration>,
    ) {
        if payload.station_id.is_some() {
            self.station_id = payload.station_id.clone();
        }
        if let Some(requested) = &payload.requested_station_id {
            self.requested_station_id = requested.clone();
        }
        self.fetched_at = Some(payload.fetched_at);

        let cutoff = retention
            .and_then(|r| now.checked_sub_signed(r))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        for reading in payload.readings() {
            let state = &mut self.quantities[reading.quantity.index()];
            if reading.present {
                state.unit = reading.unit.clone();
            }
            if reading.station_id.is_some() {
                state.station_id = reading.station_id.clone();
            }

            let added = state.store.merge(reading.effective_series());
            let pruned = state.store.prune_before(cutoff);
            log::debug!(
                "[Feed] {}: merged {} new points, pruned {}, holding {}",
                reading.quantity,
                added,
                pruned,
                state.store.len()
            );

            match (reading.latest_value, reading.latest_timestamp) {
                (Some(value), ts) => {
                    state.latest_value = Some(value);
                    state.latest_timestamp = ts;
                }
                (None, _) => {
                    let latest = state.store.latest();
                    state.latest_value = latest.map(|p| p.value);
                    state.latest_timestamp = latest.map(|p| p.timestamp);
                }
            }
        }

        self.last_error = None;
        self.last_success_at = Some(now);
    }

    fn snapshot(&self, poll_interval: Duration) -> FeedSnapshot {
        let [rainfall, windspeed, winddirection] = &self.quantities;
        FeedSnapshot {
            station_id: self.station_id.clone(),
            requested_station_id: self.requested_station_id.clone(),
            fetched_at: self.fetched_at,
            rainfall: rainfall.snapshot(),
            windspeed: windspeed.snapshot(),
            winddirection: winddirection.snapshot(),
            poll_interval_ms: poll_interval.as_millis() as u64,
            last_error: self.last_error.clone(),
            last_success_at: self.last_success_at,
        }
    }
}

struct CacheInner {
    source: Arc<dyn FeedSource>,
    poll_interval: Duration,
    retention: Option<chrono::Duration>,
    state: RwLock<FeedState>,
    in_flight: Mutex<Option<SharedRefresh>>,
    polling: AtomicBool,
    fetches: AtomicU64,
    shutdown: Mutex<Option<watch::Receiver<()>>>,
}

impl CacheInner {
    fn snapshot(&self) -> FeedSnapshot {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.snapshot(self.poll_interval)
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<SharedRefresh>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stale(&self) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match state.last_attempt {
            None => true,
            Some(at) => at.elapsed() >= self.poll_interval,
        }
    }

    /// The only place feed state is written.
    async fn run_refresh(&self) {
        let attempt = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("[Feed] refresh #{} from {}", attempt, self.source.name());

        let started = Utc::now();
        let result = match self.source.fetch().await {
            Ok(raw) => payload::normalize(&raw, started),
            Err(e) => Err(e),
        };

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.last_attempt = Some(Instant::now());
        match result {
            Ok(payload) => {
                state.apply(payload, Utc::now(), self.retention);
                log::info!(
                    "[Feed] refresh #{} ok: station={} rainfall={:?}",
                    attempt,
                    state.station_id.as_deref().unwrap_or("?"),
                    state.quantities[Quantity::Rainfall.index()].latest_value
                );
            }
            Err(e) => {
                log::warn!(
                    "[Feed] refresh #{} failed, keeping previous data: {}",
                    attempt,
                    e
                );
                state.last_error = Some(e.to_string());
            }
        }
    }
}

/// Cloneable handle to one feed cache.
#[derive(Clone)]
pub struct FeedCache {
    inner: Arc<CacheInner>,
}

impl FeedCache {
    /// Create a cache. The poll interval is floored by
    /// [`FeedConfig::effective_poll_interval`].
    pub fn new(source: Arc<dyn FeedSource>, config: &FeedConfig) -> Self {
        Self::build(source, config, config.effective_poll_interval())
    }

    fn build(source: Arc<dyn FeedSource>, config: &FeedConfig, poll_interval: Duration) -> Self {
        // Too long for chrono means nothing is ever old enough to prune.
        let retention = chrono::Duration::from_std(config.retention()).ok();

        Self {
            inner: Arc::new(CacheInner {
                source,
                poll_interval,
                retention,
                state: RwLock::new(FeedState::new(config.station_id.clone())),
                in_flight: Mutex::new(None),
                polling: AtomicBool::new(false),
                fetches: AtomicU64::new(0),
                shutdown: Mutex::new(None),
            }),
        }
    }

    /// Stop the polling task when this channel fires.
    pub fn with_shutdown(self, shutdown: watch::Receiver<()>) -> Self {
        *self
            .inner
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(shutdown);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    /// Number of upstream fetches started so far.
    pub fn upstream_fetches(&self) -> u64 {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    /// Current cached state, refreshing first when nothing has been fetched
    /// yet or the last refresh is older than the poll interval.
    ///
    /// Never fails: upstream trouble shows up in `last_error`.
    pub async fn get_snapshot(&self) -> FeedSnapshot {
        // Staleness is judged under the in-flight lock so a reader cannot
        // start a second fetch right after another one finished.
        let shared = {
            let mut slot = self.inner.in_flight();
            if let Some(running) = slot.as_ref() {
                running.clone()
            } else if self.inner.is_stale() {
                slot.insert(self.spawn_refresh()).clone()
            } else {
                return self.inner.snapshot();
            }
        };
        shared.await
    }

    /// Cached state without triggering a refresh.
    pub fn cached(&self) -> FeedSnapshot {
        self.inner.snapshot()
    }

    /// Refresh now, or join the refresh already in flight.
    pub async fn refresh(&self) -> FeedSnapshot {
        let shared = {
            let mut slot = self.inner.in_flight();
            slot.get_or_insert_with(|| self.spawn_refresh()).clone()
        };
        shared.await
    }

    /// Must be called with the in-flight slot locked.
    fn spawn_refresh(&self) -> SharedRefresh {
        let task_inner = Arc::clone(&self.inner);
        // Spawned so a reader giving up never abandons a shared refresh.
        let handle = tokio::spawn(async move {
            task_inner.run_refresh().await;
            let snapshot = task_inner.snapshot();
            task_inner.in_flight().take();
            snapshot
        });

        let join_inner = Arc::clone(&self.inner);
        async move {
            match handle.await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::error!("[Feed] refresh task died: {}", e);
                    join_inner.in_flight().take();
                    join_inner.snapshot()
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Start the background poll loop. Only the first call has any effect;
    /// returns whether this call started it.
    pub fn start_polling(&self) -> bool {
        if self.inner.polling.swap(true, Ordering::SeqCst) {
            log::debug!("[Feed] polling already running");
            return false;
        }

        let cache = self.clone();
        let mut shutdown = self
            .inner
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let interval = self.inner.poll_interval;

        log::info!(
            "[Feed] polling {} every {}s",
            self.inner.source.name(),
            interval.as_secs()
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.refresh().await;
                    }
                    _ = wait_for_shutdown(&mut shutdown) => {
                        log::info!("[Feed] shutdown signal received, polling stopped");
                        break;
                    }
                }
            }
        });
        true
    }
}

/// Resolves when the channel fires; never resolves without a live sender.
async fn wait_for_shutdown(shutdown: &mut Option<watch::Receiver<()>>) {
    match shutdown {
        Some(rx) => {
            if rx.changed().await.is_err() {
                // Sender dropped: nobody can ask us to stop any more.
                *shutdown = None;
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

// =============================================================================
// Snapshot Scheduler — one long-lived loop, one tick per minute
// =============================================================================
//
// The first tick lands `delay_seconds_from_minute` after the next minute
// boundary, giving the exchange time to settle its own candles; every later
// tick is exactly 60 s after the previous one. Each tick requests the windows
// that just closed from every source. Fetches are spawned and never awaited
// by the loop, so a slow or failing exchange cannot delay the schedule.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::exchanges::MarketSource;
use crate::period::{Period, PeriodCalculator, SCHEDULER_TICK_SECS};
use crate::queue::EventSender;
use crate::runtime_config::RuntimeConfig;
use crate::types::MarketEvent;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub delay_seconds_from_minute: u32,
    pub bootstrap_fetch: bool,
}

impl From<&RuntimeConfig> for SchedulerConfig {
    fn from(cfg: &RuntimeConfig) -> Self {
        Self {
            delay_seconds_from_minute: cfg.delay_seconds_from_minute,
            bootstrap_fetch: cfg.bootstrap_fetch,
        }
    }
}

/// Time from `now` until the next minute boundary plus `offset_secs`.
pub fn initial_delay(now: DateTime<Utc>, offset_secs: u32) -> Duration {
    let into_minute_ms = now.timestamp_millis().rem_euclid(SCHEDULER_TICK_SECS * 1_000);
    let to_boundary_ms = SCHEDULER_TICK_SECS * 1_000 - into_minute_ms;
    Duration::from_millis(to_boundary_ms as u64) + Duration::from_secs(u64::from(offset_secs))
}

pub struct Scheduler {
    periods: PeriodCalculator,
    sources: Vec<Arc<dyn MarketSource>>,
    queue: EventSender,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        periods: PeriodCalculator,
        sources: Vec<Arc<dyn MarketSource>>,
        queue: EventSender,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            periods,
            sources,
            queue,
            config,
        }
    }

    /// Run until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if self.config.bootstrap_fetch {
            self.bootstrap(Utc::now());
        }

        let delay = initial_delay(Utc::now(), self.config.delay_seconds_from_minute);
        info!(first_tick_in_ms = delay.as_millis() as u64, "scheduler started");

        let period = Duration::from_secs(SCHEDULER_TICK_SECS as u64);
        let mut next = Instant::now() + delay;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next) => {
                    self.tick(Utc::now());
                    next += period;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }

    /// Request the windows each instrument is currently filling, so local
    /// state starts from the exchange's partial candle.
    pub fn bootstrap(&self, now: DateTime<Utc>) -> Vec<JoinHandle<usize>> {
        let windows = self.periods.active_windows(now);
        info!(windows = windows.len(), "bootstrap fetch of active windows");
        self.request(&windows)
    }

    /// Request every window that closed at the tick containing `now`.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<JoinHandle<usize>> {
        let windows = self.periods.just_closed_windows(now);
        info!(
            tick = %now,
            windows = ?windows.iter().map(|p| p.resolution.secs()).collect::<Vec<_>>(),
            queue_depth = self.queue.depth(),
            "scheduler tick"
        );
        self.request(&windows)
    }

    fn request(&self, windows: &[Period]) -> Vec<JoinHandle<usize>> {
        let mut handles = Vec::new();
        for source in &self.sources {
            for market in source.markets() {
                for &period in windows {
                    handles.push(tokio::spawn(fetch_and_enqueue(
                        source.clone(),
                        market.clone(),
                        period,
                        self.queue.clone(),
                    )));
                }
            }
        }
        debug!(requests = handles.len(), "snapshot requests issued");
        handles
    }
}

/// Fetch one window and enqueue whatever came back. Returns the number of
/// snapshots enqueued.
async fn fetch_and_enqueue(
    source: Arc<dyn MarketSource>,
    market: String,
    period: Period,
    queue: EventSender,
) -> usize {
    let exchange = source.name();
    let snapshots = match source
        .fetch_snapshots(&market, period.resolution, period.start)
        .await
    {
        Ok(snapshots) => snapshots,
        Err(e) => {
            warn!(
                exchange,
                market = %market,
                resolution = period.resolution.secs(),
                start = %period.start,
                error = %e,
                "snapshot fetch failed"
            );
            return 0;
        }
    };

    if snapshots.len() != 1 {
        warn!(
            exchange,
            market = %market,
            resolution = period.resolution.secs(),
            start = %period.start,
            count = snapshots.len(),
            "expected exactly one snapshot for window"
        );
    }

    let mut enqueued = 0;
    for snapshot in snapshots {
        if queue.enqueue(MarketEvent::Snapshot(snapshot)).is_err() {
            debug!(exchange, market = %market, "queue closed, dropping snapshot");
            break;
        }
        enqueued += 1;
    }
    enqueued
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

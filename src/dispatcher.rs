// =============================================================================
// Dispatcher — the single consumer of the event queue
// =============================================================================
//
// Owns the aggregator and the store. Events are handled strictly in arrival
// order: trades feed the aggregator, snapshots go through reconciliation.
// Dirty candles and new trade rows are flushed to the store as one unit every
// `commit_every_n_events` events, and immediately when a trade opens a new
// window. A failed flush is rolled back; nothing is forgotten and the next
// flush writes the same data again.
// =============================================================================

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::aggregator::CandleAggregator;
use crate::error::{DispatchError, EventError, StoreError};
use crate::period::window_start;
use crate::queue::{EventReceiver, Received};
use crate::reconcile::{reconcile, ReconcileReport};
use crate::runtime_config::RuntimeConfig;
use crate::storage::CandleStore;
use crate::types::{CandleSnapshot, MarketEvent, Trade, WindowKey};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub commit_every_n_events: u64,
    pub flush_on_new_window: bool,
    pub idle_poll: Duration,
    pub evict_after: chrono::Duration,
}

impl From<&RuntimeConfig> for DispatcherConfig {
    fn from(cfg: &RuntimeConfig) -> Self {
        Self {
            commit_every_n_events: cfg.commit_every_n_events.max(1),
            flush_on_new_window: cfg.flush_on_new_window,
            idle_poll: Duration::from_millis(cfg.idle_poll_ms),
            evict_after: chrono::Duration::seconds(cfg.evict_after_secs as i64),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

/// Running counters, logged on shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub events: u64,
    pub trades: u64,
    pub snapshots: u64,
    pub rejected: u64,
    pub adopted: u64,
    pub discrepancies: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
}

/// What one successful flush wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub candles_created: usize,
    pub candles_updated: usize,
    pub trades: usize,
}

pub struct Dispatcher<S: CandleStore> {
    aggregator: CandleAggregator,
    store: S,
    config: DispatcherConfig,
    /// Trades applied since the last successful flush.
    pending_trades: Vec<Trade>,
    stats: DispatchStats,
    /// Latest event time seen; eviction is measured against it rather than
    /// the wall clock.
    high_water: Option<DateTime<Utc>>,
}

impl<S: CandleStore> Dispatcher<S> {
    pub fn new(aggregator: CandleAggregator, store: S, config: DispatcherConfig) -> Self {
        Self {
            aggregator,
            store,
            config,
            pending_trades: Vec::new(),
            stats: DispatchStats::default(),
            high_water: None,
        }
    }

    pub fn aggregator(&self) -> &CandleAggregator {
        &self.aggregator
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn pending_trades(&self) -> usize {
        self.pending_trades.len()
    }

    // -------------------------------------------------------------------------
    // Event handling
    // -------------------------------------------------------------------------

    /// Process one event. Errors are logged and the event is skipped.
    pub fn handle(&mut self, event: MarketEvent) {
        self.stats.events += 1;

        let result = match &event {
            MarketEvent::Trade(trade) => self.on_trade(trade),
            MarketEvent::Snapshot(snapshot) => self.on_snapshot(snapshot).map(|_| ()),
        };
        if let Err(e) = result {
            self.stats.rejected += 1;
            error!(kind = event.kind(), error = %e, "failed to process event, skipping");
        }

        if self.stats.events % self.config.commit_every_n_events == 0 {
            self.flush_or_report();
        }
    }

    fn on_trade(&mut self, trade: &Trade) -> Result<(), DispatchError> {
        trade.validate()?;

        for key in self.aggregator.active_keys(trade) {
            if let Err(e) = self.hydrate(&key) {
                warn!(
                    window = %key,
                    error = %e,
                    "store read failed, window starts from this trade"
                );
            }
        }

        let applied = self.aggregator.apply_trade(trade);
        self.pending_trades.push(trade.clone());
        self.stats.trades += 1;
        self.advance_clock(trade.time);

        if self.config.flush_on_new_window {
            if let Some(opened) = applied.iter().find(|w| w.created) {
                debug!(window = %opened.key, "new window, flushing now");
                self.flush_or_report();
            }
        }
        Ok(())
    }

    fn on_snapshot(&mut self, snapshot: &CandleSnapshot) -> Result<ReconcileReport, DispatchError> {
        snapshot.validate()?;

        let resolution = snapshot.resolution;
        if !self.aggregator.periods().contains(resolution) {
            return Err(EventError::UnconfiguredResolution(resolution).into());
        }
        if window_start(snapshot.time, resolution) != snapshot.time {
            return Err(EventError::Misaligned {
                start: snapshot.time,
                resolution,
            }
            .into());
        }

        self.hydrate(&snapshot.window_key())?;

        let report = reconcile(&mut self.aggregator, snapshot);
        self.stats.snapshots += 1;
        if report.adopted() {
            self.stats.adopted += 1;
        }
        self.stats.discrepancies += report.discrepancies().len() as u64;
        debug!(
            window = %report.key,
            candle = ?self.aggregator.get_aggregate(&report.key),
            "snapshot reconciled"
        );
        self.advance_clock(snapshot.time);
        Ok(report)
    }

    /// Bring a window evicted earlier, or left by a previous run, back into
    /// memory before it is touched.
    fn hydrate(&mut self, key: &WindowKey) -> Result<(), StoreError> {
        if self.aggregator.contains(key) {
            return Ok(());
        }
        if let Some(candle) = self.store.find_candle(key)? {
            debug!(window = %key, "hydrated candle from store");
            self.aggregator.hydrate(key.clone(), candle);
        }
        Ok(())
    }

    fn advance_clock(&mut self, time: DateTime<Utc>) {
        if self.high_water.map_or(true, |hw| time > hw) {
            self.high_water = Some(time);
        }
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Write every dirty candle and pending trade, then commit.
    pub fn flush(&mut self) -> Result<FlushSummary, StoreError> {
        match self.write_batch() {
            Ok(summary) => {
                self.pending_trades.clear();
                self.aggregator.mark_clean();
                self.stats.flushes += 1;
                debug!(
                    candles_created = summary.candles_created,
                    candles_updated = summary.candles_updated,
                    trades = summary.trades,
                    in_memory = self.aggregator.len(),
                    "batch committed"
                );

                if let (Some(now), false) = (self.high_water, self.aggregator.is_empty()) {
                    self.aggregator.evict_closed(now, self.config.evict_after);
                }
                Ok(summary)
            }
            Err(e) => {
                self.store.rollback();
                self.stats.failed_flushes += 1;
                Err(e)
            }
        }
    }

    fn write_batch(&mut self) -> Result<FlushSummary, StoreError> {
        let mut summary = FlushSummary::default();

        for trade in &self.pending_trades {
            self.store.insert_trade(trade)?;
            summary.trades += 1;
        }

        for (key, candle) in self.aggregator.dirty_candles() {
            let (_, created) = self.store.find_or_create_candle(&key, &candle)?;
            if created {
                summary.candles_created += 1;
            } else {
                self.store.update_candle(&key, &candle)?;
                summary.candles_updated += 1;
            }
        }

        self.store.commit()?;
        Ok(summary)
    }

    fn flush_or_report(&mut self) {
        if let Err(e) = self.flush() {
            error!(
                error = %e,
                dirty = self.aggregator.dirty_count(),
                pending_trades = self.pending_trades.len(),
                "flush failed, will retry on next flush"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Consumer loop
    // -------------------------------------------------------------------------

    /// Consume events until shutdown is signalled or every producer is gone,
    /// then drain what is already queued and flush.
    pub async fn run(
        mut self,
        mut queue: EventReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        info!(
            commit_every_n_events = self.config.commit_every_n_events,
            flush_on_new_window = self.config.flush_on_new_window,
            "dispatcher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = queue.recv_timeout(self.config.idle_poll) => match received {
                    Received::Event(event) => self.handle(event),
                    Received::Idle => {}
                    Received::Closed => break,
                },
            }
        }

        queue.close();
        let mut drained = 0usize;
        while let Some(event) = queue.try_recv() {
            self.handle(event);
            drained += 1;
        }
        if self.aggregator.dirty_count() > 0 || !self.pending_trades.is_empty() {
            self.flush_or_report();
        }

        info!(drained, stats = ?self.stats, "dispatcher stopped");
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::PeriodCalculator;
    use crate::queue::event_queue;
    use crate::storage::MemoryStore;
    use crate::types::{Candle, InstrumentKey, Resolution, Side};
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 12, 10, h, m, s).unwrap()
    }

    fn instrument() -> InstrumentKey {
        InstrumentKey::new("Binance", "BTCUSDT")
    }

    fn trade(price: f64, size: f64, time: DateTime<Utc>) -> MarketEvent {
        MarketEvent::Trade(Trade {
            instrument: instrument(),
            liquidation: false,
            price,
            side: Side::Buy,
            size,
            time,
            sequence: 1,
        })
    }

    fn snapshot(resolution: Resolution, time: DateTime<Utc>, candle: Candle) -> MarketEvent {
        MarketEvent::Snapshot(CandleSnapshot {
            instrument: instrument(),
            resolution,
            time,
            open: candle.open,
            close: candle.close,
            high: candle.high,
            low: candle.low,
            volume: candle.volume,
        })
    }

    fn minute_key(start: DateTime<Utc>) -> WindowKey {
        WindowKey::new(instrument(), Resolution::MINUTE, start)
    }

    fn dispatcher(store: &MemoryStore, config: DispatcherConfig) -> Dispatcher<MemoryStore> {
        Dispatcher::new(
            CandleAggregator::new(PeriodCalculator::default()),
            store.clone(),
            config,
        )
    }

    fn batch_config(n: u64) -> DispatcherConfig {
        DispatcherConfig {
            commit_every_n_events: n,
            flush_on_new_window: false,
            ..DispatcherConfig::default()
        }
    }

    #[test]
    fn flushes_every_n_events() {
        let store = MemoryStore::new();
        let mut d = dispatcher(&store, batch_config(3));

        d.handle(trade(100.0, 1.0, at(11, 46, 3)));
        d.handle(trade(105.0, 2.0, at(11, 46, 10)));
        assert_eq!(store.commits(), 0);
        assert_eq!(d.pending_trades(), 2);

        d.handle(trade(98.0, 3.0, at(11, 46, 20)));
        assert_eq!(store.commits(), 1);
        assert_eq!(store.committed_trades().len(), 3);
        assert_eq!(store.committed_candles(), 3);
        assert_eq!(
            store.committed_candle(&minute_key(at(11, 46, 0))),
            Some(Candle {
                open: 100.0,
                close: 98.0,
                high: 105.0,
                low: 98.0,
                volume: 6.0,
            })
        );
        assert_eq!(d.aggregator().dirty_count(), 0);
        assert_eq!(d.pending_trades(), 0);
    }

    #[test]
    fn new_window_is_flushed_immediately() {
        let store = MemoryStore::new();
        let mut d = dispatcher(
            &store,
            DispatcherConfig {
                commit_every_n_events: 100,
                flush_on_new_window: true,
                ..DispatcherConfig::default()
            },
        );

        d.handle(trade(100.0, 1.0, at(11, 46, 3)));
        assert_eq!(store.commits(), 1);
        assert_eq!(
            store.committed_candle(&minute_key(at(11, 46, 0))),
            Some(Candle::from_trade(100.0, 1.0))
        );

        // Same windows: accumulates in memory only.
        d.handle(trade(101.0, 1.0, at(11, 46, 30)));
        assert_eq!(store.commits(), 1);
        assert_eq!(d.aggregator().dirty_count(), 3);

        // Next minute opens a new minute window.
        d.handle(trade(102.0, 1.0, at(11, 47, 1)));
        assert_eq!(store.commits(), 2);
        assert_eq!(
            store.committed_candle(&minute_key(at(11, 46, 0))).map(|c| c.close),
            Some(101.0)
        );
    }

    #[test]
    fn failed_flush_keeps_state_for_retry() {
        let store = MemoryStore::new();
        let mut d = dispatcher(&store, batch_config(2));
        store.fail_next_commits(1);

        d.handle(trade(100.0, 1.0, at(11, 46, 3)));
        d.handle(trade(105.0, 2.0, at(11, 46, 10)));
        assert_eq!(d.stats().failed_flushes, 1);
        assert_eq!(store.commits(), 0);
        assert!(store.committed_trades().is_empty());
        assert_eq!(d.pending_trades(), 2);
        assert_eq!(d.aggregator().dirty_count(), 3);

        let summary = d.flush().unwrap();
        assert_eq!(summary.trades, 2);
        assert_eq!(summary.candles_created, 3);
        assert_eq!(store.committed_trades().len(), 2);
        assert_eq!(
            store.committed_candle(&minute_key(at(11, 46, 0))).map(|c| c.volume),
            Some(3.0)
        );
    }

    #[test]
    fn second_flush_updates_existing_rows() {
        let store = MemoryStore::new();
        let mut d = dispatcher(&store, batch_config(100));

        d.handle(trade(100.0, 1.0, at(11, 46, 3)));
        assert_eq!(d.flush().unwrap().candles_created, 3);

        d.handle(trade(110.0, 1.0, at(11, 46, 40)));
        let summary = d.flush().unwrap();
        assert_eq!(summary.candles_created, 0);
        assert_eq!(summary.candles_updated, 3);
        assert_eq!(
            store.committed_candle(&minute_key(at(11, 46, 0))).map(|c| c.high),
            Some(110.0)
        );
    }

    #[test]
    fn persisted_candle_is_continued_after_restart() {
        let store = MemoryStore::new();
        store.seed_candle(
            minute_key(at(11, 46, 0)),
            Candle {
                open: 90.0,
                close: 95.0,
                high: 96.0,
                low: 89.0,
                volume: 4.0,
            },
        );
        let mut d = dispatcher(&store, batch_config(100));

        d.handle(trade(100.0, 1.0, at(11, 46, 30)));
        assert_eq!(
            d.aggregator().get_aggregate(&minute_key(at(11, 46, 0))),
            Some(Candle {
                open: 90.0,
                close: 100.0,
                high: 100.0,
                low: 89.0,
                volume: 5.0,
            })
        );
    }

    #[test]
    fn unreadable_store_does_not_drop_the_trade() {
        let store = MemoryStore::new();
        store.seed_candle(minute_key(at(11, 46, 0)), Candle::from_trade(90.0, 4.0));
        store.fail_next_reads(3);
        let mut d = dispatcher(&store, batch_config(100));

        d.handle(trade(100.0, 1.0, at(11, 46, 30)));
        assert_eq!(d.stats().rejected, 0);
        assert_eq!(d.stats().trades, 1);
        assert_eq!(d.pending_trades(), 1);
        assert_eq!(
            d.aggregator().get_aggregate(&minute_key(at(11, 46, 0))),
            Some(Candle::from_trade(100.0, 1.0))
        );

        d.flush().unwrap();
        assert_eq!(store.committed_trades().len(), 1);
    }

    #[test]
    fn malformed_events_are_skipped() {
        let store = MemoryStore::new();
        let mut d = dispatcher(&store, batch_config(100));

        d.handle(trade(-1.0, 1.0, at(11, 46, 3)));
        d.handle(trade(100.0, -0.5, at(11, 46, 3)));
        d.handle(snapshot(
            Resolution::new(300).unwrap(),
            at(11, 45, 0),
            Candle::from_trade(100.0, 1.0),
        ));
        d.handle(snapshot(
            Resolution::MINUTE,
            at(11, 45, 30),
            Candle::from_trade(100.0, 1.0),
        ));
        d.handle(snapshot(
            Resolution::MINUTE,
            at(11, 45, 0),
            Candle {
                open: 100.0,
                close: 100.0,
                high: 90.0,
                low: 110.0,
                volume: 1.0,
            },
        ));
        assert_eq!(d.stats().rejected, 5);
        assert!(d.aggregator().is_empty());

        d.handle(trade(100.0, 1.0, at(11, 46, 3)));
        assert_eq!(d.stats().trades, 1);
        assert_eq!(d.aggregator().len(), 3);
    }

    #[test]
    fn snapshot_overwrites_local_drift() {
        let store = MemoryStore::new();
        let mut d = dispatcher(&store, batch_config(100));
        for (price, size) in [(100.0, 2.0), (105.0, 3.0), (98.0, 5.0)] {
            d.handle(trade(price, size, at(11, 46, 10)));
        }
        d.handle(snapshot(
            Resolution::MINUTE,
            at(11, 46, 0),
            Candle {
                open: 100.0,
                close: 99.0,
                high: 105.0,
                low: 98.0,
                volume: 10.0,
            },
        ));
        assert_eq!(d.stats().discrepancies, 1);

        d.flush().unwrap();
        assert_eq!(
            store.committed_candle(&minute_key(at(11, 46, 0))).map(|c| c.close),
            Some(99.0)
        );
    }

    #[test]
    fn snapshot_for_untouched_window_is_adopted_and_stored() {
        let store = MemoryStore::new();
        let mut d = dispatcher(&store, batch_config(1));
        let candle = Candle {
            open: 10.0,
            close: 11.0,
            high: 12.0,
            low: 9.0,
            volume: 100.0,
        };
        d.handle(snapshot(Resolution::HOUR, at(11, 0, 0), candle));
        assert_eq!(d.stats().adopted, 1);
        assert_eq!(
            store.committed_candle(&WindowKey::new(instrument(), Resolution::HOUR, at(11, 0, 0))),
            Some(candle)
        );
    }

    #[test]
    fn closed_windows_are_evicted_and_rehydrated() {
        let store = MemoryStore::new();
        let mut d = dispatcher(&store, batch_config(1));
        let old = minute_key(at(11, 46, 0));

        d.handle(trade(100.0, 1.0, at(11, 46, 3)));
        assert!(d.aggregator().contains(&old));

        d.handle(trade(101.0, 1.0, at(12, 10, 0)));
        assert!(!d.aggregator().contains(&old));
        assert!(store.committed_candle(&old).is_some());

        // A late trade for the evicted window continues the stored candle.
        d.handle(trade(90.0, 2.0, at(11, 46, 50)));
        assert_eq!(
            store.committed_candle(&old),
            Some(Candle {
                open: 100.0,
                close: 90.0,
                high: 100.0,
                low: 90.0,
                volume: 3.0,
            })
        );
    }

    #[tokio::test]
    async fn shutdown_drains_queue_and_flushes() {
        let store = MemoryStore::new();
        let d = dispatcher(&store, batch_config(1_000));
        let (tx, rx) = event_queue(100);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for i in 0..10 {
            tx.enqueue(trade(100.0 + i as f64, 1.0, at(11, 46, i)))
                .unwrap();
        }
        let handle = tokio::spawn(d.run(rx, shutdown_rx));
        shutdown_tx.send(true).unwrap();

        let d = handle.await.unwrap();
        assert_eq!(d.stats().trades, 10);
        assert_eq!(store.committed_trades().len(), 10);
        assert_eq!(
            store.committed_candle(&minute_key(at(11, 46, 0))).map(|c| c.close),
            Some(109.0)
        );
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn stops_when_producers_are_gone() {
        let store = MemoryStore::new();
        let d = dispatcher(
            &store,
            DispatcherConfig {
                idle_poll: Duration::from_millis(5),
                ..batch_config(1_000)
            },
        );
        let (tx, rx) = event_queue(100);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.enqueue(trade(100.0, 1.0, at(11, 46, 3))).unwrap();
        drop(tx);

        let d = d.run(rx, shutdown_rx).await;
        assert_eq!(d.stats().events, 1);
        assert_eq!(store.committed_trades().len(), 1);
    }
}

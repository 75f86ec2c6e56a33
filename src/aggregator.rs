// =============================================================================
// Candle Aggregator — incremental OHLCV state per (instrument, resolution, window)
// =============================================================================
//
// Owned exclusively by the dispatcher task, so the state map is plain mutable
// data with no locking. Every mutation marks the window dirty; the dispatcher
// collects dirty windows at flush time and marks them clean once stored.
// =============================================================================

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::period::PeriodCalculator;
use crate::types::{Candle, Trade, WindowKey};

/// Outcome of applying a trade to one resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedWindow {
    pub key: WindowKey,
    /// The trade opened this window.
    pub created: bool,
}

pub struct CandleAggregator {
    periods: PeriodCalculator,
    candles: HashMap<WindowKey, Candle>,
    /// Ordered so flushes write windows deterministically.
    dirty: BTreeSet<WindowKey>,
}

impl CandleAggregator {
    pub fn new(periods: PeriodCalculator) -> Self {
        Self {
            periods,
            candles: HashMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    pub fn periods(&self) -> &PeriodCalculator {
        &self.periods
    }

    /// Keys of the currently open window for each resolution the trade touches.
    pub fn active_keys(&self, trade: &Trade) -> Vec<WindowKey> {
        self.periods
            .active_windows(trade.time)
            .into_iter()
            .map(|p| WindowKey::new(trade.instrument.clone(), p.resolution, p.start))
            .collect()
    }

    /// Apply a trade to its active window in every resolution.
    ///
    /// A fresh window takes all of its fields from the trade. An existing one
    /// takes the trade price as close regardless of timestamp ordering.
    pub fn apply_trade(&mut self, trade: &Trade) -> Vec<AppliedWindow> {
        let keys = self.active_keys(trade);
        let mut applied = Vec::with_capacity(keys.len());

        for key in keys {
            let created = match self.candles.get_mut(&key) {
                Some(candle) => {
                    candle.apply_trade(trade.price, trade.size);
                    false
                }
                None => {
                    debug!(window = %key, price = trade.price, "trade opened a window");
                    self.candles
                        .insert(key.clone(), Candle::from_trade(trade.price, trade.size));
                    true
                }
            };
            self.dirty.insert(key.clone());
            applied.push(AppliedWindow { key, created });
        }

        applied
    }

    /// Current state of a window, or `None` if nothing has touched it.
    pub fn get_aggregate(&self, key: &WindowKey) -> Option<Candle> {
        self.candles.get(key).copied()
    }

    pub fn contains(&self, key: &WindowKey) -> bool {
        self.candles.contains_key(key)
    }

    /// Load a persisted window into memory without marking it dirty.
    pub fn hydrate(&mut self, key: WindowKey, candle: Candle) {
        self.candles.entry(key).or_insert(candle);
    }

    /// Take an externally supplied candle as the window's state.
    pub fn adopt(&mut self, key: WindowKey, candle: Candle) {
        self.candles.insert(key.clone(), candle);
        self.dirty.insert(key);
    }

    /// Mutable access for reconciliation. Callers must `mark_dirty` after a
    /// change.
    pub(crate) fn candle_mut(&mut self, key: &WindowKey) -> Option<&mut Candle> {
        self.candles.get_mut(key)
    }

    pub fn mark_dirty(&mut self, key: &WindowKey) {
        if self.candles.contains_key(key) {
            self.dirty.insert(key.clone());
        }
    }

    /// Snapshot of every dirty window, in key order.
    pub fn dirty_candles(&self) -> Vec<(WindowKey, Candle)> {
        self.dirty
            .iter()
            .filter_map(|key| self.candles.get(key).map(|c| (key.clone(), *c)))
            .collect()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    #[cfg(test)]
    pub fn is_dirty(&self, key: &WindowKey) -> bool {
        self.dirty.contains(key)
    }

    /// Forget dirtiness after a successful flush.
    pub fn mark_clean(&mut self) {
        self.dirty.clear();
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Drop clean windows that ended at least `grace` before `now`.
    /// Returns the number of windows evicted.
    pub fn evict_closed(&mut self, now: DateTime<Utc>, grace: Duration) -> usize {
        let before = self.candles.len();
        let dirty = &self.dirty;
        self.candles
            .retain(|key, _| dirty.contains(key) || key.end() + grace > now);
        let evicted = before - self.candles.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.candles.len(), "evicted closed windows");
        }
        evicted
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

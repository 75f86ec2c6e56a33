//! In-process store used by tests to observe what the dispatcher persisted.
//! Clones share the same tables.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StoreError;
use crate::storage::CandleStore;
use crate::types::{Candle, Trade, WindowKey};

#[derive(Debug, Clone, Default)]
struct Tables {
    exchanges: BTreeSet<String>,
    candles: BTreeMap<WindowKey, Candle>,
    trades: Vec<Trade>,
}

#[derive(Debug, Default)]
struct Inner {
    committed: Tables,
    pending: Option<Tables>,
    commits: usize,
    failing_commits: usize,
    failing_reads: usize,
}

impl Inner {
    fn visible(&self) -> &Tables {
        self.pending.as_ref().unwrap_or(&self.committed)
    }

    fn writable(&mut self) -> &mut Tables {
        let committed = &self.committed;
        self.pending.get_or_insert_with(|| committed.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail (and roll back).
    pub fn fail_next_commits(&self, n: usize) {
        self.inner.lock().failing_commits = n;
    }

    /// Make the next `n` candle lookups fail.
    pub fn fail_next_reads(&self, n: usize) {
        self.inner.lock().failing_reads = n;
    }

    pub fn committed_candle(&self, key: &WindowKey) -> Option<Candle> {
        self.inner.lock().committed.candles.get(key).copied()
    }

    pub fn committed_candles(&self) -> usize {
        self.inner.lock().committed.candles.len()
    }

    pub fn committed_trades(&self) -> Vec<Trade> {
        self.inner.lock().committed.trades.clone()
    }

    pub fn committed_exchanges(&self) -> Vec<String> {
        self.inner.lock().committed.exchanges.iter().cloned().collect()
    }

    /// Successful commits that carried at least one write.
    pub fn commits(&self) -> usize {
        self.inner.lock().commits
    }

    /// Seed a committed candle, as if left by an earlier run.
    pub fn seed_candle(&self, key: WindowKey, candle: Candle) {
        self.inner.lock().committed.candles.insert(key, candle);
    }
}

impl CandleStore for MemoryStore {
    fn ensure_exchange(&mut self, name: &str) -> Result<(), StoreError> {
        self.inner.lock().writable().exchanges.insert(name.to_string());
        Ok(())
    }

    fn find_candle(&mut self, key: &WindowKey) -> Result<Option<Candle>, StoreError> {
        let mut inner = self.inner.lock();
        if inner.failing_reads > 0 {
            inner.failing_reads -= 1;
            return Err(StoreError::Unavailable("simulated read failure".into()));
        }
        Ok(inner.visible().candles.get(key).copied())
    }

    fn find_or_create_candle(
        &mut self,
        key: &WindowKey,
        defaults: &Candle,
    ) -> Result<(Candle, bool), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.visible().candles.get(key) {
            return Ok((*existing, false));
        }
        inner.writable().candles.insert(key.clone(), *defaults);
        Ok((*defaults, true))
    }

    fn update_candle(&mut self, key: &WindowKey, candle: &Candle) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.writable().candles.get_mut(key) {
            *slot = *candle;
        }
        Ok(())
    }

    fn insert_trade(&mut self, trade: &Trade) -> Result<(), StoreError> {
        self.inner.lock().writable().trades.push(trade.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.failing_commits > 0 {
            inner.failing_commits -= 1;
            return Err(StoreError::Unavailable("simulated commit failure".into()));
        }
        if let Some(pending) = inner.pending.take() {
            inner.committed = pending;
            inner.commits += 1;
        }
        Ok(())
    }

    fn rollback(&mut self) {
        self.inner.lock().pending = None;
    }
}

// =============================================================================
// Storage collaborator — what the dispatcher needs from a candle store
// =============================================================================
//
// Writes between two `commit()` calls form one unit. A failed unit is rolled
// back and the caller retries the same data on its next flush.
// =============================================================================

#[cfg(test)]
pub mod memory;
pub mod sqlite;

#[cfg(test)]
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::types::{Candle, Trade, WindowKey};

pub trait CandleStore: Send {
    /// Register an exchange name (idempotent).
    fn ensure_exchange(&mut self, name: &str) -> Result<(), StoreError>;

    /// Look up a persisted candle.
    fn find_candle(&mut self, key: &WindowKey) -> Result<Option<Candle>, StoreError>;

    /// Return the stored candle for `key`, inserting `defaults` first if there
    /// is none. The flag is `true` when the row was created by this call.
    fn find_or_create_candle(
        &mut self,
        key: &WindowKey,
        defaults: &Candle,
    ) -> Result<(Candle, bool), StoreError>;

    /// Overwrite every field of an existing candle.
    fn update_candle(&mut self, key: &WindowKey, candle: &Candle) -> Result<(), StoreError>;

    /// Record a trade. Trades have no natural key; every call adds a row.
    fn insert_trade(&mut self, trade: &Trade) -> Result<(), StoreError>;

    /// Make all writes since the last commit durable.
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard all writes since the last commit.
    fn rollback(&mut self);
}

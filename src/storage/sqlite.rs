//! SQLite candle store.
//!
//! Schema mirrors the three entities of the pipeline: exchanges, raw trades
//! and one candle row per (exchange, market, resolution, start_time). Times
//! are stored as Unix seconds: REAL for trades (sub-second precision),
//! INTEGER for window starts.
//!
//! Writes open a transaction lazily; `commit()` closes it.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::storage::CandleStore;
use crate::types::{Candle, Trade, WindowKey};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS exchange (
    name TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS trade (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange_name TEXT NOT NULL REFERENCES exchange(name),
    market TEXT NOT NULL,
    price REAL NOT NULL,
    side TEXT NOT NULL,
    size REAL NOT NULL,
    time REAL NOT NULL,
    liquidation INTEGER NOT NULL,
    sequence INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trade_market_time
    ON trade(exchange_name, market, time);

CREATE TABLE IF NOT EXISTS candle (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange_name TEXT NOT NULL REFERENCES exchange(name),
    market TEXT NOT NULL,
    resolution INTEGER NOT NULL,
    start_time INTEGER NOT NULL,
    open REAL NOT NULL,
    close REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    volume REAL NOT NULL,
    CONSTRAINT exch_market_resl_start_time_uc
        UNIQUE (exchange_name, market, resolution, start_time)
);
"#;

pub struct SqliteStore {
    conn: Connection,
    in_transaction: bool,
}

impl SqliteStore {
    /// Open or create the database at `path`. `":memory:"` gives a private
    /// in-memory database.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        if path.trim().is_empty() {
            return Err(StoreError::Unavailable("database path is empty".into()));
        }
        if path == ":memory:" {
            return Self::open_in_memory();
        }

        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %path, "candle store opened");
        Ok(Self {
            conn,
            in_transaction: false,
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            in_transaction: false,
        })
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
            self.in_transaction = true;
        }
        Ok(())
    }

    #[cfg(test)]
    fn trade_count(&self, exchange: &str, market: &str) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM trade WHERE exchange_name = ?1 AND market = ?2",
            params![exchange, market],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn trade_time_secs(time: &DateTime<Utc>) -> f64 {
    time.timestamp() as f64 + f64::from(time.timestamp_subsec_nanos()) / 1e9
}

impl CandleStore for SqliteStore {
    fn ensure_exchange(&mut self, name: &str) -> Result<(), StoreError> {
        self.begin()?;
        self.conn.execute(
            "INSERT OR IGNORE INTO exchange (name) VALUES (?1)",
            params![name],
        )?;
        Ok(())
    }

    fn find_candle(&mut self, key: &WindowKey) -> Result<Option<Candle>, StoreError> {
        let candle = self
            .conn
            .query_row(
                r#"
                SELECT open, close, high, low, volume FROM candle
                WHERE exchange_name = ?1 AND market = ?2 AND resolution = ?3 AND start_time = ?4
                "#,
                params![
                    key.instrument.exchange,
                    key.instrument.market,
                    key.resolution.secs(),
                    key.start.timestamp(),
                ],
                |row| {
                    Ok(Candle {
                        open: row.get(0)?,
                        close: row.get(1)?,
                        high: row.get(2)?,
                        low: row.get(3)?,
                        volume: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(candle)
    }

    fn find_or_create_candle(
        &mut self,
        key: &WindowKey,
        defaults: &Candle,
    ) -> Result<(Candle, bool), StoreError> {
        if let Some(existing) = self.find_candle(key)? {
            return Ok((existing, false));
        }

        self.begin()?;
        self.conn.execute(
            r#"
            INSERT INTO candle (
                exchange_name, market, resolution, start_time,
                open, close, high, low, volume
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                key.instrument.exchange,
                key.instrument.market,
                key.resolution.secs(),
                key.start.timestamp(),
                defaults.open,
                defaults.close,
                defaults.high,
                defaults.low,
                defaults.volume,
            ],
        )?;
        debug!(window = %key, "candle row created");
        Ok((*defaults, true))
    }

    fn update_candle(&mut self, key: &WindowKey, candle: &Candle) -> Result<(), StoreError> {
        self.begin()?;
        let changed = self.conn.execute(
            r#"
            UPDATE candle SET open = ?5, close = ?6, high = ?7, low = ?8, volume = ?9
            WHERE exchange_name = ?1 AND market = ?2 AND resolution = ?3 AND start_time = ?4
            "#,
            params![
                key.instrument.exchange,
                key.instrument.market,
                key.resolution.secs(),
                key.start.timestamp(),
                candle.open,
                candle.close,
                candle.high,
                candle.low,
                candle.volume,
            ],
        )?;
        if changed == 0 {
            warn!(window = %key, "update matched no candle row");
        }
        Ok(())
    }

    fn insert_trade(&mut self, trade: &Trade) -> Result<(), StoreError> {
        self.begin()?;
        self.conn.execute(
            r#"
            INSERT INTO trade (
                exchange_name, market, price, side, size, time, liquidation, sequence
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                trade.instrument.exchange,
                trade.instrument.market,
                trade.price,
                trade.side.as_str(),
                trade.size,
                trade_time_secs(&trade.time),
                trade.liquidation,
                trade.sequence as i64,
            ],
        )?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if self.in_transaction {
            self.conn.execute_batch("COMMIT")?;
            self.in_transaction = false;
        }
        Ok(())
    }

    fn rollback(&mut self) {
        if self.in_transaction {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "rollback failed");
            }
            self.in_transaction = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

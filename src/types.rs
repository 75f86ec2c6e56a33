// =============================================================================
// Shared types used across the candle pipeline
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, EventError};

// ---------------------------------------------------------------------------
// Instruments and trades
// ---------------------------------------------------------------------------

/// Identity of a tradable instrument on one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrumentKey {
    pub exchange: String,
    pub market: String,
}

impl InstrumentKey {
    pub fn new(exchange: impl Into<String>, market: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            market: market.into(),
        }
    }
}

impl std::fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.exchange, self.market)
    }
}

/// Taker side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single trade received from a live feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    #[serde(flatten)]
    pub instrument: InstrumentKey,
    pub liquidation: bool,
    pub price: f64,
    pub side: Side,
    pub size: f64,
    pub time: DateTime<Utc>,
    /// Per-connection counter assigned by the feed, starting at 1.
    pub sequence: u64,
}

impl Trade {
    /// Reject trades that would corrupt an aggregate.
    pub fn validate(&self) -> Result<(), EventError> {
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(EventError::InvalidPrice(self.price));
        }
        if !self.size.is_finite() || self.size < 0.0 {
            return Err(EventError::InvalidSize(self.size));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Resolutions and windows
// ---------------------------------------------------------------------------

/// Window length in seconds.
///
/// Only resolutions the upstream exchanges publish candles for are accepted:
/// 1m, 5m, 15m, 1h, 4h, and whole days up to 30 days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Resolution(u32);

/// Largest multi-day resolution, in days.
const MAX_RESOLUTION_DAYS: u32 = 30;

impl Resolution {
    pub const MINUTE: Self = Self(60);
    pub const HOUR: Self = Self(3_600);
    pub const DAY: Self = Self(86_400);

    pub fn new(secs: u32) -> Result<Self, ConfigError> {
        let day = Self::DAY.0;
        let valid = matches!(secs, 60 | 300 | 900 | 3_600 | 14_400)
            || (secs % day == 0 && (1..=MAX_RESOLUTION_DAYS).contains(&(secs / day)));
        if valid {
            Ok(Self(secs))
        } else {
            Err(ConfigError::InvalidResolution(secs))
        }
    }

    /// The three resolutions scheduled by default: minute, hour, day.
    pub fn defaults() -> Vec<Self> {
        vec![Self::MINUTE, Self::HOUR, Self::DAY]
    }

    pub fn secs(self) -> u32 {
        self.0
    }

    pub fn duration(self) -> Duration {
        Duration::seconds(i64::from(self.0))
    }
}

impl TryFrom<u32> for Resolution {
    type Error = ConfigError;

    fn try_from(secs: u32) -> Result<Self, Self::Error> {
        Self::new(secs)
    }
}

impl From<Resolution> for u32 {
    fn from(r: Resolution) -> Self {
        r.0
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}s", self.0)
    }
}

/// Identifies one candle: an instrument, a resolution and the aligned start of
/// the window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    pub instrument: InstrumentKey,
    pub resolution: Resolution,
    pub start: DateTime<Utc>,
}

impl WindowKey {
    pub fn new(instrument: InstrumentKey, resolution: Resolution, start: DateTime<Utc>) -> Self {
        Self {
            instrument,
            resolution,
            start,
        }
    }

    /// Exclusive end of the window.
    pub fn end(&self) -> DateTime<Utc> {
        self.start + self.resolution.duration()
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}@{}",
            self.instrument,
            self.resolution,
            self.start.to_rfc3339()
        )
    }
}

// ---------------------------------------------------------------------------
// Candles
// ---------------------------------------------------------------------------

/// The five numeric fields of a candle, in reconciliation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandleField {
    Open,
    Close,
    High,
    Low,
    Volume,
}

impl CandleField {
    pub const ALL: [CandleField; 5] = [
        CandleField::Open,
        CandleField::Close,
        CandleField::High,
        CandleField::Low,
        CandleField::Volume,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::High => "high",
            Self::Low => "low",
            Self::Volume => "volume",
        }
    }
}

impl std::fmt::Display for CandleField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OHLCV aggregate for one window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
}

impl Candle {
    /// Start a candle from the first trade of its window. Every field is set
    /// here; nothing relies on storage-side defaults.
    pub fn from_trade(price: f64, size: f64) -> Self {
        Self {
            open: price,
            close: price,
            high: price,
            low: price,
            volume: size,
        }
    }

    /// Fold a subsequent trade into the candle. `close` follows processing
    /// order, not trade timestamps.
    pub fn apply_trade(&mut self, price: f64, size: f64) {
        self.close = price;
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.volume += size;
    }

    pub fn get(&self, field: CandleField) -> f64 {
        match field {
            CandleField::Open => self.open,
            CandleField::Close => self.close,
            CandleField::High => self.high,
            CandleField::Low => self.low,
            CandleField::Volume => self.volume,
        }
    }

    pub fn set(&mut self, field: CandleField, value: f64) {
        match field {
            CandleField::Open => self.open = value,
            CandleField::Close => self.close = value,
            CandleField::High => self.high = value,
            CandleField::Low => self.low = value,
            CandleField::Volume => self.volume = value,
        }
    }

    /// OHLC ordering holds and volume is non-negative.
    #[cfg(test)]
    pub fn is_valid(&self) -> bool {
        self.high >= self.low
            && self.low <= self.open
            && self.low <= self.close
            && self.high >= self.open
            && self.high >= self.close
            && self.volume >= 0.0
    }
}

/// An authoritative candle fetched from an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleSnapshot {
    #[serde(flatten)]
    pub instrument: InstrumentKey,
    pub resolution: Resolution,
    /// Window start.
    pub time: DateTime<Utc>,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
}

impl CandleSnapshot {
    pub fn window_key(&self) -> WindowKey {
        WindowKey::new(self.instrument.clone(), self.resolution, self.time)
    }

    pub fn candle(&self) -> Candle {
        Candle {
            open: self.open,
            close: self.close,
            high: self.high,
            low: self.low,
            volume: self.volume,
        }
    }

    pub fn validate(&self) -> Result<(), EventError> {
        let candle = self.candle();
        for field in CandleField::ALL {
            if !candle.get(field).is_finite() {
                return Err(EventError::NonFinite(field));
            }
        }
        if self.high < self.low {
            return Err(EventError::InvertedRange {
                high: self.high,
                low: self.low,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queue payload
// ---------------------------------------------------------------------------

/// Tagged event carried by the event queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MarketEvent {
    Trade(Trade),
    Snapshot(CandleSnapshot),
}

impl MarketEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Trade(_) => "trade",
            Self::Snapshot(_) => "snapshot",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

// =============================================================================
// Error taxonomy for the candle pipeline
// =============================================================================
//
// Configuration errors are fatal at startup. Event and store errors are
// reported by the dispatcher and never stop the consumer loop.
// =============================================================================

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{CandleField, Resolution};

/// Invalid startup configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("exchange {0} is not implemented (supported: {1})")]
    UnknownExchange(String, String),

    #[error("malformed markets argument {input:?}: {reason}")]
    MalformedMarkets { input: String, reason: String },

    #[error("resolution {0}s is not supported")]
    InvalidResolution(u32),

    #[error("at least one resolution must be configured")]
    NoResolutions,

    #[error("commit_every_n_events must be at least 1")]
    ZeroCommitInterval,

    #[error("environment variable {name} has invalid value {value:?}")]
    InvalidEnv { name: &'static str, value: String },
}

/// A single event that cannot be applied. The event is skipped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EventError {
    #[error("trade price {0} is not a positive number")]
    InvalidPrice(f64),

    #[error("trade size {0} is not a non-negative number")]
    InvalidSize(f64),

    #[error("snapshot field {0} is not finite")]
    NonFinite(CandleField),

    #[error("snapshot high {high} is below low {low}")]
    InvertedRange { high: f64, low: f64 },

    #[error("resolution {0} is not configured")]
    UnconfiguredResolution(Resolution),

    #[error("window start {start} is not aligned to {resolution}")]
    Misaligned {
        start: DateTime<Utc>,
        resolution: Resolution,
    },
}

/// Failure reported by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Anything that can go wrong while the dispatcher handles one event.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The consumer side of the event queue has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event queue is closed")]
pub struct QueueClosed;

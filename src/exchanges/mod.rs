// =============================================================================
// Market sources — live trade feeds and authoritative candle snapshots
// =============================================================================
//
// Each configured exchange name maps to one constructor in a static
// registry. A source owns its markets: it streams their trades into the
// event queue and answers snapshot requests for a given window.
// =============================================================================

pub mod binance;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::ConfigError;
use crate::markets::MarketGroup;
use crate::queue::EventSender;
use crate::types::{CandleSnapshot, Resolution};

#[async_trait]
pub trait MarketSource: Send + Sync {
    /// Exchange name, as registered and stored.
    fn name(&self) -> &str;

    fn markets(&self) -> &[String];

    /// Stream live trades for every market into `queue` until the connection
    /// drops. Returns `Ok` on a clean end of stream.
    async fn run_trade_stream(&self, queue: EventSender) -> Result<()>;

    /// Candles for `market` whose window starts exactly at `window_start`.
    async fn fetch_snapshots(
        &self,
        market: &str,
        resolution: Resolution,
        window_start: DateTime<Utc>,
    ) -> Result<Vec<CandleSnapshot>>;
}

pub type SourceConstructor = fn(Vec<String>) -> Arc<dyn MarketSource>;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

const SUPPORTED: &[&str] = &["Binance", "Binanceus"];

fn lookup(name: &str) -> Option<SourceConstructor> {
    match name {
        "Binance" => Some(binance::BinanceSource::spot as SourceConstructor),
        "Binanceus" => Some(binance::BinanceSource::us as SourceConstructor),
        _ => None,
    }
}

pub fn build_source(
    name: &str,
    markets: Vec<String>,
) -> Result<Arc<dyn MarketSource>, ConfigError> {
    let constructor = lookup(name)
        .ok_or_else(|| ConfigError::UnknownExchange(name.to_string(), SUPPORTED.join(", ")))?;
    Ok(constructor(markets))
}

/// Build one source per configured exchange. Fails on the first unknown name.
pub fn build_sources(groups: &[MarketGroup]) -> Result<Vec<Arc<dyn MarketSource>>, ConfigError> {
    groups
        .iter()
        .map(|g| build_source(&g.exchange, g.markets.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Live feed supervision
// ---------------------------------------------------------------------------

/// Keep a source's trade stream running, reconnecting after `reconnect_delay`
/// whenever it fails or ends. Stops on shutdown or once the queue's consumer
/// is gone.
pub async fn run_trade_feed(
    source: Arc<dyn MarketSource>,
    queue: EventSender,
    reconnect_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let exchange = source.name().to_string();
    loop {
        if *shutdown.borrow() || queue.is_closed() {
            break;
        }

        tokio::select! {
            result = source.run_trade_stream(queue.clone()) => match result {
                Ok(()) => warn!(exchange = %exchange, "trade stream ended; reconnecting"),
                Err(e) => error!(
                    exchange = %exchange,
                    error = %e,
                    delay_secs = reconnect_delay.as_secs(),
                    "trade stream error; reconnecting"
                ),
            },
            _ = shutdown.changed() => break,
        }

        if queue.is_closed() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!(exchange = %exchange, "trade feed stopped");
}

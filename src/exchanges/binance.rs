// =============================================================================
// Binance / Binance.US source — trade WebSocket and public klines endpoint
// =============================================================================
//
// Both venues share one wire format and differ only in host names. Neither
// call is signed.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use crate::exchanges::MarketSource;
use crate::queue::EventSender;
use crate::types::{CandleSnapshot, InstrumentKey, MarketEvent, Resolution, Side, Trade};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinanceVenue {
    Spot,
    Us,
}

impl BinanceVenue {
    pub fn exchange_name(self) -> &'static str {
        match self {
            Self::Spot => "Binance",
            Self::Us => "Binanceus",
        }
    }

    fn rest_url(self) -> &'static str {
        match self {
            Self::Spot => "https://api.binance.com",
            Self::Us => "https://api.binance.us",
        }
    }

    fn stream_url(self) -> &'static str {
        match self {
            Self::Spot => "wss://stream.binance.com:9443",
            Self::Us => "wss://stream.binance.us:9443",
        }
    }
}

/// Kline interval name for a resolution, if Binance offers one.
pub fn kline_interval(resolution: Resolution) -> Option<&'static str> {
    match resolution.secs() {
        60 => Some("1m"),
        300 => Some("5m"),
        900 => Some("15m"),
        3_600 => Some("1h"),
        14_400 => Some("4h"),
        86_400 => Some("1d"),
        259_200 => Some("3d"),
        _ => None,
    }
}

pub struct BinanceSource {
    venue: BinanceVenue,
    markets: Vec<String>,
    client: reqwest::Client,
}

impl BinanceSource {
    pub fn new(venue: BinanceVenue, markets: Vec<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let markets = markets.into_iter().map(|m| m.to_uppercase()).collect();

        debug!(base_url = venue.rest_url(), "BinanceSource initialised");

        Self {
            venue,
            markets,
            client,
        }
    }

    pub fn spot(markets: Vec<String>) -> Arc<dyn MarketSource> {
        Arc::new(Self::new(BinanceVenue::Spot, markets))
    }

    pub fn us(markets: Vec<String>) -> Arc<dyn MarketSource> {
        Arc::new(Self::new(BinanceVenue::Us, markets))
    }

    /// Combined-stream URL carrying the `@trade` channel of every market.
    pub fn trade_stream_url(&self) -> String {
        let streams: Vec<String> = self
            .markets
            .iter()
            .map(|m| format!("{}@trade", m.to_lowercase()))
            .collect();
        format!("{}/stream?streams={}", self.venue.stream_url(), streams.join("/"))
    }

    fn klines_url(&self, market: &str, interval: &str, window_start: DateTime<Utc>) -> String {
        format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&limit=2",
            self.venue.rest_url(),
            market.to_uppercase(),
            interval,
            window_start.timestamp_millis()
        )
    }
}

#[async_trait]
impl MarketSource for BinanceSource {
    fn name(&self) -> &str {
        self.venue.exchange_name()
    }

    fn markets(&self) -> &[String] {
        &self.markets
    }

    /// Runs until the stream disconnects or an error occurs, then returns so
    /// that the feed supervisor can reconnect.
    async fn run_trade_stream(&self, queue: EventSender) -> Result<()> {
        let url = self.trade_stream_url();
        let exchange = self.name();
        info!(url = %url, exchange, "connecting to trade WebSocket");

        let (ws_stream, _response) = connect_async(&url)
            .await
            .context("failed to connect to trade WebSocket")?;

        info!(exchange, markets = ?self.markets, "trade WebSocket connected");
        let (_write, mut read) = ws_stream.split();

        let mut sequence: u64 = 0;
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    match parse_trade_message(&text, exchange, sequence + 1) {
                        Ok(trade) => {
                            sequence += 1;
                            queue
                                .enqueue(MarketEvent::Trade(trade))
                                .context("event queue closed")?;
                        }
                        Err(e) => {
                            warn!(exchange, error = %e, "failed to parse trade message");
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    warn!(exchange, frame = ?frame, "trade WebSocket closed by server");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(e).context("trade WebSocket read error");
                }
                None => {
                    warn!(exchange, "trade WebSocket stream ended");
                    return Ok(());
                }
            }
        }
    }

    /// GET /api/v3/klines (public, unsigned).
    #[instrument(skip(self), name = "binance::fetch_snapshots")]
    async fn fetch_snapshots(
        &self,
        market: &str,
        resolution: Resolution,
        window_start: DateTime<Utc>,
    ) -> Result<Vec<CandleSnapshot>> {
        let interval = kline_interval(resolution)
            .with_context(|| format!("no Binance kline interval for {resolution}"))?;
        let url = self.klines_url(market, interval, window_start);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/klines returned {}: {}", status, body);
        }

        let instrument = InstrumentKey::new(self.name(), market.to_uppercase());
        let snapshots = parse_klines(&body, &instrument, resolution, window_start)?;
        debug!(market, interval, count = snapshots.len(), "klines fetched");
        Ok(snapshots)
    }
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

/// Parse one combined-stream trade message.
///
/// Expected shape:
/// ```json
/// { "stream": "btcusdt@trade",
///   "data": { "e": "trade", "s": "BTCUSDT", "p": "37000.00", "q": "0.123",
///             "T": 1639057779407, "m": true } }
/// ```
pub fn parse_trade_message(text: &str, exchange: &str, sequence: u64) -> Result<Trade> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse trade JSON")?;
    let data = root.get("data").unwrap_or(&root);

    let market = data["s"].as_str().context("missing field s")?;
    let price = parse_str_f64(&data["p"]).context("failed to parse price")?;
    let size = parse_str_f64(&data["q"]).context("failed to parse quantity")?;
    let millis = data["T"].as_i64().context("missing field T")?;
    let is_buyer_maker = data["m"].as_bool().context("missing field m")?;

    let time = Utc
        .timestamp_millis_opt(millis)
        .single()
        .with_context(|| format!("trade time {millis} out of range"))?;

    Ok(Trade {
        instrument: InstrumentKey::new(exchange, market),
        liquidation: false,
        price,
        // Buyer is maker => taker is selling.
        side: if is_buyer_maker { Side::Sell } else { Side::Buy },
        size,
        time,
        sequence,
    })
}

/// Parse a klines array-of-arrays body, keeping only the candle that opens
/// at `window_start`.
///
/// Array indices:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume, ...
pub fn parse_klines(
    body: &serde_json::Value,
    instrument: &InstrumentKey,
    resolution: Resolution,
    window_start: DateTime<Utc>,
) -> Result<Vec<CandleSnapshot>> {
    let raw = body.as_array().context("klines response is not an array")?;
    let wanted = window_start.timestamp_millis();

    let mut snapshots = Vec::new();
    for entry in raw {
        let arr = entry.as_array().context("kline entry is not an array")?;
        if arr.len() < 6 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }
        if arr[0].as_i64() != Some(wanted) {
            continue;
        }

        snapshots.push(CandleSnapshot {
            instrument: instrument.clone(),
            resolution,
            time: window_start,
            open: parse_str_f64(&arr[1])?,
            high: parse_str_f64(&arr[2])?,
            low: parse_str_f64(&arr[3])?,
            close: parse_str_f64(&arr[4])?,
            volume: parse_str_f64(&arr[5])?,
        });
    }
    Ok(snapshots)
}

/// Binance encodes decimals as strings; accept plain numbers too.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

impl std::fmt::Debug for BinanceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceSource")
            .field("venue", &self.venue)
            .field("markets", &self.markets)
            .finish()
    }
}

// =============================================================================
// Candle Reconciler — Main Entry Point
// =============================================================================
//
// Usage: candle-reconciler "Binance:BTCUSDT,ETHUSDT;Binanceus:BTCUSD"
//
// Live trades from every configured exchange are folded into per-window
// candles; once a minute the windows that just closed are fetched from the
// exchange and reconciled against the local aggregates. Ctrl+C drains the
// queue and flushes before exit.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod dispatcher;
mod error;
mod exchanges;
mod markets;
mod period;
mod queue;
mod reconcile;
mod runtime_config;
mod scheduler;
mod storage;
mod types;

use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::aggregator::CandleAggregator;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::period::PeriodCalculator;
use crate::runtime_config::RuntimeConfig;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::storage::{CandleStore, SqliteStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Candle Reconciler — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("CANDLE_CONFIG").unwrap_or_else(|_| "candle_config.json".into());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides()?;
    config.validate()?;

    let markets_arg = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CANDLE_MARKETS").ok())
        .context("missing markets argument, e.g. \"Binance:BTCUSDT,ETHUSDT\"")?;
    let groups = markets::parse_markets(&markets_arg)?;
    let sources = exchanges::build_sources(&groups)?;

    for group in &groups {
        info!(exchange = %group.exchange, markets = ?group.markets, "Configured markets");
    }
    info!(
        resolutions = ?config.resolutions,
        commit_every_n_events = config.commit_every_n_events,
        delay_seconds_from_minute = config.delay_seconds_from_minute,
        "Pipeline configuration"
    );

    // ── 2. Storage ───────────────────────────────────────────────────────
    let mut store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("failed to open database {}", config.database_path))?;
    for source in &sources {
        store.ensure_exchange(source.name())?;
    }
    store.commit()?;

    // ── 3. Queue & shutdown signal ───────────────────────────────────────
    let (queue_tx, queue_rx) = queue::event_queue(config.alert_if_queue_size_more_than);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 4. Dispatcher (single consumer) ──────────────────────────────────
    let periods = PeriodCalculator::new(config.resolutions.iter().copied())?;
    let dispatcher = Dispatcher::new(
        CandleAggregator::new(periods.clone()),
        store,
        DispatcherConfig::from(&config),
    );
    let dispatcher_handle = tokio::spawn(dispatcher.run(queue_rx, shutdown_rx.clone()));

    // ── 5. Live trade feeds ──────────────────────────────────────────────
    let reconnect_delay = Duration::from_secs(config.reconnect_delay_secs);
    let mut feed_handles = Vec::with_capacity(sources.len());
    for source in &sources {
        feed_handles.push(tokio::spawn(exchanges::run_trade_feed(
            source.clone(),
            queue_tx.clone(),
            reconnect_delay,
            shutdown_rx.clone(),
        )));
    }
    info!(count = sources.len(), "Trade feeds launched");

    // ── 6. Snapshot scheduler ────────────────────────────────────────────
    let scheduler = Scheduler::new(
        periods,
        sources,
        queue_tx,
        SchedulerConfig::from(&config),
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, draining queue");
    let _ = shutdown_tx.send(true);

    for handle in feed_handles {
        if let Err(e) = handle.await {
            error!(error = %e, "trade feed task failed");
        }
    }
    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "scheduler task failed");
    }

    match dispatcher_handle.await {
        Ok(dispatcher) => {
            let stats = dispatcher.stats();
            info!(
                events = stats.events,
                trades = stats.trades,
                snapshots = stats.snapshots,
                adopted = stats.adopted,
                rejected = stats.rejected,
                discrepancies = stats.discrepancies,
                flushes = stats.flushes,
                failed_flushes = stats.failed_flushes,
                windows_in_memory = dispatcher.aggregator().len(),
                "Dispatcher finished"
            );
            if dispatcher.pending_trades() > 0 {
                error!(
                    trades = dispatcher.pending_trades(),
                    "final flush failed, trades were not persisted"
                );
            }
        }
        Err(e) => error!(error = %e, "dispatcher task failed"),
    }

    info!("Candle Reconciler shut down complete.");
    Ok(())
}

// =============================================================================
// Reconciliation Engine — compare local candles against exchange snapshots
// =============================================================================
//
// POLICY: the exchange snapshot is authoritative. Every mismatching field is
// reported and then overwritten with the snapshot value. Mismatches are
// routine (missed WebSocket messages, late subscription) and never errors.
//
// KNOWN LIMITATION: some exchanges report volume cumulatively over a period
// longer than the window, which shows up here as large volume discrepancies.
// The comparison is left as-is until the expected semantics are confirmed.
// =============================================================================

use tracing::{debug, info, warn};

use crate::aggregator::CandleAggregator;
use crate::types::{CandleField, CandleSnapshot, WindowKey};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// One field that differed between the local candle and the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Discrepancy {
    pub field: CandleField,
    pub local: f64,
    pub snapshot: f64,
    /// `|local - snapshot|`.
    pub abs_diff: f64,
    /// Difference as a percentage of the snapshot value; `None` when the
    /// snapshot value is zero.
    pub pct_diff: Option<f64>,
}

impl Discrepancy {
    fn between(field: CandleField, local: f64, snapshot: f64) -> Self {
        let abs_diff = (local - snapshot).abs();
        let pct_diff = (snapshot != 0.0).then(|| abs_diff / snapshot.abs() * 100.0);
        Self {
            field,
            local,
            snapshot,
            abs_diff,
            pct_diff,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// No local candle existed; the snapshot was taken verbatim.
    Adopted,
    /// A local candle existed and was compared field by field.
    Compared(Vec<Discrepancy>),
}

/// Summary of reconciling one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub key: WindowKey,
    pub outcome: ReconcileOutcome,
}

impl ReconcileReport {
    pub fn discrepancies(&self) -> &[Discrepancy] {
        match &self.outcome {
            ReconcileOutcome::Adopted => &[],
            ReconcileOutcome::Compared(found) => found,
        }
    }

    pub fn adopted(&self) -> bool {
        matches!(self.outcome, ReconcileOutcome::Adopted)
    }
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Merge `snapshot` into the aggregator's state for the same window.
///
/// 1. Absent locally: adopt the snapshot.
/// 2. Present: compare open, close, high, low, volume for exact equality;
///    record and overwrite each mismatch.
pub fn reconcile(aggregator: &mut CandleAggregator, snapshot: &CandleSnapshot) -> ReconcileReport {
    let key = snapshot.window_key();
    let incoming = snapshot.candle();

    let Some(local) = aggregator.candle_mut(&key) else {
        info!(window = %key, "no trades prior to the received candle, adopting snapshot");
        aggregator.adopt(key.clone(), incoming);
        return ReconcileReport {
            key,
            outcome: ReconcileOutcome::Adopted,
        };
    };

    let mut found = Vec::new();
    for field in CandleField::ALL {
        let ours = local.get(field);
        let theirs = incoming.get(field);
        if ours != theirs {
            found.push(Discrepancy::between(field, ours, theirs));
            local.set(field, theirs);
        }
    }

    if found.is_empty() {
        debug!(window = %key, "local candle matches snapshot");
    } else {
        for d in &found {
            warn!(
                window = %key,
                field = %d.field,
                local = d.local,
                snapshot = d.snapshot,
                abs_diff = d.abs_diff,
                pct_diff = ?d.pct_diff,
                "discrepancy found, taking snapshot value"
            );
        }
        if found.iter().any(|d| d.field == CandleField::Volume) {
            debug!(
                window = %key,
                "volume discrepancies may come from cumulative exchange volume"
            );
        }
        aggregator.mark_dirty(&key);
    }

    ReconcileReport {
        key,
        outcome: ReconcileOutcome::Compared(found),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::PeriodCalculator;
    use crate::types::{Candle, InstrumentKey, Resolution};
    use chrono::{DateTime, TimeZone, Utc};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 12, 10, 11, 45, 0).unwrap()
    }

    fn key() -> WindowKey {
        WindowKey::new(
            InstrumentKey::new("Binance", "BTCUSDT"),
            Resolution::MINUTE,
            start(),
        )
    }

    fn snapshot(open: f64, close: f64, high: f64, low: f64, volume: f64) -> CandleSnapshot {
        CandleSnapshot {
            instrument: InstrumentKey::new("Binance", "BTCUSDT"),
            resolution: Resolution::MINUTE,
            time: start(),
            open,
            close,
            high,
            low,
            volume,
        }
    }

    fn seeded(candle: Candle) -> CandleAggregator {
        let mut agg = CandleAggregator::new(PeriodCalculator::default());
        agg.hydrate(key(), candle);
        agg
    }

    #[test]
    fn close_mismatch_is_reported_and_overwritten() {
        let mut agg = seeded(Candle {
            open: 100.0,
            close: 98.0,
            high: 105.0,
            low: 98.0,
            volume: 10.0,
        });

        let report = reconcile(&mut agg, &snapshot(100.0, 99.0, 105.0, 98.0, 10.0));
        let found = report.discrepancies();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].field, CandleField::Close);
        assert_eq!(found[0].abs_diff, 1.0);
        let pct = found[0].pct_diff.unwrap();
        assert!((pct - 1.0101).abs() < 1e-3, "pct was {pct}");

        assert_eq!(agg.get_aggregate(&key()).unwrap().close, 99.0);
        assert!(agg.is_dirty(&key()));
    }

    #[test]
    fn absent_window_adopts_snapshot_verbatim() {
        let mut agg = CandleAggregator::new(PeriodCalculator::default());
        let snap = snapshot(1.0, 2.0, 3.0, 0.5, 42.0);

        let report = reconcile(&mut agg, &snap);
        assert!(report.adopted());
        assert!(report.discrepancies().is_empty());
        assert_eq!(agg.get_aggregate(&key()), Some(snap.candle()));
        assert!(agg.is_dirty(&key()));
    }

    #[test]
    fn reconciling_twice_is_idempotent() {
        let mut agg = seeded(Candle::from_trade(100.0, 1.0));
        let snap = snapshot(101.0, 102.0, 103.0, 99.0, 7.0);

        let first = reconcile(&mut agg, &snap);
        assert_eq!(first.discrepancies().len(), 5);

        let second = reconcile(&mut agg, &snap);
        assert!(!second.adopted());
        assert!(second.discrepancies().is_empty());
    }

    #[test]
    fn matching_candle_stays_clean() {
        let candle = Candle {
            open: 100.0,
            close: 99.0,
            high: 105.0,
            low: 98.0,
            volume: 10.0,
        };
        let mut agg = seeded(candle);
        let report = reconcile(&mut agg, &snapshot(100.0, 99.0, 105.0, 98.0, 10.0));
        assert!(report.discrepancies().is_empty());
        assert!(!agg.is_dirty(&key()));
    }

    #[test]
    fn zero_snapshot_value_has_no_percentage() {
        let mut agg = seeded(Candle::from_trade(100.0, 2.0));
        let report = reconcile(&mut agg, &snapshot(100.0, 100.0, 100.0, 100.0, 0.0));
        let found = report.discrepancies();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].field, CandleField::Volume);
        assert_eq!(found[0].abs_diff, 2.0);
        assert_eq!(found[0].pct_diff, None);
    }
}

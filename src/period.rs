// =============================================================================
// Period Calculator — window boundaries for every configured resolution
// =============================================================================
//
// Windows are left-closed and aligned to the Unix epoch, so day windows start
// at 00:00:00 UTC. Two views are offered:
//
//   active_windows(T)      the window each resolution is currently filling
//   just_closed_windows(T) the windows that turned at the last scheduler tick
//
// The scheduler ticks once per minute. A resolution is "just closed" when the
// tick lands on one of its boundaries, which gives the cascade
// minute → hour (minute-of-hour = 0) → day (hour-of-day = 0 as well).
// =============================================================================

use chrono::{DateTime, Duration, Utc};

use crate::error::ConfigError;
use crate::types::Resolution;

/// Spacing of scheduler ticks in seconds.
pub const SCHEDULER_TICK_SECS: i64 = 60;

/// A window of one resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub resolution: Resolution,
    pub start: DateTime<Utc>,
}

/// Floor `time` to the start of the `resolution` window containing it.
pub fn window_start(time: DateTime<Utc>, resolution: Resolution) -> DateTime<Utc> {
    floor_to(time, i64::from(resolution.secs()))
}

fn floor_to(time: DateTime<Utc>, step_secs: i64) -> DateTime<Utc> {
    let secs = time.timestamp();
    let excess = secs.rem_euclid(step_secs);
    time - Duration::seconds(excess)
        - Duration::nanoseconds(i64::from(time.timestamp_subsec_nanos()))
}

/// Computes active and just-closed windows for a fixed resolution set.
#[derive(Debug, Clone)]
pub struct PeriodCalculator {
    /// Sorted ascending, no duplicates.
    resolutions: Vec<Resolution>,
}

impl PeriodCalculator {
    pub fn new(resolutions: impl IntoIterator<Item = Resolution>) -> Result<Self, ConfigError> {
        let mut resolutions: Vec<Resolution> = resolutions.into_iter().collect();
        resolutions.sort();
        resolutions.dedup();
        if resolutions.is_empty() {
            return Err(ConfigError::NoResolutions);
        }
        Ok(Self { resolutions })
    }

    pub fn resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    pub fn contains(&self, resolution: Resolution) -> bool {
        self.resolutions.binary_search(&resolution).is_ok()
    }

    /// One window per resolution, each satisfying `start <= time < start + R`.
    pub fn active_windows(&self, time: DateTime<Utc>) -> Vec<Period> {
        self.resolutions
            .iter()
            .map(|&resolution| Period {
                resolution,
                start: window_start(time, resolution),
            })
            .collect()
    }

    /// Windows that closed at the scheduler tick at or before `time`.
    ///
    /// The finest resolution is present on every minute tick; coarser ones
    /// appear only when the tick sits on their boundary.
    pub fn just_closed_windows(&self, time: DateTime<Utc>) -> Vec<Period> {
        let tick = floor_to(time, SCHEDULER_TICK_SECS);
        let tick_secs = tick.timestamp();

        self.resolutions
            .iter()
            .filter(|r| tick_secs.rem_euclid(i64::from(r.secs())) == 0)
            .map(|&resolution| Period {
                resolution,
                start: tick - resolution.duration(),
            })
            .collect()
    }
}

impl Default for PeriodCalculator {
    fn default() -> Self {
        Self {
            resolutions: Resolution::defaults(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

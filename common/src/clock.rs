use std::{
    sync::OnceLock,
    time::Instant,
};

use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;

use crate::schedule::minute_of_day;

/// 2021-01-01T00:00:00Z. Anything earlier means the wall clock was never set.
pub const MIN_VALID_EPOCH: i64 = 1_609_459_200;

pub fn is_valid_epoch(epoch: i64) -> bool {
    epoch >= MIN_VALID_EPOCH
}

/// Snapshot of every time source a control tick needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockReading {
    pub uptime_ms: u64,
    /// Wall-clock seconds once synced, otherwise a synthetic count.
    pub epoch: u32,
    pub synced: bool,
    pub local_time: Option<DateTime<FixedOffset>>,
}

impl ClockReading {
    pub fn local_minute(&self) -> Option<u16> {
        self.local_time.as_ref().map(minute_of_day)
    }
}

pub trait Clock {
    fn read(&mut self) -> ClockReading;
}

/// Keeps the second counter continuous across loss of wall-clock sync by
/// remembering the epoch at boot.
#[derive(Debug, Clone, Default)]
pub struct EpochTracker {
    boot_epoch_base: Option<i64>,
}

impl EpochTracker {
    pub fn epoch_or_synthetic(&mut self, uptime_ms: u64, wall_epoch: i64) -> u32 {
        let uptime_sec = (uptime_ms / 1000) as i64;
        let seconds = if is_valid_epoch(wall_epoch) {
            self.boot_epoch_base = Some(wall_epoch - uptime_sec);
            wall_epoch
        } else if let Some(base) = self.boot_epoch_base {
            base + uptime_sec
        } else {
            uptime_sec
        };
        seconds.clamp(0, i64::from(u32::MAX)) as u32
    }

    pub fn has_synced(&self) -> bool {
        self.boot_epoch_base.is_some()
    }
}

/// Wall clock plus monotonic uptime, localized to an IANA timezone.
#[derive(Debug, Clone)]
pub struct SystemClock {
    timezone: Tz,
    tracker: EpochTracker,
}

impl SystemClock {
    pub fn new(timezone: &str) -> Self {
        Self {
            timezone: timezone.parse().unwrap_or(Tz::UTC),
            tracker: EpochTracker::default(),
        }
    }

    pub fn timezone(&self) -> &'static str {
        self.timezone.name()
    }
}

impl Clock for SystemClock {
    fn read(&mut self) -> ClockReading {
        let uptime_ms = monotonic_ms();
        let now = Utc::now();
        let synced = is_valid_epoch(now.timestamp());
        let epoch = self.tracker.epoch_or_synthetic(uptime_ms, now.timestamp());
        let local_time = synced.then(|| localize(now, self.timezone));

        ClockReading {
            uptime_ms,
            epoch,
            synced,
            local_time,
        }
    }
}

pub fn localize(now: DateTime<Utc>, timezone: Tz) -> DateTime<FixedOffset> {
    let local = now.with_timezone(&timezone);
    local.with_timezone(&local.offset().fix())
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn valid_epoch_passes_through() {
        let mut tracker = EpochTracker::default();
        assert_eq!(tracker.epoch_or_synthetic(5_000, 1_700_000_000), 1_700_000_000);
        assert!(tracker.has_synced());
    }

    #[test]
    fn unsynced_clock_counts_uptime_seconds() {
        let mut tracker = EpochTracker::default();
        assert_eq!(tracker.epoch_or_synthetic(42_999, 0), 42);
        assert!(!tracker.has_synced());
    }

    #[test]
    fn lost_sync_continues_from_boot_base() {
        let mut tracker = EpochTracker::default();
        tracker.epoch_or_synthetic(10_000, 1_700_000_000);

        // Wall clock reverts to 1970 an hour later.
        assert_eq!(tracker.epoch_or_synthetic(3_610_000, 3600), 1_700_003_600);
    }

    #[test]
    fn localize_applies_zone_offset() {
        let utc = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();
        let local = localize(utc, chrono_tz::Europe::Berlin);
        assert_eq!(minute_of_day(&local), 14 * 60);
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        assert_eq!(SystemClock::new("Mars/Olympus").timezone(), "UTC");
        assert_eq!(SystemClock::new("Europe/Berlin").timezone(), "Europe/Berlin");
    }

    #[test]
    fn reading_exposes_local_minute() {
        let reading = ClockReading {
            uptime_ms: 0,
            epoch: 0,
            synced: true,
            local_time: Some(
                FixedOffset::east_opt(0)
                    .unwrap()
                    .with_ymd_and_hms(2026, 1, 1, 6, 15, 0)
                    .unwrap(),
            ),
        };
        assert_eq!(reading.local_minute(), Some(375));
    }
}

use chrono::{DateTime, Duration, FixedOffset, TimeZone, Timelike};

use crate::{settings::Settings, types::Period};

pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Daily split between the day and night setpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub day_start_minute: u16,
    pub night_start_minute: u16,
}

impl DayWindow {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            day_start_minute: settings.day_start_minute(),
            night_start_minute: settings.night_start_minute(),
        }
    }

    /// Equal bounds mean the day period never ends.
    pub fn is_day_active(&self, minute_of_day: u16) -> bool {
        let start = self.day_start_minute;
        let end = self.night_start_minute;
        if start == end {
            true
        } else if start < end {
            minute_of_day >= start && minute_of_day < end
        } else {
            minute_of_day >= start || minute_of_day < end
        }
    }

    pub fn period_at(&self, minute_of_day: u16) -> Period {
        if self.is_day_active(minute_of_day) {
            Period::Day
        } else {
            Period::Night
        }
    }

    /// Epoch of the next day/night switch after `now`, or `None` when the
    /// window never switches.
    pub fn next_transition_epoch(&self, now: DateTime<FixedOffset>) -> Option<i64> {
        if self.day_start_minute == self.night_start_minute {
            return None;
        }

        let now_minute = minute_of_day(&now);
        let mut best: Option<DateTime<FixedOffset>> = None;

        for day_offset in 0..2i64 {
            for boundary in [self.day_start_minute, self.night_start_minute] {
                if day_offset == 0 && boundary <= now_minute {
                    continue;
                }

                let date = now.date_naive() + Duration::days(day_offset);
                let Some(naive) =
                    date.and_hms_opt(u32::from(boundary / 60), u32::from(boundary % 60), 0)
                else {
                    continue;
                };
                let Some(candidate) = now.offset().from_local_datetime(&naive).single() else {
                    continue;
                };

                if best.map(|current| candidate < current).unwrap_or(true) {
                    best = Some(candidate);
                }
            }
        }

        best.map(|dt| dt.timestamp())
    }
}

pub fn minute_of_day<Tz: TimeZone>(now: &DateTime<Tz>) -> u16 {
    (now.hour() * 60 + now.minute()) as u16
}

/// Setpoint in force at `minute_of_day`. Without a local time the day
/// setpoint applies.
pub fn effective_set_point(settings: &Settings, minute_of_day: Option<u16>) -> f32 {
    match minute_of_day.map(|minute| DayWindow::from_settings(settings).period_at(minute)) {
        Some(Period::Night) => settings.night_set_point(),
        Some(Period::Day) | None => settings.day_set_point(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(day_start: u16, night_start: u16) -> DayWindow {
        DayWindow {
            day_start_minute: day_start,
            night_start_minute: night_start,
        }
    }

    fn fixed_time(day: u32, hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, day, hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn equal_bounds_are_always_day() {
        let window = window(420, 420);
        assert!((0..MINUTES_PER_DAY).all(|minute| window.is_day_active(minute)));
    }

    #[test]
    fn plain_window_is_half_open() {
        let window = window(360, 1320);
        assert!(!window.is_day_active(359));
        assert!(window.is_day_active(360));
        assert!(window.is_day_active(1319));
        assert!(!window.is_day_active(1320));
    }

    #[test]
    fn window_wraps_past_midnight() {
        let window = window(1320, 360);
        assert!(window.is_day_active(1400));
        assert!(window.is_day_active(0));
        assert!(window.is_day_active(359));
        assert!(!window.is_day_active(360));
        assert!(!window.is_day_active(720));
    }

    #[test]
    fn effective_set_point_follows_period() {
        let settings = Settings::default();
        assert_eq!(effective_set_point(&settings, Some(12 * 60)), 21.0);
        assert_eq!(effective_set_point(&settings, Some(23 * 60)), 18.0);
        assert_eq!(effective_set_point(&settings, None), 21.0);
    }

    #[test]
    fn minute_of_day_uses_local_offset() {
        assert_eq!(minute_of_day(&fixed_time(5, 7, 30)), 450);
    }

    #[test]
    fn next_transition_same_day() {
        let window = window(360, 1320);
        let next = window.next_transition_epoch(fixed_time(5, 9, 0)).unwrap();
        assert_eq!(next, fixed_time(5, 22, 0).timestamp());
    }

    #[test]
    fn next_transition_rolls_to_tomorrow() {
        let window = window(360, 1320);
        let next = window.next_transition_epoch(fixed_time(5, 23, 0)).unwrap();
        assert_eq!(next, fixed_time(6, 6, 0).timestamp());
    }

    #[test]
    fn constant_window_has_no_transition() {
        assert_eq!(window(0, 0).next_transition_epoch(fixed_time(5, 1, 0)), None);
    }
}

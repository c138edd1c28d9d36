use std::ops::RangeInclusive;

use crate::config::ControllerConfig;

pub trait SensorReader {
    /// Latest trustworthy temperature in °C, `None` when the sensor is
    /// faulted or its reading went stale.
    fn last_temperature(&self, now_ms: u64) -> Option<f32>;
}

/// Most recent reading plus the rules that make it usable.
#[derive(Debug, Clone)]
pub struct LatestReading {
    reading: Option<(f32, u64)>,
    stale_after_ms: u64,
    valid_range: RangeInclusive<f32>,
}

impl LatestReading {
    pub fn new(stale_after_ms: u64, valid_range: RangeInclusive<f32>) -> Self {
        Self {
            reading: None,
            stale_after_ms,
            valid_range,
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(
            config.sensor_stale_timeout_ms,
            config.min_valid_temp_c..=config.max_valid_temp_c,
        )
    }

    /// Stores a reading. Out-of-range or non-finite values count as a fault
    /// and clear the previous reading. Returns whether it was accepted.
    pub fn record(&mut self, temperature_c: f32, now_ms: u64) -> bool {
        if temperature_c.is_finite() && self.valid_range.contains(&temperature_c) {
            self.reading = Some((temperature_c, now_ms));
            true
        } else {
            self.reading = None;
            false
        }
    }

    pub fn invalidate(&mut self) {
        self.reading = None;
    }

    pub fn last_update_ms(&self) -> Option<u64> {
        self.reading.map(|(_, at)| at)
    }
}

impl SensorReader for LatestReading {
    fn last_temperature(&self, now_ms: u64) -> Option<f32> {
        let (value, at) = self.reading?;
        (now_ms.saturating_sub(at) < self.stale_after_ms).then_some(value)
    }
}

pub const SI7021_ADDRESS: u8 = 0x40;
/// Measure temperature, no clock stretching.
pub const SI7021_MEASURE_TEMP: u8 = 0xF3;

/// Converts a raw Si7021 temperature word to °C.
pub fn si7021_celsius(raw: [u8; 2]) -> f32 {
    let code = u16::from_be_bytes(raw) & 0xFFFC;
    175.72 * f32::from(code) / 65_536.0 - 46.85
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader() -> LatestReading {
        LatestReading::new(30_000, -40.0..=125.0)
    }

    #[test]
    fn fresh_reading_is_returned() {
        let mut sensor = reader();
        assert_eq!(sensor.last_temperature(0), None);

        assert!(sensor.record(20.5, 1_000));
        assert_eq!(sensor.last_temperature(30_999), Some(20.5));
    }

    #[test]
    fn stale_reading_is_dropped() {
        let mut sensor = reader();
        sensor.record(20.5, 1_000);
        assert_eq!(sensor.last_temperature(31_000), None);
    }

    #[test]
    fn implausible_reading_clears_previous() {
        let mut sensor = reader();
        sensor.record(20.5, 1_000);

        assert!(!sensor.record(f32::NAN, 2_000));
        assert_eq!(sensor.last_temperature(2_000), None);

        sensor.record(20.5, 3_000);
        assert!(!sensor.record(300.0, 4_000));
        assert_eq!(sensor.last_temperature(4_000), None);
    }

    #[test]
    fn si7021_conversion() {
        let celsius = si7021_celsius([0x64, 0x60]);
        assert!((celsius - 22.05).abs() < 0.01, "{celsius}");
        // Status bits are ignored.
        assert_eq!(si7021_celsius([0x64, 0x63]), celsius);
    }
}

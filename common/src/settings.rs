use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::{
    error::{ConfigCorruption, SettingsError},
    types::ControlMode,
};

pub const SET_POINT_RANGE: RangeInclusive<f32> = 5.0..=35.0;
pub const HYSTERESIS_RANGE: RangeInclusive<f32> = 0.1..=5.0;
pub const MAX_BOOST_MINUTES: u16 = 240;
pub const LAST_MINUTE_OF_DAY: u16 = 24 * 60 - 1;

pub const SETTINGS_MAGIC: u32 = 0x4346_4721; // "CFG!"
pub const SETTINGS_VERSION: u16 = 3;

/// User-adjustable controller settings. Fields are private so every write
/// goes through a clamping setter.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    day_set_point: f32,
    night_set_point: f32,
    day_start_minute: u16,
    night_start_minute: u16,
    hysteresis: f32,
    boost_minutes: u16,
    boost_end_epoch: u32,
    requested_mode: ControlMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            day_set_point: 21.0,
            night_set_point: 18.0,
            day_start_minute: 6 * 60,
            night_start_minute: 22 * 60,
            hysteresis: 0.5,
            boost_minutes: 15,
            boost_end_epoch: 0,
            requested_mode: ControlMode::Auto,
        }
    }
}

impl Settings {
    pub fn day_set_point(&self) -> f32 {
        self.day_set_point
    }

    pub fn night_set_point(&self) -> f32 {
        self.night_set_point
    }

    pub fn day_start_minute(&self) -> u16 {
        self.day_start_minute
    }

    pub fn night_start_minute(&self) -> u16 {
        self.night_start_minute
    }

    pub fn hysteresis(&self) -> f32 {
        self.hysteresis
    }

    pub fn boost_minutes(&self) -> u16 {
        self.boost_minutes
    }

    /// Absolute end of the running boost in clock seconds, 0 when none.
    pub fn boost_end_epoch(&self) -> u32 {
        self.boost_end_epoch
    }

    pub fn requested_mode(&self) -> ControlMode {
        self.requested_mode
    }

    pub fn set_day_set_point(&mut self, value: f32) -> bool {
        update_clamped(&mut self.day_set_point, value, SET_POINT_RANGE)
    }

    pub fn set_night_set_point(&mut self, value: f32) -> bool {
        update_clamped(&mut self.night_set_point, value, SET_POINT_RANGE)
    }

    pub fn set_hysteresis(&mut self, value: f32) -> bool {
        update_clamped(&mut self.hysteresis, value, HYSTERESIS_RANGE)
    }

    pub fn set_boost_minutes(&mut self, minutes: i64) -> bool {
        let clamped = minutes.clamp(0, i64::from(MAX_BOOST_MINUTES)) as u16;
        replace(&mut self.boost_minutes, clamped)
    }

    pub fn set_day_start_minute(&mut self, minute: i64) -> bool {
        replace(&mut self.day_start_minute, clamp_minute(minute))
    }

    pub fn set_night_start_minute(&mut self, minute: i64) -> bool {
        replace(&mut self.night_start_minute, clamp_minute(minute))
    }

    pub fn set_boost_end_epoch(&mut self, epoch: u32) -> bool {
        replace(&mut self.boost_end_epoch, epoch)
    }

    pub fn clear_boost_end(&mut self) -> bool {
        replace(&mut self.boost_end_epoch, 0)
    }

    pub fn set_requested_mode(&mut self, mode: ControlMode) -> bool {
        replace(&mut self.requested_mode, mode)
    }
}

fn update_clamped(slot: &mut f32, value: f32, range: RangeInclusive<f32>) -> bool {
    if !value.is_finite() {
        return false;
    }
    let clamped = value.clamp(*range.start(), *range.end());
    if (*slot - clamped).abs() > f32::EPSILON {
        *slot = clamped;
        true
    } else {
        false
    }
}

fn clamp_minute(minute: i64) -> u16 {
    minute.clamp(0, i64::from(LAST_MINUTE_OF_DAY)) as u16
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot != value {
        *slot = value;
        true
    } else {
        false
    }
}

/// Versioned record written to non-volatile storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSettings {
    pub magic: u32,
    pub version: u16,
    #[serde(rename = "daySetPoint")]
    pub day_set_point: f32,
    #[serde(rename = "nightSetPoint")]
    pub night_set_point: f32,
    #[serde(rename = "dayStartMinute")]
    pub day_start_minute: u16,
    #[serde(rename = "nightStartMinute")]
    pub night_start_minute: u16,
    pub hysteresis: f32,
    #[serde(rename = "boostMinutes")]
    pub boost_minutes: u16,
    #[serde(rename = "boostEndEpoch")]
    pub boost_end_epoch: u32,
    pub mode: i64,
}

impl From<&Settings> for PersistedSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            magic: SETTINGS_MAGIC,
            version: SETTINGS_VERSION,
            day_set_point: settings.day_set_point,
            night_set_point: settings.night_set_point,
            day_start_minute: settings.day_start_minute,
            night_start_minute: settings.night_start_minute,
            hysteresis: settings.hysteresis,
            boost_minutes: settings.boost_minutes,
            boost_end_epoch: settings.boost_end_epoch,
            mode: i64::from(settings.requested_mode.code()),
        }
    }
}

impl PersistedSettings {
    /// Rejects the record instead of clamping it: a stored value outside
    /// its range means the record was not written by us.
    pub fn into_settings(self) -> Result<Settings, ConfigCorruption> {
        if self.magic != SETTINGS_MAGIC {
            return Err(ConfigCorruption::BadMagic(self.magic));
        }
        if self.version != SETTINGS_VERSION {
            return Err(ConfigCorruption::BadVersion(self.version));
        }
        check_range("daySetPoint", self.day_set_point, &SET_POINT_RANGE)?;
        check_range("nightSetPoint", self.night_set_point, &SET_POINT_RANGE)?;
        check_range("hysteresis", self.hysteresis, &HYSTERESIS_RANGE)?;
        if self.day_start_minute > LAST_MINUTE_OF_DAY {
            return Err(ConfigCorruption::OutOfRange("dayStartMinute"));
        }
        if self.night_start_minute > LAST_MINUTE_OF_DAY {
            return Err(ConfigCorruption::OutOfRange("nightStartMinute"));
        }
        if self.boost_minutes > MAX_BOOST_MINUTES {
            return Err(ConfigCorruption::OutOfRange("boostMinutes"));
        }

        Ok(Settings {
            day_set_point: self.day_set_point,
            night_set_point: self.night_set_point,
            day_start_minute: self.day_start_minute,
            night_start_minute: self.night_start_minute,
            hysteresis: self.hysteresis,
            boost_minutes: self.boost_minutes,
            boost_end_epoch: self.boost_end_epoch,
            requested_mode: ControlMode::from_code(self.mode),
        })
    }
}

fn check_range(
    field: &'static str,
    value: f32,
    range: &RangeInclusive<f32>,
) -> Result<(), ConfigCorruption> {
    if value.is_finite() && range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigCorruption::OutOfRange(field))
    }
}

pub fn encode_settings(settings: &Settings) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&PersistedSettings::from(settings))
}

pub fn decode_settings(raw: &[u8]) -> Result<Settings, ConfigCorruption> {
    let record: PersistedSettings = serde_json::from_slice(raw)
        .map_err(|err| ConfigCorruption::Unparsable(err.to_string()))?;
    record.into_settings()
}

pub trait SettingsStore {
    /// Always yields usable settings; defaults replace a corrupt record.
    fn load(&mut self) -> Settings;
    fn save(&mut self, settings: &Settings) -> Result<(), SettingsError>;
}

/// Raw record storage underneath [`RecordSettingsStore`].
pub trait SettingsBackend {
    fn read_record(&mut self) -> Result<Option<Vec<u8>>, SettingsError>;
    fn write_record(&mut self, record: &[u8]) -> Result<(), SettingsError>;
}

#[derive(Debug)]
pub enum LoadOutcome {
    Loaded,
    /// Nothing stored yet; defaults were written.
    Missing,
    /// Stored record rejected; defaults were written over it.
    Reset(ConfigCorruption),
    /// Storage could not be read; defaults are used but nothing is written.
    ReadFailed(SettingsError),
}

#[derive(Debug)]
pub struct LoadReport {
    pub outcome: LoadOutcome,
    pub save_error: Option<SettingsError>,
}

#[derive(Debug, Default)]
pub struct RecordSettingsStore<B> {
    backend: B,
}

impl<B: SettingsBackend> RecordSettingsStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn load_with_report(&mut self) -> (Settings, LoadReport) {
        let outcome = match self.backend.read_record() {
            Ok(Some(raw)) => match decode_settings(&raw) {
                Ok(settings) => {
                    return (
                        settings,
                        LoadReport {
                            outcome: LoadOutcome::Loaded,
                            save_error: None,
                        },
                    )
                }
                Err(corruption) => LoadOutcome::Reset(corruption),
            },
            Ok(None) => LoadOutcome::Missing,
            Err(err) => {
                return (
                    Settings::default(),
                    LoadReport {
                        outcome: LoadOutcome::ReadFailed(err),
                        save_error: None,
                    },
                )
            }
        };

        let defaults = Settings::default();
        let save_error = self.save(&defaults).err();
        (
            defaults,
            LoadReport {
                outcome,
                save_error,
            },
        )
    }
}

impl<B: SettingsBackend> SettingsStore for RecordSettingsStore<B> {
    fn load(&mut self) -> Settings {
        self.load_with_report().0
    }

    fn save(&mut self, settings: &Settings) -> Result<(), SettingsError> {
        let record = encode_settings(settings)?;
        self.backend.write_record(&record)
    }
}

/// Volatile backend for tests and bring-up without flash.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    pub record: Option<Vec<u8>>,
    pub fail_writes: bool,
    pub writes: usize,
}

impl SettingsBackend for MemoryBackend {
    fn read_record(&mut self) -> Result<Option<Vec<u8>>, SettingsError> {
        Ok(self.record.clone())
    }

    fn write_record(&mut self, record: &[u8]) -> Result<(), SettingsError> {
        if self.fail_writes {
            return Err(SettingsError::Backend("memory backend rejects writes".into()));
        }
        self.record = Some(record.to_vec());
        self.writes += 1;
        Ok(())
    }
}

pub type MemorySettingsStore = RecordSettingsStore<MemoryBackend>;

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn stored(record: &PersistedSettings) -> MemorySettingsStore {
        RecordSettingsStore::new(MemoryBackend {
            record: Some(serde_json::to_vec(record).unwrap()),
            ..MemoryBackend::default()
        })
    }

    #[test]
    fn setters_clamp_out_of_range_values() {
        let mut settings = Settings::default();

        assert!(settings.set_day_set_point(100.0));
        assert_eq!(settings.day_set_point(), 35.0);
        assert!(settings.set_night_set_point(-5.0));
        assert_eq!(settings.night_set_point(), 5.0);
        assert!(settings.set_boost_minutes(9999));
        assert_eq!(settings.boost_minutes(), 240);
        assert!(settings.set_boost_minutes(-3));
        assert_eq!(settings.boost_minutes(), 0);
        assert!(settings.set_hysteresis(0.0));
        assert_eq!(settings.hysteresis(), 0.1);
        assert!(settings.set_day_start_minute(5000));
        assert_eq!(settings.day_start_minute(), 1439);
        assert!(settings.set_night_start_minute(-1));
        assert_eq!(settings.night_start_minute(), 0);
    }

    #[test]
    fn setters_report_unchanged_values() {
        let mut settings = Settings::default();
        assert!(!settings.set_day_set_point(21.0));
        assert!(!settings.set_requested_mode(ControlMode::Auto));
        assert!(settings.set_requested_mode(ControlMode::Off));
    }

    #[test]
    fn non_finite_values_are_ignored() {
        let mut settings = Settings::default();
        assert!(!settings.set_day_set_point(f32::NAN));
        assert!(!settings.set_hysteresis(f32::INFINITY));
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn saved_settings_load_back() {
        let mut store = MemorySettingsStore::default();
        let mut settings = Settings::default();
        settings.set_day_set_point(22.5);
        settings.set_requested_mode(ControlMode::Boost);
        settings.set_boost_end_epoch(1_700_000_000);

        store.save(&settings).unwrap();
        let (loaded, report) = store.load_with_report();

        assert_eq!(loaded, settings);
        assert!(matches!(report.outcome, LoadOutcome::Loaded));
        assert_eq!(store.backend().writes, 1);
    }

    #[test]
    fn missing_record_writes_defaults() {
        let mut store = MemorySettingsStore::default();
        let (loaded, report) = store.load_with_report();

        assert_eq!(loaded, Settings::default());
        assert!(matches!(report.outcome, LoadOutcome::Missing));
        assert!(report.save_error.is_none());
        assert_eq!(store.backend().writes, 1);
    }

    #[test]
    fn bad_magic_resets_to_defaults() {
        let mut record = PersistedSettings::from(&Settings::default());
        record.magic = 0xDEAD_BEEF;
        record.day_set_point = 30.0;
        let mut store = stored(&record);

        let (loaded, report) = store.load_with_report();

        assert_eq!(loaded, Settings::default());
        assert!(matches!(
            report.outcome,
            LoadOutcome::Reset(ConfigCorruption::BadMagic(0xDEAD_BEEF))
        ));
        let rewritten = decode_settings(store.backend().record.as_deref().unwrap()).unwrap();
        assert_eq!(rewritten, Settings::default());
    }

    #[test]
    fn out_of_range_field_is_corruption() {
        let mut record = PersistedSettings::from(&Settings::default());
        record.hysteresis = 9.0;

        assert_eq!(
            record.into_settings(),
            Err(ConfigCorruption::OutOfRange("hysteresis"))
        );
    }

    #[test]
    fn old_version_is_corruption() {
        let mut record = PersistedSettings::from(&Settings::default());
        record.version = 2;
        assert_eq!(record.into_settings(), Err(ConfigCorruption::BadVersion(2)));
    }

    #[test]
    fn garbage_record_is_corruption() {
        let mut store = RecordSettingsStore::new(MemoryBackend {
            record: Some(b"{\"magic\":".to_vec()),
            ..MemoryBackend::default()
        });

        let (loaded, report) = store.load_with_report();

        assert_eq!(loaded, Settings::default());
        assert!(matches!(
            report.outcome,
            LoadOutcome::Reset(ConfigCorruption::Unparsable(_))
        ));
    }

    #[test]
    fn unknown_mode_code_loads_as_off() {
        let mut record = PersistedSettings::from(&Settings::default());
        record.mode = 1;
        let settings = record.into_settings().unwrap();
        assert_eq!(settings.requested_mode(), ControlMode::Off);
    }

    #[test]
    fn read_failure_keeps_storage_untouched() {
        struct Broken {
            writes: usize,
        }

        impl SettingsBackend for Broken {
            fn read_record(&mut self) -> Result<Option<Vec<u8>>, SettingsError> {
                Err(SettingsError::Backend("flash offline".into()))
            }

            fn write_record(&mut self, _record: &[u8]) -> Result<(), SettingsError> {
                self.writes += 1;
                Ok(())
            }
        }

        let mut store = RecordSettingsStore::new(Broken { writes: 0 });
        let (loaded, report) = store.load_with_report();

        assert_eq!(loaded, Settings::default());
        assert!(matches!(report.outcome, LoadOutcome::ReadFailed(_)));
        assert_eq!(store.backend().writes, 0);
    }

    #[test]
    fn failed_default_write_is_reported() {
        let mut store = RecordSettingsStore::new(MemoryBackend {
            fail_writes: true,
            ..MemoryBackend::default()
        });

        let (_, report) = store.load_with_report();

        assert!(matches!(report.outcome, LoadOutcome::Missing));
        assert!(matches!(report.save_error, Some(SettingsError::Backend(_))));
    }
}

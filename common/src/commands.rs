use serde::Deserialize;

use crate::{settings::Settings, types::ControlMode};

/// Largest MQTT command payload accepted.
pub const MAX_COMMAND_BYTES: usize = 512;

/// Mode given either as its integer code or by name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ModeValue {
    Code(i64),
    Name(String),
}

impl ModeValue {
    /// Unknown codes map to `Off` like a stored record would; unknown names
    /// are ignored.
    pub fn resolve(&self) -> Option<ControlMode> {
        match self {
            Self::Code(code) => Some(ControlMode::from_code(*code)),
            Self::Name(name) => ControlMode::parse(name),
        }
    }
}

/// Partial settings update shared by `POST /api/config` and `<base>/cmd`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SettingsCommand {
    /// Sets both day and night setpoints.
    #[serde(rename = "setPoint")]
    pub set_point: Option<f32>,
    #[serde(rename = "daySetPoint")]
    pub day_set_point: Option<f32>,
    #[serde(rename = "nightSetPoint")]
    pub night_set_point: Option<f32>,
    pub hysteresis: Option<f32>,
    #[serde(rename = "boostMinutes")]
    pub boost_minutes: Option<i64>,
    #[serde(rename = "dayStartMinute")]
    pub day_start_minute: Option<i64>,
    #[serde(rename = "nightStartMinute")]
    pub night_start_minute: Option<i64>,
    pub mode: Option<ModeValue>,
}

impl SettingsCommand {
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Applies every present field through the clamping setters. Returns
    /// whether anything changed.
    pub fn apply(&self, settings: &mut Settings) -> bool {
        let mut changed = false;

        if let Some(value) = self.set_point {
            changed |= settings.set_day_set_point(value);
            changed |= settings.set_night_set_point(value);
        }
        if let Some(value) = self.day_set_point {
            changed |= settings.set_day_set_point(value);
        }
        if let Some(value) = self.night_set_point {
            changed |= settings.set_night_set_point(value);
        }
        if let Some(value) = self.hysteresis {
            changed |= settings.set_hysteresis(value);
        }
        if let Some(value) = self.boost_minutes {
            changed |= settings.set_boost_minutes(value);
        }
        if let Some(value) = self.day_start_minute {
            changed |= settings.set_day_start_minute(value);
        }
        if let Some(value) = self.night_start_minute {
            changed |= settings.set_night_start_minute(value);
        }
        if let Some(mode) = self.mode.as_ref().and_then(ModeValue::resolve) {
            changed |= settings.set_requested_mode(mode);
        }

        changed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NudgeField {
    DaySetPoint,
    NightSetPoint,
    Hysteresis,
    BoostMinutes,
}

impl NudgeField {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "daySetPoint" | "setPoint" | "sp" => Some(Self::DaySetPoint),
            "nightSetPoint" => Some(Self::NightSetPoint),
            "hysteresis" | "hy" => Some(Self::Hysteresis),
            "boostMinutes" | "boost" => Some(Self::BoostMinutes),
            _ => None,
        }
    }
}

/// Relative adjustment, clamped like any other write.
pub fn nudge(settings: &mut Settings, field: NudgeField, delta: f32) -> bool {
    if !delta.is_finite() {
        return false;
    }
    match field {
        NudgeField::DaySetPoint => settings.set_day_set_point(settings.day_set_point() + delta),
        NudgeField::NightSetPoint => {
            settings.set_night_set_point(settings.night_set_point() + delta)
        }
        NudgeField::Hysteresis => settings.set_hysteresis(settings.hysteresis() + delta),
        NudgeField::BoostMinutes => settings
            .set_boost_minutes(i64::from(settings.boost_minutes()) + delta.round() as i64),
    }
}

/// Starts (or restarts) a boost of the configured length from `now_epoch`.
pub fn start_boost(settings: &mut Settings, now_epoch: u32) -> bool {
    let end = now_epoch
        .saturating_add(u32::from(settings.boost_minutes()) * 60)
        .max(1);
    let mut changed = settings.set_boost_end_epoch(end);
    changed |= settings.set_requested_mode(ControlMode::Boost);
    changed
}

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlMode {
    Auto,
    Off,
    Boost,
}

impl ControlMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Off => "OFF",
            Self::Boost => "BOOST",
        }
    }

    /// Integer code used by the persisted settings record and the MQTT
    /// `mode` field. Code 1 belonged to the retired manual mode.
    pub fn code(self) -> u8 {
        match self {
            Self::Auto => 0,
            Self::Off => 2,
            Self::Boost => 3,
        }
    }

    /// Unknown codes fall back to `Off` so a bad record can never start
    /// the heater.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Auto,
            3 => Self::Boost,
            _ => Self::Off,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "AUTO" => Some(Self::Auto),
            "OFF" => Some(Self::Off),
            "BOOST" => Some(Self::Boost),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiagnosticState {
    Idle,
    Heating,
    Error,
}

impl DiagnosticState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Heating => "HEATING",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Day,
    Night,
}

impl Period {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "DAY",
            Self::Night => "NIGHT",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub temperature: Option<f32>,
    #[serde(rename = "sensorValid")]
    pub sensor_valid: bool,
    #[serde(rename = "daySetPoint")]
    pub day_set_point: f32,
    #[serde(rename = "nightSetPoint")]
    pub night_set_point: f32,
    #[serde(rename = "setPoint")]
    pub effective_set_point: f32,
    pub period: &'static str,
    /// Next day/night switch; absent without local time or with a constant window.
    #[serde(rename = "nextPeriodChange")]
    pub next_period_change: Option<i64>,
    pub hysteresis: f32,
    #[serde(rename = "boostMinutes")]
    pub boost_minutes: u16,
    #[serde(rename = "boostRemainingSec")]
    pub boost_remaining_sec: u32,
    #[serde(rename = "dayStartMinute")]
    pub day_start_minute: u16,
    #[serde(rename = "nightStartMinute")]
    pub night_start_minute: u16,
    #[serde(rename = "requestedMode")]
    pub requested_mode: &'static str,
    #[serde(rename = "activeMode")]
    pub active_mode: &'static str,
    pub state: &'static str,
    #[serde(rename = "heaterOn")]
    pub heater_on: bool,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    #[serde(rename = "nowEpoch")]
    pub now_epoch: u32,
    pub timezone: String,
    #[serde(rename = "historyEnabled")]
    pub history_enabled: bool,
    #[serde(rename = "historyCount")]
    pub history_count: u32,
}

/// Retained `<base>/state` payload.
#[derive(Debug, Clone, Serialize)]
pub struct StatePayload {
    #[serde(rename = "setPoint")]
    pub set_point: f32,
    #[serde(rename = "daySetPoint")]
    pub day_set_point: f32,
    #[serde(rename = "nightSetPoint")]
    pub night_set_point: f32,
    pub hysteresis: f32,
    #[serde(rename = "boostMinutes")]
    pub boost_minutes: u16,
    #[serde(rename = "dayStartMinute")]
    pub day_start_minute: u16,
    #[serde(rename = "nightStartMinute")]
    pub night_start_minute: u16,
    pub mode: &'static str,
    pub state: &'static str,
}

/// Retained `<base>/telemetry` payload.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryPayload {
    pub temp: Option<f32>,
    pub state: &'static str,
    pub mode: &'static str,
    pub heater: bool,
}

/// One entry of the `/history.json` array. Temperatures stay in
/// centi-degrees as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistoryPoint {
    pub ts: u32,
    pub t: i16,
    pub sp: i16,
    pub hy: i16,
    pub h: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeStatus {
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub timezone: String,
    #[serde(rename = "nowEpoch")]
    pub now_epoch: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_mode_codes_decode_to_off() {
        assert_eq!(ControlMode::from_code(0), ControlMode::Auto);
        assert_eq!(ControlMode::from_code(1), ControlMode::Off);
        assert_eq!(ControlMode::from_code(2), ControlMode::Off);
        assert_eq!(ControlMode::from_code(3), ControlMode::Boost);
        assert_eq!(ControlMode::from_code(-7), ControlMode::Off);
        assert_eq!(ControlMode::from_code(42), ControlMode::Off);
    }

    #[test]
    fn mode_codes_round_trip() {
        for mode in [ControlMode::Auto, ControlMode::Off, ControlMode::Boost] {
            assert_eq!(ControlMode::from_code(i64::from(mode.code())), mode);
        }
    }

    #[test]
    fn mode_names_parse_case_insensitively() {
        assert_eq!(ControlMode::parse("boost"), Some(ControlMode::Boost));
        assert_eq!(ControlMode::parse(" Auto "), Some(ControlMode::Auto));
        assert_eq!(ControlMode::parse("manual"), None);
    }
}

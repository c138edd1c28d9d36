use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{history::DEFAULT_CAPACITY, topics::DEFAULT_BASE_TOPIC};

pub const DEFAULT_TIMEZONE: &str = "Europe/Berlin";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub evaluation_interval_ms: u64,
    pub sensor_read_interval_ms: u64,
    pub sensor_stale_timeout_ms: u64,
    pub min_valid_temp_c: f32,
    pub max_valid_temp_c: f32,
    pub state_publish_interval_ms: u64,
    pub history_interval_minutes: u32,
    pub history_capacity: u32,
    pub history_file: String,
    pub history_default_days: i64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_ms: 2_000,
            sensor_read_interval_ms: 5_000,
            sensor_stale_timeout_ms: 30_000,
            min_valid_temp_c: -40.0,
            max_valid_temp_c: 125.0,
            state_publish_interval_ms: 10_000,
            history_interval_minutes: 5,
            history_capacity: DEFAULT_CAPACITY,
            history_file: "hist.bin".to_string(),
            history_default_days: 5,
        }
    }
}

impl ControllerConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        self.evaluation_interval_ms = self.evaluation_interval_ms.clamp(250, 60_000);
        self.sensor_read_interval_ms = self.sensor_read_interval_ms.clamp(1_000, 300_000);
        self.sensor_stale_timeout_ms = self
            .sensor_stale_timeout_ms
            .max(self.sensor_read_interval_ms * 2);
        if !self.min_valid_temp_c.is_finite()
            || !self.max_valid_temp_c.is_finite()
            || self.min_valid_temp_c >= self.max_valid_temp_c
        {
            self.min_valid_temp_c = defaults.min_valid_temp_c;
            self.max_valid_temp_c = defaults.max_valid_temp_c;
        }
        self.state_publish_interval_ms = self.state_publish_interval_ms.clamp(1_000, 3_600_000);
        self.history_interval_minutes = self.history_interval_minutes.min(24 * 60);
        self.history_capacity = self.history_capacity.clamp(1, 100_000);
        if self.history_file.trim().is_empty() {
            self.history_file = defaults.history_file;
        }
        self.history_default_days = self.history_default_days.clamp(1, 14);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub base_topic: String,
    pub client_id: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            base_topic: DEFAULT_BASE_TOPIC.to_string(),
            client_id: "heatctl".to_string(),
            http_port: 80,
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        let trimmed = self.base_topic.trim().trim_end_matches('/');
        self.base_topic = if trimmed.is_empty() {
            DEFAULT_BASE_TOPIC.to_string()
        } else {
            trimmed.to_string()
        };
        if self.client_id.trim().is_empty() {
            self.client_id = "heatctl".to_string();
        }
        if self.mqtt_port == 0 {
            self.mqtt_port = 1883;
        }
    }

    pub fn mqtt_enabled(&self) -> bool {
        !self.mqtt_host.trim().is_empty()
    }
}

/// Board wiring. Active levels cover relay modules that switch on low.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HardwareConfig {
    pub relay_pin: i32,
    pub relay_active_high: bool,
    pub led_pin: i32,
    pub led_active_high: bool,
    pub i2c_sda_pin: i32,
    pub i2c_scl_pin: i32,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            relay_pin: 26,
            relay_active_high: true,
            led_pin: 2,
            led_active_high: true,
            i2c_sda_pin: 21,
            i2c_scl_pin: 22,
        }
    }
}

impl HardwareConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if !(0..=39).contains(&self.relay_pin) {
            self.relay_pin = defaults.relay_pin;
        }
        if !(0..=39).contains(&self.led_pin) {
            self.led_pin = defaults.led_pin;
        }
        if !(0..=39).contains(&self.i2c_sda_pin) {
            self.i2c_sda_pin = defaults.i2c_sda_pin;
        }
        if !(0..=39).contains(&self.i2c_scl_pin) {
            self.i2c_scl_pin = defaults.i2c_scl_pin;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub controller: ControllerConfig,
    pub timezone: String,
    pub network: NetworkConfig,
    pub hardware: HardwareConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            network: NetworkConfig::default(),
            hardware: HardwareConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.controller.sanitize();
        self.network.sanitize();
        self.hardware.sanitize();
        if self.timezone.parse::<Tz>().is_err() {
            self.timezone = DEFAULT_TIMEZONE.to_string();
        }
    }
}

pub const DEFAULT_BASE_TOPIC: &str = "heating";

pub fn command_topic(base: &str) -> String {
    format!("{base}/cmd")
}

pub fn state_topic(base: &str) -> String {
    format!("{base}/state")
}

pub fn telemetry_topic(base: &str) -> String {
    format!("{base}/telemetry")
}

/// Plain-text °C readings pushed by an external sensor node.
pub fn sensor_temperature_topic(base: &str) -> String {
    format!("{base}/sensor/temperature")
}

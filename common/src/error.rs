use std::io;

use thiserror::Error;

/// Failures of the settings persistence layer. Callers log these and keep
/// running with the in-memory settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings storage I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("settings record could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("settings backend error: {0}")]
    Backend(String),
}

/// Why a stored settings record was rejected on load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigCorruption {
    #[error("settings record is not valid JSON: {0}")]
    Unparsable(String),
    #[error("settings magic {0:#010x} does not match")]
    BadMagic(u32),
    #[error("settings version {0} is not supported")]
    BadVersion(u16),
    #[error("settings field `{0}` is out of range")]
    OutOfRange(&'static str),
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history storage I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("history storage is unavailable")]
    Unavailable,
    #[error("history capacity must be at least one record")]
    ZeroCapacity,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("relay write failed: {0}")]
pub struct RelayError(pub String);

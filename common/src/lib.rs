pub mod backoff;
pub mod clock;
pub mod commands;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod history;
pub mod schedule;
pub mod sensor;
pub mod settings;
pub mod topics;
pub mod types;

pub use backoff::Backoff;
pub use clock::{Clock, ClockReading, EpochTracker, SystemClock};
pub use commands::{NudgeField, SettingsCommand};
pub use config::{ControllerConfig, HardwareConfig, NetworkConfig, RuntimeConfig};
pub use controller::{HeaterRelay, HeatingController, TickReport};
pub use engine::{ControlEngine, EngineAction, EngineInput, Evaluation};
pub use error::{ConfigCorruption, HistoryError, RelayError, SettingsError};
pub use history::{
    HistoryLog, HistoryRecorder, HistorySample, HistorySampler, OpenOutcome, RecordOutcome,
};
pub use settings::{
    LoadOutcome, LoadReport, RecordSettingsStore, Settings, SettingsBackend, SettingsStore,
};
pub use topics::*;
pub use types::{
    ControlMode, ControllerStatus, DiagnosticState, HistoryPoint, StatePayload,
    TelemetryPayload, TimeStatus,
};

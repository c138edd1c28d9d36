use std::io::{Read, Seek, Write};

use crate::{
    clock::ClockReading,
    commands::{self, NudgeField, SettingsCommand},
    config::ControllerConfig,
    engine::{ControlEngine, EngineAction, EngineInput, Evaluation},
    error::{HistoryError, RelayError, SettingsError},
    history::{records_for_days, HistoryRecorder, HistorySample, RecordOutcome},
    schedule::{effective_set_point, DayWindow},
    sensor::{LatestReading, SensorReader},
    settings::{Settings, SettingsStore},
    types::{
        ControlMode, ControllerStatus, HistoryPoint, Period, StatePayload, TelemetryPayload,
        TimeStatus,
    },
};

pub trait HeaterRelay {
    fn set(&mut self, on: bool) -> Result<(), RelayError>;
}

/// What one [`HeatingController::tick`] did. Nothing in here is fatal; the
/// caller logs it.
#[derive(Debug)]
pub struct TickReport {
    pub evaluation: Option<Evaluation>,
    pub heater_changed: Option<bool>,
    pub relay_error: Option<RelayError>,
    pub persist_error: Option<SettingsError>,
    pub history: RecordOutcome,
}

/// Owns every piece of controller state. Adapters reach it only through
/// its methods, from a single thread.
pub struct HeatingController<S, R, F> {
    config: ControllerConfig,
    timezone: String,
    engine: ControlEngine,
    settings: Settings,
    store: S,
    relay: R,
    sensor: LatestReading,
    history: HistoryRecorder<F>,
}

impl<S, R, F> HeatingController<S, R, F>
where
    S: SettingsStore,
    R: HeaterRelay,
    F: Read + Write + Seek,
{
    /// `relay` must already be off; the engine starts from that assumption.
    pub fn new(
        config: ControllerConfig,
        timezone: impl Into<String>,
        settings: Settings,
        store: S,
        relay: R,
        history: HistoryRecorder<F>,
    ) -> Self {
        Self {
            engine: ControlEngine::new(settings.requested_mode(), config.evaluation_interval_ms),
            sensor: LatestReading::from_config(&config),
            config,
            timezone: timezone.into(),
            settings,
            store,
            relay,
            history,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn engine(&self) -> &ControlEngine {
        &self.engine
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn record_temperature(&mut self, temperature_c: f32, now_ms: u64) -> bool {
        self.sensor.record(temperature_c, now_ms)
    }

    pub fn mark_sensor_fault(&mut self) {
        self.sensor.invalidate();
    }

    /// One cooperative step: at most one engine evaluation and at most one
    /// history append, each on its own cadence.
    pub fn tick(&mut self, clock: &ClockReading) -> TickReport {
        let now_ms = clock.uptime_ms;
        let minute = clock.local_minute();
        let temperature = self.sensor.last_temperature(now_ms);

        let mut report = TickReport {
            evaluation: None,
            heater_changed: None,
            relay_error: None,
            persist_error: None,
            history: RecordOutcome::NotDue,
        };

        let input = EngineInput {
            now_epoch: clock.epoch,
            temperature_c: temperature,
            minute_of_day: minute,
        };
        if let Some(evaluation) = self.engine.tick(now_ms, input, &mut self.settings) {
            for action in &evaluation.actions {
                match *action {
                    EngineAction::Relay(on) => {
                        report.heater_changed = Some(on);
                        if let Err(err) = self.relay.set(on) {
                            self.engine.relay_write_failed();
                            report.relay_error = Some(err);
                        }
                    }
                    EngineAction::PersistSettings => {
                        if let Err(err) = self.store.save(&self.settings) {
                            report.persist_error = Some(err);
                        }
                    }
                }
            }
            report.evaluation = Some(evaluation);
        }

        let heater_on = self.engine.is_heater_on();
        let set_point = effective_set_point(&self.settings, minute);
        let hysteresis = self.settings.hysteresis();
        report.history = self.history.record_if_due(now_ms, || {
            temperature.map(|t| HistorySample::new(clock.epoch, t, set_point, hysteresis, heater_on))
        });

        report
    }

    /// Applies a partial update and persists it when anything changed.
    pub fn apply_command(&mut self, command: &SettingsCommand) -> Result<bool, SettingsError> {
        let changed = command.apply(&mut self.settings);
        self.persist_if(changed)
    }

    pub fn nudge(&mut self, field: NudgeField, delta: f32) -> Result<bool, SettingsError> {
        let changed = commands::nudge(&mut self.settings, field, delta);
        self.persist_if(changed)
    }

    pub fn start_boost(&mut self, now_epoch: u32) -> Result<bool, SettingsError> {
        let changed = commands::start_boost(&mut self.settings, now_epoch);
        self.persist_if(changed)
    }

    fn persist_if(&mut self, changed: bool) -> Result<bool, SettingsError> {
        if changed {
            self.store.save(&self.settings)?;
        }
        Ok(changed)
    }

    /// Drives the relay off ahead of a controlled stop.
    pub fn shutdown(&mut self) -> Result<(), RelayError> {
        self.relay.set(false)
    }

    pub fn status(&self, clock: &ClockReading) -> ControllerStatus {
        let minute = clock.local_minute();
        let window = DayWindow::from_settings(&self.settings);
        let period = minute.map(|m| window.period_at(m)).unwrap_or(Period::Day);
        let next_period_change = clock
            .local_time
            .and_then(|now| window.next_transition_epoch(now));
        let temperature = self.sensor.last_temperature(clock.uptime_ms);
        let boost_remaining_sec = if self.engine.active_mode() == ControlMode::Boost {
            self.settings.boost_end_epoch().saturating_sub(clock.epoch)
        } else {
            0
        };

        ControllerStatus {
            temperature,
            sensor_valid: temperature.is_some(),
            day_set_point: self.settings.day_set_point(),
            night_set_point: self.settings.night_set_point(),
            effective_set_point: effective_set_point(&self.settings, minute),
            period: period.as_str(),
            next_period_change,
            hysteresis: self.settings.hysteresis(),
            boost_minutes: self.settings.boost_minutes(),
            boost_remaining_sec,
            day_start_minute: self.settings.day_start_minute(),
            night_start_minute: self.settings.night_start_minute(),
            requested_mode: self.settings.requested_mode().as_str(),
            active_mode: self.engine.active_mode().as_str(),
            state: self.engine.state().as_str(),
            heater_on: self.engine.is_heater_on(),
            time_synced: clock.synced,
            now_epoch: clock.epoch,
            timezone: self.timezone.clone(),
            history_enabled: self.history.is_enabled(),
            history_count: self.history.len(),
        }
    }

    pub fn state_payload(&self, clock: &ClockReading) -> StatePayload {
        StatePayload {
            set_point: effective_set_point(&self.settings, clock.local_minute()),
            day_set_point: self.settings.day_set_point(),
            night_set_point: self.settings.night_set_point(),
            hysteresis: self.settings.hysteresis(),
            boost_minutes: self.settings.boost_minutes(),
            day_start_minute: self.settings.day_start_minute(),
            night_start_minute: self.settings.night_start_minute(),
            mode: self.settings.requested_mode().as_str(),
            state: self.engine.state().as_str(),
        }
    }

    pub fn telemetry_payload(&self, clock: &ClockReading) -> TelemetryPayload {
        TelemetryPayload {
            temp: self.sensor.last_temperature(clock.uptime_ms),
            state: self.engine.state().as_str(),
            mode: self.engine.active_mode().as_str(),
            heater: self.engine.is_heater_on(),
        }
    }

    pub fn time_status(&self, clock: &ClockReading) -> TimeStatus {
        TimeStatus {
            time_synced: clock.synced,
            timezone: self.timezone.clone(),
            now_epoch: clock.epoch,
        }
    }

    /// Recent samples covering `days`. An empty log with a live reading
    /// yields that reading so a fresh install still plots something.
    pub fn history_points(
        &mut self,
        days: Option<i64>,
        clock: &ClockReading,
    ) -> Result<Vec<HistoryPoint>, HistoryError> {
        let days = days.unwrap_or(self.config.history_default_days);
        let max = records_for_days(
            days,
            self.config.history_interval_minutes,
            self.history.capacity().max(1),
        );
        let samples = self.history.read_tail(max)?;
        if !samples.is_empty() {
            return Ok(samples.iter().map(HistoryPoint::from).collect());
        }

        let live = self.sensor.last_temperature(clock.uptime_ms).map(|temperature| {
            let sample = HistorySample::new(
                clock.epoch,
                temperature,
                effective_set_point(&self.settings, clock.local_minute()),
                self.settings.hysteresis(),
                self.engine.is_heater_on(),
            );
            HistoryPoint::from(&sample)
        });
        Ok(live.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        history::{HistoryLog, HistorySampler},
        settings::{MemoryBackend, MemorySettingsStore, RecordSettingsStore},
        types::DiagnosticState,
    };

    const T0: u32 = 1_700_000_000;

    #[derive(Debug, Default)]
    struct RecordingRelay {
        writes: Vec<bool>,
        fail: bool,
        fail_next: usize,
    }

    impl HeaterRelay for RecordingRelay {
        fn set(&mut self, on: bool) -> Result<(), RelayError> {
            if self.fail || self.fail_next > 0 {
                self.fail_next = self.fail_next.saturating_sub(1);
                return Err(RelayError("gpio busy".into()));
            }
            self.writes.push(on);
            Ok(())
        }
    }

    type TestController = HeatingController<MemorySettingsStore, RecordingRelay, Cursor<Vec<u8>>>;

    fn config() -> ControllerConfig {
        ControllerConfig {
            history_interval_minutes: 1,
            history_capacity: 16,
            ..ControllerConfig::default()
        }
    }

    fn controller_with(settings: Settings, with_log: bool) -> TestController {
        let config = config();
        let log = with_log.then(|| {
            HistoryLog::attach(Cursor::new(Vec::new()), config.history_capacity)
                .unwrap()
                .0
        });
        let history = HistoryRecorder::new(
            log,
            HistorySampler::from_minutes(config.history_interval_minutes),
        );
        HeatingController::new(
            config,
            "Europe/Berlin",
            settings,
            MemorySettingsStore::default(),
            RecordingRelay::default(),
            history,
        )
    }

    fn clock(uptime_ms: u64) -> ClockReading {
        ClockReading {
            uptime_ms,
            epoch: T0 + (uptime_ms / 1000) as u32,
            synced: true,
            local_time: None,
        }
    }

    #[test]
    fn tick_drives_relay_from_sensor() {
        let mut controller = controller_with(Settings::default(), true);
        controller.record_temperature(19.0, 0);

        let report = controller.tick(&clock(0));

        assert_eq!(report.heater_changed, Some(true));
        assert_eq!(controller.relay().writes, vec![true]);
        assert_eq!(controller.engine().state(), DiagnosticState::Heating);
    }

    #[test]
    fn evaluation_is_gated_by_interval() {
        let mut controller = controller_with(Settings::default(), false);
        controller.record_temperature(19.0, 0);

        assert!(controller.tick(&clock(0)).evaluation.is_some());
        assert!(controller.tick(&clock(1_000)).evaluation.is_none());
        assert!(controller.tick(&clock(2_000)).evaluation.is_some());
    }

    #[test]
    fn stale_sensor_fails_safe() {
        let mut controller = controller_with(Settings::default(), false);
        controller.record_temperature(19.0, 0);
        controller.tick(&clock(0));

        let report = controller.tick(&clock(40_000));

        assert_eq!(report.heater_changed, Some(false));
        assert_eq!(controller.engine().state(), DiagnosticState::Error);
        assert_eq!(controller.relay().writes, vec![true, false]);
    }

    #[test]
    fn boost_persists_end_time() {
        let mut controller = controller_with(Settings::default(), false);
        controller.record_temperature(22.0, 0);

        assert!(controller.start_boost(T0).unwrap());
        controller.tick(&clock(0));
        controller.tick(&clock(2_000));

        let stored = crate::settings::decode_settings(
            controller.store().backend().record.as_deref().unwrap(),
        )
        .unwrap();
        assert_eq!(stored.requested_mode(), ControlMode::Boost);
        assert_eq!(stored.boost_end_epoch(), T0 + 15 * 60);
        assert!(controller.engine().is_heater_on());

        let status = controller.status(&clock(2_000));
        assert_eq!(status.active_mode, "BOOST");
        assert_eq!(status.boost_remaining_sec, 15 * 60 - 2);
    }

    #[test]
    fn status_reports_period_and_next_change() {
        use chrono::{FixedOffset, TimeZone};

        let controller = controller_with(Settings::default(), false);
        let now = FixedOffset::east_opt(3_600)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 5, 9, 0, 0)
            .unwrap();
        let reading = ClockReading {
            local_time: Some(now),
            ..clock(0)
        };

        let status = controller.status(&reading);
        assert_eq!(status.period, "DAY");
        assert_eq!(status.effective_set_point, 21.0);
        assert_eq!(status.next_period_change, Some(now.timestamp() + 13 * 3_600));

        let status = controller.status(&clock(0));
        assert_eq!(status.next_period_change, None);
    }

    #[test]
    fn persist_failure_is_reported_not_fatal() {
        let store = RecordSettingsStore::new(MemoryBackend {
            fail_writes: true,
            ..MemoryBackend::default()
        });
        let config = config();
        let mut settings = Settings::default();
        settings.set_requested_mode(ControlMode::Boost);
        let mut controller = HeatingController::new(
            config,
            "UTC",
            settings,
            store,
            RecordingRelay::default(),
            HistoryRecorder::<Cursor<Vec<u8>>>::new(None, HistorySampler::new(0)),
        );
        controller.record_temperature(18.0, 0);

        let report = controller.tick(&clock(0));

        assert!(matches!(report.persist_error, Some(SettingsError::Backend(_))));
        assert_eq!(report.heater_changed, Some(true));
    }

    #[test]
    fn relay_failure_is_reported() {
        let mut controller = controller_with(Settings::default(), false);
        controller.relay.fail = true;
        controller.record_temperature(18.0, 0);

        let report = controller.tick(&clock(0));

        assert!(report.relay_error.is_some());
    }

    #[test]
    fn failed_off_write_is_retried_during_sensor_fault() {
        let mut controller = controller_with(Settings::default(), false);
        controller.record_temperature(18.0, 0);
        controller.tick(&clock(0));
        assert_eq!(controller.relay().writes, vec![true]);

        controller.relay.fail_next = 1;
        controller.mark_sensor_fault();
        let failed = controller.tick(&clock(2_000));
        assert!(failed.relay_error.is_some());
        assert_eq!(controller.relay().writes, vec![true]);

        let retried = controller.tick(&clock(4_000));
        assert!(retried.relay_error.is_none());
        assert_eq!(retried.heater_changed, Some(false));
        assert_eq!(controller.relay().writes, vec![true, false]);
        assert_eq!(controller.engine().state(), DiagnosticState::Error);

        for step in 3..8 {
            controller.tick(&clock(step * 2_000));
        }
        assert_eq!(controller.relay().writes, vec![true, false]);
    }

    #[test]
    fn history_records_effective_set_point_each_interval() {
        let mut settings = Settings::default();
        settings.set_night_set_point(16.0);
        let mut controller = controller_with(settings, true);
        let night = |uptime_ms: u64| ClockReading {
            local_time: Some(
                chrono::DateTime::parse_from_rfc3339("2026-01-05T23:30:00+01:00").unwrap(),
            ),
            ..clock(uptime_ms)
        };

        controller.record_temperature(17.0, 0);
        controller.tick(&night(0));
        controller.record_temperature(17.0, 60_000);
        let report = controller.tick(&night(60_000));

        assert!(matches!(report.history, RecordOutcome::Appended));
        let points = controller.history_points(Some(1), &night(60_000)).unwrap();
        assert_eq!(
            points,
            vec![HistoryPoint {
                ts: T0 + 60,
                t: 1_700,
                sp: 1_600,
                hy: 50,
                h: 0
            }]
        );
    }

    #[test]
    fn history_skips_without_reading() {
        let mut controller = controller_with(Settings::default(), true);
        controller.tick(&clock(0));

        let report = controller.tick(&clock(60_000));

        assert!(matches!(report.history, RecordOutcome::Skipped));
        assert!(controller.history_points(None, &clock(60_000)).unwrap().is_empty());
    }

    #[test]
    fn empty_history_falls_back_to_live_sample() {
        let mut controller = controller_with(Settings::default(), false);
        controller.record_temperature(20.25, 0);

        let points = controller.history_points(None, &clock(0)).unwrap();

        assert_eq!(
            points,
            vec![HistoryPoint {
                ts: T0,
                t: 2_025,
                sp: 2_100,
                hy: 50,
                h: 0
            }]
        );
    }

    #[test]
    fn command_updates_and_persists() {
        let mut controller = controller_with(Settings::default(), false);
        let command = SettingsCommand::parse(br#"{"daySetPoint": 23, "mode": "off"}"#).unwrap();

        assert!(controller.apply_command(&command).unwrap());
        assert!(!controller.apply_command(&command).unwrap());
        assert_eq!(controller.store().backend().writes, 1);
        assert_eq!(controller.settings().day_set_point(), 23.0);

        let payload = controller.state_payload(&clock(0));
        assert_eq!(payload.mode, "OFF");
        assert_eq!(payload.set_point, 23.0);
    }

    #[test]
    fn shutdown_switches_relay_off() {
        let mut controller = controller_with(Settings::default(), false);
        controller.shutdown().unwrap();
        assert_eq!(controller.relay().writes, vec![false]);
    }
}

use crate::{
    schedule::effective_set_point,
    settings::{Settings, MAX_BOOST_MINUTES},
    types::{ControlMode, DiagnosticState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineAction {
    /// Drive the relay. Only emitted when the output actually changes.
    Relay(bool),
    /// The settings record was mutated and must be written back.
    PersistSettings,
}

/// Everything an evaluation reads besides the settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineInput {
    /// Epoch-or-synthetic seconds, the time base of `boost_end_epoch`.
    pub now_epoch: u32,
    pub temperature_c: Option<f32>,
    pub minute_of_day: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub heater_on: bool,
    pub state: DiagnosticState,
    pub active_mode: ControlMode,
    pub actions: Vec<EngineAction>,
}

#[derive(Debug, Clone)]
pub struct ControlEngine {
    evaluation_interval_ms: u64,
    active_mode: ControlMode,
    entered_mode: Option<ControlMode>,
    state: DiagnosticState,
    heater_on: bool,
    /// The last relay write failed; repeat it on the next evaluation.
    relay_retry: bool,
    last_epoch: Option<u32>,
    last_evaluation_ms: Option<u64>,
}

impl ControlEngine {
    pub fn new(initial_mode: ControlMode, evaluation_interval_ms: u64) -> Self {
        Self {
            evaluation_interval_ms,
            active_mode: initial_mode,
            entered_mode: None,
            state: DiagnosticState::Idle,
            heater_on: false,
            relay_retry: false,
            last_epoch: None,
            last_evaluation_ms: None,
        }
    }

    pub fn active_mode(&self) -> ControlMode {
        self.active_mode
    }

    pub fn state(&self) -> DiagnosticState {
        self.state
    }

    pub fn is_heater_on(&self) -> bool {
        self.heater_on
    }

    /// Called by the owner when executing [`EngineAction::Relay`] failed. The
    /// cached output stays what the engine wants and the write is repeated on
    /// the next evaluation until it succeeds.
    pub fn relay_write_failed(&mut self) {
        self.relay_retry = true;
    }

    /// Runs [`Self::evaluate`] when the evaluation interval has elapsed.
    /// The first call always evaluates.
    pub fn tick(
        &mut self,
        now_ms: u64,
        input: EngineInput,
        settings: &mut Settings,
    ) -> Option<Evaluation> {
        if let Some(last) = self.last_evaluation_ms {
            if now_ms.saturating_sub(last) < self.evaluation_interval_ms {
                return None;
            }
        }
        self.last_evaluation_ms = Some(now_ms);
        Some(self.evaluate(input, settings))
    }

    pub fn evaluate(&mut self, input: EngineInput, settings: &mut Settings) -> Evaluation {
        let mut actions = Vec::new();
        let temperature = input.temperature_c.filter(|value| value.is_finite());
        let previous_epoch = self.last_epoch.replace(input.now_epoch);

        match self.active_mode {
            ControlMode::Off => self.run_off(temperature, settings, &mut actions),
            ControlMode::Boost => self.run_boost(
                input.now_epoch,
                previous_epoch,
                temperature,
                settings,
                &mut actions,
            ),
            ControlMode::Auto => {
                self.run_auto(temperature, input.minute_of_day, settings, &mut actions)
            }
        }

        if std::mem::take(&mut self.relay_retry)
            && !actions.iter().any(|action| matches!(action, EngineAction::Relay(_)))
        {
            actions.push(EngineAction::Relay(self.heater_on));
        }

        Evaluation {
            heater_on: self.heater_on,
            state: self.state,
            active_mode: self.active_mode,
            actions,
        }
    }

    fn run_off(
        &mut self,
        temperature: Option<f32>,
        settings: &Settings,
        actions: &mut Vec<EngineAction>,
    ) {
        if self.entered_mode != Some(ControlMode::Off) {
            self.entered_mode = Some(ControlMode::Off);
            self.set_heater(false, actions);
            self.state = DiagnosticState::Idle;
        }

        if temperature.is_none() {
            self.fail_safe(actions);
            return;
        }
        if self.state == DiagnosticState::Error {
            self.state = DiagnosticState::Idle;
        }

        if settings.requested_mode() != ControlMode::Off {
            self.switch_to(settings.requested_mode());
        }
    }

    fn run_boost(
        &mut self,
        now_epoch: u32,
        previous_epoch: Option<u32>,
        temperature: Option<f32>,
        settings: &mut Settings,
        actions: &mut Vec<EngineAction>,
    ) {
        let max_span = u32::from(MAX_BOOST_MINUTES) * 60;
        if self.entered_mode == Some(ControlMode::Boost) {
            if let Some(previous) = previous_epoch {
                follow_time_base(previous, now_epoch, max_span, settings, actions);
            }
        } else {
            self.entered_mode = Some(ControlMode::Boost);
            let recorded = settings.boost_end_epoch();
            if recorded == 0 || recorded.saturating_sub(now_epoch) > max_span {
                let minutes = u32::from(settings.boost_minutes());
                let end = now_epoch.saturating_add(minutes * 60).max(1);
                settings.set_boost_end_epoch(end);
                persist(actions);
            }
            self.set_heater(true, actions);
            self.state = DiagnosticState::Heating;
        }

        if temperature.is_none() {
            self.fail_safe(actions);
            return;
        }
        if self.state == DiagnosticState::Error {
            self.set_heater(true, actions);
            self.state = DiagnosticState::Heating;
        }

        let end = settings.boost_end_epoch();
        if end != 0 && now_epoch >= end {
            settings.clear_boost_end();
            settings.set_requested_mode(ControlMode::Auto);
            persist(actions);
            self.switch_to(ControlMode::Auto);
            return;
        }

        if settings.requested_mode() != ControlMode::Boost {
            if settings.clear_boost_end() {
                persist(actions);
            }
            self.switch_to(settings.requested_mode());
        }
    }

    fn run_auto(
        &mut self,
        temperature: Option<f32>,
        minute_of_day: Option<u16>,
        settings: &Settings,
        actions: &mut Vec<EngineAction>,
    ) {
        if self.entered_mode != Some(ControlMode::Auto) {
            self.entered_mode = Some(ControlMode::Auto);
        }

        let Some(temperature) = temperature else {
            self.fail_safe(actions);
            return;
        };
        if self.state == DiagnosticState::Error {
            self.state = if self.heater_on {
                DiagnosticState::Heating
            } else {
                DiagnosticState::Idle
            };
        }

        if settings.requested_mode() != ControlMode::Auto {
            self.switch_to(settings.requested_mode());
            return;
        }

        let set_point = effective_set_point(settings, minute_of_day);
        let hysteresis = settings.hysteresis();

        // Only the band edges switch; inside the band the output holds.
        if temperature <= set_point - hysteresis && self.state != DiagnosticState::Heating {
            self.set_heater(true, actions);
            self.state = DiagnosticState::Heating;
        } else if temperature >= set_point + hysteresis && self.state != DiagnosticState::Idle {
            self.set_heater(false, actions);
            self.state = DiagnosticState::Idle;
        }
    }

    fn fail_safe(&mut self, actions: &mut Vec<EngineAction>) {
        self.set_heater(false, actions);
        self.state = DiagnosticState::Error;
    }

    fn switch_to(&mut self, mode: ControlMode) {
        self.active_mode = mode;
        self.entered_mode = None;
    }

    fn set_heater(&mut self, on: bool, actions: &mut Vec<EngineAction>) {
        if self.heater_on != on {
            self.heater_on = on;
            actions.push(EngineAction::Relay(on));
        }
    }
}

/// A step longer than any boost between two evaluations is a change of time
/// base (first clock sync), not elapsed time. The pending end moves with it
/// so the remaining boost duration is kept.
fn follow_time_base(
    previous: u32,
    now: u32,
    max_span: u32,
    settings: &mut Settings,
    actions: &mut Vec<EngineAction>,
) {
    let end = settings.boost_end_epoch();
    if end == 0 || now.abs_diff(previous) <= max_span {
        return;
    }
    let shifted = i64::from(end) + i64::from(now) - i64::from(previous);
    settings.set_boost_end_epoch(shifted.clamp(1, i64::from(u32::MAX)) as u32);
    persist(actions);
}

fn persist(actions: &mut Vec<EngineAction>) {
    if !actions.contains(&EngineAction::PersistSettings) {
        actions.push(EngineAction::PersistSettings);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const T0: u32 = 1_700_000_000;

    fn input(now_epoch: u32, temperature: Option<f32>) -> EngineInput {
        EngineInput {
            now_epoch,
            temperature_c: temperature,
            minute_of_day: Some(12 * 60),
        }
    }

    fn auto_settings(set_point: f32, hysteresis: f32) -> Settings {
        let mut settings = Settings::default();
        settings.set_day_set_point(set_point);
        settings.set_hysteresis(hysteresis);
        settings
    }

    #[test]
    fn first_tick_evaluates_then_waits_for_interval() {
        let mut engine = ControlEngine::new(ControlMode::Auto, 2_000);
        let mut settings = Settings::default();

        assert!(engine.tick(500, input(T0, Some(20.0)), &mut settings).is_some());
        assert!(engine.tick(2_499, input(T0, Some(20.0)), &mut settings).is_none());
        assert!(engine.tick(2_500, input(T0, Some(20.0)), &mut settings).is_some());
    }

    #[test]
    fn auto_holds_output_inside_dead_band() {
        let mut engine = ControlEngine::new(ControlMode::Auto, 2_000);
        let mut settings = auto_settings(20.0, 0.5);
        let mut relay_writes = Vec::new();

        for temp in [20.0, 19.6, 19.5, 19.8, 20.2, 20.49, 20.5, 20.3, 19.7] {
            let evaluation = engine.evaluate(input(T0, Some(temp)), &mut settings);
            relay_writes.extend(evaluation.actions);
        }

        assert_eq!(
            relay_writes,
            vec![EngineAction::Relay(true), EngineAction::Relay(false)]
        );
        assert!(!engine.is_heater_on());
        assert_eq!(engine.state(), DiagnosticState::Idle);
    }

    #[test]
    fn auto_uses_night_set_point_outside_day_window() {
        let mut engine = ControlEngine::new(ControlMode::Auto, 2_000);
        let mut settings = Settings::default();
        let night = EngineInput {
            now_epoch: T0,
            temperature_c: Some(19.0),
            minute_of_day: Some(23 * 60),
        };

        let evaluation = engine.evaluate(night, &mut settings);

        assert!(evaluation.actions.is_empty());
        assert!(!evaluation.heater_on);
    }

    #[test]
    fn off_turns_heater_off_once() {
        let mut engine = ControlEngine::new(ControlMode::Auto, 2_000);
        let mut settings = auto_settings(21.0, 0.5);
        engine.evaluate(input(T0, Some(18.0)), &mut settings);
        assert!(engine.is_heater_on());

        settings.set_requested_mode(ControlMode::Off);
        let switching = engine.evaluate(input(T0, Some(18.0)), &mut settings);
        assert!(switching.actions.is_empty());
        assert_eq!(switching.active_mode, ControlMode::Off);

        let entered = engine.evaluate(input(T0, Some(18.0)), &mut settings);
        assert_eq!(entered.actions, vec![EngineAction::Relay(false)]);
        assert_eq!(entered.state, DiagnosticState::Idle);

        let steady = engine.evaluate(input(T0, Some(18.0)), &mut settings);
        assert!(steady.actions.is_empty());
    }

    #[test]
    fn boost_runs_for_configured_minutes_then_returns_to_auto() {
        let mut engine = ControlEngine::new(ControlMode::Boost, 2_000);
        let mut settings = Settings::default();
        settings.set_boost_minutes(20);
        settings.set_requested_mode(ControlMode::Boost);

        let entry = engine.evaluate(input(T0, Some(19.0)), &mut settings);
        assert_eq!(
            entry.actions,
            vec![EngineAction::PersistSettings, EngineAction::Relay(true)]
        );
        assert_eq!(settings.boost_end_epoch(), T0 + 1_200);
        assert_eq!(entry.state, DiagnosticState::Heating);

        let running = engine.evaluate(input(T0 + 1_199, Some(25.0)), &mut settings);
        assert!(running.actions.is_empty());
        assert_eq!(running.active_mode, ControlMode::Boost);

        let expired = engine.evaluate(input(T0 + 1_200, Some(25.0)), &mut settings);
        assert_eq!(expired.actions, vec![EngineAction::PersistSettings]);
        assert_eq!(expired.active_mode, ControlMode::Auto);
        assert_eq!(settings.boost_end_epoch(), 0);
        assert_eq!(settings.requested_mode(), ControlMode::Auto);

        // AUTO picks up with the heater still on and switches it off above the band.
        let auto = engine.evaluate(input(T0 + 1_202, Some(25.0)), &mut settings);
        assert_eq!(auto.actions, vec![EngineAction::Relay(false)]);
    }

    #[test]
    fn boost_keeps_recorded_end_across_restart() {
        let mut engine = ControlEngine::new(ControlMode::Boost, 2_000);
        let mut settings = Settings::default();
        settings.set_requested_mode(ControlMode::Boost);
        settings.set_boost_end_epoch(T0 + 300);

        let entry = engine.evaluate(input(T0, Some(19.0)), &mut settings);

        assert_eq!(entry.actions, vec![EngineAction::Relay(true)]);
        assert_eq!(settings.boost_end_epoch(), T0 + 300);
    }

    #[test]
    fn boost_end_beyond_maximum_is_recomputed() {
        let mut engine = ControlEngine::new(ControlMode::Boost, 2_000);
        let mut settings = Settings::default();
        settings.set_requested_mode(ControlMode::Boost);
        settings.set_boost_end_epoch(T0);

        // Clock still unsynced: synthetic seconds far below the stored end.
        engine.evaluate(input(120, Some(19.0)), &mut settings);

        assert_eq!(settings.boost_end_epoch(), 120 + 15 * 60);
    }

    #[test]
    fn boost_survives_first_clock_sync() {
        let mut engine = ControlEngine::new(ControlMode::Boost, 2_000);
        let mut settings = Settings::default();
        settings.set_boost_minutes(20);
        settings.set_requested_mode(ControlMode::Boost);

        // Synthetic uptime seconds before SNTP.
        engine.evaluate(input(60, Some(19.0)), &mut settings);
        assert_eq!(settings.boost_end_epoch(), 1_260);
        engine.evaluate(input(62, Some(19.0)), &mut settings);

        let synced = engine.evaluate(input(T0 + 90, Some(19.0)), &mut settings);
        assert_eq!(synced.active_mode, ControlMode::Boost);
        assert_eq!(synced.actions, vec![EngineAction::PersistSettings]);
        assert_eq!(settings.boost_end_epoch(), T0 + 90 + 1_198);
        assert_eq!(settings.requested_mode(), ControlMode::Boost);

        let running = engine.evaluate(input(T0 + 90 + 1_197, Some(19.0)), &mut settings);
        assert_eq!(running.active_mode, ControlMode::Boost);
        let expired = engine.evaluate(input(T0 + 90 + 1_198, Some(19.0)), &mut settings);
        assert_eq!(expired.active_mode, ControlMode::Auto);
        assert_eq!(settings.boost_end_epoch(), 0);
    }

    #[test]
    fn failed_relay_write_is_repeated() {
        let mut engine = ControlEngine::new(ControlMode::Auto, 2_000);
        let mut settings = auto_settings(21.0, 0.5);
        let on = engine.evaluate(input(T0, Some(18.0)), &mut settings);
        assert_eq!(on.actions, vec![EngineAction::Relay(true)]);

        let fault = engine.evaluate(input(T0 + 2, None), &mut settings);
        assert_eq!(fault.actions, vec![EngineAction::Relay(false)]);
        engine.relay_write_failed();

        let retry = engine.evaluate(input(T0 + 4, None), &mut settings);
        assert_eq!(retry.actions, vec![EngineAction::Relay(false)]);
        assert!(!retry.heater_on);

        let settled = engine.evaluate(input(T0 + 6, None), &mut settings);
        assert!(settled.actions.is_empty());
    }

    #[test]
    fn boost_cancelled_by_new_mode_clears_end() {
        let mut engine = ControlEngine::new(ControlMode::Boost, 2_000);
        let mut settings = Settings::default();
        settings.set_requested_mode(ControlMode::Boost);
        engine.evaluate(input(T0, Some(19.0)), &mut settings);

        settings.set_requested_mode(ControlMode::Off);
        let cancelled = engine.evaluate(input(T0 + 10, Some(19.0)), &mut settings);
        assert_eq!(cancelled.actions, vec![EngineAction::PersistSettings]);
        assert_eq!(settings.boost_end_epoch(), 0);
        assert_eq!(cancelled.active_mode, ControlMode::Off);

        let off = engine.evaluate(input(T0 + 12, Some(19.0)), &mut settings);
        assert_eq!(off.actions, vec![EngineAction::Relay(false)]);
    }

    #[test]
    fn sensor_loss_during_boost_fails_safe_and_recovers() {
        let mut engine = ControlEngine::new(ControlMode::Boost, 2_000);
        let mut settings = Settings::default();
        settings.set_boost_minutes(20);
        settings.set_requested_mode(ControlMode::Boost);
        engine.evaluate(input(T0, Some(19.0)), &mut settings);

        let lost = engine.evaluate(input(T0 + 60, None), &mut settings);
        assert_eq!(lost.actions, vec![EngineAction::Relay(false)]);
        assert_eq!(lost.state, DiagnosticState::Error);
        assert_eq!(settings.boost_end_epoch(), T0 + 1_200);

        let recovered = engine.evaluate(input(T0 + 62, Some(19.0)), &mut settings);
        assert_eq!(recovered.actions, vec![EngineAction::Relay(true)]);
        assert_eq!(recovered.state, DiagnosticState::Heating);
        assert_eq!(recovered.active_mode, ControlMode::Boost);
    }

    #[test]
    fn sensor_loss_in_auto_turns_heater_off() {
        let mut engine = ControlEngine::new(ControlMode::Auto, 2_000);
        let mut settings = auto_settings(21.0, 0.5);
        engine.evaluate(input(T0, Some(18.0)), &mut settings);

        let lost = engine.evaluate(input(T0, Some(f32::NAN)), &mut settings);
        assert_eq!(lost.actions, vec![EngineAction::Relay(false)]);
        assert_eq!(lost.state, DiagnosticState::Error);

        // Relay is off after the fault, so recovery reports IDLE and the
        // dead band then turns it back on.
        let recovered = engine.evaluate(input(T0, Some(18.0)), &mut settings);
        assert_eq!(recovered.actions, vec![EngineAction::Relay(true)]);
        assert_eq!(recovered.state, DiagnosticState::Heating);
    }

    #[test]
    fn sensor_loss_in_off_reports_error_then_idle() {
        let mut engine = ControlEngine::new(ControlMode::Off, 2_000);
        let mut settings = Settings::default();
        settings.set_requested_mode(ControlMode::Off);

        let lost = engine.evaluate(input(T0, None), &mut settings);
        assert!(lost.actions.is_empty());
        assert_eq!(lost.state, DiagnosticState::Error);

        let recovered = engine.evaluate(input(T0, Some(20.0)), &mut settings);
        assert_eq!(recovered.state, DiagnosticState::Idle);
    }
}

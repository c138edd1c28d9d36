use core::convert::TryInto;
use std::{
    fs::{File, OpenOptions},
    sync::mpsc::{self, Receiver, Sender, SyncSender, TryRecvError},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    gpio::{AnyIOPin, AnyOutputPin, Output, PinDriver},
    i2c::{I2cConfig, I2cDriver, I2C0},
    units::FromValueType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, error, info, warn};
use serde::Serialize;

use heatctl_common::{
    commands::MAX_COMMAND_BYTES,
    config::{HardwareConfig, NetworkConfig},
    history::HistorySampler,
    sensor::{si7021_celsius, SI7021_ADDRESS, SI7021_MEASURE_TEMP},
    settings::{LoadOutcome, LoadReport},
    Backoff, Clock, ClockReading, ControlMode, ControllerStatus, HeaterRelay, HeatingController,
    HistoryError, HistoryLog, HistoryPoint, HistoryRecorder, NudgeField, OpenOutcome,
    RecordOutcome, RecordSettingsStore, RelayError, RuntimeConfig, SettingsBackend,
    SettingsCommand, SettingsError, SystemClock, TickReport, TimeStatus,
};

const NVS_NAMESPACE: &str = "heatctl";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_SETTINGS_KEY: &str = "settings";
const SPIFFS_BASE_PATH: &core::ffi::CStr = c"/spiffs";
const MAX_HTTP_BODY: usize = 1024;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WIFI_CHECK_INTERVAL_MS: u64 = 30_000;
const LOOP_SLEEP: Duration = Duration::from_millis(200);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const I2C_TIMEOUT_TICKS: u32 = 10;
const SI7021_CONVERSION: Duration = Duration::from_millis(20);

type DeviceController =
    HeatingController<RecordSettingsStore<NvsSettingsBackend>, GpioHeater, File>;
type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;
type Reply<T> = SyncSender<T>;

/// Work handed to the control thread by the HTTP and MQTT tasks.
enum ControlRequest {
    Status(Reply<ControllerStatus>),
    Command(
        SettingsCommand,
        Option<Reply<Result<ControllerStatus, SettingsError>>>,
    ),
    Boost(Reply<Result<ControllerStatus, SettingsError>>),
    Nudge {
        field: NudgeField,
        delta: f32,
        reply: Reply<Result<ControllerStatus, SettingsError>>,
    },
    History {
        days: Option<i64>,
        reply: Reply<Result<Vec<HistoryPoint>, HistoryError>>,
    },
    Time(Reply<TimeStatus>),
    MqttConnected,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

struct MqttTopics {
    command: String,
    state: String,
    telemetry: String,
}

impl MqttTopics {
    fn new(base: &str) -> Self {
        Self {
            command: heatctl_common::command_topic(base),
            state: heatctl_common::state_topic(base),
            telemetry: heatctl_common::telemetry_topic(base),
        }
    }
}

/// Owned by the control thread. `enqueue` hands messages to the MQTT task
/// without waiting on the broker.
struct StatePublisher {
    client: EspMqttClient<'static>,
    topics: MqttTopics,
}

impl StatePublisher {
    fn subscribe(&mut self) {
        if let Err(err) = self.client.subscribe(&self.topics.command, QoS::AtMostOnce) {
            warn!("mqtt subscribe to {} failed: {err}", self.topics.command);
        }
    }

    fn publish(&mut self, controller: &DeviceController, clock: &ClockReading) {
        let state = serde_json::to_vec(&controller.state_payload(clock));
        let telemetry = serde_json::to_vec(&controller.telemetry_payload(clock));
        for (topic, body) in [(&self.topics.state, state), (&self.topics.telemetry, telemetry)] {
            match body {
                Ok(body) => {
                    if let Err(err) = self.client.enqueue(topic, QoS::AtLeastOnce, true, &body) {
                        debug!("publish to {topic} skipped: {err}");
                    }
                }
                Err(err) => warn!("serialization for {topic} failed: {err}"),
            }
        }
    }
}

/// Relay output with the status LED mirroring it.
struct GpioHeater {
    relay: PinDriver<'static, AnyOutputPin, Output>,
    relay_active_high: bool,
    led: Option<PinDriver<'static, AnyOutputPin, Output>>,
    led_active_high: bool,
}

impl GpioHeater {
    /// Drives the relay inactive before anything else can run.
    fn new(hardware: &HardwareConfig) -> anyhow::Result<Self> {
        let relay = unsafe { PinDriver::output(AnyOutputPin::new(hardware.relay_pin)) }
            .with_context(|| format!("relay GPIO{} unavailable", hardware.relay_pin))?;
        let led = match unsafe { PinDriver::output(AnyOutputPin::new(hardware.led_pin)) } {
            Ok(pin) => Some(pin),
            Err(err) => {
                warn!("status LED unavailable on GPIO{}: {err}", hardware.led_pin);
                None
            }
        };

        let mut heater = Self {
            relay,
            relay_active_high: hardware.relay_active_high,
            led,
            led_active_high: hardware.led_active_high,
        };
        heater
            .set(false)
            .map_err(|err| anyhow!("failed to switch relay off: {err}"))?;
        Ok(heater)
    }
}

fn drive(
    pin: &mut PinDriver<'static, AnyOutputPin, Output>,
    on: bool,
    active_high: bool,
) -> Result<(), esp_idf_svc::sys::EspError> {
    if on == active_high {
        pin.set_high()
    } else {
        pin.set_low()
    }
}

impl HeaterRelay for GpioHeater {
    fn set(&mut self, on: bool) -> Result<(), RelayError> {
        drive(&mut self.relay, on, self.relay_active_high)
            .map_err(|err| RelayError(err.to_string()))?;
        if let Some(led) = self.led.as_mut() {
            if let Err(err) = drive(led, on, self.led_active_high) {
                warn!("failed to drive status LED: {err}");
            }
        }
        Ok(())
    }
}

struct Si7021 {
    i2c: I2cDriver<'static>,
}

impl Si7021 {
    fn read_celsius(&mut self) -> anyhow::Result<f32> {
        self.i2c
            .write(SI7021_ADDRESS, &[SI7021_MEASURE_TEMP], I2C_TIMEOUT_TICKS)
            .context("si7021 measure command failed")?;
        thread::sleep(SI7021_CONVERSION);
        let mut raw = [0_u8; 2];
        self.i2c
            .read(SI7021_ADDRESS, &mut raw, I2C_TIMEOUT_TICKS)
            .context("si7021 read failed")?;
        Ok(si7021_celsius(raw))
    }
}

/// Settings record as a blob in its own NVS key.
struct NvsSettingsBackend {
    nvs: EspNvs<NvsDefault>,
}

impl SettingsBackend for NvsSettingsBackend {
    fn read_record(&mut self) -> Result<Option<Vec<u8>>, SettingsError> {
        let mut buffer = vec![0_u8; 512];
        self.nvs
            .get_blob(NVS_SETTINGS_KEY, &mut buffer)
            .map(|record| record.map(<[u8]>::to_vec))
            .map_err(|err| SettingsError::Backend(err.to_string()))
    }

    fn write_record(&mut self, record: &[u8]) -> Result<(), SettingsError> {
        self.nvs
            .set_blob(NVS_SETTINGS_KEY, record)
            .map_err(|err| SettingsError::Backend(err.to_string()))
    }
}

struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn open(&self) -> anyhow::Result<EspNvs<NvsDefault>> {
        Ok(EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?)
    }

    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = self.open()?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => {
                let runtime = RuntimeConfig::default();
                drop(nvs);
                if let Err(err) = self.save_runtime_config(&runtime) {
                    warn!("failed to write default runtime config: {err:#}");
                }
                Ok(runtime)
            }
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let mut nvs = self.open()?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime.network);

    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`, timezone {}",
        runtime.network.wifi_ssid,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
        runtime.timezone,
    );

    let Peripherals { modem, i2c0, .. } = Peripherals::take()?;

    // Relay first: the heater must be off before WiFi or storage can stall boot.
    let heater = GpioHeater::new(&runtime.hardware)?;
    let sensor = init_sensor(i2c0, &runtime.hardware);
    let controller = build_controller(&nvs_store, &runtime, heater)?;

    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)?;
    disable_wifi_power_save();

    let _sntp = match EspSntp::new_default() {
        Ok(sntp) => {
            info!("SNTP initialized");
            Some(sntp)
        }
        Err(err) => {
            warn!("failed to start SNTP, running on uptime: {err}");
            None
        }
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let (control, requests) = mpsc::channel();

    let publisher = if runtime.network.mqtt_enabled() {
        let (client, connection) = create_mqtt_client(&runtime.network)?;
        spawn_mqtt_receiver(
            connection,
            control.clone(),
            MqttTopics::new(&runtime.network.base_topic),
        )?;
        Some(StatePublisher {
            client,
            topics: MqttTopics::new(&runtime.network.base_topic),
        })
    } else {
        info!("mqtt disabled: no broker configured");
        None
    };

    let clock = SystemClock::new(&runtime.timezone);
    let controller_config = runtime.controller.clone();
    thread::Builder::new()
        .name("control".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            run_control_loop(
                controller,
                clock,
                requests,
                sensor,
                publisher,
                controller_config.sensor_read_interval_ms,
                controller_config.state_publish_interval_ms,
            )
        })
        .context("failed to start control thread")?;

    let server = create_http_server(control, runtime.network.http_port)?;
    info!("http server listening on port {}", runtime.network.http_port);

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            network.wifi_ssid = ssid.to_string();
        }
    }

    if network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            network.wifi_pass = pass.to_string();
        }
    }
}

fn init_sensor(i2c: I2C0, hardware: &HardwareConfig) -> Option<Si7021> {
    let config = I2cConfig::new().baudrate(100.kHz().into());
    let (sda, scl) = unsafe {
        (
            AnyIOPin::new(hardware.i2c_sda_pin),
            AnyIOPin::new(hardware.i2c_scl_pin),
        )
    };
    match I2cDriver::new(i2c, sda, scl, &config) {
        Ok(i2c) => {
            info!(
                "si7021 on I2C SDA GPIO{} / SCL GPIO{}",
                hardware.i2c_sda_pin, hardware.i2c_scl_pin
            );
            Some(Si7021 { i2c })
        }
        Err(err) => {
            error!("I2C init failed, sensor disabled: {err}");
            None
        }
    }
}

fn build_controller(
    nvs_store: &NvsStore,
    runtime: &RuntimeConfig,
    heater: GpioHeater,
) -> anyhow::Result<DeviceController> {
    let config = runtime.controller.clone();

    let mut settings_store = RecordSettingsStore::new(NvsSettingsBackend {
        nvs: nvs_store.open()?,
    });
    let (settings, report) = settings_store.load_with_report();
    log_load_report(&report);
    info!(
        "settings: mode {} day {:.1}°C night {:.1}°C hysteresis {:.1}°C",
        settings.requested_mode().as_str(),
        settings.day_set_point(),
        settings.night_set_point(),
        settings.hysteresis()
    );

    let log = match open_history(&config.history_file, config.history_capacity) {
        Ok((log, outcome)) => {
            match outcome {
                OpenOutcome::Opened => info!("history opened ({} records)", log.len()),
                OpenOutcome::Created => info!("history created"),
                OpenOutcome::Recreated(fault) => warn!("history discarded ({fault}); started empty"),
            }
            Some(log)
        }
        Err(err) => {
            warn!("history storage unavailable: {err:#}");
            None
        }
    };
    let history = HistoryRecorder::new(
        log,
        HistorySampler::from_minutes(config.history_interval_minutes),
    );

    Ok(HeatingController::new(
        config,
        runtime.timezone.clone(),
        settings,
        settings_store,
        heater,
        history,
    ))
}

fn log_load_report(report: &LoadReport) {
    match &report.outcome {
        LoadOutcome::Loaded => info!("settings loaded"),
        LoadOutcome::Missing => info!("no stored settings; defaults written"),
        LoadOutcome::Reset(reason) => warn!("stored settings rejected ({reason}); defaults restored"),
        LoadOutcome::ReadFailed(err) => warn!("settings unreadable ({err}); running on defaults"),
    }
    if let Some(err) = &report.save_error {
        warn!("failed to write default settings: {err}");
    }
}

/// SPIFFS has no directories, so the file is opened in place and the log
/// repairs a bad header itself.
fn open_history(file: &str, capacity: u32) -> anyhow::Result<(HistoryLog<File>, OpenOutcome)> {
    mount_spiffs()?;
    let base = SPIFFS_BASE_PATH.to_str()?;
    let path = format!("{base}/{}", file.trim_start_matches('/'));
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open {path}"))?;
    Ok(HistoryLog::attach(file, capacity)?)
}

fn mount_spiffs() -> anyhow::Result<()> {
    let conf = esp_idf_svc::sys::esp_vfs_spiffs_conf_t {
        base_path: SPIFFS_BASE_PATH.as_ptr(),
        partition_label: core::ptr::null(),
        max_files: 4,
        format_if_mount_failed: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_vfs_spiffs_register(&conf) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_vfs_spiffs_register failed with code {}", rc))
}

fn run_control_loop(
    mut controller: DeviceController,
    mut clock: SystemClock,
    requests: Receiver<ControlRequest>,
    mut sensor: Option<Si7021>,
    mut publisher: Option<StatePublisher>,
    sensor_interval_ms: u64,
    publish_interval_ms: u64,
) {
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register control loop with watchdog: {err:#}");
    }

    let mut last_sensor_ms: Option<u64> = None;
    let mut last_publish_ms: Option<u64> = None;
    let mut last_wifi_check_ms = 0_u64;
    let mut last_mode: Option<ControlMode> = None;

    loop {
        feed_watchdog();
        let reading = clock.read();
        let now_ms = reading.uptime_ms;

        if last_sensor_ms.map_or(true, |last| now_ms.saturating_sub(last) >= sensor_interval_ms) {
            last_sensor_ms = Some(now_ms);
            poll_sensor(&mut controller, sensor.as_mut(), now_ms);
        }

        loop {
            match requests.try_recv() {
                Ok(request) => {
                    handle_request(&mut controller, &reading, request, publisher.as_mut())
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    error!("control channel closed; switching heater off");
                    if let Err(err) = controller.shutdown() {
                        error!("failed to switch heater off: {err}");
                    }
                    return;
                }
            }
        }

        let report = controller.tick(&reading);
        if let Some(mode) = report.evaluation.as_ref().map(|evaluation| evaluation.active_mode) {
            if last_mode != Some(mode) {
                info!("active mode {}", mode.as_str());
                last_mode = Some(mode);
            }
        }
        log_tick_report(&report);

        let publish_due = last_publish_ms
            .map(|last| now_ms.saturating_sub(last) >= publish_interval_ms)
            .unwrap_or(true);
        if publish_due || report.heater_changed.is_some() {
            if let Some(publisher) = publisher.as_mut() {
                publisher.publish(&controller, &reading);
            }
            last_publish_ms = Some(now_ms);
        }

        if now_ms.saturating_sub(last_wifi_check_ms) >= WIFI_CHECK_INTERVAL_MS {
            last_wifi_check_ms = now_ms;
            if !is_wifi_station_connected() {
                reconnect_wifi();
            }
        }

        thread::sleep(LOOP_SLEEP);
    }
}

fn poll_sensor(controller: &mut DeviceController, sensor: Option<&mut Si7021>, now_ms: u64) {
    let Some(sensor) = sensor else {
        controller.mark_sensor_fault();
        return;
    };
    match sensor.read_celsius() {
        Ok(value) => {
            if !controller.record_temperature(value, now_ms) {
                warn!("implausible temperature {value:.2}°C; sensor marked faulted");
            }
        }
        Err(err) => {
            warn!("sensor read failed: {err:#}");
            controller.mark_sensor_fault();
        }
    }
}

fn handle_request(
    controller: &mut DeviceController,
    clock: &ClockReading,
    request: ControlRequest,
    publisher: Option<&mut StatePublisher>,
) {
    match request {
        ControlRequest::Status(reply) => {
            let _ = reply.send(controller.status(clock));
        }
        ControlRequest::Command(command, reply) => {
            let result = controller.apply_command(&command);
            settled(controller, clock, result, reply, publisher);
        }
        ControlRequest::Boost(reply) => {
            let result = controller.start_boost(clock.epoch);
            settled(controller, clock, result, Some(reply), publisher);
        }
        ControlRequest::Nudge {
            field,
            delta,
            reply,
        } => {
            let result = controller.nudge(field, delta);
            settled(controller, clock, result, Some(reply), publisher);
        }
        ControlRequest::History { days, reply } => {
            let _ = reply.send(controller.history_points(days, clock));
        }
        ControlRequest::Time(reply) => {
            let _ = reply.send(controller.time_status(clock));
        }
        ControlRequest::MqttConnected => {
            if let Some(publisher) = publisher {
                publisher.subscribe();
                publisher.publish(controller, clock);
            }
        }
    }
}

fn settled(
    controller: &DeviceController,
    clock: &ClockReading,
    result: Result<bool, SettingsError>,
    reply: Option<Reply<Result<ControllerStatus, SettingsError>>>,
    publisher: Option<&mut StatePublisher>,
) {
    let result = match result {
        Ok(changed) => {
            if changed {
                info!("settings updated");
            }
            Ok(controller.status(clock))
        }
        Err(err) => {
            warn!("failed to persist settings: {err}");
            Err(err)
        }
    };
    if let Some(publisher) = publisher {
        publisher.publish(controller, clock);
    }
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

fn log_tick_report(report: &TickReport) {
    if let Some(on) = report.heater_changed {
        info!("heater {}", if on { "ON" } else { "OFF" });
    }
    if let Some(err) = &report.relay_error {
        error!("{err}");
    }
    if let Some(err) = &report.persist_error {
        warn!("failed to persist settings: {err}");
    }
    match &report.history {
        RecordOutcome::Appended => debug!("history sample appended"),
        RecordOutcome::Skipped => debug!("history sample skipped: no valid reading"),
        RecordOutcome::Failed(err) => warn!("history append failed: {err}"),
        RecordOutcome::NotDue | RecordOutcome::Unavailable => {}
    }
}

/// Never fails on a missing network: heating keeps running offline and the
/// control loop retries the station link later.
fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if network.wifi_ssid.is_empty() {
        warn!("wifi credentials missing; running offline");
        return Ok(esp_wifi);
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                return Ok(esp_wifi);
            }
            Err(err) => warn!("wifi connect failed on attempt {attempt}: {err}"),
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; running offline");
    Ok(esp_wifi)
}

fn reconnect_wifi() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_connect() };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi reconnect requested");
    } else {
        debug!("wifi reconnect not possible: esp_err_t={rc}");
    }
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(network.client_id.as_str()),
        username: (!network.mqtt_user.is_empty()).then_some(network.mqtt_user.as_str()),
        password: (!network.mqtt_pass.is_empty()).then_some(network.mqtt_pass.as_str()),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    control: Sender<ControlRequest>,
    topics: MqttTopics,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            let mut backoff = Backoff::default();
            loop {
                match conn.next() {
                    Ok(event) => match event.payload() {
                        EventPayload::Connected(_) => {
                            info!("mqtt connected");
                            backoff.reset();
                            if control.send(ControlRequest::MqttConnected).is_err() {
                                return;
                            }
                        }
                        EventPayload::Disconnected => warn!("mqtt disconnected"),
                        EventPayload::Received {
                            topic: Some(topic),
                            data,
                            details,
                            ..
                        } => {
                            // Only complete payloads are handled.
                            if !matches!(details, Details::Complete) {
                                continue;
                            }
                            if let Err(err) = handle_mqtt_message(&control, &topics, topic, data) {
                                warn!("mqtt message handling failed: {err:#}");
                            }
                        }
                        _ => {}
                    },
                    Err(err) => {
                        let delay = backoff.on_failure();
                        warn!("mqtt receive loop error: {err}; retrying in {}s", delay.as_secs());
                        thread::sleep(delay);
                    }
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

fn handle_mqtt_message(
    control: &Sender<ControlRequest>,
    topics: &MqttTopics,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    if topic != topics.command {
        return Ok(());
    }
    if payload.len() > MAX_COMMAND_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let command = SettingsCommand::parse(payload).context("invalid command payload")?;
    control
        .send(ControlRequest::Command(command, None))
        .map_err(|_| anyhow!("control thread is gone"))
}

fn ask<T>(
    control: &Sender<ControlRequest>,
    make: impl FnOnce(Reply<T>) -> ControlRequest,
) -> Option<T> {
    let (reply, answer) = mpsc::sync_channel(1);
    control.send(make(reply)).ok()?;
    answer.recv_timeout(REPLY_TIMEOUT).ok()
}

fn write_settings_result(
    req: HttpRequest<'_, '_>,
    result: Option<Result<ControllerStatus, SettingsError>>,
) -> anyhow::Result<()> {
    match result {
        Some(Ok(status)) => write_json(req, &status),
        Some(Err(_)) => write_error(req, 500, "Failed to persist settings"),
        None => write_error(req, 503, "Controller is not running"),
    }
}

fn create_http_server(
    control: Sender<ControlRequest>,
    port: u16,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: port,
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let control = control.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            match ask(&control, ControlRequest::Status) {
                Some(status) => write_json(req, &status),
                None => write_error(req, 503, "Controller is not running"),
            }
        })?;
    }

    {
        let control = control.clone();
        server.fn_handler("/api/config", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let command = match SettingsCommand::parse(&body) {
                Ok(command) => command,
                Err(_) => return write_error(req, 400, "Invalid settings payload"),
            };
            let result = ask(&control, |reply| ControlRequest::Command(command, Some(reply)));
            write_settings_result(req, result)
        })?;
    }

    {
        let control = control.clone();
        server.fn_handler("/api/boost", Method::Post, move |req| {
            let result = ask(&control, ControlRequest::Boost);
            write_settings_result(req, result)
        })?;
    }

    {
        let control = control.clone();
        server.fn_handler("/api/nudge", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let Some(field) = query_param(&uri, "field").and_then(|name| NudgeField::parse(&name))
            else {
                return write_error(req, 400, "Missing or unknown 'field' parameter");
            };
            let Some(delta) = query_param(&uri, "delta")
                .and_then(|value| value.parse::<f32>().ok())
                .filter(|value| value.is_finite())
            else {
                return write_error(req, 400, "Missing or invalid 'delta' parameter");
            };

            let result = ask(&control, |reply| ControlRequest::Nudge {
                field,
                delta,
                reply,
            });
            write_settings_result(req, result)
        })?;
    }

    {
        let control = control.clone();
        server.fn_handler("/api/time", Method::Get, move |req| {
            match ask(&control, ControlRequest::Time) {
                Some(time) => write_json(req, &time),
                None => write_error(req, 503, "Controller is not running"),
            }
        })?;
    }

    server.fn_handler("/history.json", Method::Get, move |req| {
        let uri = req.uri().to_string();
        let days = query_param(&uri, "days").and_then(|value| value.parse::<i64>().ok());

        match ask(&control, |reply| ControlRequest::History { days, reply }) {
            Some(Ok(points)) => write_json(req, &points),
            Some(Err(err)) => {
                warn!("history read failed: {err}");
                write_error(req, 500, "Failed to read history")
            }
            None => write_error(req, 503, "Controller is not running"),
        }
    })?;

    Ok(server)
}

fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&ErrorBody { error: message })?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn query_param(uri: &str, key: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        (name == key).then(|| value.replace('+', " "))
    })
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

use std::{
    collections::HashMap,
    fs::{self, File},
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use heatctl_common::{
    commands::MAX_COMMAND_BYTES,
    history::HistorySampler,
    settings::{LoadOutcome, LoadReport},
    Backoff, Clock, ClockReading, ControlMode, ControllerStatus, HeaterRelay, HeatingController,
    HistoryError, HistoryLog, HistoryPoint, HistoryRecorder, NudgeField, OpenOutcome,
    RecordOutcome, RecordSettingsStore, RelayError, RuntimeConfig, SettingsBackend,
    SettingsCommand, SettingsError, SystemClock, TickReport, TimeStatus,
};

const LOOP_SLEEP: Duration = Duration::from_millis(200);
const DEFAULT_HTTP_PORT: u16 = 8080;

type HostController =
    HeatingController<RecordSettingsStore<FileSettingsBackend>, SimulatedRelay, File>;

/// Work handed to the control thread. Every variant that expects an answer
/// carries its own reply channel.
enum ControlRequest {
    Status(oneshot::Sender<ControllerStatus>),
    Command(
        SettingsCommand,
        Option<oneshot::Sender<Result<ControllerStatus, SettingsError>>>,
    ),
    Boost(oneshot::Sender<Result<ControllerStatus, SettingsError>>),
    Nudge {
        field: NudgeField,
        delta: f32,
        reply: oneshot::Sender<Result<ControllerStatus, SettingsError>>,
    },
    History {
        days: Option<i64>,
        reply: oneshot::Sender<Result<Vec<HistoryPoint>, HistoryError>>,
    },
    Time(oneshot::Sender<TimeStatus>),
    Temperature(f32),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
struct AppState {
    control: mpsc::Sender<ControlRequest>,
}

#[derive(Clone)]
struct AppStore {
    data_dir: Arc<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Clone)]
struct MqttTopics {
    command: String,
    sensor: String,
    state: String,
    telemetry: String,
}

impl MqttTopics {
    fn new(base: &str) -> Self {
        Self {
            command: heatctl_common::command_topic(base),
            sensor: heatctl_common::sensor_temperature_topic(base),
            state: heatctl_common::state_topic(base),
            telemetry: heatctl_common::telemetry_topic(base),
        }
    }
}

/// Retained state/telemetry publishing from the control thread. Uses the
/// non-blocking client calls so a dead broker never stalls a tick.
struct StatePublisher {
    client: AsyncClient,
    topics: MqttTopics,
}

impl StatePublisher {
    fn publish(&self, controller: &HostController, clock: &ClockReading) {
        self.publish_json(&self.topics.state, &controller.state_payload(clock));
        self.publish_json(&self.topics.telemetry, &controller.telemetry_payload(clock));
    }

    fn publish_json<T: Serialize>(&self, topic: &str, payload: &T) {
        match serde_json::to_vec(payload) {
            Ok(body) => {
                if let Err(err) = self
                    .client
                    .try_publish(topic, QoS::AtLeastOnce, true, body)
                {
                    debug!("publish to {topic} skipped: {err}");
                }
            }
            Err(err) => warn!("serialization for {topic} failed: {err}"),
        }
    }
}

/// Stands in for the relay on a development host.
#[derive(Debug, Default)]
struct SimulatedRelay;

impl HeaterRelay for SimulatedRelay {
    fn set(&mut self, on: bool) -> Result<(), RelayError> {
        info!("relay {}", if on { "ON" } else { "OFF" });
        Ok(())
    }
}

/// Settings record as a JSON file, replaced atomically on save.
struct FileSettingsBackend {
    path: PathBuf,
}

impl SettingsBackend for FileSettingsBackend {
    fn read_record(&mut self) -> Result<Option<Vec<u8>>, SettingsError> {
        match fs::read(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write_record(&mut self, record: &[u8]) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, record)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    apply_env_overrides(&mut runtime);

    let controller = build_controller(&store, &runtime);
    let clock = SystemClock::new(&runtime.timezone);
    info!("timezone {}", clock.timezone());

    let (control, requests) = mpsc::channel(32);
    let app_state = AppState { control };

    let publisher = if runtime.network.mqtt_enabled() {
        let topics = MqttTopics::new(&runtime.network.base_topic);
        let mut mqtt_options = MqttOptions::new(
            runtime.network.client_id.clone(),
            runtime.network.mqtt_host.clone(),
            runtime.network.mqtt_port,
        );
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        if !runtime.network.mqtt_user.is_empty() {
            mqtt_options.set_credentials(
                runtime.network.mqtt_user.clone(),
                runtime.network.mqtt_pass.clone(),
            );
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 64);
        spawn_mqtt_loop(
            client.clone(),
            eventloop,
            app_state.control.clone(),
            topics.clone(),
        );
        Some(StatePublisher { client, topics })
    } else {
        info!("mqtt disabled: no broker configured");
        None
    };

    let publish_interval_ms = runtime.controller.state_publish_interval_ms;
    thread::Builder::new()
        .name("control".into())
        .spawn(move || run_control_loop(controller, clock, requests, publisher, publish_interval_ms))
        .context("failed to start control thread")?;

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/config", post(handle_post_config))
        .route("/api/boost", post(handle_post_boost))
        .route("/api/nudge", post(handle_post_nudge))
        .route("/api/time", get(handle_get_time))
        .route("/history.json", get(handle_get_history))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state.clone());

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_HTTP_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let (reply, done) = oneshot::channel();
    if app_state.control.send(ControlRequest::Shutdown(reply)).await.is_ok() {
        let _ = done.await;
    }
    info!("controller stopped");
    Ok(())
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    let network = &mut runtime.network;
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
}

fn build_controller(store: &AppStore, runtime: &RuntimeConfig) -> HostController {
    let config = runtime.controller.clone();

    let mut settings_store = RecordSettingsStore::new(FileSettingsBackend {
        path: store.settings_path(),
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

    let history_path = store.history_path(&config.history_file);
    let log = match HistoryLog::open(&history_path, config.history_capacity) {
        Ok((log, outcome)) => {
            match outcome {
                OpenOutcome::Opened => info!(
                    "history opened at {} ({} records)",
                    history_path.display(),
                    log.len()
                ),
                OpenOutcome::Created => info!("history created at {}", history_path.display()),
                OpenOutcome::Recreated(fault) => warn!(
                    "history at {} discarded ({fault}); started empty",
                    history_path.display()
                ),
            }
            Some(log)
        }
        Err(err) => {
            warn!("history storage unavailable: {err}");
            None
        }
    };
    let history = HistoryRecorder::new(
        log,
        HistorySampler::from_minutes(config.history_interval_minutes),
    );

    HeatingController::new(
        config,
        runtime.timezone.clone(),
        settings,
        settings_store,
        SimulatedRelay,
        history,
    )
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

fn run_control_loop(
    mut controller: HostController,
    mut clock: SystemClock,
    mut requests: mpsc::Receiver<ControlRequest>,
    publisher: Option<StatePublisher>,
    publish_interval_ms: u64,
) {
    let mut last_publish_ms: Option<u64> = None;
    let mut last_mode: Option<ControlMode> = None;

    loop {
        let reading = clock.read();

        loop {
            match requests.try_recv() {
                Ok(request) => {
                    if !handle_request(&mut controller, &reading, request, publisher.as_ref()) {
                        return;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    stop_controller(&mut controller);
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
            .map(|last| reading.uptime_ms.saturating_sub(last) >= publish_interval_ms)
            .unwrap_or(true);
        if publish_due || report.heater_changed.is_some() {
            if let Some(publisher) = &publisher {
                publisher.publish(&controller, &reading);
            }
            last_publish_ms = Some(reading.uptime_ms);
        }

        thread::sleep(LOOP_SLEEP);
    }
}

fn stop_controller(controller: &mut HostController) {
    if let Err(err) = controller.shutdown() {
        error!("failed to switch heater off on shutdown: {err}");
    }
}

/// Returns `false` once the loop should stop.
fn handle_request(
    controller: &mut HostController,
    clock: &ClockReading,
    request: ControlRequest,
    publisher: Option<&StatePublisher>,
) -> bool {
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
        ControlRequest::Temperature(value) => {
            if !controller.record_temperature(value, clock.uptime_ms) {
                warn!("implausible temperature {value}°C; sensor marked faulted");
            }
        }
        ControlRequest::Shutdown(reply) => {
            stop_controller(controller);
            let _ = reply.send(());
            return false;
        }
    }
    true
}

/// Logs the outcome of a settings change, republishes state, and answers
/// the caller if there is one.
fn settled(
    controller: &HostController,
    clock: &ClockReading,
    result: Result<bool, SettingsError>,
    reply: Option<oneshot::Sender<Result<ControllerStatus, SettingsError>>>,
    publisher: Option<&StatePublisher>,
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

fn spawn_mqtt_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    control: mpsc::Sender<ControlRequest>,
    topics: MqttTopics,
) {
    tokio::spawn(async move {
        let mut backoff = Backoff::default();
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    backoff.reset();
                    for topic in [&topics.command, &topics.sensor] {
                        if let Err(err) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                            warn!("mqtt subscribe to {topic} failed: {err}");
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&control, &topics, &message.topic, &message.payload)
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    let delay = backoff.on_failure();
                    warn!("mqtt connection error: {err}; retrying in {}s", delay.as_secs());
                    tokio::time::sleep(delay).await;
                }
            }
        }
    });
}

async fn handle_mqtt_message(
    control: &mpsc::Sender<ControlRequest>,
    topics: &MqttTopics,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    if payload.len() > MAX_COMMAND_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let request = if topic == topics.command {
        let command = SettingsCommand::parse(payload).context("invalid command payload")?;
        ControlRequest::Command(command, None)
    } else if topic == topics.sensor {
        let text = std::str::from_utf8(payload).context("non utf8 sensor payload")?;
        let value = text
            .trim()
            .parse::<f32>()
            .with_context(|| format!("invalid temperature {text:?}"))?;
        ControlRequest::Temperature(value)
    } else {
        return Ok(());
    };

    control
        .send(request)
        .await
        .context("control thread is gone")?;
    Ok(())
}

async fn ask<T>(
    state: &AppState,
    make: impl FnOnce(oneshot::Sender<T>) -> ControlRequest,
) -> Result<T, Response> {
    let (reply, answer) = oneshot::channel();
    let unavailable =
        || error_response(StatusCode::SERVICE_UNAVAILABLE, "Controller is not running");
    state
        .control
        .send(make(reply))
        .await
        .map_err(|_| unavailable())?;
    answer.await.map_err(|_| unavailable())
}

fn settings_response(result: Result<ControllerStatus, SettingsError>) -> Response {
    match result {
        Ok(status) => Json(status).into_response(),
        Err(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist settings",
        ),
    }
}

async fn handle_get_status(State(state): State<AppState>) -> Response {
    match ask(&state, ControlRequest::Status).await {
        Ok(status) => Json(status).into_response(),
        Err(response) => response,
    }
}

async fn handle_post_config(
    State(state): State<AppState>,
    Json(command): Json<SettingsCommand>,
) -> Response {
    match ask(&state, |reply| ControlRequest::Command(command, Some(reply))).await {
        Ok(result) => settings_response(result),
        Err(response) => response,
    }
}

async fn handle_post_boost(State(state): State<AppState>) -> Response {
    match ask(&state, ControlRequest::Boost).await {
        Ok(result) => settings_response(result),
        Err(response) => response,
    }
}

async fn handle_post_nudge(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(field) = params.get("field").and_then(|name| NudgeField::parse(name)) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing or unknown 'field' parameter");
    };
    let Some(delta) = params
        .get("delta")
        .and_then(|value| value.parse::<f32>().ok())
        .filter(|value| value.is_finite())
    else {
        return error_response(StatusCode::BAD_REQUEST, "Missing or invalid 'delta' parameter");
    };

    match ask(&state, |reply| ControlRequest::Nudge {
        field,
        delta,
        reply,
    })
    .await
    {
        Ok(result) => settings_response(result),
        Err(response) => response,
    }
}

async fn handle_get_history(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let days = params.get("days").and_then(|value| value.parse::<i64>().ok());

    match ask(&state, |reply| ControlRequest::History { days, reply }).await {
        Ok(Ok(points)) => Json(points).into_response(),
        Ok(Err(err)) => {
            warn!("history read failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read history")
        }
        Err(response) => response,
    }
}

async fn handle_get_time(State(state): State<AppState>) -> Response {
    match ask(&state, ControlRequest::Time).await {
        Ok(time) => Json(time).into_response(),
        Err(response) => response,
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("HEATCTL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.heatctl"));

        Self {
            data_dir: Arc::new(data_dir),
        }
    }

    fn runtime_path(&self) -> PathBuf {
        self.data_dir.join("runtime.json")
    }

    fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    fn history_path(&self, file: &str) -> PathBuf {
        let file = Path::new(file);
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.data_dir.join(file)
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let runtime = RuntimeConfig::default();
                if let Err(err) = self.save_runtime_config(&runtime).await {
                    warn!("failed to write default runtime config: {err:#}");
                }
                Ok(runtime)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let path = self.runtime_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

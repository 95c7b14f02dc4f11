use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{Local, Utc};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{info, warn};

use pilotwire_common::{
    config::NetworkConfig,
    telemetry::{parse_power, parse_temperature, reading_age_ms, MAX_TELEMETRY_PAYLOAD_BYTES},
    CommandOrigin, EngineConfig, EngineEvent, EngineStatus, HeatingLevel, ModeCommand,
    OffloadEvent, OutputFault, PilotwireEngine, RuntimeConfig, SignalOutput, TelemetryConfig,
    TOPIC_CMD_MODE, TOPIC_CMD_OUTSIDE, TOPIC_CMD_POWER, TOPIC_CMD_TARGET, TOPIC_STAT_STATE,
    TOPIC_STAT_STATUS,
};

type Engine = PilotwireEngine<LoggingOutput>;

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<Engine>>,
    telemetry: Arc<TelemetryConfig>,
    mqtt: AsyncClient,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Default)]
struct LoggingOutput {
    lines: Option<(bool, bool)>,
}

impl SignalOutput for LoggingOutput {
    fn set_lines(&mut self, positive: bool, negative: bool) -> Result<(), OutputFault> {
        if self.lines != Some((positive, negative)) {
            info!("pilot wire lines: positive={positive} negative={negative}");
        }
        self.lines = Some((positive, negative));
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    status: EngineStatus,
    #[serde(rename = "nowEpoch")]
    now_epoch: i64,
}

#[derive(Debug, Serialize)]
struct NetworkConfigView {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    wifi_pass_set: bool,
    #[serde(rename = "mqttHost")]
    mqtt_host: String,
    #[serde(rename = "mqttPort")]
    mqtt_port: u16,
    #[serde(rename = "mqttUser")]
    mqtt_user: String,
    #[serde(rename = "mqttPassSet")]
    mqtt_pass_set: bool,
}

#[derive(Debug, Serialize)]
struct ConfigView {
    engine: EngineConfig,
    telemetry: TelemetryConfig,
    network: NetworkConfigView,
}

#[derive(Debug, Deserialize)]
struct ConfigUpdate {
    engine: EngineConfig,
    #[serde(default)]
    telemetry: Option<TelemetryConfig>,
}

#[derive(Debug, Serialize)]
struct ConfigUpdateResponse {
    #[serde(rename = "restartRequired")]
    restart_required: bool,
    config: ConfigView,
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
    if let Err(err) = runtime.engine.validate() {
        warn!("stored engine config rejected ({err}), using defaults");
        runtime.engine = EngineConfig::default();
    }

    let engine = PilotwireEngine::new(
        runtime.engine.clone(),
        LoggingOutput::default(),
        monotonic_ms(),
    )
    .context("invalid engine configuration")?;
    info!(
        "pilotwire engine ready: {} heater, target {:.1} °C",
        runtime.engine.capability, runtime.engine.regulation.target_temp_c
    );

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("pilotwire-controller-rust", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        engine: Arc::new(Mutex::new(engine)),
        telemetry: Arc::new(runtime.telemetry),
        mqtt,
        store,
    };

    subscribe_topics(&app_state.mqtt, &app_state.telemetry).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(app_state.clone());
    spawn_state_publish_loop(app_state.clone());

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/mode", post(handle_set_mode))
        .route("/api/outside", post(handle_set_outside))
        .route("/api/target", post(handle_set_target))
        .route(
            "/api/config",
            get(handle_get_config).put(handle_put_config),
        )
        .with_state(app_state);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn subscribe_topics(mqtt: &AsyncClient, telemetry: &TelemetryConfig) -> anyhow::Result<()> {
    let topics = [
        telemetry.power_topic.as_str(),
        telemetry.temperature_topic.as_str(),
        TOPIC_CMD_MODE,
        TOPIC_CMD_POWER,
        TOPIC_CMD_OUTSIDE,
        TOPIC_CMD_TARGET,
    ];

    for topic in topics {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) = handle_mqtt_message(
                        &app_state,
                        message.topic,
                        message.payload.to_vec(),
                        message.retain,
                    )
                    .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut period_ms = app_state.engine.lock().await.config().tick_interval_ms;
        let mut interval = tokio::time::interval(Duration::from_millis(period_ms));

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();

            let (events, fault, configured_ms) = {
                let mut engine = app_state.engine.lock().await;
                let events = engine.tick(now_ms);
                (
                    events,
                    engine.take_output_fault(),
                    engine.config().tick_interval_ms,
                )
            };

            log_engine_events(&events);
            if let Some(fault) = fault {
                warn!("pilot wire output fault: {fault}");
            }

            if configured_ms != period_ms {
                info!("control tick interval changed to {configured_ms} ms");
                period_ms = configured_ms;
                interval = tokio::time::interval(Duration::from_millis(period_ms));
            }
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            publish_state(&app_state).await;
        }
    });
}

async fn publish_state(app_state: &AppState) {
    let now_ms = monotonic_ms();
    let (state_payload, status_payload) = {
        let engine = app_state.engine.lock().await;
        (
            serde_json::to_vec(&engine.state_payload(now_ms)),
            serde_json::to_vec(&engine.status(now_ms)),
        )
    };

    for (topic, payload) in [
        (TOPIC_STAT_STATE, state_payload),
        (TOPIC_STAT_STATUS, status_payload),
    ] {
        match payload {
            Ok(body) => {
                if let Err(err) = app_state
                    .mqtt
                    .publish(topic, QoS::AtLeastOnce, true, body)
                    .await
                {
                    warn!("{topic} publish failed: {err}");
                }
            }
            Err(err) => warn!("{topic} serialization failed: {err}"),
        }
    }
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: String,
    payload: Vec<u8>,
    retained: bool,
) -> anyhow::Result<()> {
    if payload.len() > MAX_TELEMETRY_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;
    let now_ms = monotonic_ms();
    let telemetry = app_state.telemetry.as_ref();

    if topic == telemetry.power_topic {
        let Some(watts) = parse_power(&message, telemetry.power_key.as_deref()) else {
            warn!("ignoring unusable power payload on {topic}: {message}");
            return Ok(());
        };
        let events = {
            let mut engine = app_state.engine.lock().await;
            let mut events = engine.on_power_sample(watts, now_ms);
            if events.iter().any(is_offload_transition) {
                events.extend(engine.tick(now_ms));
            }
            events
        };
        log_engine_events(&events);
        return Ok(());
    }

    if topic == telemetry.temperature_topic {
        let Some(celsius) = parse_temperature(&message, telemetry.temperature_key.as_deref())
        else {
            warn!("ignoring unusable temperature payload on {topic}: {message}");
            return Ok(());
        };
        let age_ms = match reading_age_ms(&message, Local::now().naive_local()) {
            Some(age_ms) => age_ms,
            None if retained => {
                info!("ignoring retained undated temperature, waiting for a live reading");
                return Ok(());
            }
            None => 0,
        };
        let plausible = {
            let mut engine = app_state.engine.lock().await;
            engine.update_remote_temperature_aged(celsius, age_ms, now_ms)
        };
        if !plausible {
            warn!("remote temperature {celsius:.1} °C is out of range");
        }
        return Ok(());
    }

    match topic.as_str() {
        TOPIC_CMD_MODE => {
            if submit_mode(app_state, &message, CommandOrigin::ModeSet)
                .await
                .is_ok()
            {
                publish_state(app_state).await;
            }
        }
        TOPIC_CMD_POWER => {
            // Relay-style power commands never drive the pilot wire; the
            // rejection is logged by submit_mode.
            let _ = submit_mode(app_state, &message, CommandOrigin::PowerCommand).await;
        }
        TOPIC_CMD_OUTSIDE => {
            let Some(outside) = parse_switch(&message) else {
                warn!("invalid outside mode payload: {message}");
                return Ok(());
            };
            if set_outside_mode(app_state, outside).await {
                publish_state(app_state).await;
            }
        }
        TOPIC_CMD_TARGET => {
            let Ok(target) = message.trim().parse::<f32>() else {
                warn!("invalid target temperature payload: {message}");
                return Ok(());
            };
            let changed = {
                let mut engine = app_state.engine.lock().await;
                engine.set_target_temp(target)
            };
            match changed {
                Ok(true) => persist_runtime_from_state(app_state).await?,
                Ok(false) => {}
                Err(err) => warn!("target temperature rejected: {err}"),
            }
        }
        _ => {}
    }
    Ok(())
}

async fn submit_mode(
    app_state: &AppState,
    value: &str,
    origin: CommandOrigin,
) -> anyhow::Result<HeatingLevel> {
    let level = value.trim().parse::<HeatingLevel>().map_err(|err| {
        warn!("{origin} command ignored: {err}");
        err
    })?;

    let (result, events) = {
        let mut engine = app_state.engine.lock().await;
        match engine.submit_command(ModeCommand::new(level, origin)) {
            Ok(()) => (Ok(level), engine.tick(monotonic_ms())),
            Err(rejection) => (Err(rejection), Vec::new()),
        }
    };

    match result {
        Ok(level) => {
            info!("{origin} command accepted: {level}");
            log_engine_events(&events);
            Ok(level)
        }
        Err(rejection) => {
            warn!("{origin} command for {level} rejected: {rejection}");
            Err(rejection.into())
        }
    }
}

async fn set_outside_mode(app_state: &AppState, outside: bool) -> bool {
    let events = {
        let mut engine = app_state.engine.lock().await;
        if !engine.set_outside_mode(outside) {
            return false;
        }
        engine.tick(monotonic_ms())
    };
    info!("outside mode {}", if outside { "on" } else { "off" });
    log_engine_events(&events);
    true
}

fn is_offload_transition(event: &EngineEvent) -> bool {
    matches!(
        event,
        EngineEvent::Offload(OffloadEvent::Offloaded { .. } | OffloadEvent::Restored { .. })
    )
}

fn log_engine_events(events: &[EngineEvent]) {
    for event in events {
        match event {
            EngineEvent::LevelChanged { from, to, source } => {
                info!("heating level {from} -> {to} ({source:?})");
            }
            EngineEvent::Offload(OffloadEvent::Offloaded { power_w }) => {
                warn!("offloading heater, installation draws {power_w:.0} W");
            }
            EngineEvent::Offload(OffloadEvent::Restored {
                power_w,
                offloaded_for_ms,
            }) => {
                info!(
                    "load restored at {power_w:.0} W after {}s",
                    offloaded_for_ms / 1_000
                );
            }
            EngineEvent::Offload(OffloadEvent::RestorePending { power_w }) => {
                info!("power back to {power_w:.0} W, waiting before restore");
            }
            EngineEvent::Offload(OffloadEvent::TelemetryStale {
                state,
                silent_for_ms,
            }) => {
                warn!(
                    "no power telemetry for {}s, holding {}",
                    silent_for_ms / 1_000,
                    state.as_str()
                );
            }
            EngineEvent::Offload(OffloadEvent::TelemetryResumed) => {
                info!("power telemetry resumed");
            }
            EngineEvent::OutputFaulted { level } => {
                warn!("failed to drive {level} onto the pilot wire, retrying next tick");
            }
        }
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let now_ms = monotonic_ms();
    let status = {
        let engine = state.engine.lock().await;
        engine.status(now_ms)
    };

    Json(StatusResponse {
        status,
        now_epoch: Utc::now().timestamp(),
    })
}

async fn handle_set_mode(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };

    let origin = params
        .get("origin")
        .map(|tag| CommandOrigin::from_tag(tag))
        .unwrap_or(CommandOrigin::ModeSet);

    if let Err(err) = submit_mode(&state, value, origin).await {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }
    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_outside(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(outside) = parse_switch(value) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid value. Use 'on' or 'off'");
    };

    set_outside_mode(&state, outside).await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_target(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(target) = value.parse::<f32>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value");
    };

    let changed = {
        let mut engine = state.engine.lock().await;
        engine.set_target_temp(target)
    };
    match changed {
        Ok(true) => {
            if let Err(err) = persist_runtime_from_state(&state).await {
                warn!("failed to persist target update: {err:#}");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to persist runtime settings",
                );
            }
        }
        Ok(false) => {}
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    }
    handle_get_status(State(state)).await.into_response()
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    let runtime = state
        .store
        .load_runtime_config()
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load runtime config from store: {err:#}");
            RuntimeConfig::default()
        });
    let engine = state.engine.lock().await.config().clone();

    Json(build_config_view(engine, runtime.telemetry, &runtime.network))
}

async fn handle_put_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> impl IntoResponse {
    let previous_tick_ms = {
        let mut engine = state.engine.lock().await;
        let previous_tick_ms = engine.config().tick_interval_ms;
        if let Err(err) = engine.reconfigure(update.engine.clone()) {
            return error_response(StatusCode::BAD_REQUEST, &err.to_string());
        }
        previous_tick_ms
    };
    info!(
        "engine reconfigured (tick {previous_tick_ms} -> {} ms)",
        update.engine.tick_interval_ms
    );

    let mut runtime = state
        .store
        .load_runtime_config()
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load existing runtime config for update: {err:#}");
            RuntimeConfig::default()
        });
    runtime.engine = update.engine;
    if let Some(telemetry) = update.telemetry {
        runtime.telemetry = telemetry;
    }

    if let Err(err) = state.store.save_runtime_config(&runtime).await {
        warn!("failed to persist config update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }

    let payload = ConfigUpdateResponse {
        restart_required: runtime.telemetry != *state.telemetry,
        config: build_config_view(runtime.engine, runtime.telemetry, &runtime.network),
    };
    Json(payload).into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("PILOTWIRE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.pilotwire"));
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

async fn persist_runtime_from_state(state: &AppState) -> anyhow::Result<()> {
    let engine = state.engine.lock().await.config().clone();
    let mut runtime = state.store.load_runtime_config().await?;
    runtime.engine = engine;
    state.store.save_runtime_config(&runtime).await
}

fn build_config_view(
    engine: EngineConfig,
    telemetry: TelemetryConfig,
    network: &NetworkConfig,
) -> ConfigView {
    ConfigView {
        engine,
        telemetry,
        network: NetworkConfigView {
            wifi_ssid: network.wifi_ssid.clone(),
            wifi_pass_set: !network.wifi_pass.is_empty(),
            mqtt_host: network.mqtt_host.clone(),
            mqtt_port: network.mqtt_port,
            mqtt_user: network.mqtt_user.clone(),
            mqtt_pass_set: !network.mqtt_pass.is_empty(),
        },
    }
}

fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "1" | "true" | "yes" => Some(true),
        "off" | "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_payloads() {
        assert_eq!(parse_switch("ON"), Some(true));
        assert_eq!(parse_switch(" 0 "), Some(false));
        assert_eq!(parse_switch("maybe"), None);
    }

    #[test]
    fn logging_output_never_faults() {
        let mut output = LoggingOutput::default();
        assert!(output.set_lines(true, false).is_ok());
        assert_eq!(output.lines, Some((true, false)));
    }

    #[test]
    fn only_offload_transitions_trigger_an_immediate_tick() {
        assert!(is_offload_transition(&EngineEvent::Offload(
            OffloadEvent::Offloaded { power_w: 3_000.0 }
        )));
        assert!(!is_offload_transition(&EngineEvent::Offload(
            OffloadEvent::TelemetryResumed
        )));
    }
}

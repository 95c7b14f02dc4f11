use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{Datelike, Local, NaiveDateTime};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::Method,
    io::Write,
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, IOPin, InputOutput, Output, OutputPin, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};
use serde::Serialize;

use pilotwire_common::{
    config::NetworkConfig,
    telemetry::{parse_power, parse_temperature, reading_age_ms, MAX_TELEMETRY_PAYLOAD_BYTES},
    CommandOrigin, EngineConfig, EngineEvent, EngineStatus, HeatingLevel, ModeCommand,
    OffloadEvent, OutputFault, PilotwireEngine, RuntimeConfig, SignalOutput, TelemetryConfig,
    TOPIC_CMD_MODE, TOPIC_CMD_OUTSIDE, TOPIC_CMD_POWER, TOPIC_CMD_TARGET, TOPIC_STAT_STATE,
};

const NVS_NAMESPACE: &str = "pilotwire";
const NVS_RUNTIME_KEY: &str = "runtime_json";

const PILOT_POSITIVE_PIN: i32 = 4;
const PILOT_NEGATIVE_PIN: i32 = 5;
const DS18B20_PIN: i32 = 6;

const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const LOCAL_TEMP_PERIOD_MS: u64 = 30_000;
const STATE_PUBLISH_PERIOD_MS: u64 = 10_000;
const MIN_WALL_CLOCK_YEAR: i32 = 2024;

type Engine = PilotwireEngine<GpioOutput>;
type Mqtt = Arc<Mutex<EspMqttClient<'static>>>;

#[derive(Clone)]
struct SharedState {
    engine: Arc<Mutex<Engine>>,
    telemetry: Arc<TelemetryConfig>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    status: EngineStatus,
    #[serde(rename = "uptimeMs")]
    uptime_ms: u64,
}

struct GpioOutput {
    positive: PinDriver<'static, AnyOutputPin, Output>,
    negative: PinDriver<'static, AnyOutputPin, Output>,
}

impl SignalOutput for GpioOutput {
    fn set_lines(&mut self, positive: bool, negative: bool) -> Result<(), OutputFault> {
        drive(&mut self.positive, positive)
            .map_err(|err| OutputFault(format!("GPIO{PILOT_POSITIVE_PIN}: {err}")))?;
        drive(&mut self.negative, negative)
            .map_err(|err| OutputFault(format!("GPIO{PILOT_NEGATIVE_PIN}: {err}")))
    }
}

fn drive(
    pin: &mut PinDriver<'static, AnyOutputPin, Output>,
    high: bool,
) -> Result<(), esp_idf_svc::sys::EspError> {
    if high {
        pin.set_high()
    } else {
        pin.set_low()
    }
}

struct LocalSensor {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    address: Option<Address>,
    delay: Ets,
}

impl LocalSensor {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut one_wire_pin = PinDriver::input_output_od(pin)?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;

        let one_wire = OneWire::new(one_wire_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut sensor = Self {
            one_wire,
            address: None,
            delay: Ets,
        };
        sensor.scan();
        Ok(sensor)
    }

    fn scan(&mut self) {
        self.address = None;
        for device in self.one_wire.devices(false, &mut self.delay) {
            match device {
                Ok(address) if address.family_code() == ds18b20::FAMILY_CODE => {
                    self.address = Some(address);
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        match self.address {
            Some(address) => info!("DS18B20 ready on GPIO{DS18B20_PIN} ({address:?})"),
            None => warn!("no DS18B20 found on GPIO{DS18B20_PIN}"),
        }
    }

    fn read_celsius(&mut self) -> Option<f32> {
        if self.address.is_none() {
            self.scan();
        }
        let address = self.address?;

        let sensor = match Ds18b20::new::<core::convert::Infallible>(address) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!("invalid DS18B20 address {address:?}: {err:?}");
                self.address = None;
                return None;
            }
        };

        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            warn!("failed to start DS18B20 conversion: {err:?}");
            self.address = None;
            return None;
        }
        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);

        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => Some(data.temperature),
            Err(err) => {
                warn!("failed to read DS18B20 data: {err:?}");
                self.address = None;
                None
            }
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    if let Err(err) = runtime.engine.validate() {
        warn!("stored engine config rejected ({err}), using defaults");
        runtime.engine = EngineConfig::default();
    }

    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let output = GpioOutput {
        positive: PinDriver::output(pins.gpio4.downgrade_output())?,
        negative: PinDriver::output(pins.gpio5.downgrade_output())?,
    };
    let engine = PilotwireEngine::new(runtime.engine.clone(), output, monotonic_ms())
        .context("invalid engine configuration")?;
    info!(
        "pilotwire engine ready: {} heater on GPIO{PILOT_POSITIVE_PIN}/GPIO{PILOT_NEGATIVE_PIN}",
        runtime.engine.capability
    );

    let local_sensor = match LocalSensor::new(pins.gpio6.downgrade()) {
        Ok(sensor) => Some(sensor),
        Err(err) => {
            warn!("local temperature sensor unavailable: {err:#}");
            None
        }
    };

    let state = SharedState {
        engine: Arc::new(Mutex::new(engine)),
        telemetry: Arc::new(runtime.telemetry.clone()),
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    // The heater keeps regulating on the local sensor when the network is down;
    // power telemetry then goes stale and the offload state is held.
    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network) {
        Ok(wifi) => Some(wifi),
        Err(err) => {
            warn!("running offline: {err:#}");
            None
        }
    };

    let mqtt = if wifi.is_some() {
        let (client, conn) = create_mqtt_client(&runtime.network)?;
        let client = Arc::new(Mutex::new(client));
        subscribe_topics(&client, &state.telemetry)?;
        spawn_mqtt_receiver(state.clone(), nvs_store.clone(), conn, client.clone())?;
        Some(client)
    } else {
        None
    };

    spawn_control_loop(state.clone(), mqtt, local_sensor)?;

    let server = if wifi.is_some() {
        Some(create_http_server(state, nvs_store)?)
    } else {
        None
    };

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.is_empty() {
        return Err(anyhow!("wifi credentials missing"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

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

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        let _ = wifi.stop();
        return Err(anyhow!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed: {err:#}"));
    }

    drop(wifi);
    Ok(esp_wifi)
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some("pilotwire-controller"),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &Mqtt, telemetry: &TelemetryConfig) -> anyhow::Result<()> {
    let topics = [
        telemetry.power_topic.as_str(),
        telemetry.temperature_topic.as_str(),
        TOPIC_CMD_MODE,
        TOPIC_CMD_POWER,
        TOPIC_CMD_OUTSIDE,
        TOPIC_CMD_TARGET,
    ];

    let mut mqtt = lock(mqtt);
    for topic in topics {
        mqtt.subscribe(topic, QoS::AtMostOnce)?;
    }
    Ok(())
}

fn spawn_mqtt_receiver(
    state: SharedState,
    nvs_store: NvsStore,
    mut conn: EspMqttConnection,
    mqtt: Mqtt,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => {
                    let EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } = event.payload()
                    else {
                        continue;
                    };
                    if !matches!(details, Details::Complete) {
                        continue;
                    }
                    if data.len() > MAX_TELEMETRY_PAYLOAD_BYTES {
                        warn!(
                            "dropping oversized MQTT payload on topic {} ({} bytes)",
                            topic,
                            data.len()
                        );
                        continue;
                    }
                    if let Ok(message) = core::str::from_utf8(data) {
                        if let Err(err) = handle_mqtt_message(&state, &nvs_store, topic, message)
                        {
                            warn!("mqtt message handling failed: {err:#}");
                        }
                    }
                }
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    if let Err(sub_err) = subscribe_topics(&mqtt, &state.telemetry) {
                        warn!("mqtt re-subscribe failed: {sub_err:#}");
                    }
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

fn spawn_control_loop(
    state: SharedState,
    mqtt: Option<Mqtt>,
    mut local_sensor: Option<LocalSensor>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let mut last_sensor_read_ms: Option<u64> = None;
            let mut last_state_publish_ms = 0_u64;

            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();

                if let Some(sensor) = local_sensor.as_mut() {
                    let due = last_sensor_read_ms
                        .map(|last| now_ms.saturating_sub(last) >= LOCAL_TEMP_PERIOD_MS)
                        .unwrap_or(true);
                    if due {
                        last_sensor_read_ms = Some(now_ms);
                        if let Some(celsius) = sensor.read_celsius() {
                            if !lock(&state.engine).update_local_temperature(celsius, now_ms) {
                                warn!("local temperature {celsius:.1} °C is out of range");
                            }
                        }
                    }
                }

                let (events, fault, tick_ms) = {
                    let mut engine = lock(&state.engine);
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

                if let Some(mqtt) = mqtt.as_ref() {
                    if now_ms.saturating_sub(last_state_publish_ms) >= STATE_PUBLISH_PERIOD_MS {
                        last_state_publish_ms = now_ms;
                        if let Err(err) = publish_state(&state, mqtt) {
                            warn!("state publish failed: {err:#}");
                        }
                    }
                }

                thread::sleep(Duration::from_millis(tick_ms));
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

fn publish_state(state: &SharedState, mqtt: &Mqtt) -> anyhow::Result<()> {
    let now_ms = monotonic_ms();
    let payload = {
        let engine = lock(&state.engine);
        serde_json::to_vec(&engine.state_payload(now_ms))?
    };

    lock(mqtt).publish(TOPIC_STAT_STATE, QoS::AtLeastOnce, true, &payload)?;
    Ok(())
}

fn handle_mqtt_message(
    state: &SharedState,
    nvs_store: &NvsStore,
    topic: &str,
    message: &str,
) -> anyhow::Result<()> {
    let now_ms = monotonic_ms();
    let telemetry = state.telemetry.as_ref();

    if topic == telemetry.power_topic {
        let Some(watts) = parse_power(message, telemetry.power_key.as_deref()) else {
            warn!("ignoring unusable power payload on {topic}: {message}");
            return Ok(());
        };
        let mut engine = lock(&state.engine);
        let mut events = engine.on_power_sample(watts, now_ms);
        if events.iter().any(is_offload_transition) {
            events.extend(engine.tick(now_ms));
        }
        drop(engine);
        log_engine_events(&events);
        return Ok(());
    }

    if topic == telemetry.temperature_topic {
        let Some(celsius) = parse_temperature(message, telemetry.temperature_key.as_deref())
        else {
            warn!("ignoring unusable temperature payload on {topic}: {message}");
            return Ok(());
        };
        let age_ms = wall_clock()
            .and_then(|now| reading_age_ms(message, now))
            .unwrap_or(0);
        if !lock(&state.engine).update_remote_temperature_aged(celsius, age_ms, now_ms) {
            warn!("remote temperature {celsius:.1} °C is out of range");
        }
        return Ok(());
    }

    match topic {
        TOPIC_CMD_MODE => {
            let _ = submit_mode(state, message, CommandOrigin::ModeSet);
        }
        TOPIC_CMD_POWER => {
            let _ = submit_mode(state, message, CommandOrigin::PowerCommand);
        }
        TOPIC_CMD_OUTSIDE => match parse_switch(message) {
            Some(outside) => set_outside_mode(state, outside),
            None => warn!("invalid outside mode payload: {message}"),
        },
        TOPIC_CMD_TARGET => {
            let Ok(target) = message.trim().parse::<f32>() else {
                warn!("invalid target temperature payload: {message}");
                return Ok(());
            };
            let changed = lock(&state.engine).set_target_temp(target);
            match changed {
                Ok(true) => persist_runtime_from_state(nvs_store, state)?,
                Ok(false) => {}
                Err(err) => warn!("target temperature rejected: {err}"),
            }
        }
        _ => {}
    }
    Ok(())
}

fn submit_mode(
    state: &SharedState,
    value: &str,
    origin: CommandOrigin,
) -> anyhow::Result<HeatingLevel> {
    let level = value.trim().parse::<HeatingLevel>().map_err(|err| {
        warn!("{origin} command ignored: {err}");
        err
    })?;

    let mut engine = lock(&state.engine);
    if let Err(rejection) = engine.submit_command(ModeCommand::new(level, origin)) {
        warn!("{origin} command for {level} rejected: {rejection}");
        return Err(rejection.into());
    }
    let events = engine.tick(monotonic_ms());
    drop(engine);

    info!("{origin} command accepted: {level}");
    log_engine_events(&events);
    Ok(level)
}

fn set_outside_mode(state: &SharedState, outside: bool) {
    let mut engine = lock(&state.engine);
    if !engine.set_outside_mode(outside) {
        return;
    }
    let events = engine.tick(monotonic_ms());
    drop(engine);

    info!("outside mode {}", if outside { "on" } else { "off" });
    log_engine_events(&events);
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

fn create_http_server(
    state: SharedState,
    nvs_store: NvsStore,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 12 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            write_json(req, &build_status(&state))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/mode", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let Some(value) = query_param(&uri, "value") else {
                return write_error(req, 400, "Missing 'value' parameter");
            };
            let origin = query_param(&uri, "origin")
                .map(|tag| CommandOrigin::from_tag(&tag))
                .unwrap_or(CommandOrigin::ModeSet);
            if let Err(err) = submit_mode(&state, &value, origin) {
                return write_error(req, 400, &err.to_string());
            }
            write_json(req, &build_status(&state))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/outside", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let Some(outside) = query_param(&uri, "value").and_then(|value| parse_switch(&value))
            else {
                return write_error(req, 400, "Missing or invalid 'value' parameter");
            };
            set_outside_mode(&state, outside);
            write_json(req, &build_status(&state))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/target", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let Some(target) =
                query_param(&uri, "value").and_then(|value| value.parse::<f32>().ok())
            else {
                return write_error(req, 400, "Missing or invalid 'value' parameter");
            };

            let changed = lock(&state.engine).set_target_temp(target);
            match changed {
                Ok(true) => persist_runtime_from_state(&nvs_store, &state)?,
                Ok(false) => {}
                Err(err) => return write_error(req, 400, &err.to_string()),
            }
            write_json(req, &build_status(&state))
        })?;
    }

    Ok(server)
}

fn build_status(state: &SharedState) -> StatusResponse {
    let now_ms = monotonic_ms();
    StatusResponse {
        status: lock(&state.engine).status(now_ms),
        uptime_ms: now_ms,
    }
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&serde_json::json!({ "error": message }))?;
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

fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "1" | "true" | "yes" => Some(true),
        "off" | "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn persist_runtime_from_state(nvs_store: &NvsStore, state: &SharedState) -> anyhow::Result<()> {
    let engine = lock(&state.engine).config().clone();
    let mut runtime = nvs_store.load_runtime_config().unwrap_or_default();
    runtime.engine = engine;
    nvs_store.save_runtime_config(&runtime)
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = lock(&self.lock);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = lock(&self.lock);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
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

fn wall_clock() -> Option<NaiveDateTime> {
    let now = Local::now().naive_local();
    (now.year() >= MIN_WALL_CLOCK_YEAR).then_some(now)
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

use std::time::Duration;

use anyhow::Context;
use chrono::{Local, NaiveDateTime};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tracing::{info, warn};

use pilotwire_common::{TOPIC_TELE_POWER, TOPIC_TELE_TEMPERATURE};

const BASE_LOAD_W: f32 = 1_800.0;
const HEATER_LOAD_W: f32 = 1_500.0;
// Short appliance burst, large enough to trip the default offload ceiling.
const SPIKE_LOAD_W: f32 = 3_000.0;
const SPIKE_EVERY_TICKS: u64 = 20;
const SPIKE_TICKS: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Reading {
    power_w: f32,
    temperature_c: f32,
}

fn simulate(tick: u64) -> Reading {
    let heater_on = (tick / 6) % 2 == 0;
    let spiking = tick % SPIKE_EVERY_TICKS >= SPIKE_EVERY_TICKS - SPIKE_TICKS;

    let mut power_w = BASE_LOAD_W + (tick % 5) as f32 * 40.0;
    if heater_on {
        power_w += HEATER_LOAD_W;
    }
    if spiking {
        power_w += SPIKE_LOAD_W;
    }

    // Triangle wave between 18.8 and 21.2 °C.
    let phase = (tick % 24) as f32;
    let temperature_c = if phase < 12.0 {
        18.8 + phase * 0.2
    } else {
        21.2 - (phase - 12.0) * 0.2
    };

    Reading {
        power_w,
        temperature_c,
    }
}

fn power_payload(power_w: f32, json: bool) -> String {
    if json {
        serde_json::json!({ "ENERGY": { "Power": power_w.round() } }).to_string()
    } else {
        format!("{power_w:.0}")
    }
}

fn temperature_payload(temperature_c: f32, json: bool, measured: NaiveDateTime) -> String {
    if json {
        serde_json::json!({
            "Time": measured.format("%Y-%m-%dT%H:%M:%S").to_string(),
            "DS18B20": { "Temperature": (temperature_c * 10.0).round() / 10.0 },
        })
        .to_string()
    } else {
        format!("{temperature_c:.1}")
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);
    let interval_secs = std::env::var("TELEMETRY_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(10);
    let json = std::env::var("TELEMETRY_JSON").is_ok_and(|value| value == "1");

    let mut mqtt_options = MqttOptions::new("pilotwire-telemetry-rust", mqtt_host, mqtt_port);
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    tokio::spawn(async move {
        loop {
            if let Err(err) = eventloop.poll().await {
                warn!("telemetry mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });

    info!("telemetry simulator started, publishing every {interval_secs}s");

    let mut tick: u64 = 0;
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;
        let reading = simulate(tick);
        tick = tick.saturating_add(1);

        mqtt.publish(
            TOPIC_TELE_POWER,
            QoS::AtLeastOnce,
            false,
            power_payload(reading.power_w, json),
        )
        .await
        .context("failed to publish power reading")?;
        // Only dated readings are retained; the controller ignores undated retained ones.
        mqtt.publish(
            TOPIC_TELE_TEMPERATURE,
            QoS::AtLeastOnce,
            json,
            temperature_payload(reading.temperature_c, json, Local::now().naive_local()),
        )
        .await
        .context("failed to publish temperature reading")?;
    }
}

#[cfg(test)]
mod tests {
    use pilotwire_common::{
        telemetry::{parse_power, parse_temperature, reading_age_ms},
        TelemetryConfig,
    };

    use super::*;

    #[test]
    fn spike_crosses_default_ceiling() {
        let peak = (0..SPIKE_EVERY_TICKS)
            .map(|tick| simulate(tick).power_w)
            .fold(0.0, f32::max);
        assert!(peak >= 6_000.0);
        assert!(simulate(0).power_w < 5_500.0);
    }

    #[test]
    fn temperature_stays_around_default_target() {
        for tick in 0..48 {
            let celsius = simulate(tick).temperature_c;
            assert!((18.7..=21.3).contains(&celsius), "tick {tick}: {celsius}");
        }
    }

    #[test]
    fn payloads_parse_with_controller_default_keys() {
        let keys = TelemetryConfig::default();
        let power_key = keys.power_key.as_deref();
        let temperature_key = keys.temperature_key.as_deref();
        let measured =
            NaiveDateTime::parse_from_str("2024-01-15 07:30:00", "%Y-%m-%d %H:%M:%S").unwrap();

        for json in [false, true] {
            assert_eq!(
                parse_power(&power_payload(3_340.0, json), power_key),
                Some(3_340.0)
            );
            assert_eq!(
                parse_temperature(&temperature_payload(19.4, json, measured), temperature_key),
                Some(19.4)
            );
        }
    }

    #[test]
    fn json_temperature_carries_measurement_time() {
        let measured =
            NaiveDateTime::parse_from_str("2024-01-15 07:30:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let later =
            NaiveDateTime::parse_from_str("2024-01-15 07:31:00", "%Y-%m-%d %H:%M:%S").unwrap();

        let payload = temperature_payload(19.4, true, measured);
        assert_eq!(reading_age_ms(&payload, later), Some(60_000));
        assert_eq!(reading_age_ms(&temperature_payload(19.4, false, measured), later), None);
    }
}

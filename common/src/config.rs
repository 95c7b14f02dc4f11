use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, protocol::HeaterCapability, topics, types::HeatingLevel};

pub const MIN_TARGET_TEMP_C: f32 = 5.0;
pub const MAX_TARGET_TEMP_C: f32 = 30.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegulationConfig {
    pub target_temp_c: f32,
    // Total width of the dead band centred on the effective setpoint.
    pub hysteresis_c: f32,
    pub outside_offset_c: f32,
    // Extra deficit below the band that escalates a dual-level heater to Comfort2.
    #[serde(default)]
    pub escalation_delta_c: Option<f32>,
}

impl Default for RegulationConfig {
    fn default() -> Self {
        Self {
            target_temp_c: 20.0,
            hysteresis_c: 0.5,
            outside_offset_c: 3.0,
            escalation_delta_c: None,
        }
    }
}

impl RegulationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.target_temp_c.is_finite()
            || !(MIN_TARGET_TEMP_C..=MAX_TARGET_TEMP_C).contains(&self.target_temp_c)
        {
            return Err(ConfigError::TargetOutOfRange(self.target_temp_c));
        }
        if !self.hysteresis_c.is_finite() || self.hysteresis_c <= 0.0 {
            return Err(ConfigError::InvalidHysteresis(self.hysteresis_c));
        }
        if !self.outside_offset_c.is_finite() || self.outside_offset_c < 0.0 {
            return Err(ConfigError::InvalidOutsideOffset(self.outside_offset_c));
        }
        if let Some(delta) = self.escalation_delta_c {
            if !delta.is_finite() || delta <= 0.0 {
                return Err(ConfigError::InvalidEscalationDelta(delta));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffloadConfig {
    pub max_power_w: f32,
    pub restore_power_w: f32,
    pub telemetry_timeout_ms: u64,
    #[serde(default)]
    pub restore_delay_ms: u64,
    pub shed_level: HeatingLevel,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            max_power_w: 6_000.0,
            restore_power_w: 5_500.0,
            telemetry_timeout_ms: 120_000,
            restore_delay_ms: 0,
            shed_level: HeatingLevel::FrostProtection,
        }
    }
}

impl OffloadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.max_power_w.is_finite() || self.max_power_w <= 0.0 {
            return Err(ConfigError::InvalidMaxPower(self.max_power_w));
        }
        if !self.restore_power_w.is_finite() || self.restore_power_w < 0.0 {
            return Err(ConfigError::InvalidRestorePower(self.restore_power_w));
        }
        if self.restore_power_w >= self.max_power_w {
            return Err(ConfigError::RestoreNotBelowMax {
                restore: self.restore_power_w,
                max: self.max_power_w,
            });
        }
        if self.telemetry_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration("telemetry_timeout_ms"));
        }
        if !matches!(
            self.shed_level,
            HeatingLevel::Off | HeatingLevel::FrostProtection
        ) {
            return Err(ConfigError::InvalidShedLevel(self.shed_level));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub regulation: RegulationConfig,
    pub offload: OffloadConfig,
    pub capability: HeaterCapability,
    pub temperature_stale_ms: u64,
    pub tick_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            regulation: RegulationConfig::default(),
            offload: OffloadConfig::default(),
            capability: HeaterCapability::SingleLevel,
            temperature_stale_ms: 600_000,
            tick_interval_ms: 1_000,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.regulation.validate()?;
        self.offload.validate()?;
        if self.temperature_stale_ms == 0 {
            return Err(ConfigError::ZeroDuration("temperature_stale_ms"));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::ZeroDuration("tick_interval_ms"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "openhab.local".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

// Tasmota `SENSOR` layout. Bare numeric payloads parse regardless of key.
pub const DEFAULT_POWER_KEY: &str = "ENERGY.Power";
pub const DEFAULT_TEMPERATURE_KEY: &str = "Temperature";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub power_topic: String,
    #[serde(default)]
    pub power_key: Option<String>,
    pub temperature_topic: String,
    #[serde(default)]
    pub temperature_key: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            power_topic: topics::TOPIC_TELE_POWER.to_string(),
            power_key: Some(DEFAULT_POWER_KEY.to_string()),
            temperature_topic: topics::TOPIC_TELE_TEMPERATURE.to_string(),
            temperature_key: Some(DEFAULT_TEMPERATURE_KEY.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub engine: EngineConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(EngineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn restore_at_or_above_max_is_rejected() {
        let mut config = OffloadConfig {
            max_power_w: 3_000.0,
            restore_power_w: 3_000.0,
            ..OffloadConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::RestoreNotBelowMax {
                restore: 3_000.0,
                max: 3_000.0
            })
        );

        config.restore_power_w = 2_800.0;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn zero_hysteresis_is_rejected_not_clamped() {
        let config = RegulationConfig {
            hysteresis_c: 0.0,
            ..RegulationConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidHysteresis(0.0)));
    }

    #[test]
    fn comfort_is_not_a_shed_level() {
        let config = OffloadConfig {
            shed_level: HeatingLevel::Comfort,
            ..OffloadConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShedLevel(HeatingLevel::Comfort))
        );
    }

    #[test]
    fn zero_stale_timeout_is_rejected() {
        let config = EngineConfig {
            temperature_stale_ms: 0,
            ..EngineConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration("temperature_stale_ms"))
        );
    }

    #[test]
    fn default_keys_read_tasmota_and_bare_payloads() {
        let telemetry = TelemetryConfig::default();
        let power_key = telemetry.power_key.as_deref();
        let temperature_key = telemetry.temperature_key.as_deref();
        let sensor = r#"{"Time":"2024-01-15T07:30:00","ENERGY":{"Power":3340},"DS18B20":{"Temperature":19.4}}"#;

        assert_eq!(crate::telemetry::parse_power(sensor, power_key), Some(3_340.0));
        assert_eq!(crate::telemetry::parse_power("3340", power_key), Some(3_340.0));
        assert_eq!(
            crate::telemetry::parse_temperature(sensor, temperature_key),
            Some(19.4)
        );
        assert_eq!(
            crate::telemetry::parse_temperature("19.4", temperature_key),
            Some(19.4)
        );
    }

    #[test]
    fn runtime_config_without_telemetry_section_loads() {
        let mut value = serde_json::to_value(RuntimeConfig::default()).unwrap();
        value.as_object_mut().unwrap().remove("telemetry");

        let runtime: RuntimeConfig = serde_json::from_value(value).unwrap();
        assert_eq!(runtime.telemetry, TelemetryConfig::default());
    }
}

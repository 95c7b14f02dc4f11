use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::UnknownLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeatingLevel {
    Off,
    FrostProtection,
    Eco,
    Comfort,
    Comfort1,
    Comfort2,
}

impl HeatingLevel {
    pub const ALL: [Self; 6] = [
        Self::Off,
        Self::FrostProtection,
        Self::Eco,
        Self::Comfort,
        Self::Comfort1,
        Self::Comfort2,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::FrostProtection => "FROST_PROTECTION",
            Self::Eco => "ECO",
            Self::Comfort => "COMFORT",
            Self::Comfort1 => "COMFORT1",
            Self::Comfort2 => "COMFORT2",
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::FrostProtection => 1,
            Self::Eco => 2,
            Self::Comfort => 3,
            Self::Comfort1 => 4,
            Self::Comfort2 => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.code() == code)
    }

    pub(crate) fn index(self) -> usize {
        self.code() as usize
    }
}

impl fmt::Display for HeatingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HeatingLevel {
    type Err = UnknownLevel;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if let Ok(code) = trimmed.parse::<u8>() {
            return Self::from_code(code).ok_or_else(|| UnknownLevel(trimmed.to_string()));
        }

        let normalized: String = trimmed
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .map(|c| c.to_ascii_uppercase())
            .collect();

        match normalized.as_str() {
            "OFF" => Ok(Self::Off),
            "FROST" | "FROSTPROTECTION" | "HORSGEL" => Ok(Self::FrostProtection),
            "ECO" => Ok(Self::Eco),
            "COMFORT" => Ok(Self::Comfort),
            "COMFORT1" => Ok(Self::Comfort1),
            "COMFORT2" => Ok(Self::Comfort2),
            _ => Err(UnknownLevel(trimmed.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OffloadState {
    Normal,
    Offloaded,
}

impl OffloadState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Offloaded => "OFFLOADED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TemperatureSource {
    Local,
    Remote,
}

pub const MIN_VALID_TEMP_C: f32 = -40.0;
pub const MAX_VALID_TEMP_C: f32 = 85.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureSample {
    pub value: f32,
    pub source: TemperatureSource,
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: u64,
    // How old the measurement already was when it arrived.
    #[serde(rename = "ageAtReceiptMs")]
    pub age_at_receipt_ms: u64,
    pub valid: bool,
}

impl TemperatureSample {
    pub fn new(value: f32, source: TemperatureSource, timestamp_ms: u64) -> Self {
        Self {
            value,
            source,
            timestamp_ms,
            age_at_receipt_ms: 0,
            valid: value.is_finite() && (MIN_VALID_TEMP_C..=MAX_VALID_TEMP_C).contains(&value),
        }
    }

    pub fn local(value: f32, timestamp_ms: u64) -> Self {
        Self::new(value, TemperatureSource::Local, timestamp_ms)
    }

    pub fn remote(value: f32, timestamp_ms: u64) -> Self {
        Self::new(value, TemperatureSource::Remote, timestamp_ms)
    }

    pub fn aged(self, age_at_receipt_ms: u64) -> Self {
        Self {
            age_at_receipt_ms,
            ..self
        }
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms
            .saturating_sub(self.timestamp_ms)
            .saturating_add(self.age_at_receipt_ms)
    }

    pub fn is_usable(&self, now_ms: u64, stale_after_ms: u64) -> bool {
        self.valid && self.age_ms(now_ms) < stale_after_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerSample {
    pub watts: f32,
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: u64,
}

impl PowerSample {
    pub fn new(watts: f32, timestamp_ms: u64) -> Self {
        Self {
            watts,
            timestamp_ms,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.watts.is_finite() && self.watts >= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Heating,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlSource {
    Startup,
    Regulation,
    TemperatureStale,
    ManualOverride,
    Offload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandOrigin {
    ModeSet,
    PowerCommand,
    Timer,
    Unknown,
}

impl CommandOrigin {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "modeset" | "mode_set" | "mode" => Self::ModeSet,
            "power" | "relay" | "powercommand" => Self::PowerCommand,
            "timer" => Self::Timer,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ModeSet => "MODE_SET",
            Self::PowerCommand => "POWER_COMMAND",
            Self::Timer => "TIMER",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn is_authorized(self) -> bool {
        self == Self::ModeSet
    }
}

impl fmt::Display for CommandOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeCommand {
    pub level: HeatingLevel,
    pub origin: CommandOrigin,
}

impl ModeCommand {
    pub fn new(level: HeatingLevel, origin: CommandOrigin) -> Self {
        Self { level, origin }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub level: HeatingLevel,
    #[serde(rename = "offloadState")]
    pub offload_state: OffloadState,
    pub temperature: Option<TemperatureSample>,
    #[serde(rename = "temperatureAgeMs")]
    pub temperature_age_ms: Option<u64>,
    #[serde(rename = "outsideMode")]
    pub outside_mode: bool,
    #[serde(rename = "temperatureValid")]
    pub temperature_valid: bool,
    #[serde(rename = "targetTemp")]
    pub target_temp: f32,
    #[serde(rename = "effectiveTargetTemp")]
    pub effective_target_temp: f32,
    pub hysteresis: f32,
    pub source: ControlSource,
    pub decision: Option<Decision>,
    pub capability: crate::protocol::HeaterCapability,
    #[serde(rename = "outputLevel")]
    pub output_level: HeatingLevel,
    #[serde(rename = "outputFaults")]
    pub output_faults: u64,
    #[serde(rename = "lastOutputFault")]
    pub last_output_fault: Option<String>,
    #[serde(rename = "powerW")]
    pub power_w: Option<f32>,
    #[serde(rename = "maxPowerW")]
    pub max_power_w: f32,
    #[serde(rename = "restorePowerW")]
    pub restore_power_w: f32,
    #[serde(rename = "telemetryStale")]
    pub telemetry_stale: bool,
    #[serde(rename = "offloadedForMs")]
    pub offloaded_for_ms: Option<u64>,
    #[serde(rename = "offloadCount")]
    pub offload_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatePayload {
    pub level: &'static str,
    pub offload: &'static str,
    pub temp: Option<f32>,
    #[serde(rename = "tempAgeSec")]
    pub temp_age_sec: Option<u64>,
    pub target: f32,
    pub outside: bool,
    pub power: Option<f32>,
}

use thiserror::Error;

use crate::{
    config::{MAX_TARGET_TEMP_C, MIN_TARGET_TEMP_C},
    protocol::HeaterCapability,
    types::{CommandOrigin, HeatingLevel},
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error(
        "target temperature {0} is outside {min}..={max} °C",
        min = MIN_TARGET_TEMP_C,
        max = MAX_TARGET_TEMP_C
    )]
    TargetOutOfRange(f32),
    #[error("hysteresis must be a positive number of degrees, got {0}")]
    InvalidHysteresis(f32),
    #[error("outside offset must be a non-negative number of degrees, got {0}")]
    InvalidOutsideOffset(f32),
    #[error("escalation delta must be a positive number of degrees, got {0}")]
    InvalidEscalationDelta(f32),
    #[error("max power must be a positive number of watts, got {0}")]
    InvalidMaxPower(f32),
    #[error("restore power must be a non-negative number of watts, got {0}")]
    InvalidRestorePower(f32),
    #[error("restore threshold {restore} W must be strictly below max power {max} W")]
    RestoreNotBelowMax { restore: f32, max: f32 },
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("shed level {0} is not a low-power level (use OFF or FROST_PROTECTION)")]
    InvalidShedLevel(HeatingLevel),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandRejection {
    #[error("command origin {0} is not authorized to set the heating level")]
    UnauthorizedOrigin(CommandOrigin),
    #[error("heating level {level} is not supported by a {capability} heater")]
    UnsupportedLevel {
        level: HeatingLevel,
        capability: HeaterCapability,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown heating level `{0}`")]
pub struct UnknownLevel(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct OutputFault(pub String);

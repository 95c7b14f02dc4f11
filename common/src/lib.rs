pub mod config;
pub mod engine;
pub mod error;
pub mod offload;
pub mod protocol;
pub mod regulator;
pub mod telemetry;
pub mod topics;
pub mod types;

pub use config::{
    EngineConfig, NetworkConfig, OffloadConfig, RegulationConfig, RuntimeConfig, TelemetryConfig,
};
pub use engine::{EngineEvent, PilotwireEngine};
pub use error::{CommandRejection, ConfigError, OutputFault, UnknownLevel};
pub use offload::{OffloadController, OffloadEvent};
pub use protocol::{
    ApplyOutcome, HeaterCapability, LineSignal, MemoryOutput, ProtocolDriver, ProtocolState,
    ProtocolTable, SignalOutput,
};
pub use regulator::{RegulatorOutput, TemperatureRegulator};
pub use topics::*;
pub use types::{
    CommandOrigin, ControlSource, Decision, EngineStatus, HeatingLevel, ModeCommand,
    OffloadState, PowerSample, StatePayload, TemperatureSample, TemperatureSource,
};

use crate::{
    config::{EngineConfig, RegulationConfig},
    error::{CommandRejection, ConfigError, OutputFault},
    offload::{OffloadController, OffloadEvent},
    protocol::{ApplyOutcome, ProtocolDriver, ProtocolTable, SignalOutput},
    regulator::TemperatureRegulator,
    types::{
        ControlSource, Decision, EngineStatus, HeatingLevel, ModeCommand, OffloadState,
        PowerSample, StatePayload, TemperatureSample,
    },
};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    LevelChanged {
        from: HeatingLevel,
        to: HeatingLevel,
        source: ControlSource,
    },
    Offload(OffloadEvent),
    // The live level could not be written; the next tick retries.
    OutputFaulted { level: HeatingLevel },
}

#[derive(Debug, Clone, Copy, Default)]
struct Inputs {
    local: Option<TemperatureSample>,
    remote: Option<TemperatureSample>,
    outside_mode: bool,
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    temperature: Option<TemperatureSample>,
    outside_mode: bool,
    shed_level: Option<HeatingLevel>,
    manual_override: Option<HeatingLevel>,
}

pub struct PilotwireEngine<O> {
    config: EngineConfig,
    regulator: TemperatureRegulator,
    offload: OffloadController,
    driver: ProtocolDriver<O>,
    inputs: Inputs,
    manual_override: Option<HeatingLevel>,
    level: HeatingLevel,
    applied_level: Option<HeatingLevel>,
    source: ControlSource,
    decision: Option<Decision>,
}

impl<O: SignalOutput> PilotwireEngine<O> {
    pub fn new(config: EngineConfig, output: O, now_ms: u64) -> Result<Self, ConfigError> {
        config.validate()?;

        let table = ProtocolTable::for_capability(config.capability);
        Ok(Self {
            regulator: TemperatureRegulator::new(config.regulation.clone(), config.capability),
            offload: OffloadController::new(config.offload.clone(), now_ms),
            driver: ProtocolDriver::new(table, output),
            inputs: Inputs::default(),
            manual_override: None,
            // Nothing is known about the room yet; start from the safe level.
            level: HeatingLevel::FrostProtection,
            applied_level: None,
            source: ControlSource::Startup,
            decision: None,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn reconfigure(&mut self, config: EngineConfig) -> Result<(), ConfigError> {
        config.validate()?;

        if config.capability != self.config.capability {
            self.driver
                .set_table(ProtocolTable::for_capability(config.capability));
            self.applied_level = None;
        }
        self.regulator
            .set_config(config.regulation.clone(), config.capability);
        self.offload.set_config(config.offload.clone());
        self.config = config;
        Ok(())
    }

    pub fn set_regulation(&mut self, regulation: RegulationConfig) -> Result<bool, ConfigError> {
        if regulation == self.config.regulation {
            return Ok(false);
        }
        let mut config = self.config.clone();
        config.regulation = regulation;
        self.reconfigure(config)?;
        Ok(true)
    }

    pub fn set_target_temp(&mut self, target_c: f32) -> Result<bool, ConfigError> {
        self.set_regulation(RegulationConfig {
            target_temp_c: target_c,
            ..self.config.regulation.clone()
        })
    }

    pub fn set_outside_mode(&mut self, outside_mode: bool) -> bool {
        let changed = self.inputs.outside_mode != outside_mode;
        self.inputs.outside_mode = outside_mode;
        changed
    }

    pub fn is_outside_mode(&self) -> bool {
        self.inputs.outside_mode
    }

    pub fn update_local_temperature(&mut self, value_c: f32, now_ms: u64) -> bool {
        let sample = TemperatureSample::local(value_c, now_ms);
        self.inputs.local = Some(sample);
        sample.valid
    }

    pub fn update_remote_temperature(&mut self, value_c: f32, now_ms: u64) -> bool {
        self.update_remote_temperature_aged(value_c, 0, now_ms)
    }

    // Remote reading whose measurement predates its arrival by `age_ms`,
    // so a replayed or retained value counts toward staleness.
    pub fn update_remote_temperature_aged(
        &mut self,
        value_c: f32,
        age_ms: u64,
        now_ms: u64,
    ) -> bool {
        let sample = TemperatureSample::remote(value_c, now_ms).aged(age_ms);
        self.inputs.remote = Some(sample);
        sample.valid
    }

    pub fn on_power_sample(&mut self, watts: f32, now_ms: u64) -> Vec<EngineEvent> {
        self.offload
            .on_power_sample(PowerSample::new(watts, now_ms))
            .into_iter()
            .map(EngineEvent::Offload)
            .collect()
    }

    // Queues a one-shot level for the next tick. Only mode-set commands are
    // accepted; a rejected command leaves every piece of state untouched.
    pub fn submit_command(&mut self, command: ModeCommand) -> Result<(), CommandRejection> {
        if !command.origin.is_authorized() {
            return Err(CommandRejection::UnauthorizedOrigin(command.origin));
        }
        if !self.config.capability.supports(command.level) {
            return Err(CommandRejection::UnsupportedLevel {
                level: command.level,
                capability: self.config.capability,
            });
        }
        self.manual_override = Some(command.level);
        Ok(())
    }

    pub fn tick(&mut self, now_ms: u64) -> Vec<EngineEvent> {
        let mut events = Vec::new();

        if let Some(event) = self.offload.check_timeout(now_ms) {
            events.push(EngineEvent::Offload(event));
        }

        let snapshot = self.snapshot(now_ms);
        let regulated = self.regulator.evaluate(
            snapshot.temperature.map(|sample| sample.value),
            snapshot.outside_mode,
        );

        let (level, source) = if let Some(shed) = snapshot.shed_level {
            (shed, ControlSource::Offload)
        } else if let Some(manual) = snapshot.manual_override {
            (manual, ControlSource::ManualOverride)
        } else if regulated.decision.is_none() {
            (regulated.level, ControlSource::TemperatureStale)
        } else {
            (regulated.level, ControlSource::Regulation)
        };

        self.commit(level, source, regulated.decision, now_ms, &mut events);
        events
    }

    fn snapshot(&mut self, now_ms: u64) -> Snapshot {
        Snapshot {
            temperature: self.usable_temperature(now_ms),
            outside_mode: self.inputs.outside_mode,
            shed_level: self.offload.override_level(),
            manual_override: self.manual_override.take(),
        }
    }

    fn commit(
        &mut self,
        level: HeatingLevel,
        source: ControlSource,
        decision: Option<Decision>,
        now_ms: u64,
        events: &mut Vec<EngineEvent>,
    ) {
        if level != self.level {
            events.push(EngineEvent::LevelChanged {
                from: self.level,
                to: level,
                source,
            });
        }
        self.level = level;
        self.source = source;
        self.decision = decision;

        let outcome = if self.applied_level == Some(level) {
            self.driver.refresh(now_ms)
        } else {
            let state = self.driver.encode(level);
            self.driver.apply(state, now_ms)
        };

        match outcome {
            ApplyOutcome::Written | ApplyOutcome::Unchanged => self.applied_level = Some(level),
            ApplyOutcome::Faulted => {
                self.applied_level = None;
                events.push(EngineEvent::OutputFaulted { level });
            }
        }
    }

    fn usable_temperature(&self, now_ms: u64) -> Option<TemperatureSample> {
        let stale_after_ms = self.config.temperature_stale_ms;
        self.inputs
            .remote
            .filter(|sample| sample.is_usable(now_ms, stale_after_ms))
            .or_else(|| {
                self.inputs
                    .local
                    .filter(|sample| sample.is_usable(now_ms, stale_after_ms))
            })
    }

    fn latest_temperature(&self, now_ms: u64) -> Option<TemperatureSample> {
        match (self.inputs.remote, self.inputs.local) {
            (Some(remote), Some(local)) if local.age_ms(now_ms) < remote.age_ms(now_ms) => {
                Some(local)
            }
            (Some(remote), _) => Some(remote),
            (None, local) => local,
        }
    }

    pub fn level(&self) -> HeatingLevel {
        self.level
    }

    pub fn control_source(&self) -> ControlSource {
        self.source
    }

    pub fn offload_state(&self) -> OffloadState {
        self.offload.state()
    }

    pub fn offload(&self) -> &OffloadController {
        &self.offload
    }

    pub fn regulator(&self) -> &TemperatureRegulator {
        &self.regulator
    }

    pub fn driver(&self) -> &ProtocolDriver<O> {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut ProtocolDriver<O> {
        &mut self.driver
    }

    pub fn take_output_fault(&mut self) -> Option<OutputFault> {
        self.driver.take_fault()
    }

    pub fn status(&self, now_ms: u64) -> EngineStatus {
        let usable = self.usable_temperature(now_ms);
        let temperature = usable.or_else(|| self.latest_temperature(now_ms));
        let offload = self.config.offload.clone();

        EngineStatus {
            level: self.level,
            offload_state: self.offload.state(),
            temperature,
            temperature_age_ms: temperature.map(|sample| sample.age_ms(now_ms)),
            outside_mode: self.inputs.outside_mode,
            temperature_valid: usable.is_some(),
            target_temp: self.config.regulation.target_temp_c,
            effective_target_temp: self.regulator.effective_setpoint(self.inputs.outside_mode),
            hysteresis: self.config.regulation.hysteresis_c,
            source: self.source,
            decision: self.decision,
            capability: self.config.capability,
            output_level: self.driver.readback_level(),
            output_faults: self.driver.fault_count(),
            last_output_fault: self.driver.last_fault().map(ToString::to_string),
            power_w: self.offload.last_sample().map(|sample| sample.watts),
            max_power_w: offload.max_power_w,
            restore_power_w: offload.restore_power_w,
            telemetry_stale: self.offload.is_telemetry_stale(),
            offloaded_for_ms: self.offload.offloaded_for_ms(now_ms),
            offload_count: self.offload.offload_count(),
        }
    }

    pub fn state_payload(&self, now_ms: u64) -> StatePayload {
        let temperature = self
            .usable_temperature(now_ms)
            .or_else(|| self.latest_temperature(now_ms));

        StatePayload {
            level: self.level.as_str(),
            offload: self.offload.state().as_str(),
            temp: temperature.map(|sample| sample.value),
            temp_age_sec: temperature.map(|sample| sample.age_ms(now_ms) / 1_000),
            target: self.config.regulation.target_temp_c,
            outside: self.inputs.outside_mode,
            power: self.offload.last_sample().map(|sample| sample.watts),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::OffloadConfig,
        protocol::{HeaterCapability, MemoryOutput},
        types::CommandOrigin,
    };

    fn config() -> EngineConfig {
        EngineConfig {
            regulation: RegulationConfig {
                target_temp_c: 20.0,
                hysteresis_c: 0.5,
                outside_offset_c: 3.0,
                escalation_delta_c: None,
            },
            offload: OffloadConfig {
                max_power_w: 3_000.0,
                restore_power_w: 2_800.0,
                telemetry_timeout_ms: 60_000,
                restore_delay_ms: 0,
                shed_level: HeatingLevel::FrostProtection,
            },
            capability: HeaterCapability::SingleLevel,
            temperature_stale_ms: 300_000,
            tick_interval_ms: 1_000,
        }
    }

    fn engine() -> PilotwireEngine<MemoryOutput> {
        PilotwireEngine::new(config(), MemoryOutput::new(), 0).unwrap()
    }

    #[test]
    fn rejects_invalid_configuration_at_construction() {
        let mut bad = config();
        bad.offload.restore_power_w = 3_500.0;
        assert!(PilotwireEngine::new(bad, MemoryOutput::new(), 0).is_err());
    }

    #[test]
    fn starts_in_frost_protection_without_temperature() {
        let mut engine = engine();
        engine.tick(1_000);

        assert_eq!(engine.level(), HeatingLevel::FrostProtection);
        assert_eq!(engine.control_source(), ControlSource::TemperatureStale);
        assert_eq!(engine.driver().output().lines(), Some((false, true)));
    }

    #[test]
    fn regulates_to_comfort_when_cold() {
        let mut engine = engine();
        engine.update_remote_temperature(18.0, 1_000);

        let events = engine.tick(2_000);

        assert_eq!(
            events,
            vec![EngineEvent::LevelChanged {
                from: HeatingLevel::FrostProtection,
                to: HeatingLevel::Comfort,
                source: ControlSource::Regulation,
            }]
        );
        assert_eq!(engine.driver().readback_level(), HeatingLevel::Comfort);
    }

    #[test]
    fn unchanged_level_is_not_rewritten() {
        let mut engine = engine();
        engine.update_remote_temperature(22.0, 0);
        engine.tick(1_000);
        engine.tick(2_000);
        engine.tick(3_000);

        assert_eq!(engine.driver().output().writes().len(), 1);
    }

    #[test]
    fn offload_overrides_regulation() {
        let mut engine = engine();
        engine.update_remote_temperature(18.0, 0);
        engine.tick(1_000);

        engine.on_power_sample(3_200.0, 1_500);
        engine.tick(2_000);
        assert_eq!(engine.level(), HeatingLevel::FrostProtection);
        assert_eq!(engine.control_source(), ControlSource::Offload);

        engine.on_power_sample(2_700.0, 2_500);
        engine.tick(3_000);
        assert_eq!(engine.level(), HeatingLevel::Comfort);
    }

    #[test]
    fn manual_override_is_one_shot() {
        let mut engine = engine();
        engine.update_remote_temperature(22.0, 0);
        engine.tick(1_000);

        engine
            .submit_command(ModeCommand::new(HeatingLevel::Comfort, CommandOrigin::ModeSet))
            .unwrap();
        engine.tick(2_000);
        assert_eq!(engine.level(), HeatingLevel::Comfort);
        assert_eq!(engine.control_source(), ControlSource::ManualOverride);

        engine.tick(3_000);
        assert_eq!(engine.level(), HeatingLevel::Eco);
    }

    #[test]
    fn offload_wins_over_manual_override() {
        let mut engine = engine();
        engine.update_remote_temperature(18.0, 0);
        engine.on_power_sample(3_500.0, 0);
        engine
            .submit_command(ModeCommand::new(HeatingLevel::Comfort, CommandOrigin::ModeSet))
            .unwrap();

        engine.tick(1_000);

        assert_eq!(engine.level(), HeatingLevel::FrostProtection);
        assert_eq!(engine.control_source(), ControlSource::Offload);
    }

    #[test]
    fn unauthorized_command_is_rejected_without_side_effects() {
        let mut engine = engine();
        engine.update_remote_temperature(22.0, 0);
        engine.tick(1_000);

        let result =
            engine.submit_command(ModeCommand::new(HeatingLevel::Comfort, CommandOrigin::PowerCommand));
        assert_eq!(
            result,
            Err(CommandRejection::UnauthorizedOrigin(CommandOrigin::PowerCommand))
        );

        engine.tick(2_000);
        assert_eq!(engine.level(), HeatingLevel::Eco);
    }

    #[test]
    fn unsupported_level_is_rejected() {
        let mut engine = engine();
        let result =
            engine.submit_command(ModeCommand::new(HeatingLevel::Comfort2, CommandOrigin::ModeSet));

        assert_eq!(
            result,
            Err(CommandRejection::UnsupportedLevel {
                level: HeatingLevel::Comfort2,
                capability: HeaterCapability::SingleLevel,
            })
        );
    }

    #[test]
    fn fresh_remote_sample_wins_over_local() {
        let mut engine = engine();
        engine.update_local_temperature(22.0, 0);
        engine.update_remote_temperature(18.0, 0);
        engine.tick(1_000);
        assert_eq!(engine.level(), HeatingLevel::Comfort);

        engine.update_local_temperature(22.0, 400_000);
        engine.tick(400_500);
        assert_eq!(engine.level(), HeatingLevel::Eco);
    }

    #[test]
    fn write_fault_is_reported_and_retried() {
        let mut engine = engine();
        engine.update_remote_temperature(18.0, 0);
        engine.driver_mut().output_mut().fail_next_writes(1);

        let events = engine.tick(1_000);
        assert!(events.contains(&EngineEvent::OutputFaulted {
            level: HeatingLevel::Comfort
        }));
        assert!(engine.take_output_fault().is_some());

        engine.tick(2_000);
        assert_eq!(engine.driver().readback_level(), HeatingLevel::Comfort);
        assert_eq!(engine.status(2_000).output_faults, 1);
    }

    #[test]
    fn invalid_reconfiguration_keeps_previous_config() {
        let mut engine = engine();
        let mut bad = config();
        bad.regulation.hysteresis_c = -1.0;

        assert_eq!(
            engine.reconfigure(bad),
            Err(ConfigError::InvalidHysteresis(-1.0))
        );
        assert_eq!(engine.config(), &config());
    }

    #[test]
    fn capability_change_rewrites_output() {
        let mut engine = engine();
        engine.update_remote_temperature(18.0, 0);
        engine.tick(1_000);

        let mut direct = config();
        direct.capability = HeaterCapability::Direct;
        engine.reconfigure(direct).unwrap();
        engine.tick(2_000);

        assert_eq!(engine.driver().output().lines(), Some((true, false)));
        assert_eq!(engine.driver().output().writes().len(), 2);
    }

    #[test]
    fn status_exposes_core_fields() {
        let mut engine = engine();
        engine.update_remote_temperature(19.0, 1_000);
        engine.set_outside_mode(true);
        engine.on_power_sample(1_200.0, 1_000);
        engine.tick(3_000);

        let status = engine.status(3_000);
        assert_eq!(status.level, HeatingLevel::Eco);
        assert_eq!(status.offload_state, OffloadState::Normal);
        assert_eq!(status.temperature.map(|sample| sample.value), Some(19.0));
        assert_eq!(status.temperature_age_ms, Some(2_000));
        assert!(status.outside_mode);
        assert_eq!(status.effective_target_temp, 17.0);
        assert_eq!(status.power_w, Some(1_200.0));
    }

    #[test]
    fn age_at_receipt_counts_toward_staleness() {
        let mut engine = engine();
        engine.update_remote_temperature_aged(18.0, 250_000, 10_000);
        engine.tick(10_000);
        assert_eq!(engine.level(), HeatingLevel::Comfort);
        assert_eq!(engine.status(10_000).temperature_age_ms, Some(250_000));

        engine.tick(60_000);
        assert_eq!(engine.level(), HeatingLevel::FrostProtection);
        assert_eq!(engine.control_source(), ControlSource::TemperatureStale);
    }
}

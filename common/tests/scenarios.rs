use chrono::NaiveDateTime;
use pilotwire_common::{
    telemetry::{parse_temperature, reading_age_ms},
    CommandOrigin, ControlSource, EngineConfig, EngineEvent, HeaterCapability, HeatingLevel,
    MemoryOutput, ModeCommand, OffloadConfig, OffloadEvent, OffloadState, PilotwireEngine,
    RegulationConfig,
};
use pretty_assertions::assert_eq;

fn config() -> EngineConfig {
    EngineConfig {
        regulation: RegulationConfig {
            target_temp_c: 20.0,
            hysteresis_c: 0.5,
            outside_offset_c: 4.0,
            escalation_delta_c: None,
        },
        offload: OffloadConfig {
            max_power_w: 3_000.0,
            restore_power_w: 2_800.0,
            telemetry_timeout_ms: 30_000,
            restore_delay_ms: 0,
            shed_level: HeatingLevel::FrostProtection,
        },
        capability: HeaterCapability::SingleLevel,
        temperature_stale_ms: 120_000,
        tick_interval_ms: 1_000,
    }
}

fn engine() -> PilotwireEngine<MemoryOutput> {
    PilotwireEngine::new(config(), MemoryOutput::new(), 0).expect("valid config")
}

#[test]
fn power_sequence_drives_offload_states() {
    let mut engine = engine();
    let mut states = Vec::new();

    for (i, watts) in [2_000.0, 3_200.0, 2_900.0, 2_750.0].into_iter().enumerate() {
        let now_ms = (i as u64 + 1) * 1_000;
        engine.on_power_sample(watts, now_ms);
        engine.tick(now_ms);
        states.push(engine.offload_state());
    }

    assert_eq!(
        states,
        vec![
            OffloadState::Normal,
            OffloadState::Offloaded,
            OffloadState::Offloaded,
            OffloadState::Normal
        ]
    );
}

#[test]
fn temperature_sequence_with_prior_heating() {
    let mut engine = engine();
    engine.update_remote_temperature(18.0, 0);
    engine.tick(500);
    assert_eq!(engine.level(), HeatingLevel::Comfort);

    let mut levels = Vec::new();
    for (i, celsius) in [19.2, 19.6, 20.3, 20.8].into_iter().enumerate() {
        let now_ms = (i as u64 + 1) * 1_000;
        engine.update_remote_temperature(celsius, now_ms);
        engine.tick(now_ms);
        levels.push(engine.level());
    }

    assert_eq!(
        levels,
        vec![
            HeatingLevel::Comfort,
            HeatingLevel::Comfort,
            HeatingLevel::Eco,
            HeatingLevel::Eco
        ]
    );
}

#[test]
fn stale_temperature_forces_frost_protection_even_when_cold() {
    let mut engine = engine();
    engine.update_remote_temperature(15.0, 0);
    engine.on_power_sample(500.0, 0);
    engine.tick(1_000);
    assert_eq!(engine.level(), HeatingLevel::Comfort);

    engine.on_power_sample(500.0, 120_000);
    engine.tick(120_000);

    assert_eq!(engine.offload_state(), OffloadState::Normal);
    assert_eq!(engine.level(), HeatingLevel::FrostProtection);
    assert_eq!(engine.control_source(), ControlSource::TemperatureStale);
    assert_eq!(engine.driver().output().lines(), Some((false, true)));
}

#[test]
fn silent_telemetry_while_offloaded_keeps_heater_shed() {
    let mut engine = engine();
    engine.update_remote_temperature(15.0, 0);
    engine.on_power_sample(3_500.0, 0);
    engine.tick(1_000);

    let mut stale_seen = false;
    for second in 2..=120 {
        let now_ms = second * 1_000;
        engine.update_remote_temperature(15.0, now_ms);
        for event in engine.tick(now_ms) {
            if let EngineEvent::Offload(OffloadEvent::TelemetryStale {
                state,
                ..
            }) = event
            {
                assert_eq!(state, OffloadState::Offloaded);
                stale_seen = true;
            }
        }
    }

    assert!(stale_seen);
    assert_eq!(engine.offload_state(), OffloadState::Offloaded);
    assert_eq!(engine.level(), HeatingLevel::FrostProtection);
    assert!(engine.status(120_000).telemetry_stale);
}

#[test]
fn silent_telemetry_in_normal_does_not_offload() {
    let mut engine = engine();
    engine.update_remote_temperature(15.0, 0);
    engine.tick(1_000);

    engine.update_remote_temperature(15.0, 60_000);
    engine.tick(60_000);

    assert!(engine.status(60_000).telemetry_stale);
    assert_eq!(engine.offload_state(), OffloadState::Normal);
    assert_eq!(engine.level(), HeatingLevel::Comfort);
}

#[test]
fn outside_mode_switches_to_eco_on_next_tick() {
    let mut engine = engine();
    engine.update_remote_temperature(18.0, 0);
    engine.tick(1_000);
    assert_eq!(engine.level(), HeatingLevel::Comfort);

    assert!(engine.set_outside_mode(true));
    engine.tick(2_000);

    assert_eq!(engine.level(), HeatingLevel::Eco);
}

#[test]
fn off_shed_level_cuts_heater() {
    let mut config = config();
    config.offload.shed_level = HeatingLevel::Off;
    let mut engine = PilotwireEngine::new(config, MemoryOutput::new(), 0).unwrap();
    engine.update_remote_temperature(15.0, 0);

    engine.on_power_sample(3_100.0, 0);
    engine.tick(1_000);

    assert_eq!(engine.level(), HeatingLevel::Off);
    assert_eq!(engine.driver().output().lines(), Some((true, false)));
}

#[test]
fn accepted_mode_command_holds_for_a_single_tick() {
    let mut engine = engine();
    engine.update_remote_temperature(22.0, 0);
    engine.tick(1_000);

    engine
        .submit_command(ModeCommand::new(HeatingLevel::FrostProtection, CommandOrigin::ModeSet))
        .unwrap();
    engine.tick(2_000);
    engine.tick(3_000);

    assert_eq!(
        engine.driver().output().writes(),
        &[(true, true), (false, true), (true, true)]
    );
}

#[test]
fn direct_heater_switches_relay_with_regulation() {
    let mut config = config();
    config.capability = HeaterCapability::Direct;
    let mut engine = PilotwireEngine::new(config, MemoryOutput::new(), 0).unwrap();

    engine.update_local_temperature(18.0, 0);
    engine.tick(1_000);
    assert_eq!(engine.driver().output().lines(), Some((true, false)));

    engine.update_local_temperature(22.0, 2_000);
    engine.tick(2_000);
    assert_eq!(engine.level(), HeatingLevel::Eco);
    assert_eq!(engine.driver().output().lines(), Some((false, false)));
    assert_eq!(engine.driver().readback_level(), HeatingLevel::Off);
}

#[test]
fn dated_remote_reading_older_than_stale_window_forces_frost() {
    let payload = r#"{"Time":"2020-07-07T10:00:00","DS18B20":{"Temperature":15.0}}"#;
    let wall_clock = NaiveDateTime::parse_from_str("2020-07-08 10:00:00", "%Y-%m-%d %H:%M:%S")
        .expect("valid wall clock");

    let celsius = parse_temperature(payload, Some("Temperature")).expect("temperature");
    let age_ms = reading_age_ms(payload, wall_clock).expect("dated payload");
    assert_eq!(age_ms, 86_400_000);

    let mut engine = engine();
    engine.update_remote_temperature_aged(celsius, age_ms, 1_000);
    engine.tick(1_000);

    assert_eq!(engine.level(), HeatingLevel::FrostProtection);
    assert_eq!(engine.control_source(), ControlSource::TemperatureStale);
}

#[test]
fn dated_remote_reading_inside_stale_window_regulates() {
    let payload = r#"{"Time":"2020-07-07T10:00:00","DS18B20":{"Temperature":15.0}}"#;
    let wall_clock = NaiveDateTime::parse_from_str("2020-07-07 10:00:30", "%Y-%m-%d %H:%M:%S")
        .expect("valid wall clock");

    let age_ms = reading_age_ms(payload, wall_clock).expect("dated payload");
    let mut engine = engine();
    engine.update_remote_temperature_aged(15.0, age_ms, 1_000);
    engine.tick(1_000);
    assert_eq!(engine.level(), HeatingLevel::Comfort);

    engine.tick(1_000 + 120_000 - age_ms);
    assert_eq!(engine.level(), HeatingLevel::FrostProtection);
}

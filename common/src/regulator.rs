use crate::{
    config::RegulationConfig,
    protocol::HeaterCapability,
    types::{Decision, HeatingLevel},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegulatorOutput {
    pub level: HeatingLevel,
    pub decision: Option<Decision>,
    pub effective_setpoint: f32,
}

#[derive(Debug, Clone)]
pub struct TemperatureRegulator {
    config: RegulationConfig,
    capability: HeaterCapability,
    last_decision: Option<Decision>,
}

impl TemperatureRegulator {
    pub fn new(config: RegulationConfig, capability: HeaterCapability) -> Self {
        Self {
            config,
            capability,
            last_decision: None,
        }
    }

    pub fn config(&self) -> &RegulationConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: RegulationConfig, capability: HeaterCapability) {
        self.config = config;
        self.capability = capability;
    }

    pub fn last_decision(&self) -> Option<Decision> {
        self.last_decision
    }

    pub fn effective_setpoint(&self, outside_mode: bool) -> f32 {
        if outside_mode {
            self.config.target_temp_c - self.config.outside_offset_c
        } else {
            self.config.target_temp_c
        }
    }

    // Runs one regulation cycle. A missing reading forces FrostProtection
    // and leaves the hysteresis memory untouched.
    pub fn evaluate(&mut self, reading: Option<f32>, outside_mode: bool) -> RegulatorOutput {
        let effective_setpoint = self.effective_setpoint(outside_mode);

        let Some(current) = reading.filter(|value| value.is_finite()) else {
            return RegulatorOutput {
                level: HeatingLevel::FrostProtection,
                decision: None,
                effective_setpoint,
            };
        };

        let half_band = self.config.hysteresis_c / 2.0;
        let lower = effective_setpoint - half_band;
        let upper = effective_setpoint + half_band;

        let decision = if current < lower {
            Decision::Heating
        } else if current > upper {
            Decision::Idle
        } else {
            self.last_decision.unwrap_or(if current < effective_setpoint {
                Decision::Heating
            } else {
                Decision::Idle
            })
        };
        self.last_decision = Some(decision);

        let level = match decision {
            Decision::Heating if self.should_escalate(current, lower) => HeatingLevel::Comfort2,
            Decision::Heating => HeatingLevel::Comfort,
            Decision::Idle => HeatingLevel::Eco,
        };

        RegulatorOutput {
            level,
            decision: Some(decision),
            effective_setpoint,
        }
    }

    fn should_escalate(&self, current: f32, lower: f32) -> bool {
        if self.capability != HeaterCapability::DualLevel {
            return false;
        }
        self.config
            .escalation_delta_c
            .map(|delta| current < lower - delta)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn regulator(target: f32, hysteresis: f32) -> TemperatureRegulator {
        TemperatureRegulator::new(
            RegulationConfig {
                target_temp_c: target,
                hysteresis_c: hysteresis,
                outside_offset_c: 3.0,
                escalation_delta_c: None,
            },
            HeaterCapability::SingleLevel,
        )
    }

    fn decisions(regulator: &mut TemperatureRegulator, readings: &[f32]) -> Vec<Decision> {
        readings
            .iter()
            .filter_map(|reading| regulator.evaluate(Some(*reading), false).decision)
            .collect()
    }

    #[test]
    fn heats_through_band_then_idles_past_upper_edge() {
        let mut regulator = regulator(20.0, 0.5);
        regulator.last_decision = Some(Decision::Heating);

        assert_eq!(
            decisions(&mut regulator, &[19.2, 19.6, 20.3, 20.8]),
            vec![
                Decision::Heating,
                Decision::Heating,
                Decision::Idle,
                Decision::Idle
            ]
        );
    }

    #[test]
    fn retains_previous_decision_inside_band() {
        let mut regulator = regulator(20.0, 1.0);

        assert_eq!(
            decisions(&mut regulator, &[21.0, 19.9, 20.2, 19.6]),
            vec![
                Decision::Idle,
                Decision::Idle,
                Decision::Idle,
                Decision::Idle
            ]
        );
        assert_eq!(
            decisions(&mut regulator, &[19.4, 20.1, 20.4]),
            vec![Decision::Heating, Decision::Heating, Decision::Heating]
        );
    }

    #[test]
    fn maps_decisions_to_comfort_and_eco() {
        let mut regulator = regulator(20.0, 0.5);

        assert_eq!(regulator.evaluate(Some(18.0), false).level, HeatingLevel::Comfort);
        assert_eq!(regulator.evaluate(Some(22.0), false).level, HeatingLevel::Eco);
    }

    #[test]
    fn missing_reading_forces_frost_protection_and_keeps_memory() {
        let mut regulator = regulator(20.0, 0.5);
        regulator.evaluate(Some(18.0), false);

        let output = regulator.evaluate(None, false);

        assert_eq!(output.level, HeatingLevel::FrostProtection);
        assert_eq!(output.decision, None);
        assert_eq!(regulator.last_decision(), Some(Decision::Heating));
    }

    #[test]
    fn outside_mode_lowers_setpoint_immediately() {
        let mut regulator = regulator(20.0, 0.5);

        assert_eq!(regulator.evaluate(Some(18.5), false).level, HeatingLevel::Comfort);

        let output = regulator.evaluate(Some(18.5), true);
        assert_eq!(output.effective_setpoint, 17.0);
        assert_eq!(output.level, HeatingLevel::Eco);
    }

    #[test]
    fn dual_level_heater_escalates_on_large_deficit() {
        let mut regulator = TemperatureRegulator::new(
            RegulationConfig {
                escalation_delta_c: Some(2.0),
                ..RegulationConfig::default()
            },
            HeaterCapability::DualLevel,
        );

        assert_eq!(regulator.evaluate(Some(19.0), false).level, HeatingLevel::Comfort);
        assert_eq!(regulator.evaluate(Some(17.0), false).level, HeatingLevel::Comfort2);
    }

    #[test]
    fn single_level_heater_never_escalates() {
        let mut regulator = TemperatureRegulator::new(
            RegulationConfig {
                escalation_delta_c: Some(2.0),
                ..RegulationConfig::default()
            },
            HeaterCapability::SingleLevel,
        );

        assert_eq!(regulator.evaluate(Some(10.0), false).level, HeatingLevel::Comfort);
    }
}

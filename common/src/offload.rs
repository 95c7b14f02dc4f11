use crate::{
    config::OffloadConfig,
    types::{HeatingLevel, OffloadState, PowerSample},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OffloadEvent {
    Offloaded { power_w: f32 },
    Restored { power_w: f32, offloaded_for_ms: u64 },
    RestorePending { power_w: f32 },
    TelemetryStale { state: OffloadState, silent_for_ms: u64 },
    TelemetryResumed,
}

#[derive(Debug, Clone)]
pub struct OffloadController {
    config: OffloadConfig,
    state: OffloadState,
    offloaded_since_ms: Option<u64>,
    restore_pending_since_ms: Option<u64>,
    last_sample: Option<PowerSample>,
    last_heard_ms: u64,
    telemetry_stale: bool,
    offload_count: u32,
}

impl OffloadController {
    pub fn new(config: OffloadConfig, now_ms: u64) -> Self {
        Self {
            config,
            state: OffloadState::Normal,
            offloaded_since_ms: None,
            restore_pending_since_ms: None,
            last_sample: None,
            last_heard_ms: now_ms,
            telemetry_stale: false,
            offload_count: 0,
        }
    }

    pub fn config(&self) -> &OffloadConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: OffloadConfig) {
        self.config = config;
    }

    pub fn state(&self) -> OffloadState {
        self.state
    }

    pub fn is_offloaded(&self) -> bool {
        self.state == OffloadState::Offloaded
    }

    pub fn override_level(&self) -> Option<HeatingLevel> {
        self.is_offloaded().then_some(self.config.shed_level)
    }

    pub fn last_sample(&self) -> Option<PowerSample> {
        self.last_sample
    }

    pub fn is_telemetry_stale(&self) -> bool {
        self.telemetry_stale
    }

    pub fn offload_count(&self) -> u32 {
        self.offload_count
    }

    pub fn offloaded_for_ms(&self, now_ms: u64) -> Option<u64> {
        self.offloaded_since_ms
            .map(|since| now_ms.saturating_sub(since))
    }

    pub fn on_power_sample(&mut self, sample: PowerSample) -> Vec<OffloadEvent> {
        let mut events = Vec::new();
        if !sample.is_valid() {
            return events;
        }

        self.last_sample = Some(sample);
        self.last_heard_ms = self.last_heard_ms.max(sample.timestamp_ms);
        if self.telemetry_stale {
            self.telemetry_stale = false;
            events.push(OffloadEvent::TelemetryResumed);
        }

        let power_w = sample.watts;
        match self.state {
            OffloadState::Normal => {
                if power_w >= self.config.max_power_w {
                    self.state = OffloadState::Offloaded;
                    self.offloaded_since_ms = Some(sample.timestamp_ms);
                    self.restore_pending_since_ms = None;
                    self.offload_count = self.offload_count.saturating_add(1);
                    events.push(OffloadEvent::Offloaded { power_w });
                }
            }
            OffloadState::Offloaded => {
                if power_w > self.config.restore_power_w {
                    self.restore_pending_since_ms = None;
                    return events;
                }

                let first_pending = self.restore_pending_since_ms.is_none();
                let pending_since = *self
                    .restore_pending_since_ms
                    .get_or_insert(sample.timestamp_ms);

                if sample.timestamp_ms.saturating_sub(pending_since) >= self.config.restore_delay_ms
                {
                    let offloaded_for_ms = self.offloaded_for_ms(sample.timestamp_ms).unwrap_or(0);
                    self.state = OffloadState::Normal;
                    self.offloaded_since_ms = None;
                    self.restore_pending_since_ms = None;
                    events.push(OffloadEvent::Restored {
                        power_w,
                        offloaded_for_ms,
                    });
                } else if first_pending {
                    events.push(OffloadEvent::RestorePending { power_w });
                }
            }
        }

        events
    }

    // Raises the stale flag once telemetry has been silent for the timeout.
    pub fn check_timeout(&mut self, now_ms: u64) -> Option<OffloadEvent> {
        let silent_for_ms = now_ms.saturating_sub(self.last_heard_ms);
        if self.telemetry_stale || silent_for_ms < self.config.telemetry_timeout_ms {
            return None;
        }

        self.telemetry_stale = true;
        Some(OffloadEvent::TelemetryStale {
            state: self.state,
            silent_for_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn controller(max: f32, restore: f32) -> OffloadController {
        OffloadController::new(
            OffloadConfig {
                max_power_w: max,
                restore_power_w: restore,
                telemetry_timeout_ms: 60_000,
                restore_delay_ms: 0,
                shed_level: HeatingLevel::FrostProtection,
            },
            0,
        )
    }

    fn feed(controller: &mut OffloadController, samples: &[f32]) -> Vec<OffloadState> {
        samples
            .iter()
            .enumerate()
            .map(|(i, watts)| {
                controller.on_power_sample(PowerSample::new(*watts, i as u64 * 1_000));
                controller.state()
            })
            .collect()
    }

    #[test]
    fn sheds_above_max_and_restores_below_restore_threshold() {
        let mut controller = controller(3_000.0, 2_800.0);

        assert_eq!(
            feed(&mut controller, &[2_000.0, 3_200.0, 2_900.0, 2_750.0]),
            vec![
                OffloadState::Normal,
                OffloadState::Offloaded,
                OffloadState::Offloaded,
                OffloadState::Normal
            ]
        );
        assert_eq!(controller.offload_count(), 1);
    }

    #[test]
    fn thresholds_are_inclusive() {
        let mut controller = controller(3_000.0, 2_800.0);

        assert_eq!(
            feed(&mut controller, &[3_000.0, 2_800.0]),
            vec![OffloadState::Offloaded, OffloadState::Normal]
        );
    }

    #[test]
    fn override_level_follows_state() {
        let mut controller = controller(3_000.0, 2_800.0);
        assert_eq!(controller.override_level(), None);

        controller.on_power_sample(PowerSample::new(3_500.0, 10));
        assert_eq!(
            controller.override_level(),
            Some(HeatingLevel::FrostProtection)
        );
    }

    #[test]
    fn invalid_samples_are_ignored() {
        let mut controller = controller(3_000.0, 2_800.0);

        assert!(controller
            .on_power_sample(PowerSample::new(f32::NAN, 10))
            .is_empty());
        assert!(controller
            .on_power_sample(PowerSample::new(-5.0, 20))
            .is_empty());
        assert_eq!(controller.last_sample(), None);
    }

    #[test]
    fn silence_in_normal_flags_stale_without_offloading() {
        let mut controller = controller(3_000.0, 2_800.0);
        controller.on_power_sample(PowerSample::new(1_000.0, 0));

        assert_eq!(controller.check_timeout(59_999), None);
        assert_eq!(
            controller.check_timeout(60_000),
            Some(OffloadEvent::TelemetryStale {
                state: OffloadState::Normal,
                silent_for_ms: 60_000
            })
        );
        assert_eq!(controller.check_timeout(90_000), None);
        assert!(controller.is_telemetry_stale());
        assert_eq!(controller.state(), OffloadState::Normal);
    }

    #[test]
    fn silence_while_offloaded_never_restores() {
        let mut controller = controller(3_000.0, 2_800.0);
        controller.on_power_sample(PowerSample::new(4_000.0, 0));

        assert!(controller.check_timeout(600_000).is_some());
        assert_eq!(controller.state(), OffloadState::Offloaded);

        let events = controller.on_power_sample(PowerSample::new(1_000.0, 601_000));
        assert_eq!(events.first(), Some(&OffloadEvent::TelemetryResumed));
        assert_eq!(controller.state(), OffloadState::Normal);
        assert!(!controller.is_telemetry_stale());
    }

    #[test]
    fn restore_delay_requires_sustained_low_power() {
        let mut controller = controller(3_000.0, 2_800.0);
        controller.set_config(OffloadConfig {
            restore_delay_ms: 10_000,
            ..controller.config().clone()
        });
        controller.on_power_sample(PowerSample::new(3_100.0, 0));

        let events = controller.on_power_sample(PowerSample::new(2_000.0, 1_000));
        assert_eq!(
            events,
            vec![OffloadEvent::RestorePending { power_w: 2_000.0 }]
        );
        controller.on_power_sample(PowerSample::new(2_900.0, 5_000));
        controller.on_power_sample(PowerSample::new(2_000.0, 6_000));
        controller.on_power_sample(PowerSample::new(2_000.0, 15_000));
        assert_eq!(controller.state(), OffloadState::Offloaded);

        let events = controller.on_power_sample(PowerSample::new(2_000.0, 16_000));
        assert_eq!(
            events,
            vec![OffloadEvent::Restored {
                power_w: 2_000.0,
                offloaded_for_ms: 16_000
            }]
        );
        assert_eq!(controller.state(), OffloadState::Normal);
    }
}

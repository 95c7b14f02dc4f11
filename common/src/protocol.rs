use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{error::OutputFault, types::HeatingLevel};

pub const BURST_PERIOD_MS: u32 = 300_000;
pub const COMFORT1_BURST_MS: u32 = 3_000;
pub const COMFORT2_BURST_MS: u32 = 7_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum LineSignal {
    Off,
    On,
    Pulsed { on_ms: u32, period_ms: u32 },
}

impl LineSignal {
    pub fn level_at(self, now_ms: u64) -> bool {
        match self {
            Self::Off => false,
            Self::On => true,
            Self::Pulsed { on_ms, period_ms } => {
                period_ms > 0 && now_ms % u64::from(period_ms) < u64::from(on_ms)
            }
        }
    }

    pub fn is_modulated(self) -> bool {
        matches!(self, Self::Pulsed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProtocolState {
    pub positive: LineSignal,
    pub negative: LineSignal,
}

impl ProtocolState {
    pub const fn new(positive: LineSignal, negative: LineSignal) -> Self {
        Self { positive, negative }
    }

    pub fn levels_at(self, now_ms: u64) -> (bool, bool) {
        (
            self.positive.level_at(now_ms),
            self.negative.level_at(now_ms),
        )
    }

    pub fn is_modulated(self) -> bool {
        self.positive.is_modulated() || self.negative.is_modulated()
    }
}

const NO_SIGNAL: ProtocolState = ProtocolState::new(LineSignal::Off, LineSignal::Off);
const FULL_WAVE: ProtocolState = ProtocolState::new(LineSignal::On, LineSignal::On);
const NEGATIVE_HALF: ProtocolState = ProtocolState::new(LineSignal::Off, LineSignal::On);
const POSITIVE_HALF: ProtocolState = ProtocolState::new(LineSignal::On, LineSignal::Off);

const fn burst(on_ms: u32) -> ProtocolState {
    let line = LineSignal::Pulsed {
        on_ms,
        period_ms: BURST_PERIOD_MS,
    };
    ProtocolState::new(line, line)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeaterCapability {
    Direct,
    SingleLevel,
    DualLevel,
}

impl HeaterCapability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "DIRECT",
            Self::SingleLevel => "SINGLE_LEVEL",
            Self::DualLevel => "DUAL_LEVEL",
        }
    }

    pub fn supports(self, level: HeatingLevel) -> bool {
        match self {
            Self::Direct => matches!(level, HeatingLevel::Off | HeatingLevel::Comfort),
            Self::SingleLevel => !matches!(level, HeatingLevel::Comfort1 | HeatingLevel::Comfort2),
            Self::DualLevel => true,
        }
    }
}

impl fmt::Display for HeaterCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolTable {
    capability: HeaterCapability,
    off: ProtocolState,
    entries: [Option<ProtocolState>; 6],
}

impl ProtocolTable {
    pub fn for_capability(capability: HeaterCapability) -> Self {
        let mut entries = [None; 6];
        let off = match capability {
            HeaterCapability::Direct => NO_SIGNAL,
            HeaterCapability::SingleLevel | HeaterCapability::DualLevel => POSITIVE_HALF,
        };

        // Comfort: no signal, Eco: both half-waves, Frost: negative only, Off: positive only.
        for level in HeatingLevel::ALL {
            if !capability.supports(level) {
                continue;
            }
            entries[level.index()] = Some(match (capability, level) {
                (HeaterCapability::Direct, HeatingLevel::Comfort) => POSITIVE_HALF,
                (_, HeatingLevel::Off) => off,
                (_, HeatingLevel::Comfort) => NO_SIGNAL,
                (_, HeatingLevel::Eco) => FULL_WAVE,
                (_, HeatingLevel::FrostProtection) => NEGATIVE_HALF,
                (_, HeatingLevel::Comfort1) => burst(COMFORT1_BURST_MS),
                (_, HeatingLevel::Comfort2) => burst(COMFORT2_BURST_MS),
            });
        }

        Self {
            capability,
            off,
            entries,
        }
    }

    pub fn capability(&self) -> HeaterCapability {
        self.capability
    }

    pub fn off_state(&self) -> ProtocolState {
        self.off
    }

    // Levels outside the heater capability encode as Off.
    pub fn encode(&self, level: HeatingLevel) -> ProtocolState {
        self.entries[level.index()].unwrap_or(self.off)
    }

    pub fn encode_code(&self, code: u8) -> ProtocolState {
        HeatingLevel::from_code(code)
            .map(|level| self.encode(level))
            .unwrap_or(self.off)
    }

    // Unknown signal combinations decode as Off.
    pub fn decode(&self, state: ProtocolState) -> HeatingLevel {
        HeatingLevel::ALL
            .into_iter()
            .find(|level| self.entries[level.index()] == Some(state))
            .unwrap_or(HeatingLevel::Off)
    }
}

pub trait SignalOutput {
    fn set_lines(&mut self, positive: bool, negative: bool) -> Result<(), OutputFault>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryOutput {
    lines: Option<(bool, bool)>,
    writes: Vec<(bool, bool)>,
    failures_remaining: u32,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Option<(bool, bool)> {
        self.lines
    }

    pub fn writes(&self) -> &[(bool, bool)] {
        &self.writes
    }

    pub fn fail_next_writes(&mut self, count: u32) {
        self.failures_remaining = count;
    }
}

impl SignalOutput for MemoryOutput {
    fn set_lines(&mut self, positive: bool, negative: bool) -> Result<(), OutputFault> {
        if self.failures_remaining > 0 {
            self.failures_remaining -= 1;
            return Err(OutputFault("simulated line write failure".to_string()));
        }
        self.lines = Some((positive, negative));
        self.writes.push((positive, negative));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Written,
    Unchanged,
    Faulted,
}

pub struct ProtocolDriver<O> {
    table: ProtocolTable,
    output: O,
    applied: Option<ProtocolState>,
    pins: Option<(bool, bool)>,
    pending_fault: Option<OutputFault>,
    last_fault: Option<OutputFault>,
    fault_count: u64,
}

impl<O: SignalOutput> ProtocolDriver<O> {
    pub fn new(table: ProtocolTable, output: O) -> Self {
        Self {
            table,
            output,
            applied: None,
            pins: None,
            pending_fault: None,
            last_fault: None,
            fault_count: 0,
        }
    }

    pub fn table(&self) -> &ProtocolTable {
        &self.table
    }

    pub fn set_table(&mut self, table: ProtocolTable) {
        if self.table != table {
            self.table = table;
            self.applied = None;
        }
    }

    pub fn encode(&self, level: HeatingLevel) -> ProtocolState {
        self.table.encode(level)
    }

    pub fn apply(&mut self, state: ProtocolState, now_ms: u64) -> ApplyOutcome {
        if self.applied == Some(state) {
            return ApplyOutcome::Unchanged;
        }

        let levels = state.levels_at(now_ms);
        match self.output.set_lines(levels.0, levels.1) {
            Ok(()) => {
                self.applied = Some(state);
                self.pins = Some(levels);
                ApplyOutcome::Written
            }
            Err(fault) => {
                self.record_fault(fault);
                ApplyOutcome::Faulted
            }
        }
    }

    // Re-drives modulated lines; only pin transitions reach the hardware.
    pub fn refresh(&mut self, now_ms: u64) -> ApplyOutcome {
        let Some(state) = self.applied else {
            return ApplyOutcome::Unchanged;
        };

        let levels = state.levels_at(now_ms);
        if self.pins == Some(levels) {
            return ApplyOutcome::Unchanged;
        }

        match self.output.set_lines(levels.0, levels.1) {
            Ok(()) => {
                self.pins = Some(levels);
                ApplyOutcome::Written
            }
            Err(fault) => {
                self.record_fault(fault);
                ApplyOutcome::Faulted
            }
        }
    }

    pub fn readback(&self) -> Option<ProtocolState> {
        self.applied
    }

    pub fn readback_level(&self) -> HeatingLevel {
        self.applied
            .map(|state| self.table.decode(state))
            .unwrap_or(HeatingLevel::Off)
    }

    pub fn take_fault(&mut self) -> Option<OutputFault> {
        self.pending_fault.take()
    }

    pub fn last_fault(&self) -> Option<&OutputFault> {
        self.last_fault.as_ref()
    }

    pub fn fault_count(&self) -> u64 {
        self.fault_count
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    fn record_fault(&mut self, fault: OutputFault) {
        // Lines are in an unknown state until the next successful write.
        self.applied = None;
        self.pins = None;
        self.fault_count = self.fault_count.saturating_add(1);
        self.last_fault = Some(fault.clone());
        self.pending_fault = Some(fault);
    }
}

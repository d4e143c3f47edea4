//! Shared physical state of the simulated bench.
//!
//! Every simulated session holds a handle to one [`BenchState`] behind a
//! mutex. Channel state outlives sessions the way instrument state outlives a
//! driver handle: closing a session releases ownership but leaves the last
//! programmed levels applied until a reset or output disable.

use super::dut::{DutModel, OperatingPoint};
use super::journal::{Call, JournalEntry};
use crate::error::{DriverError, DriverErrorKind};
use crate::hardware::capabilities::{
    DcPowerEvent, DcPowerSetting, EdgeTrigger, HorizontalTiming, MeasureWhen, MeasurementSample,
    OutputFunction, SequenceProperty, Sense, SourceMode, TransientResponse, TriggerType,
    VerticalConfig,
};
use crate::hardware::terminal::{TerminalEvent, TriggerTerminal};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

/// Samples reported per `fetch_backlog` call while a record is streaming.
pub(crate) const BACKLOG_CHUNK: usize = 256;

/// Resource and channel identifying one physical channel.
pub(crate) type ChannelKey = (String, String);

/// Committed properties of a source-measure channel.
#[derive(Debug, Clone)]
pub(crate) struct ChannelSettings {
    pub sense: Sense,
    pub source_mode: SourceMode,
    pub output_function: OutputFunction,
    pub voltage_level: f64,
    pub current_limit: f64,
    pub current_level: f64,
    pub voltage_limit_range: f64,
    pub source_delay: Duration,
    pub aperture_time: Duration,
    pub measure_when: MeasureWhen,
    pub record_length: usize,
    pub record_length_is_finite: bool,
    pub source_trigger_type: TriggerType,
    pub measure_trigger_type: TriggerType,
    pub source_trigger_input: Option<TriggerTerminal>,
    pub measure_trigger_input: Option<TriggerTerminal>,
    pub output_enabled: bool,
    pub transient_response: TransientResponse,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            sense: Sense::Local,
            source_mode: SourceMode::SinglePoint,
            output_function: OutputFunction::DcVoltage,
            voltage_level: 0.0,
            current_limit: 0.01,
            current_level: 0.0,
            voltage_limit_range: 6.0,
            source_delay: Duration::from_micros(50),
            aperture_time: Duration::from_millis(1),
            measure_when: MeasureWhen::OnDemand,
            record_length: 1,
            record_length_is_finite: true,
            source_trigger_type: TriggerType::None,
            measure_trigger_type: TriggerType::None,
            source_trigger_input: None,
            measure_trigger_input: None,
            output_enabled: true,
            transient_response: TransientResponse::Normal,
        }
    }
}

/// One step of an advanced sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct AdvancedStep {
    pub voltage_level: Option<f64>,
    pub current_limit: Option<f64>,
}

/// Full state of one source-measure channel.
#[derive(Debug, Default)]
pub(crate) struct ChannelState {
    pub owner: Option<u64>,
    pub settings: ChannelSettings,
    pub advanced_properties: Vec<SequenceProperty>,
    pub advanced_steps: Vec<AdvancedStep>,
    pub sequence: Vec<f64>,
    pub running: bool,
    pub program: Vec<f64>,
    pub cursor: usize,
    pub buffer: VecDeque<MeasurementSample>,
    pub events: HashSet<DcPowerEvent>,
    pub applied: Option<f64>,
}

impl ChannelState {
    fn is_sourcing(&self, function: OutputFunction) -> bool {
        self.settings.output_enabled
            && self.settings.output_function == function
            && self.applied.is_some()
    }

    /// Levels stepped by the sequence engine.
    fn resolve_program(&self) -> Vec<f64> {
        if !self.advanced_steps.is_empty() {
            let fallback = self.level_setting();
            self.advanced_steps
                .iter()
                .map(|step| match self.settings.output_function {
                    OutputFunction::DcVoltage => step.voltage_level.unwrap_or(fallback),
                    OutputFunction::DcCurrent => fallback,
                })
                .collect()
        } else {
            self.sequence.clone()
        }
    }

    fn level_setting(&self) -> f64 {
        match self.settings.output_function {
            OutputFunction::DcVoltage => self.settings.voltage_level,
            OutputFunction::DcCurrent => self.settings.current_level,
        }
    }

    fn reset(&mut self) {
        let owner = self.owner;
        *self = ChannelState::default();
        self.owner = owner;
    }
}

/// State of one oscilloscope channel.
#[derive(Debug, Default)]
pub(crate) struct ScopeState {
    pub owner: Option<u64>,
    pub vertical: Option<VerticalConfig>,
    pub trigger: Option<EdgeTrigger>,
    pub horizontal: Option<HorizontalTiming>,
    pub armed: bool,
    pub samples_taken: u64,
}

/// Everything the simulated instruments share.
pub(crate) struct BenchState {
    pub dut: DutModel,
    pub channels: HashMap<ChannelKey, ChannelState>,
    pub scopes: HashMap<ChannelKey, ScopeState>,
    pub journal: Vec<JournalEntry>,
    next_session: u64,
    rng: StdRng,
}

impl BenchState {
    pub fn new(dut: DutModel, seed: u64) -> Self {
        Self {
            dut,
            channels: HashMap::new(),
            scopes: HashMap::new(),
            journal: Vec::new(),
            next_session: 1,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn record(&mut self, key: &ChannelKey, call: Call) {
        self.journal.push(JournalEntry {
            resource: key.0.clone(),
            channel: key.1.clone(),
            call,
        });
    }

    // =========================================================================
    // Ownership
    // =========================================================================

    pub fn open_channel(&mut self, key: &ChannelKey) -> Result<u64, DriverError> {
        let id = self.next_session;
        let channel = self.channels.entry(key.clone()).or_default();
        if channel.owner.is_some() {
            return Err(busy(key));
        }
        channel.owner = Some(id);
        self.next_session += 1;
        Ok(id)
    }

    pub fn open_scope(&mut self, key: &ChannelKey) -> Result<u64, DriverError> {
        let id = self.next_session;
        let scope = self.scopes.entry(key.clone()).or_default();
        if scope.owner.is_some() {
            return Err(busy(key));
        }
        scope.owner = Some(id);
        self.next_session += 1;
        Ok(id)
    }

    pub fn channel_mut(
        &mut self,
        key: &ChannelKey,
        session: u64,
        operation: &str,
    ) -> Result<&mut ChannelState, DriverError> {
        match self.channels.get_mut(key) {
            Some(channel) if channel.owner == Some(session) => Ok(channel),
            _ => Err(closed(key, operation)),
        }
    }

    pub fn scope_mut(
        &mut self,
        key: &ChannelKey,
        session: u64,
        operation: &str,
    ) -> Result<&mut ScopeState, DriverError> {
        match self.scopes.get_mut(key) {
            Some(scope) if scope.owner == Some(session) => Ok(scope),
            _ => Err(closed(key, operation)),
        }
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub fn apply_setting(
        &mut self,
        key: &ChannelKey,
        session: u64,
        setting: DcPowerSetting,
    ) -> Result<(), DriverError> {
        let channel = self.channel_mut(key, session, "configure")?;
        let settings = &mut channel.settings;
        match setting {
            DcPowerSetting::Sense(value) => settings.sense = value,
            DcPowerSetting::SourceMode(value) => settings.source_mode = value,
            DcPowerSetting::OutputFunction(value) => settings.output_function = value,
            DcPowerSetting::VoltageLevel(value) => {
                if value.abs() > 60.0 {
                    return Err(invalid(key, format!("voltage level {} V out of range", value)));
                }
                match channel.advanced_steps.last_mut() {
                    Some(step) => step.voltage_level = Some(value),
                    None => channel.settings.voltage_level = value,
                }
            }
            DcPowerSetting::CurrentLimit(value) => {
                if value <= 0.0 {
                    return Err(invalid(key, format!("current limit {} A must be positive", value)));
                }
                match channel.advanced_steps.last_mut() {
                    Some(step) => step.current_limit = Some(value),
                    None => channel.settings.current_limit = value,
                }
            }
            DcPowerSetting::CurrentLevel(value) => settings.current_level = value,
            DcPowerSetting::VoltageLimitRange(value) => settings.voltage_limit_range = value,
            DcPowerSetting::SourceDelay(value) => settings.source_delay = value,
            DcPowerSetting::ApertureTime(value) => {
                if value.is_zero() {
                    return Err(invalid(key, "aperture time must be positive"));
                }
                settings.aperture_time = value;
            }
            DcPowerSetting::MeasureWhen(value) => settings.measure_when = value,
            DcPowerSetting::MeasureRecordLength(value) => {
                if value == 0 {
                    return Err(invalid(key, "measure record length must be positive"));
                }
                settings.record_length = value;
            }
            DcPowerSetting::MeasureRecordLengthIsFinite(value) => {
                settings.record_length_is_finite = value
            }
            DcPowerSetting::SourceTriggerType(value) => settings.source_trigger_type = value,
            DcPowerSetting::MeasureTriggerType(value) => settings.measure_trigger_type = value,
            DcPowerSetting::SourceTriggerInput(value) => settings.source_trigger_input = Some(value),
            DcPowerSetting::MeasureTriggerInput(value) => {
                settings.measure_trigger_input = Some(value)
            }
            DcPowerSetting::OutputEnabled(value) => {
                settings.output_enabled = value;
                if !value {
                    channel.applied = None;
                }
            }
            DcPowerSetting::TransientResponse(value) => settings.transient_response = value,
            // Ranges and loop compensation do not change the simulated response.
            DcPowerSetting::VoltageLevelAutorange(_)
            | DcPowerSetting::CurrentLimitAutorange(_)
            | DcPowerSetting::CurrentLevelAutorange(_)
            | DcPowerSetting::CurrentLevelRange(_)
            | DcPowerSetting::VoltageGainBandwidth(_)
            | DcPowerSetting::VoltageCompensationFrequency(_)
            | DcPowerSetting::VoltagePoleZeroRatio(_)
            | DcPowerSetting::CurrentGainBandwidth(_)
            | DcPowerSetting::CurrentCompensationFrequency(_)
            | DcPowerSetting::CurrentPoleZeroRatio(_) => {}
        }
        Ok(())
    }

    pub fn commit(&mut self, key: &ChannelKey, session: u64) -> Result<(), DriverError> {
        let channel = self.channel_mut(key, session, "commit")?;
        if channel.settings.source_mode == SourceMode::Sequence && channel.resolve_program().is_empty()
        {
            return Err(DriverError::new(
                &key.0,
                "commit",
                DriverErrorKind::Configuration,
                "sequence mode requires at least one step",
            ));
        }
        Ok(())
    }

    pub fn reset_channel(&mut self, key: &ChannelKey, session: u64) -> Result<(), DriverError> {
        self.channel_mut(key, session, "reset")?.reset();
        Ok(())
    }

    pub fn abort_channel(&mut self, key: &ChannelKey, session: u64) -> Result<(), DriverError> {
        let channel = self.channel_mut(key, session, "abort")?;
        channel.running = false;
        channel.cursor = 0;
        channel.program.clear();
        channel.buffer.clear();
        channel.events.clear();
        Ok(())
    }

    // =========================================================================
    // Source and sequence engine
    // =========================================================================

    pub fn initiate(&mut self, key: &ChannelKey, session: u64) -> Result<(), DriverError> {
        let channel = self.channel_mut(key, session, "initiate")?;
        if channel.running {
            return Err(DriverError::new(
                &key.0,
                "initiate",
                DriverErrorKind::Configuration,
                "channel is already running",
            ));
        }

        channel.buffer.clear();
        channel.events.clear();
        channel.cursor = 0;

        match channel.settings.source_mode {
            SourceMode::SinglePoint => {
                let previous = channel.applied;
                let level = channel.level_setting();
                channel.running = true;
                if channel.settings.output_enabled {
                    channel.applied = Some(level);
                }
                channel.events.insert(DcPowerEvent::SourceComplete);
                if channel.settings.measure_when == MeasureWhen::AutomaticallyAfterSourceComplete {
                    self.record_samples(key, previous.unwrap_or(level), level);
                    self.mark_measured(key);
                }
                Ok(())
            }
            SourceMode::Sequence => {
                let program = channel.resolve_program();
                if program.is_empty() {
                    return Err(DriverError::new(
                        &key.0,
                        "initiate",
                        DriverErrorKind::Configuration,
                        "sequence is empty",
                    ));
                }
                channel.program = program;
                channel.running = true;
                if channel.settings.source_trigger_type == TriggerType::DigitalEdge {
                    // Armed: steps advance on incoming source triggers.
                    return Ok(());
                }
                self.run_sequence(key);
                Ok(())
            }
        }
    }

    /// Run a self-clocked sequence to completion, pulsing exported terminals.
    fn run_sequence(&mut self, key: &ChannelKey) {
        let (program, limits, function, measure_when) = match self.channels.get(key) {
            Some(channel) => (
                channel.program.clone(),
                channel
                    .advanced_steps
                    .iter()
                    .map(|step| step.current_limit)
                    .collect::<Vec<_>>(),
                channel.settings.output_function,
                channel.settings.measure_when,
            ),
            None => return,
        };
        let trigger = TriggerTerminal::new(&key.0, &key.1, TerminalEvent::SourceTrigger);
        let complete = TriggerTerminal::new(&key.0, &key.1, TerminalEvent::SourceCompleteEvent);

        for (index, level) in program.iter().enumerate() {
            let previous = match self.channels.get_mut(key) {
                Some(channel) => {
                    let previous = channel.applied;
                    if channel.settings.output_enabled {
                        channel.applied = Some(*level);
                    }
                    if let Some(Some(limit)) = limits.get(index) {
                        channel.settings.current_limit = *limit;
                    }
                    previous
                }
                None => return,
            };

            self.pulse_source_trigger(&trigger);

            if measure_when == MeasureWhen::AutomaticallyAfterSourceComplete {
                let from = match function {
                    OutputFunction::DcCurrent => previous.unwrap_or(*level),
                    OutputFunction::DcVoltage => *level,
                };
                self.record_samples(key, from, *level);
            }

            self.pulse_measure_trigger(&complete);
        }

        if let Some(channel) = self.channels.get_mut(key) {
            channel.cursor = program.len();
            channel.events.extend([
                DcPowerEvent::SourceComplete,
                DcPowerEvent::SequenceIterationComplete,
                DcPowerEvent::SequenceEngineDone,
            ]);
            if measure_when != MeasureWhen::OnDemand {
                channel.events.insert(DcPowerEvent::MeasureComplete);
            }
        }
    }

    /// Advance every running consumer listening on `terminal`.
    fn pulse_source_trigger(&mut self, terminal: &TriggerTerminal) {
        for channel in self.channels.values_mut() {
            let listening = channel.running
                && channel.settings.source_trigger_type == TriggerType::DigitalEdge
                && channel.settings.source_trigger_input.as_ref() == Some(terminal);
            if !listening || channel.cursor >= channel.program.len() {
                continue;
            }
            if channel.settings.output_enabled {
                channel.applied = Some(channel.program[channel.cursor]);
            }
            channel.events.insert(DcPowerEvent::SourceComplete);
        }
    }

    /// Take one measurement on every running consumer listening on `terminal`.
    fn pulse_measure_trigger(&mut self, terminal: &TriggerTerminal) {
        let listeners: Vec<ChannelKey> = self
            .channels
            .iter()
            .filter(|(_, channel)| {
                channel.running
                    && channel.settings.measure_when == MeasureWhen::OnMeasureTrigger
                    && channel.settings.measure_trigger_type == TriggerType::DigitalEdge
                    && channel.settings.measure_trigger_input.as_ref() == Some(terminal)
                    && channel.cursor < channel.program.len()
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in listeners {
            let sample = self.sample(&key);
            if let Some(channel) = self.channels.get_mut(&key) {
                channel.buffer.push_back(sample);
                channel.cursor += 1;
                channel.events.insert(DcPowerEvent::MeasureComplete);
                if channel.cursor == channel.program.len() {
                    channel.events.extend([
                        DcPowerEvent::SequenceIterationComplete,
                        DcPowerEvent::SequenceEngineDone,
                    ]);
                }
            }
        }
    }

    fn mark_measured(&mut self, key: &ChannelKey) {
        if let Some(channel) = self.channels.get_mut(key) {
            channel.events.insert(DcPowerEvent::MeasureComplete);
        }
    }

    // =========================================================================
    // Measurement
    // =========================================================================

    /// Operating point given every energized channel on the bench.
    pub fn operating_point(&self) -> OperatingPoint {
        let input_voltage = self
            .channels
            .values()
            .find(|channel| channel.is_sourcing(OutputFunction::DcVoltage))
            .and_then(|channel| channel.applied)
            .unwrap_or(0.0);
        let load_current = self
            .channels
            .values()
            .find(|channel| channel.is_sourcing(OutputFunction::DcCurrent))
            .and_then(|channel| channel.applied)
            .unwrap_or(0.0);
        self.dut.operating_point(input_voltage, load_current)
    }

    /// One on-demand reading of `key` at the present operating point.
    pub fn sample(&mut self, key: &ChannelKey) -> MeasurementSample {
        let op = self.operating_point();
        let function = self
            .channels
            .get(key)
            .map(|channel| channel.settings.output_function)
            .unwrap_or(OutputFunction::DcVoltage);
        match function {
            OutputFunction::DcVoltage => MeasurementSample::new(op.input_voltage, op.input_current),
            OutputFunction::DcCurrent => {
                let noise = self.noise(self.dut.measurement_noise);
                MeasurementSample::new(op.output_voltage + noise, -op.output_current)
            }
        }
    }

    /// Fill one measurement record after a step from `from_level` to `to_level`.
    fn record_samples(&mut self, key: &ChannelKey, from_level: f64, to_level: f64) {
        let (length, aperture, function) = match self.channels.get(key) {
            Some(channel) => (
                channel.settings.record_length,
                channel.settings.aperture_time.as_secs_f64(),
                channel.settings.output_function,
            ),
            None => return,
        };

        let mut record = Vec::with_capacity(length);
        match function {
            OutputFunction::DcVoltage => {
                for _ in 0..length {
                    record.push(self.sample(key));
                }
            }
            OutputFunction::DcCurrent => {
                let input_voltage = self.operating_point().input_voltage;
                for index in 0..length {
                    let elapsed = index as f64 * aperture;
                    let voltage =
                        self.dut
                            .transient_voltage(input_voltage, from_level, to_level, elapsed);
                    let noise = self.noise(self.dut.measurement_noise);
                    let current = if self.dut.is_on(input_voltage) { to_level } else { 0.0 };
                    record.push(MeasurementSample::new(voltage + noise, -current));
                }
            }
        }

        if let Some(channel) = self.channels.get_mut(key) {
            channel.buffer.extend(record);
        }
    }

    /// Take `count` buffered samples, or `None` when fewer are available.
    pub fn drain(
        &mut self,
        key: &ChannelKey,
        session: u64,
        count: usize,
    ) -> Result<Option<Vec<MeasurementSample>>, DriverError> {
        let channel = self.channel_mut(key, session, "fetch_multiple")?;
        if channel.buffer.len() < count {
            return Ok(None);
        }
        Ok(Some(channel.buffer.drain(..count).collect()))
    }

    // =========================================================================
    // Scope
    // =========================================================================

    /// Synthesize `count` ripple samples for an armed scope channel.
    pub fn scope_samples(&mut self, key: &ChannelKey, count: usize, sample_rate: f64) -> Vec<f64> {
        let start = self
            .scopes
            .get(key)
            .map(|scope| scope.samples_taken)
            .unwrap_or(0);
        let running = self.dut.is_on(self.operating_point().input_voltage);
        let mut samples = Vec::with_capacity(count);
        for index in 0..count {
            let t = (start + index as u64) as f64 / sample_rate;
            let ripple = if running { self.dut.ripple(t) } else { 0.0 };
            let noise = self.noise(self.dut.ripple_noise);
            samples.push(ripple + noise);
        }
        if let Some(scope) = self.scopes.get_mut(key) {
            scope.samples_taken += count as u64;
            scope.armed = false;
        }
        samples
    }

    fn noise(&mut self, amplitude: f64) -> f64 {
        if amplitude > 0.0 {
            self.rng.gen_range(-amplitude..=amplitude)
        } else {
            0.0
        }
    }
}

fn busy(key: &ChannelKey) -> DriverError {
    DriverError::new(
        &key.0,
        "open",
        DriverErrorKind::ResourceBusy,
        format!("channel '{}' is already owned by another session", key.1),
    )
}

fn closed(key: &ChannelKey, operation: &str) -> DriverError {
    DriverError::new(
        &key.0,
        operation,
        DriverErrorKind::Closed,
        format!("channel '{}' session is closed", key.1),
    )
}

fn invalid(key: &ChannelKey, message: impl Into<String>) -> DriverError {
    DriverError::new(&key.0, "configure", DriverErrorKind::InvalidParameter, message)
}

//! Instrument Session Capabilities
//!
//! The measurement core talks to hardware only through the traits in this
//! module. A concrete driver (vendor binding or the simulated bench) opens
//! sessions through [`InstrumentDriver`] and hands back boxed trait objects:
//!
//! - [`DcPowerChannel`]: one source-measure channel acting as either the
//!   source (voltage output) or the electronic load (current output)
//! - [`ScopeChannel`]: one oscilloscope channel used for ripple capture
//!
//! Both share [`ManagedSession`], the teardown surface used by the recovery
//! supervisor (`abort`, `disable_output`, `reset`, `close`).
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Returns [`DriverError`] so the core can classify timeouts
//! - Takes `&self`; sessions manage their own interior state
//!
//! Channel properties are plain key/value settings applied with
//! [`DcPowerChannel::configure`] before [`DcPowerChannel::commit`]. The key is
//! the [`DcPowerSetting`] variant, the value its payload.

use crate::error::DriverError;
use crate::hardware::terminal::TriggerTerminal;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result type for session operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

// =============================================================================
// Channel property values
// =============================================================================

/// Where the channel senses its output voltage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sense {
    /// At the instrument terminals.
    Local,
    /// At the DUT through separate sense leads.
    Remote,
}

/// How the channel sources its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceMode {
    /// One fixed level until reconfigured.
    SinglePoint,
    /// A programmed list of levels stepped by the sequence engine.
    Sequence,
}

/// Quantity the channel regulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFunction {
    /// Regulate voltage, limit current (source role).
    DcVoltage,
    /// Regulate current, limit voltage (load role).
    DcCurrent,
}

/// When the channel takes a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasureWhen {
    /// Only when `measure_multiple` is called.
    OnDemand,
    /// After every source step settles.
    AutomaticallyAfterSourceComplete,
    /// When the measure trigger fires.
    OnMeasureTrigger,
}

/// Trigger source kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerType {
    /// Software or immediate.
    None,
    /// Edge on a routed digital line.
    DigitalEdge,
}

/// Control loop compensation preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransientResponse {
    /// Instrument default.
    Normal,
    /// Gain bandwidth, compensation frequency and pole-zero ratio set explicitly.
    Custom,
}

/// Events a channel can be waited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DcPowerEvent {
    /// The output reached its programmed level.
    SourceComplete,
    /// A measurement finished.
    MeasureComplete,
    /// One pass over the sequence finished.
    SequenceIterationComplete,
    /// The sequence engine ran every programmed step.
    SequenceEngineDone,
}

/// Properties that an advanced sequence step may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceProperty {
    /// Output voltage level.
    VoltageLevel,
    /// Output current limit.
    CurrentLimit,
}

/// One channel property assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DcPowerSetting {
    /// Voltage sense location.
    Sense(Sense),
    /// Single point or sequence.
    SourceMode(SourceMode),
    /// Voltage or current regulation.
    OutputFunction(OutputFunction),
    /// Voltage level in volts.
    VoltageLevel(f64),
    /// Autorange the voltage level range.
    VoltageLevelAutorange(bool),
    /// Current limit in amps.
    CurrentLimit(f64),
    /// Autorange the current limit range.
    CurrentLimitAutorange(bool),
    /// Current level in amps.
    CurrentLevel(f64),
    /// Autorange the current level range.
    CurrentLevelAutorange(bool),
    /// Fixed current level range in amps.
    CurrentLevelRange(f64),
    /// Fixed voltage limit range in volts.
    VoltageLimitRange(f64),
    /// Settling delay after every source step.
    SourceDelay(Duration),
    /// Measurement integration window.
    ApertureTime(Duration),
    /// Measurement scheduling.
    MeasureWhen(MeasureWhen),
    /// Samples per measurement record.
    MeasureRecordLength(usize),
    /// Whether the record length bounds acquisition.
    MeasureRecordLengthIsFinite(bool),
    /// What advances the source to its next step.
    SourceTriggerType(TriggerType),
    /// What starts a measurement.
    MeasureTriggerType(TriggerType),
    /// Line that advances the source.
    SourceTriggerInput(TriggerTerminal),
    /// Line that starts a measurement.
    MeasureTriggerInput(TriggerTerminal),
    /// Output relay state.
    OutputEnabled(bool),
    /// Compensation preset.
    TransientResponse(TransientResponse),
    /// Voltage loop gain bandwidth in hertz.
    VoltageGainBandwidth(f64),
    /// Voltage loop compensation frequency in hertz.
    VoltageCompensationFrequency(f64),
    /// Voltage loop pole-zero ratio.
    VoltagePoleZeroRatio(f64),
    /// Current loop gain bandwidth in hertz.
    CurrentGainBandwidth(f64),
    /// Current loop compensation frequency in hertz.
    CurrentCompensationFrequency(f64),
    /// Current loop pole-zero ratio.
    CurrentPoleZeroRatio(f64),
}

/// One voltage/current reading from a channel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MeasurementSample {
    /// Measured voltage in volts.
    pub voltage: f64,
    /// Measured current in amps.
    pub current: f64,
}

impl MeasurementSample {
    /// Create a sample.
    pub fn new(voltage: f64, current: f64) -> Self {
        Self { voltage, current }
    }

    /// Instantaneous power in watts.
    pub fn power(&self) -> f64 {
        self.voltage * self.current
    }
}

// =============================================================================
// Session traits
// =============================================================================

/// Teardown surface shared by every session kind.
///
/// The supervisor drives these in order abort, disable output, reset, close.
#[async_trait]
pub trait ManagedSession: Send + Sync {
    /// Resource name the session was opened on.
    fn resource_name(&self) -> &str;

    /// Channel the session owns.
    fn channel_name(&self) -> &str;

    /// Stop any running acquisition or sequence.
    async fn abort(&self) -> DriverResult<()>;

    /// Open the output relay. Sessions without an output treat this as a no-op.
    async fn disable_output(&self) -> DriverResult<()> {
        Ok(())
    }

    /// Return the channel to its power-on defaults.
    async fn reset(&self) -> DriverResult<()>;

    /// Release the channel. Further calls fail with `Closed`.
    async fn close(&self) -> DriverResult<()>;
}

/// One source-measure channel.
#[async_trait]
pub trait DcPowerChannel: ManagedSession {
    /// Apply one property. Takes effect at the next `commit`.
    async fn configure(&self, setting: DcPowerSetting) -> DriverResult<()>;

    /// Create an advanced sequence whose steps carry `properties`.
    ///
    /// Subsequent level and limit settings apply to the most recently created step.
    async fn create_advanced_sequence(
        &self,
        name: &str,
        properties: &[SequenceProperty],
    ) -> DriverResult<()>;

    /// Append a step to the active advanced sequence.
    async fn create_advanced_sequence_step(&self) -> DriverResult<()>;

    /// Program a simple sequence of output levels with per-step source delays.
    async fn set_sequence(&self, levels: &[f64], source_delays: &[Duration]) -> DriverResult<()>;

    /// Push pending settings to the hardware.
    async fn commit(&self) -> DriverResult<()>;

    /// Start sourcing (and the sequence engine in sequence mode).
    async fn initiate(&self) -> DriverResult<()>;

    /// Block until `event` fires or `timeout` elapses.
    async fn wait_for_event(&self, event: DcPowerEvent, timeout: Duration) -> DriverResult<()>;

    /// Fetch `count` buffered samples in acquisition order.
    async fn fetch_multiple(
        &self,
        count: usize,
        timeout: Duration,
    ) -> DriverResult<Vec<MeasurementSample>>;

    /// Take one on-demand measurement.
    async fn measure_multiple(&self) -> DriverResult<Vec<MeasurementSample>>;

    /// Number of samples ready to fetch.
    async fn fetch_backlog(&self) -> DriverResult<usize>;

    /// Time between two samples of one measurement record.
    async fn measure_record_delta_time(&self) -> DriverResult<Duration>;
}

/// Vertical settings of a scope channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VerticalConfig {
    /// Full-scale range in volts.
    pub range: f64,
    /// Offset in volts.
    pub offset: f64,
    /// Probe attenuation factor.
    pub probe_attenuation: f64,
    /// Input coupling.
    pub coupling: Coupling,
    /// Input impedance in ohms.
    pub input_impedance: f64,
    /// Bandwidth limit in hertz, `None` for the instrument default.
    pub max_input_frequency: Option<f64>,
}

/// Input or trigger coupling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Coupling {
    /// Blocks the DC component.
    Ac,
    /// Passes the full signal.
    Dc,
}

/// Edge direction of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slope {
    /// Rising edge.
    Positive,
    /// Falling edge.
    Negative,
}

/// Edge trigger of a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeTrigger {
    /// Channel the trigger watches.
    pub source: String,
    /// Level in volts.
    pub level: f64,
    /// Trigger coupling.
    pub coupling: Coupling,
    /// Edge direction.
    pub slope: Slope,
    /// Fire automatically when no edge arrives.
    pub auto_trigger: bool,
}

/// Horizontal timing of a scope acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HorizontalTiming {
    /// Minimum sample rate in samples per second.
    pub min_sample_rate: f64,
    /// Minimum record length.
    pub min_num_points: usize,
    /// Trigger reference position in percent of the record.
    pub reference_position: f64,
    /// Records per acquisition.
    pub num_records: usize,
    /// Refuse equivalent-time sampling.
    pub enforce_realtime: bool,
}

/// One oscilloscope channel.
#[async_trait]
pub trait ScopeChannel: ManagedSession {
    /// Apply vertical and input characteristics.
    async fn configure_vertical(&self, vertical: VerticalConfig) -> DriverResult<()>;

    /// Apply the edge trigger.
    async fn configure_trigger(&self, trigger: EdgeTrigger) -> DriverResult<()>;

    /// Apply horizontal timing.
    async fn configure_horizontal(&self, timing: HorizontalTiming) -> DriverResult<()>;

    /// Sample rate actually used by the digitizer.
    async fn sample_rate(&self) -> DriverResult<f64>;

    /// Arm one acquisition.
    async fn initiate(&self) -> DriverResult<()>;

    /// Fetch `num_samples` points of the armed acquisition.
    async fn fetch(&self, num_samples: usize, timeout: Duration) -> DriverResult<Vec<f64>>;
}

/// Opens sessions on named resources.
///
/// A channel may be held by one session at a time; a second open of the same
/// resource and channel fails with [`crate::error::DriverErrorKind::ResourceBusy`].
#[async_trait]
pub trait InstrumentDriver: Send + Sync {
    /// Open a source-measure channel.
    async fn open_dcpower(
        &self,
        resource: &str,
        channel: &str,
    ) -> DriverResult<Box<dyn DcPowerChannel>>;

    /// Open an oscilloscope channel.
    async fn open_scope(&self, resource: &str, channel: &str) -> DriverResult<Box<dyn ScopeChannel>>;
}

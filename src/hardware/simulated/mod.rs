//! Simulated Bench
//!
//! In-process stand-in for a source, an electronic load and an oscilloscope
//! wired to one regulator DUT. It implements [`InstrumentDriver`] so every
//! measurement procedure can run without hardware.
//!
//! # Behavior
//!
//! - Opening a channel that is already owned fails with `ResourceBusy`.
//! - A self-clocked sequence runs to completion inside `initiate()`, pulsing
//!   `/{resource}/Engine{channel}/SourceTrigger` and `.../SourceCompleteEvent`
//!   at every step. Only channels that are already running and listen on
//!   those exact terminals react, so a load armed after the source misses
//!   every step and its completion wait times out.
//! - Waits and fetches that cannot be satisfied sleep for their timeout and
//!   fail with `Timeout` (use `tokio::time::pause` in tests).
//! - Every call is journaled in order; [`ErrorConfig`] injects failures.
//!
//! # Example
//!
//! ```rust,ignore
//! let bench = SimulatedBench::new();
//! let source = bench.open_dcpower("PPS", "0").await?;
//! source.configure(DcPowerSetting::VoltageLevel(12.0)).await?;
//! ```

mod dcpower;
mod dut;
mod faults;
mod journal;
mod scope;
mod state;

pub use dcpower::SimulatedDcPower;
pub use dut::{DutModel, OperatingPoint};
pub use faults::{ErrorConfig, ErrorScenario, Operation};
pub use journal::{Call, JournalEntry};
pub use scope::SimulatedScope;

use crate::hardware::capabilities::{
    DcPowerChannel, DriverResult, EdgeTrigger, HorizontalTiming, InstrumentDriver, MeasureWhen,
    OutputFunction, ScopeChannel, Sense, SourceMode, TriggerType, VerticalConfig,
};
use crate::hardware::terminal::TriggerTerminal;
use async_trait::async_trait;
use parking_lot::Mutex;
use state::{BenchState, ChannelKey};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEFAULT_SEED: u64 = 0x5eed_b0a2d;

/// Snapshot of a source-measure channel's programmed state.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSnapshot {
    /// Whether a session currently owns the channel.
    pub open: bool,
    /// Sense location.
    pub sense: Sense,
    /// Source mode.
    pub source_mode: SourceMode,
    /// Output function.
    pub output_function: OutputFunction,
    /// Measurement scheduling.
    pub measure_when: MeasureWhen,
    /// Source trigger kind.
    pub source_trigger_type: TriggerType,
    /// Source trigger input line.
    pub source_trigger_input: Option<TriggerTerminal>,
    /// Measure trigger input line.
    pub measure_trigger_input: Option<TriggerTerminal>,
    /// Voltage limit range.
    pub voltage_limit_range: f64,
    /// Source delay.
    pub source_delay: Duration,
    /// Aperture time.
    pub aperture_time: Duration,
    /// Record length.
    pub record_length: usize,
    /// Whether the record is finite.
    pub record_length_is_finite: bool,
    /// Output relay state.
    pub output_enabled: bool,
    /// Level currently driven, if energized.
    pub applied: Option<f64>,
    /// Step setpoints `(voltage, current limit)` of the advanced sequence.
    pub advanced_steps: Vec<(Option<f64>, Option<f64>)>,
    /// Levels of the simple sequence.
    pub sequence: Vec<f64>,
}

/// Snapshot of a scope channel's configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeSnapshot {
    /// Whether a session currently owns the channel.
    pub open: bool,
    /// Vertical settings.
    pub vertical: Option<VerticalConfig>,
    /// Trigger settings.
    pub trigger: Option<EdgeTrigger>,
    /// Horizontal timing.
    pub horizontal: Option<HorizontalTiming>,
}

/// Simulated instrument bench.
///
/// Cloning shares the same physical state, so a test can keep a handle for
/// inspection while procedures own another.
#[derive(Clone)]
pub struct SimulatedBench {
    state: Arc<Mutex<BenchState>>,
    faults: ErrorConfig,
}

impl Default for SimulatedBench {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBench {
    /// Bench with the default regulator model and no injected faults.
    pub fn new() -> Self {
        Self::with_dut(DutModel::default())
    }

    /// Bench with a custom regulator model.
    pub fn with_dut(dut: DutModel) -> Self {
        Self {
            state: Arc::new(Mutex::new(BenchState::new(dut, DEFAULT_SEED))),
            faults: ErrorConfig::none(),
        }
    }

    /// Attach fault injection.
    pub fn with_faults(mut self, faults: ErrorConfig) -> Self {
        self.faults = faults;
        self
    }

    /// Regulator model in use.
    pub fn dut(&self) -> DutModel {
        self.state.lock().dut.clone()
    }

    /// Every call made so far, in order.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().journal.clone()
    }

    /// Calls made on `resource`, in order.
    pub fn calls(&self, resource: &str) -> Vec<Call> {
        self.state
            .lock()
            .journal
            .iter()
            .filter(|entry| entry.resource == resource)
            .map(|entry| entry.call.clone())
            .collect()
    }

    /// Index in the journal of the first `call` on `resource`.
    pub fn position(&self, resource: &str, call: &Call) -> Option<usize> {
        self.state
            .lock()
            .journal
            .iter()
            .position(|entry| entry.resource == resource && &entry.call == call)
    }

    /// Number of channels currently owned by a session.
    pub fn open_sessions(&self) -> usize {
        let state = self.state.lock();
        state.channels.values().filter(|c| c.owner.is_some()).count()
            + state.scopes.values().filter(|s| s.owner.is_some()).count()
    }

    /// Programmed state of a source-measure channel.
    pub fn channel(&self, resource: &str, channel: &str) -> Option<ChannelSnapshot> {
        let state = self.state.lock();
        let key: ChannelKey = (resource.to_string(), channel.to_string());
        state.channels.get(&key).map(|c| ChannelSnapshot {
            open: c.owner.is_some(),
            sense: c.settings.sense,
            source_mode: c.settings.source_mode,
            output_function: c.settings.output_function,
            measure_when: c.settings.measure_when,
            source_trigger_type: c.settings.source_trigger_type,
            source_trigger_input: c.settings.source_trigger_input.clone(),
            measure_trigger_input: c.settings.measure_trigger_input.clone(),
            voltage_limit_range: c.settings.voltage_limit_range,
            source_delay: c.settings.source_delay,
            aperture_time: c.settings.aperture_time,
            record_length: c.settings.record_length,
            record_length_is_finite: c.settings.record_length_is_finite,
            output_enabled: c.settings.output_enabled,
            applied: c.applied,
            advanced_steps: c
                .advanced_steps
                .iter()
                .map(|step| (step.voltage_level, step.current_limit))
                .collect(),
            sequence: c.sequence.clone(),
        })
    }

    /// Configuration of a scope channel.
    pub fn scope(&self, resource: &str, channel: &str) -> Option<ScopeSnapshot> {
        let state = self.state.lock();
        let key: ChannelKey = (resource.to_string(), channel.to_string());
        state.scopes.get(&key).map(|s| ScopeSnapshot {
            open: s.owner.is_some(),
            vertical: s.vertical,
            trigger: s.trigger.clone(),
            horizontal: s.horizontal,
        })
    }
}

#[async_trait]
impl InstrumentDriver for SimulatedBench {
    async fn open_dcpower(
        &self,
        resource: &str,
        channel: &str,
    ) -> DriverResult<Box<dyn DcPowerChannel>> {
        let key: ChannelKey = (resource.to_string(), channel.to_string());
        let session = {
            let mut state = self.state.lock();
            state.record(&key, Call::Open);
            self.faults.check_operation(resource, Operation::Open)?;
            state.open_channel(&key)?
        };
        debug!(resource, channel, session, "opened simulated dcpower channel");
        Ok(Box::new(SimulatedDcPower::new(
            Arc::clone(&self.state),
            self.faults.clone(),
            key,
            session,
        )))
    }

    async fn open_scope(&self, resource: &str, channel: &str) -> DriverResult<Box<dyn ScopeChannel>> {
        let key: ChannelKey = (resource.to_string(), channel.to_string());
        let session = {
            let mut state = self.state.lock();
            state.record(&key, Call::Open);
            self.faults.check_operation(resource, Operation::Open)?;
            state.open_scope(&key)?
        };
        debug!(resource, channel, session, "opened simulated scope channel");
        Ok(Box::new(SimulatedScope::new(
            Arc::clone(&self.state),
            self.faults.clone(),
            key,
            session,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverErrorKind;
    use crate::hardware::capabilities::{DcPowerEvent, DcPowerSetting, ManagedSession};

    #[tokio::test]
    async fn second_open_is_refused() {
        let bench = SimulatedBench::new();
        let first = bench.open_dcpower("PPS", "0").await.unwrap();
        let err = bench.open_dcpower("PPS", "0").await.err().unwrap();
        assert_eq!(err.kind, DriverErrorKind::ResourceBusy);

        first.close().await.unwrap();
        assert!(bench.open_dcpower("PPS", "0").await.is_ok());
    }

    #[tokio::test]
    async fn closed_session_is_rejected() {
        let bench = SimulatedBench::new();
        let session = bench.open_dcpower("PPS", "0").await.unwrap();
        session.close().await.unwrap();
        let err = session.commit().await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Closed);
    }

    #[tokio::test]
    async fn single_point_measures_dut_input() {
        let bench = SimulatedBench::new();
        let source = bench.open_dcpower("PPS", "0").await.unwrap();
        source
            .configure(DcPowerSetting::VoltageLevel(12.0))
            .await
            .unwrap();
        source.configure(DcPowerSetting::CurrentLimit(2.0)).await.unwrap();
        source.commit().await.unwrap();
        source.initiate().await.unwrap();
        source
            .wait_for_event(DcPowerEvent::SourceComplete, Duration::from_secs(5))
            .await
            .unwrap();
        let sample = source.measure_multiple().await.unwrap()[0];
        assert_eq!(sample.voltage, 12.0);
        // Unloaded regulator draws its quiescent current.
        assert!((sample.current - bench.dut().quiescent_current).abs() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_event_times_out() {
        let bench = SimulatedBench::new();
        let load = bench.open_dcpower("E-load", "0").await.unwrap();
        let err = load
            .wait_for_event(DcPowerEvent::SequenceEngineDone, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Timeout);
    }

    #[tokio::test]
    async fn journal_tracks_calls_in_order() {
        let bench = SimulatedBench::new();
        let source = bench.open_dcpower("PPS", "0").await.unwrap();
        source.abort().await.unwrap();
        source.disable_output().await.unwrap();
        source.reset().await.unwrap();
        source.close().await.unwrap();
        assert_eq!(
            bench.calls("PPS"),
            vec![
                Call::Open,
                Call::Abort,
                Call::DisableOutput,
                Call::Reset,
                Call::Close
            ]
        );
        assert_eq!(bench.open_sessions(), 0);
    }
}

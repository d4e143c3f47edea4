//! Dual-Instrument Configurator
//!
//! Turns sweep values and safety limits into the programs the two
//! source-measure channels run:
//!
//! - the **source** steps an advanced sequence of `(voltage, current limit)`
//!   pairs on its own clock and measures after every step
//! - the **load** steps a simple current sequence, advancing on the source's
//!   `SourceTrigger` line and measuring on its `SourceCompleteEvent` line
//!
//! The load only ever consumes triggers; both terminals are built from the
//! source's resource and channel.
//!
//! Single-point helpers cover the procedures that energize a channel at a
//! fixed level and measure on demand.

use crate::error::{BenchError, BenchResult};
use crate::hardware::capabilities::{
    DcPowerChannel, DcPowerEvent, DcPowerSetting, MeasureWhen, MeasurementSample, OutputFunction,
    SequenceProperty, Sense, SourceMode, TriggerType,
};
use crate::hardware::terminal::{TerminalEvent, TriggerTerminal};
use crate::sweep::clamp_current;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Bound on single-point `SourceComplete` waits.
pub const SOURCE_COMPLETE_TIMEOUT: Duration = Duration::from_secs(5);

/// Name of the advanced sequence programmed on the source.
pub const SOURCE_SEQUENCE_NAME: &str = "SourceVoltages";

// =============================================================================
// Programs
// =============================================================================

/// One step of a channel program: the sourced level and its compliance limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Setpoint {
    /// Voltage (source) or current (load) level.
    pub level: f64,
    /// Current limit (source) or voltage limit range (load).
    pub limit: f64,
}

/// Ordered setpoints applied to one channel across a sweep.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelProgram {
    steps: Vec<Setpoint>,
}

impl ChannelProgram {
    /// Program from explicit setpoints.
    pub fn new(steps: Vec<Setpoint>) -> Self {
        Self { steps }
    }

    /// Setpoints in execution order.
    pub fn steps(&self) -> &[Setpoint] {
        &self.steps
    }

    /// Levels in execution order.
    pub fn levels(&self) -> Vec<f64> {
        self.steps.iter().map(|step| step.level).collect()
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// `true` for a program without steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Current and power limits the source must respect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerBudget {
    /// Requested current limit in amps.
    pub current_limit: f64,
    /// Maximum source power in watts.
    pub power_ceiling: f64,
}

impl PowerBudget {
    /// Current limit allowed at `voltage`.
    pub fn limit_at(&self, voltage: f64) -> f64 {
        clamp_current(voltage, self.current_limit, self.power_ceiling)
    }
}

/// Matched source and load programs for a nested sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepProgram {
    /// Voltage steps, each outer value repeated once per inner value.
    pub source: ChannelProgram,
    /// Current steps, the inner sweep repeated once per outer value.
    pub load: ChannelProgram,
    /// Number of source voltages.
    pub outer_points: usize,
    /// Number of load currents.
    pub inner_points: usize,
}

impl SweepProgram {
    /// Cartesian expansion of source voltages (outer) and load currents (inner).
    ///
    /// Step `k` pairs `voltages[k / inner]` with `currents[k % inner]`. Either
    /// sweep being empty is a validation error, raised before any hardware is
    /// touched.
    pub fn cartesian(
        voltages: &[f64],
        currents: &[f64],
        budget: PowerBudget,
        voltage_limit_range: f64,
    ) -> BenchResult<Self> {
        if voltages.is_empty() {
            return Err(BenchError::Validation(
                "source voltage sweep produced no points".into(),
            ));
        }
        if currents.is_empty() {
            return Err(BenchError::Validation(
                "load current sweep produced no points".into(),
            ));
        }

        let source = voltages
            .iter()
            .flat_map(|&voltage| {
                std::iter::repeat(Setpoint {
                    level: voltage,
                    limit: budget.limit_at(voltage),
                })
                .take(currents.len())
            })
            .collect();
        let load = std::iter::repeat(currents)
            .take(voltages.len())
            .flatten()
            .map(|&current| Setpoint {
                level: current,
                limit: voltage_limit_range,
            })
            .collect();

        Ok(Self {
            source: ChannelProgram::new(source),
            load: ChannelProgram::new(load),
            outer_points: voltages.len(),
            inner_points: currents.len(),
        })
    }

    /// Total number of synchronized steps.
    pub fn len(&self) -> usize {
        self.source.len()
    }

    /// `true` when no step would run.
    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }
}

/// Settling and integration times applied to every step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepTiming {
    /// Delay between sourcing a level and measuring.
    pub source_delay: Duration,
    /// Measurement integration window.
    pub aperture_time: Duration,
}

// =============================================================================
// Channel programming
// =============================================================================

/// Apply `settings` in order.
pub async fn apply(
    channel: &dyn DcPowerChannel,
    settings: impl IntoIterator<Item = DcPowerSetting>,
) -> BenchResult<()> {
    for setting in settings {
        channel.configure(setting).await?;
    }
    Ok(())
}

/// Bring the source up at `voltage` and leave it sourcing.
///
/// Programs a remote-sensed single-point voltage output with the budgeted
/// current limit, waits for the source to settle (`setup_time` as source
/// delay) and aborts, which keeps the output energized.
pub async fn energize_source(
    channel: &dyn DcPowerChannel,
    voltage: f64,
    budget: PowerBudget,
    setup_time: Duration,
) -> BenchResult<()> {
    apply(
        channel,
        [
            DcPowerSetting::Sense(Sense::Remote),
            DcPowerSetting::SourceMode(SourceMode::SinglePoint),
            DcPowerSetting::OutputFunction(OutputFunction::DcVoltage),
            DcPowerSetting::VoltageLevelAutorange(true),
            DcPowerSetting::CurrentLimitAutorange(true),
            DcPowerSetting::VoltageLevel(voltage),
            DcPowerSetting::CurrentLimit(budget.limit_at(voltage)),
            DcPowerSetting::SourceDelay(setup_time),
        ],
    )
    .await?;
    settle(channel).await?;
    debug!(resource = channel.resource_name(), voltage, "source energized");
    Ok(())
}

/// Bring the load up at `current` and leave it sinking.
pub async fn energize_load(
    channel: &dyn DcPowerChannel,
    current: f64,
    voltage_limit_range: f64,
    setup_time: Duration,
) -> BenchResult<()> {
    apply(
        channel,
        [
            DcPowerSetting::Sense(Sense::Remote),
            DcPowerSetting::SourceMode(SourceMode::SinglePoint),
            DcPowerSetting::OutputFunction(OutputFunction::DcCurrent),
            DcPowerSetting::CurrentLevelAutorange(true),
            DcPowerSetting::CurrentLevel(current),
            DcPowerSetting::VoltageLimitRange(voltage_limit_range),
            DcPowerSetting::SourceDelay(setup_time),
        ],
    )
    .await?;
    settle(channel).await?;
    debug!(resource = channel.resource_name(), current, "load energized");
    Ok(())
}

async fn settle(channel: &dyn DcPowerChannel) -> BenchResult<()> {
    channel.commit().await?;
    channel.initiate().await?;
    channel
        .wait_for_event(DcPowerEvent::SourceComplete, SOURCE_COMPLETE_TIMEOUT)
        .await?;
    channel.abort().await?;
    Ok(())
}

/// Program the source's self-clocked advanced sequence.
pub async fn program_source_sequence(
    channel: &dyn DcPowerChannel,
    program: &ChannelProgram,
    timing: StepTiming,
) -> BenchResult<()> {
    apply(
        channel,
        [
            DcPowerSetting::Sense(Sense::Remote),
            DcPowerSetting::SourceMode(SourceMode::Sequence),
            DcPowerSetting::OutputFunction(OutputFunction::DcVoltage),
            DcPowerSetting::VoltageLevelAutorange(true),
            DcPowerSetting::CurrentLimitAutorange(true),
            DcPowerSetting::SourceDelay(timing.source_delay),
        ],
    )
    .await?;

    channel
        .create_advanced_sequence(
            SOURCE_SEQUENCE_NAME,
            &[SequenceProperty::VoltageLevel, SequenceProperty::CurrentLimit],
        )
        .await?;
    for step in program.steps() {
        channel.create_advanced_sequence_step().await?;
        channel
            .configure(DcPowerSetting::VoltageLevel(step.level))
            .await?;
        channel
            .configure(DcPowerSetting::CurrentLimit(step.limit))
            .await?;
    }

    apply(
        channel,
        [
            DcPowerSetting::MeasureWhen(MeasureWhen::AutomaticallyAfterSourceComplete),
            DcPowerSetting::ApertureTime(timing.aperture_time),
        ],
    )
    .await?;
    channel.commit().await?;
    debug!(
        resource = channel.resource_name(),
        steps = program.len(),
        "source sequence committed"
    );
    Ok(())
}

/// Program the load's trigger-driven current sequence.
///
/// `trigger_source` is the `(resource, channel)` of the source whose exported
/// lines clock this load.
pub async fn program_load_sequence(
    channel: &dyn DcPowerChannel,
    program: &ChannelProgram,
    voltage_limit_range: f64,
    aperture_time: Duration,
    trigger_source: (&str, &str),
) -> BenchResult<()> {
    let (resource, source_channel) = trigger_source;
    let levels = program.levels();
    let delays = vec![Duration::ZERO; levels.len()];

    apply(
        channel,
        [
            DcPowerSetting::Sense(Sense::Remote),
            DcPowerSetting::SourceMode(SourceMode::Sequence),
            DcPowerSetting::OutputFunction(OutputFunction::DcCurrent),
            DcPowerSetting::CurrentLevelAutorange(true),
            DcPowerSetting::VoltageLimitRange(voltage_limit_range),
        ],
    )
    .await?;
    channel.set_sequence(&levels, &delays).await?;
    apply(
        channel,
        [
            DcPowerSetting::SourceTriggerType(TriggerType::DigitalEdge),
            DcPowerSetting::MeasureTriggerType(TriggerType::DigitalEdge),
            DcPowerSetting::SourceTriggerInput(TriggerTerminal::new(
                resource,
                source_channel,
                TerminalEvent::SourceTrigger,
            )),
            DcPowerSetting::MeasureWhen(MeasureWhen::OnMeasureTrigger),
            DcPowerSetting::ApertureTime(aperture_time),
            DcPowerSetting::MeasureTriggerInput(TriggerTerminal::new(
                resource,
                source_channel,
                TerminalEvent::SourceCompleteEvent,
            )),
        ],
    )
    .await?;
    channel.commit().await?;
    debug!(
        resource = channel.resource_name(),
        steps = program.len(),
        trigger_source = resource,
        "load sequence committed"
    );
    Ok(())
}

// =============================================================================
// Single point, measured on demand
// =============================================================================

/// Program a single-point voltage source measured on demand.
pub async fn configure_source_on_demand(
    channel: &dyn DcPowerChannel,
    voltage: f64,
    current_limit: f64,
    timing: StepTiming,
) -> BenchResult<()> {
    apply(
        channel,
        [
            DcPowerSetting::Sense(Sense::Remote),
            DcPowerSetting::SourceMode(SourceMode::SinglePoint),
            DcPowerSetting::OutputFunction(OutputFunction::DcVoltage),
            DcPowerSetting::VoltageLevel(voltage),
            DcPowerSetting::CurrentLimit(current_limit),
            DcPowerSetting::VoltageLevelAutorange(true),
            DcPowerSetting::CurrentLimitAutorange(true),
            DcPowerSetting::SourceDelay(timing.source_delay),
            DcPowerSetting::ApertureTime(timing.aperture_time),
            DcPowerSetting::MeasureWhen(MeasureWhen::OnDemand),
        ],
    )
    .await?;
    channel.commit().await?;
    Ok(())
}

/// Program a single-point current load measured on demand.
pub async fn configure_load_on_demand(
    channel: &dyn DcPowerChannel,
    current: f64,
    voltage_limit_range: f64,
    timing: StepTiming,
) -> BenchResult<()> {
    apply(
        channel,
        [
            DcPowerSetting::Sense(Sense::Remote),
            DcPowerSetting::SourceMode(SourceMode::SinglePoint),
            DcPowerSetting::OutputFunction(OutputFunction::DcCurrent),
            DcPowerSetting::CurrentLevel(current),
            DcPowerSetting::CurrentLevelAutorange(true),
            DcPowerSetting::VoltageLimitRange(voltage_limit_range),
            DcPowerSetting::SourceDelay(timing.source_delay),
            DcPowerSetting::ApertureTime(timing.aperture_time),
            DcPowerSetting::MeasureWhen(MeasureWhen::OnDemand),
        ],
    )
    .await?;
    channel.commit().await?;
    Ok(())
}

/// Initiate, wait for the level to settle and take one reading.
///
/// The channel is aborted afterwards whether or not the reading succeeded;
/// the output stays at the programmed level.
pub async fn measure_on_demand(channel: &dyn DcPowerChannel) -> BenchResult<MeasurementSample> {
    channel.initiate().await?;
    let reading = read_once(channel).await;
    let aborted = channel.abort().await;
    let sample = reading?;
    aborted?;
    Ok(sample)
}

async fn read_once(channel: &dyn DcPowerChannel) -> BenchResult<MeasurementSample> {
    channel
        .wait_for_event(DcPowerEvent::SourceComplete, SOURCE_COMPLETE_TIMEOUT)
        .await?;
    channel
        .measure_multiple()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| {
            BenchError::Processing(format!(
                "'{}' returned no measurement",
                channel.resource_name()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulated::Call;
    use crate::hardware::{InstrumentDriver, SimulatedBench};

    const BUDGET: PowerBudget = PowerBudget {
        current_limit: 25.0,
        power_ceiling: 300.0,
    };

    #[test]
    fn cartesian_expansion_is_outer_major() {
        let program = SweepProgram::cartesian(&[6.0, 20.0], &[0.1, 1.0, 2.0], BUDGET, 5.0).unwrap();
        assert_eq!(program.len(), 6);
        assert_eq!(program.source.levels(), vec![6.0, 6.0, 6.0, 20.0, 20.0, 20.0]);
        assert_eq!(program.load.levels(), vec![0.1, 1.0, 2.0, 0.1, 1.0, 2.0]);
        // 20 V * 25 A exceeds 300 W.
        assert_eq!(program.source.steps()[3].limit, 15.0);
        assert_eq!(program.source.steps()[0].limit, 25.0);
        assert!(program.load.steps().iter().all(|step| step.limit == 5.0));
    }

    #[test]
    fn empty_sweep_is_rejected() {
        assert!(matches!(
            SweepProgram::cartesian(&[], &[1.0], BUDGET, 5.0),
            Err(BenchError::Validation(_))
        ));
        assert!(matches!(
            SweepProgram::cartesian(&[6.0], &[], BUDGET, 5.0),
            Err(BenchError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn load_listens_on_source_terminals() {
        let bench = SimulatedBench::new();
        let load = bench.open_dcpower("E-load", "0").await.unwrap();
        let program = ChannelProgram::new(vec![Setpoint {
            level: 1.0,
            limit: 5.0,
        }]);
        program_load_sequence(
            load.as_ref(),
            &program,
            5.0,
            Duration::from_millis(5),
            ("PPS", "0"),
        )
        .await
        .unwrap();

        let snapshot = bench.channel("E-load", "0").unwrap();
        assert_eq!(
            snapshot.source_trigger_input.unwrap().as_str(),
            "/PPS/Engine0/SourceTrigger"
        );
        assert_eq!(
            snapshot.measure_trigger_input.unwrap().as_str(),
            "/PPS/Engine0/SourceCompleteEvent"
        );
        assert_eq!(snapshot.measure_when, MeasureWhen::OnMeasureTrigger);
        assert_eq!(snapshot.sequence, vec![1.0]);
    }

    #[tokio::test]
    async fn source_program_writes_one_step_per_setpoint() {
        let bench = SimulatedBench::new();
        let source = bench.open_dcpower("PPS", "0").await.unwrap();
        let program = SweepProgram::cartesian(&[6.0, 20.0], &[0.1, 1.0], BUDGET, 5.0).unwrap();
        let timing = StepTiming {
            source_delay: Duration::from_millis(5),
            aperture_time: Duration::from_millis(5),
        };
        program_source_sequence(source.as_ref(), &program.source, timing)
            .await
            .unwrap();

        let snapshot = bench.channel("PPS", "0").unwrap();
        assert_eq!(
            snapshot.advanced_steps,
            vec![
                (Some(6.0), Some(25.0)),
                (Some(6.0), Some(25.0)),
                (Some(20.0), Some(15.0)),
                (Some(20.0), Some(15.0)),
            ]
        );
        assert_eq!(
            snapshot.measure_when,
            MeasureWhen::AutomaticallyAfterSourceComplete
        );
        assert_eq!(
            bench
                .calls("PPS")
                .iter()
                .filter(|call| **call == Call::CreateAdvancedSequenceStep)
                .count(),
            4
        );
    }

    #[tokio::test]
    async fn energized_source_stays_on_after_abort() {
        let bench = SimulatedBench::new();
        let source = bench.open_dcpower("PPS", "0").await.unwrap();
        energize_source(source.as_ref(), 12.0, BUDGET, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(bench.channel("PPS", "0").unwrap().applied, Some(12.0));
        assert_eq!(bench.calls("PPS").last(), Some(&Call::Abort));
    }

    #[tokio::test]
    async fn on_demand_reading_aborts_afterwards() {
        let bench = SimulatedBench::new();
        let source = bench.open_dcpower("PPS", "0").await.unwrap();
        let timing = StepTiming {
            source_delay: Duration::from_secs(1),
            aperture_time: Duration::from_millis(5),
        };
        configure_source_on_demand(source.as_ref(), 10.0, 15.0, timing)
            .await
            .unwrap();
        let sample = measure_on_demand(source.as_ref()).await.unwrap();
        assert_eq!(sample.voltage, 10.0);
        assert_eq!(bench.calls("PPS").last(), Some(&Call::Abort));
    }
}

//! Synchronized sweep engine shared by the sweep-based tests.
//!
//! Pre-energizes both instruments at the first setpoint, programs the source
//! and load sequences, runs the trigger protocol and hands back a
//! [`SweepStream`] that drains the sweep step by step.

use super::dut_power::open_pair;
use super::supervisor::finish;
use super::ChannelAddress;
use crate::error::{BenchError, BenchResult};
use crate::hardware::capabilities::{DcPowerChannel, InstrumentDriver};
use crate::measurement::configurator::{
    energize_load, energize_source, program_load_sequence, program_source_sequence, PowerBudget,
    StepTiming, SweepProgram,
};
use crate::measurement::protocol::SynchronizedSweep;
use crate::measurement::stream::SweepStream;
use std::time::Duration;
use tracing::info;

/// Everything needed to run one synchronized sweep.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    /// Source channel (timing master).
    pub source: ChannelAddress,
    /// Load channel (trigger consumer).
    pub load: ChannelAddress,
    /// Expanded per-step programs.
    pub program: SweepProgram,
    /// Source current and power limits.
    pub budget: PowerBudget,
    /// Load voltage limit range in volts.
    pub load_voltage_limit_range: f64,
    /// Settling time used while pre-energizing.
    pub dut_setup_time: Duration,
    /// Per-step source delay and aperture.
    pub timing: StepTiming,
    /// Bound on the wait for the load's end of sequence.
    pub sequence_timeout: Duration,
    /// Bound on each per-step fetch.
    pub fetch_timeout: Duration,
    /// Reference for deviation.
    pub nominal_voltage: f64,
}

/// Run `plan` up to `Synchronized` and return the stream that drains it.
///
/// Any failure after the sessions are opened releases them before the error
/// is returned.
pub async fn start_sweep(driver: &dyn InstrumentDriver, plan: &SweepPlan) -> BenchResult<SweepStream> {
    let (first_voltage, first_current) = match (
        plan.program.source.steps().first(),
        plan.program.load.steps().first(),
    ) {
        (Some(source), Some(load)) => (source.level, load.level),
        _ => {
            return Err(BenchError::Validation(
                "sweep program has no steps".into(),
            ))
        }
    };

    info!(
        source = %plan.source,
        load = %plan.load,
        steps = plan.program.len(),
        outer = plan.program.outer_points,
        inner = plan.program.inner_points,
        "starting synchronized sweep"
    );

    let (source, load) = open_pair(driver, &plan.source, &plan.load).await?;
    let outcome = async {
        let source = source.session()?;
        let load = load.session()?;
        prepare(source, load, plan, first_voltage, first_current).await
    }
    .await;
    if let Err(err) = outcome {
        return finish(vec![source, load], Err(err)).await;
    }

    let mut sweep = SynchronizedSweep::new(source, load, plan.program.len(), plan.fetch_timeout);
    sweep.run(plan.sequence_timeout).await?;
    Ok(SweepStream::new(sweep, plan.nominal_voltage))
}

async fn prepare(
    source: &dyn DcPowerChannel,
    load: &dyn DcPowerChannel,
    plan: &SweepPlan,
    first_voltage: f64,
    first_current: f64,
) -> BenchResult<()> {
    energize_source(source, first_voltage, plan.budget, plan.dut_setup_time).await?;
    energize_load(
        load,
        first_current,
        plan.load_voltage_limit_range,
        plan.dut_setup_time,
    )
    .await?;
    program_source_sequence(source, &plan.program.source, plan.timing).await?;
    program_load_sequence(
        load,
        &plan.program.load,
        plan.load_voltage_limit_range,
        plan.timing.aperture_time,
        (source.resource_name(), source.channel_name()),
    )
    .await
}

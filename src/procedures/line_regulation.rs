//! Line regulation: output voltage across a source-voltage sweep at a fixed
//! load current.

use super::engine::{start_sweep, SweepPlan};
use super::{ChannelAddress, Checks, XySeries};
use crate::error::BenchResult;
use crate::hardware::capabilities::InstrumentDriver;
use crate::measurement::configurator::{PowerBudget, StepTiming, SweepProgram};
use crate::measurement::metrics::{mean, DerivedMetrics, StepMetrics};
use crate::measurement::stream::SweepStream;
use crate::sweep::{generate, SweepKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parameters of the line regulation sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineRegulationParams {
    /// Settling time while pre-energizing the DUT.
    #[serde(with = "humantime_serde")]
    pub dut_setup_time: Duration,
    /// Delay between sourcing a step and measuring it.
    #[serde(with = "humantime_serde")]
    pub source_delay: Duration,
    /// Measurement integration window.
    #[serde(with = "humantime_serde")]
    pub aperture_time: Duration,
    /// Expected DUT output voltage.
    pub nominal_output_voltage: f64,
    /// Source channel.
    pub source: ChannelAddress,
    /// Requested source current limit in amps.
    pub source_current_limit: f64,
    /// Spacing of the source voltages.
    pub sweep_type: SweepKind,
    /// Source power ceiling in watts.
    pub source_maximum_power: f64,
    /// First source voltage.
    pub source_start_voltage: f64,
    /// Last source voltage.
    pub source_stop_voltage: f64,
    /// Points (linear) or points per decade (logarithmic).
    pub points: usize,
    /// Load channel.
    pub load: ChannelAddress,
    /// Fixed load current.
    pub load_current_level: f64,
    /// Load voltage limit range in volts.
    pub load_voltage_limit_range: f64,
    /// Bound on the wait for the load's end of sequence.
    #[serde(with = "humantime_serde")]
    pub sequence_timeout: Duration,
}

impl Default for LineRegulationParams {
    fn default() -> Self {
        Self {
            dut_setup_time: Duration::from_secs(1),
            source_delay: Duration::from_millis(5),
            aperture_time: Duration::from_millis(5),
            nominal_output_voltage: 3.3,
            source: ChannelAddress::first("PPS"),
            source_current_limit: 25.0,
            sweep_type: SweepKind::Linear,
            source_maximum_power: 300.0,
            source_start_voltage: 6.0,
            source_stop_voltage: 20.0,
            points: 10,
            load: ChannelAddress::first("E-load"),
            load_current_level: 1.0,
            load_voltage_limit_range: 5.0,
            sequence_timeout: Duration::from_secs(10),
        }
    }
}

impl LineRegulationParams {
    /// Source voltages of the sweep.
    pub fn source_voltages(&self) -> Vec<f64> {
        generate(
            self.sweep_type,
            self.source_start_voltage,
            self.source_stop_voltage,
            self.points,
            true,
        )
    }

    /// Reject values no instrument could be programmed with.
    pub fn validate(&self) -> BenchResult<()> {
        Checks::new("line_regulation")
            .positive_time("dut_setup_time", self.dut_setup_time)
            .positive_time("aperture_time", self.aperture_time)
            .positive_time("sequence_timeout", self.sequence_timeout)
            .channel("source", &self.source)
            .channel("load", &self.load)
            .positive("nominal_output_voltage", self.nominal_output_voltage)
            .positive("source_current_limit", self.source_current_limit)
            .positive("source_maximum_power", self.source_maximum_power)
            .positive("load_voltage_limit_range", self.load_voltage_limit_range)
            .finite("source_start_voltage", self.source_start_voltage)
            .finite("source_stop_voltage", self.source_stop_voltage)
            .finite("load_current_level", self.load_current_level)
            .finish()
    }

    /// Program with one load step per source voltage.
    pub fn plan(&self) -> BenchResult<SweepPlan> {
        self.validate()?;
        let budget = PowerBudget {
            current_limit: self.source_current_limit,
            power_ceiling: self.source_maximum_power,
        };
        let program = SweepProgram::cartesian(
            &self.source_voltages(),
            &[self.load_current_level],
            budget,
            self.load_voltage_limit_range,
        )?;
        Ok(SweepPlan {
            source: self.source.clone(),
            load: self.load.clone(),
            program,
            budget,
            load_voltage_limit_range: self.load_voltage_limit_range,
            dut_setup_time: self.dut_setup_time,
            timing: StepTiming {
                source_delay: self.source_delay,
                aperture_time: self.aperture_time,
            },
            sequence_timeout: self.sequence_timeout,
            fetch_timeout: self.sequence_timeout,
            nominal_voltage: self.nominal_output_voltage,
        })
    }
}

/// Cumulative outputs of the line regulation sweep.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LineRegulationOutputs {
    /// Load voltage against source voltage.
    pub load_voltage_vs_source_voltage: XySeries,
    /// Deviation (percent) against source voltage.
    pub load_voltage_deviation_vs_source_voltage: XySeries,
    /// Mean load voltage so far.
    pub load_voltage: f64,
    /// Mean deviation so far, percent.
    pub load_voltage_deviation: f64,
    /// Summary over the whole sweep, set on the final outputs.
    pub summary: Option<DerivedMetrics>,
    /// Status line.
    pub status: String,
}

impl LineRegulationOutputs {
    /// These outputs extended with one more step.
    #[must_use]
    pub fn with_step(self, step: &StepMetrics) -> Self {
        let source_voltage = step.source.voltage;
        let voltages = self
            .load_voltage_vs_source_voltage
            .with_point(source_voltage, step.load_voltage);
        let deviations = self
            .load_voltage_deviation_vs_source_voltage
            .with_point(source_voltage, step.deviation_pct);
        Self {
            load_voltage: mean(&voltages.y).unwrap_or_default(),
            load_voltage_deviation: mean(&deviations.y).unwrap_or_default(),
            load_voltage_vs_source_voltage: voltages,
            load_voltage_deviation_vs_source_voltage: deviations,
            summary: self.summary,
            status: self.status,
        }
    }

    /// These outputs with the sweep summary.
    #[must_use]
    pub fn with_summary(mut self, summary: Option<DerivedMetrics>) -> Self {
        self.summary = summary;
        self
    }

    /// These outputs with a status line.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }
}

/// Start the line regulation sweep and return its step stream.
pub async fn measure(
    driver: &dyn InstrumentDriver,
    params: &LineRegulationParams,
) -> BenchResult<SweepStream> {
    let plan = params.plan()?;
    start_sweep(driver, &plan).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::MeasurementSample;

    fn step(source_voltage: f64, load_voltage: f64) -> StepMetrics {
        StepMetrics::from_pair(
            MeasurementSample::new(source_voltage, 0.5),
            MeasurementSample::new(load_voltage, -1.0),
            3.3,
        )
        .unwrap()
    }

    #[test]
    fn outputs_track_running_means() {
        let outputs = LineRegulationOutputs::default()
            .with_step(&step(6.0, 3.2))
            .with_step(&step(12.0, 3.4));
        assert_eq!(outputs.load_voltage_vs_source_voltage.x, vec![6.0, 12.0]);
        assert!((outputs.load_voltage - 3.3).abs() < 1e-12);
        assert!(outputs.load_voltage_deviation.abs() < 1e-9);
    }

    #[test]
    fn logarithmic_sweep_ends_at_stop() {
        let params = LineRegulationParams {
            sweep_type: SweepKind::Logarithmic,
            source_start_voltage: 5.0,
            source_stop_voltage: 20.0,
            points: 4,
            ..LineRegulationParams::default()
        };
        let voltages = params.source_voltages();
        assert_eq!(voltages.last(), Some(&20.0));
        assert_eq!(params.plan().unwrap().program.inner_points, 1);
    }
}

//! Efficiency and load regulation.
//!
//! The source sweeps its voltage linearly (outer sweep) while the load
//! sweeps its current (inner sweep, linear or logarithmic) at every source
//! voltage. Each step yields efficiency and output deviation. The
//! single-point variant runs the same engine with one voltage and one
//! current.

use super::engine::{start_sweep, SweepPlan};
use super::{ChannelAddress, Checks};
use crate::error::{BenchError, BenchResult};
use crate::hardware::capabilities::InstrumentDriver;
use crate::measurement::configurator::{PowerBudget, StepTiming, SweepProgram};
use crate::measurement::metrics::{DerivedMetrics, StepMetrics};
use crate::measurement::stream::SweepStream;
use crate::sweep::{generate, SweepKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Parameters
// =============================================================================

/// Parameters of the efficiency and load regulation sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EfficiencyParams {
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
    /// Source power ceiling in watts.
    pub source_maximum_power: f64,
    /// First source voltage.
    pub source_start_voltage: f64,
    /// Last source voltage.
    pub source_stop_voltage: f64,
    /// Number of source voltages.
    pub source_voltage_sweep_points: usize,
    /// Load channel.
    pub load: ChannelAddress,
    /// Load voltage limit range in volts.
    pub load_voltage_limit_range: f64,
    /// `linear` or `logarithmic`, case-insensitive.
    pub load_sweep_type: String,
    /// First load current.
    pub load_start_current: f64,
    /// Last load current.
    pub load_stop_current: f64,
    /// Load points (linear) or points per decade (logarithmic).
    pub load_current_sweep_points: usize,
    /// Bound on the wait for the load's end of sequence.
    #[serde(with = "humantime_serde")]
    pub sequence_timeout: Duration,
}

impl Default for EfficiencyParams {
    fn default() -> Self {
        Self {
            dut_setup_time: Duration::from_secs(1),
            source_delay: Duration::from_millis(5),
            aperture_time: Duration::from_millis(5),
            nominal_output_voltage: 3.3,
            source: ChannelAddress::first("PPS"),
            source_current_limit: 25.0,
            source_maximum_power: 300.0,
            source_start_voltage: 6.0,
            source_stop_voltage: 20.0,
            source_voltage_sweep_points: 4,
            load: ChannelAddress::first("E-load"),
            load_voltage_limit_range: 5.0,
            load_sweep_type: "linear".to_string(),
            load_start_current: 0.1,
            load_stop_current: 24.0,
            load_current_sweep_points: 10,
            sequence_timeout: Duration::from_secs(10),
        }
    }
}

impl EfficiencyParams {
    /// Source voltages, outer sweep.
    pub fn source_voltages(&self) -> Vec<f64> {
        generate(
            SweepKind::Linear,
            self.source_start_voltage,
            self.source_stop_voltage,
            self.source_voltage_sweep_points,
            true,
        )
    }

    /// Load currents, inner sweep. Rejects an unknown sweep type.
    pub fn load_currents(&self) -> BenchResult<Vec<f64>> {
        let kind: SweepKind = self.load_sweep_type.parse()?;
        Ok(generate(
            kind,
            self.load_start_current,
            self.load_stop_current,
            self.load_current_sweep_points,
            true,
        ))
    }

    fn budget(&self) -> PowerBudget {
        PowerBudget {
            current_limit: self.source_current_limit,
            power_ceiling: self.source_maximum_power,
        }
    }

    /// Reject values no instrument could be programmed with.
    pub fn validate(&self) -> BenchResult<()> {
        Checks::new("efficiency")
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
            .finite("load_start_current", self.load_start_current)
            .finite("load_stop_current", self.load_stop_current)
            .finish()
    }

    /// Expanded program, validated before any hardware is touched.
    pub fn plan(&self) -> BenchResult<SweepPlan> {
        self.validate()?;
        let currents = self.load_currents()?;
        let program = SweepProgram::cartesian(
            &self.source_voltages(),
            &currents,
            self.budget(),
            self.load_voltage_limit_range,
        )?;
        Ok(SweepPlan {
            source: self.source.clone(),
            load: self.load.clone(),
            program,
            budget: self.budget(),
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

/// Parameters of the single-point efficiency measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinglePointParams {
    /// Settling time while pre-energizing the DUT.
    #[serde(with = "humantime_serde")]
    pub dut_setup_time: Duration,
    /// Delay between sourcing and measuring.
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
    /// Source power ceiling in watts.
    pub source_maximum_power: f64,
    /// Load channel.
    pub load: ChannelAddress,
    /// Load voltage limit range in volts.
    pub load_voltage_limit_range: f64,
    /// Source voltage.
    pub source_voltage: f64,
    /// Load current.
    pub load_current: f64,
    /// Bound on the wait for the load's measurement.
    #[serde(with = "humantime_serde")]
    pub sequence_timeout: Duration,
}

impl Default for SinglePointParams {
    fn default() -> Self {
        Self {
            dut_setup_time: Duration::from_secs(1),
            source_delay: Duration::from_millis(5),
            aperture_time: Duration::from_millis(5),
            nominal_output_voltage: 3.3,
            source: ChannelAddress::first("PPS"),
            source_current_limit: 25.0,
            source_maximum_power: 300.0,
            load: ChannelAddress::first("E-load"),
            load_voltage_limit_range: 5.0,
            source_voltage: 12.0,
            load_current: 1.0,
            sequence_timeout: Duration::from_secs(10),
        }
    }
}

impl SinglePointParams {
    /// Reject values no instrument could be programmed with.
    pub fn validate(&self) -> BenchResult<()> {
        Checks::new("single_point_efficiency")
            .positive_time("dut_setup_time", self.dut_setup_time)
            .positive_time("aperture_time", self.aperture_time)
            .positive_time("sequence_timeout", self.sequence_timeout)
            .channel("source", &self.source)
            .channel("load", &self.load)
            .positive("nominal_output_voltage", self.nominal_output_voltage)
            .positive("source_current_limit", self.source_current_limit)
            .positive("source_maximum_power", self.source_maximum_power)
            .positive("load_voltage_limit_range", self.load_voltage_limit_range)
            .positive("source_voltage", self.source_voltage)
            .finite("load_current", self.load_current)
            .finish()
    }

    /// One-step program.
    pub fn plan(&self) -> BenchResult<SweepPlan> {
        self.validate()?;
        let budget = PowerBudget {
            current_limit: self.source_current_limit,
            power_ceiling: self.source_maximum_power,
        };
        let program = SweepProgram::cartesian(
            &[self.source_voltage],
            &[self.load_current],
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

// =============================================================================
// Outputs
// =============================================================================

/// Cumulative outputs of the efficiency sweep.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EfficiencyOutputs {
    /// Status line.
    pub status: String,
    /// Source voltages of the outer sweep.
    pub voltage_values: Vec<f64>,
    /// Number of source voltages.
    pub source_sweep_points: usize,
    /// Number of load currents per source voltage.
    pub load_sweep_points: usize,
    /// Absolute load current per step.
    pub load_currents: Vec<f64>,
    /// Efficiency per step, percent.
    pub efficiency: Vec<f64>,
    /// Load voltage per step.
    pub load_voltages: Vec<f64>,
    /// Deviation from nominal per step, percent.
    pub load_voltage_deviation: Vec<f64>,
    /// Summary over the whole sweep, set on the final outputs.
    pub summary: Option<DerivedMetrics>,
}

impl EfficiencyOutputs {
    /// Empty outputs for the sweep described by `plan`.
    pub fn for_plan(plan: &SweepPlan, voltage_values: Vec<f64>) -> Self {
        Self {
            voltage_values,
            source_sweep_points: plan.program.outer_points,
            load_sweep_points: plan.program.inner_points,
            ..Self::default()
        }
    }

    /// These outputs extended with one more step.
    #[must_use]
    pub fn with_step(mut self, step: &StepMetrics) -> Self {
        self.load_currents.push(step.load_current);
        self.load_voltages.push(step.load_voltage);
        self.efficiency.push(step.efficiency_pct);
        self.load_voltage_deviation.push(step.deviation_pct);
        self
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

/// Outputs of the single-point efficiency measurement.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SinglePointOutputs {
    /// Status line.
    pub status: String,
    /// Absolute load current.
    pub load_current: f64,
    /// Efficiency, percent.
    pub efficiency: f64,
    /// Load voltage.
    pub load_voltage: f64,
    /// Deviation from nominal, percent.
    pub load_voltage_deviation: f64,
}

impl SinglePointOutputs {
    /// These outputs with a status line.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }
}

impl From<StepMetrics> for SinglePointOutputs {
    fn from(step: StepMetrics) -> Self {
        Self {
            status: String::new(),
            load_current: step.load_current,
            efficiency: step.efficiency_pct,
            load_voltage: step.load_voltage,
            load_voltage_deviation: step.deviation_pct,
        }
    }
}

// =============================================================================
// Measure
// =============================================================================

/// Start the efficiency sweep and return its step stream.
pub async fn measure(
    driver: &dyn InstrumentDriver,
    params: &EfficiencyParams,
) -> BenchResult<(EfficiencyOutputs, SweepStream)> {
    let plan = params.plan()?;
    let outputs = EfficiencyOutputs::for_plan(&plan, params.source_voltages());
    let stream = start_sweep(driver, &plan).await?;
    Ok((outputs, stream))
}

/// Run the single-point measurement to completion.
pub async fn measure_single_point(
    driver: &dyn InstrumentDriver,
    params: &SinglePointParams,
) -> BenchResult<SinglePointOutputs> {
    let plan = params.plan()?;
    let steps = start_sweep(driver, &plan).await?.collect().await?;
    steps
        .first()
        .map(|progress| SinglePointOutputs::from(progress.metrics))
        .ok_or_else(|| BenchError::Processing("single-point sweep produced no step".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_sweep_type_is_rejected_before_hardware() {
        let params = EfficiencyParams {
            load_sweep_type: "quadratic".into(),
            ..EfficiencyParams::default()
        };
        assert!(matches!(params.plan(), Err(BenchError::Validation(_))));
    }

    #[test]
    fn sweep_type_is_case_insensitive() {
        let params = EfficiencyParams {
            load_sweep_type: "LogaRithmic".into(),
            load_start_current: 1.0,
            load_stop_current: 10.0,
            load_current_sweep_points: 2,
            ..EfficiencyParams::default()
        };
        let plan = params.plan().unwrap();
        assert_eq!(plan.program.inner_points, 2);
        assert_eq!(plan.program.len(), 8);
    }

    #[test]
    fn default_plan_is_four_by_ten() {
        let plan = EfficiencyParams::default().plan().unwrap();
        assert_eq!(plan.program.outer_points, 4);
        assert_eq!(plan.program.inner_points, 10);
        assert_eq!(plan.program.len(), 40);
    }

    #[test]
    fn params_deserialize_with_defaults() {
        let params: EfficiencyParams = serde_json::from_str(
            r#"{"source_stop_voltage": 12.0, "dut_setup_time": "250ms"}"#,
        )
        .unwrap();
        assert_eq!(params.source_stop_voltage, 12.0);
        assert_eq!(params.dut_setup_time, Duration::from_millis(250));
        assert_eq!(params.load, ChannelAddress::first("E-load"));
    }
}

//! Load transient response.
//!
//! The source holds a fixed voltage with custom loop compensation. The load
//! steps `sp1 -> sp2 -> sp1`, dwelling `level_dwell_time` at each level while
//! recording voltage and current at `sample_rate`.

use super::dut_power::open_pair;
use super::supervisor::finish;
use super::{ChannelAddress, Checks, XySeries};
use crate::error::{BenchError, BenchResult};
use crate::hardware::capabilities::{
    DcPowerChannel, DcPowerEvent, DcPowerSetting, InstrumentDriver, MeasureWhen,
    MeasurementSample, OutputFunction, Sense, SourceMode, TransientResponse,
};
use crate::measurement::configurator::apply;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Fixed current level range of the load in amps.
const LOAD_CURRENT_RANGE: f64 = 40.0;

/// Parameters of the load transient capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadTransientParams {
    /// Settling time before the first load level.
    #[serde(with = "humantime_serde")]
    pub dut_setup_time: Duration,
    /// Time spent at each load level.
    #[serde(with = "humantime_serde")]
    pub level_dwell_time: Duration,
    /// Expected DUT output voltage.
    pub nominal_output_voltage: f64,
    /// Source channel.
    pub source: ChannelAddress,
    /// Source voltage.
    pub source_voltage_level: f64,
    /// Source current limit.
    pub source_current_limit: f64,
    /// Source voltage loop gain bandwidth in hertz.
    pub voltage_gain_bandwidth: f64,
    /// Source voltage loop compensation frequency in hertz.
    pub voltage_compensation_frequency: f64,
    /// Source voltage loop pole-zero ratio.
    pub voltage_pole_zero_ratio: f64,
    /// Load channel.
    pub load: ChannelAddress,
    /// Load voltage limit range.
    pub load_voltage_limit_range: f64,
    /// Load sample rate in hertz.
    pub sample_rate: f64,
    /// Load current before and after the step.
    pub load_current_set_point_1: f64,
    /// Load current during the step.
    pub load_current_set_point_2: f64,
    /// Load current loop gain bandwidth in hertz.
    pub current_gain_bandwidth: f64,
    /// Load current loop compensation frequency in hertz.
    pub current_compensation_frequency: f64,
    /// Load current loop pole-zero ratio.
    pub current_pole_zero_ratio: f64,
    /// Bound on the sequence wait and the record fetch.
    #[serde(with = "humantime_serde")]
    pub sequence_timeout: Duration,
}

impl Default for LoadTransientParams {
    fn default() -> Self {
        Self {
            dut_setup_time: Duration::from_millis(50),
            level_dwell_time: Duration::from_millis(1),
            nominal_output_voltage: 3.3,
            source: ChannelAddress::first("PPS"),
            source_voltage_level: 12.0,
            source_current_limit: 25.0,
            voltage_gain_bandwidth: 2000.0,
            voltage_compensation_frequency: 3530.0,
            voltage_pole_zero_ratio: 2.0,
            load: ChannelAddress::first("E-load"),
            load_voltage_limit_range: 6.0,
            sample_rate: 1.8e6,
            load_current_set_point_1: 4.0,
            load_current_set_point_2: 14.0,
            current_gain_bandwidth: 14e3,
            current_compensation_frequency: 180e3,
            current_pole_zero_ratio: 0.3,
            sequence_timeout: Duration::from_secs(10),
        }
    }
}

impl LoadTransientParams {
    /// Reject values no instrument could be programmed with.
    pub fn validate(&self) -> BenchResult<()> {
        let mut checks = Checks::new("load_transient");
        checks
            .positive_time("dut_setup_time", self.dut_setup_time)
            .positive_time("level_dwell_time", self.level_dwell_time)
            .positive_time("sequence_timeout", self.sequence_timeout)
            .channel("source", &self.source)
            .channel("load", &self.load)
            .positive("nominal_output_voltage", self.nominal_output_voltage)
            .positive("source_voltage_level", self.source_voltage_level)
            .positive("source_current_limit", self.source_current_limit)
            .positive("load_voltage_limit_range", self.load_voltage_limit_range)
            .positive("sample_rate", self.sample_rate)
            .finite("load_current_set_point_1", self.load_current_set_point_1)
            .finite("load_current_set_point_2", self.load_current_set_point_2);
        if self.sample_rate.is_finite() && self.sample_rate > 0.0 {
            checks.require(
                self.record_length() > 0,
                format!(
                    "sample_rate {} Hz records no sample in level_dwell_time {:?}",
                    self.sample_rate, self.level_dwell_time
                ),
            );
        }
        checks.finish()
    }

    /// Load aperture, one sample period.
    pub fn aperture_time(&self) -> BenchResult<Duration> {
        Duration::try_from_secs_f64(1.0 / self.sample_rate).map_err(|err| {
            BenchError::Validation(format!("sample_rate {} Hz: {}", self.sample_rate, err))
        })
    }

    /// Samples recorded at each load level.
    pub fn record_length(&self) -> usize {
        (self.sample_rate * self.level_dwell_time.as_secs_f64()) as usize
    }

    /// Load current levels in order.
    pub fn levels(&self) -> [f64; 3] {
        [
            self.load_current_set_point_1,
            self.load_current_set_point_2,
            self.load_current_set_point_1,
        ]
    }

    fn source_settings(&self) -> Vec<DcPowerSetting> {
        vec![
            DcPowerSetting::Sense(Sense::Remote),
            DcPowerSetting::SourceMode(SourceMode::SinglePoint),
            DcPowerSetting::OutputFunction(OutputFunction::DcVoltage),
            DcPowerSetting::VoltageLevel(self.source_voltage_level),
            DcPowerSetting::CurrentLimit(self.source_current_limit),
            DcPowerSetting::VoltageLevelAutorange(true),
            DcPowerSetting::CurrentLimitAutorange(true),
            DcPowerSetting::SourceDelay(self.dut_setup_time),
            DcPowerSetting::MeasureWhen(MeasureWhen::AutomaticallyAfterSourceComplete),
            DcPowerSetting::TransientResponse(TransientResponse::Custom),
            DcPowerSetting::VoltageGainBandwidth(self.voltage_gain_bandwidth),
            DcPowerSetting::VoltageCompensationFrequency(self.voltage_compensation_frequency),
            DcPowerSetting::VoltagePoleZeroRatio(self.voltage_pole_zero_ratio),
        ]
    }

    fn load_settings(&self) -> BenchResult<Vec<DcPowerSetting>> {
        Ok(vec![
            DcPowerSetting::Sense(Sense::Remote),
            DcPowerSetting::CurrentLevel(self.load_current_set_point_1),
            DcPowerSetting::VoltageLimitRange(self.load_voltage_limit_range),
            DcPowerSetting::CurrentLevelAutorange(false),
            DcPowerSetting::SourceDelay(self.dut_setup_time),
            DcPowerSetting::CurrentLevelRange(LOAD_CURRENT_RANGE),
            DcPowerSetting::SourceMode(SourceMode::Sequence),
            DcPowerSetting::OutputFunction(OutputFunction::DcCurrent),
            DcPowerSetting::ApertureTime(self.aperture_time()?),
            DcPowerSetting::MeasureRecordLength(self.record_length()),
            DcPowerSetting::MeasureWhen(MeasureWhen::AutomaticallyAfterSourceComplete),
            DcPowerSetting::TransientResponse(TransientResponse::Custom),
            DcPowerSetting::CurrentGainBandwidth(self.current_gain_bandwidth),
            DcPowerSetting::CurrentCompensationFrequency(self.current_compensation_frequency),
            DcPowerSetting::CurrentPoleZeroRatio(self.current_pole_zero_ratio),
        ])
    }
}

/// Outputs of the load transient capture.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LoadTransientOutputs {
    /// Load voltage against time.
    pub load_voltage_graph: XySeries,
    /// Load current against time.
    pub load_current_graph: XySeries,
    /// Status line.
    pub status: String,
}

impl LoadTransientOutputs {
    /// Split a record into voltage and current graphs sampled every `dt`.
    pub fn from_record(samples: &[MeasurementSample], dt: Duration) -> Self {
        let dt = dt.as_secs_f64();
        let voltages = samples.iter().map(|s| s.voltage).collect();
        let currents = samples.iter().map(|s| s.current).collect();
        Self {
            load_voltage_graph: XySeries::uniform(voltages, 0, dt),
            load_current_graph: XySeries::uniform(currents, 0, dt),
            status: String::new(),
        }
    }

    /// These outputs with a status line.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }
}

/// Capture the load step response.
pub async fn measure(
    driver: &dyn InstrumentDriver,
    params: &LoadTransientParams,
) -> BenchResult<LoadTransientOutputs> {
    params.validate()?;
    let (source, load) = open_pair(driver, &params.source, &params.load).await?;
    let outcome = async {
        let source = source.session()?;
        let load = load.session()?;
        capture(source, load, params).await
    }
    .await;
    finish(vec![source, load], outcome).await
}

async fn capture(
    source: &dyn DcPowerChannel,
    load: &dyn DcPowerChannel,
    params: &LoadTransientParams,
) -> BenchResult<LoadTransientOutputs> {
    apply(source, params.source_settings()).await?;
    source.commit().await?;
    source.initiate().await?;

    apply(load, params.load_settings()?).await?;
    let levels = params.levels();
    load.set_sequence(
        &levels,
        &[params.dut_setup_time, Duration::ZERO, Duration::ZERO],
    )
    .await?;
    load.commit().await?;
    let dt = load.measure_record_delta_time().await?;

    let total = params.record_length() * levels.len();
    debug!(samples = total, ?dt, "capturing load transient");
    load.initiate().await?;
    load.wait_for_event(DcPowerEvent::SequenceEngineDone, params.sequence_timeout)
        .await?;
    let samples = load.fetch_multiple(total, params.sequence_timeout).await?;
    Ok(LoadTransientOutputs::from_record(&samples, dt))
}

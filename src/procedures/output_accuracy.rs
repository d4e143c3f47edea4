//! Output voltage accuracy: mean of a finite load voltage record against the
//! nominal output.

use super::dut_power::open_guarded;
use super::supervisor::{finish, DcPowerGuard};
use super::{ChannelAddress, Checks, XySeries};
use crate::error::{BenchError, BenchResult};
use crate::hardware::capabilities::{
    DcPowerChannel, DcPowerSetting, InstrumentDriver, MeasureWhen,
};
use crate::measurement::configurator::{
    apply, configure_load_on_demand, configure_source_on_demand, measure_on_demand, StepTiming,
};
use crate::measurement::metrics::mean;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Largest record the load is asked to buffer.
const MAX_RECORD_LENGTH: usize = 10_000_000;

/// Parameters of the output voltage accuracy measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputAccuracyParams {
    /// Settling time before each reading.
    #[serde(with = "humantime_serde")]
    pub dut_setup_time: Duration,
    /// Integration window of each record sample.
    #[serde(with = "humantime_serde")]
    pub aperture_time: Duration,
    /// Expected DUT output voltage.
    pub nominal_output_voltage: f64,
    /// Source channel.
    pub source: ChannelAddress,
    /// Source voltage.
    pub source_voltage_level: f64,
    /// Source current limit.
    pub source_current_limit: f64,
    /// Load channel.
    pub load: ChannelAddress,
    /// Load current.
    pub load_current_level: f64,
    /// Load voltage limit range.
    pub load_voltage_limit: f64,
    /// Length of the record in seconds.
    pub measurement_duration: f64,
    /// Bound on each record fetch.
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
}

impl Default for OutputAccuracyParams {
    fn default() -> Self {
        Self {
            dut_setup_time: Duration::from_secs(1),
            aperture_time: Duration::from_millis(1),
            nominal_output_voltage: 3.3,
            source: ChannelAddress::first("PPS"),
            source_voltage_level: 6.0,
            source_current_limit: 25.0,
            load: ChannelAddress::first("E-load"),
            load_current_level: 1.0,
            load_voltage_limit: 6.0,
            measurement_duration: 1.0,
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

impl OutputAccuracyParams {
    /// Reject values no instrument could be programmed with.
    pub fn validate(&self) -> BenchResult<()> {
        let mut checks = Checks::new("output_accuracy");
        checks
            .positive_time("dut_setup_time", self.dut_setup_time)
            .positive_time("aperture_time", self.aperture_time)
            .positive_time("fetch_timeout", self.fetch_timeout)
            .channel("source", &self.source)
            .channel("load", &self.load)
            .positive("nominal_output_voltage", self.nominal_output_voltage)
            .positive("source_voltage_level", self.source_voltage_level)
            .positive("source_current_limit", self.source_current_limit)
            .positive("load_voltage_limit", self.load_voltage_limit)
            .finite("load_current_level", self.load_current_level)
            .positive("measurement_duration", self.measurement_duration);
        if !self.aperture_time.is_zero() && self.measurement_duration.is_finite() {
            checks.require(
                self.record_length() <= MAX_RECORD_LENGTH,
                format!(
                    "measurement_duration {} s at aperture_time {:?} exceeds {} samples",
                    self.measurement_duration, self.aperture_time, MAX_RECORD_LENGTH
                ),
            );
        }
        checks.finish()
    }

    /// Samples in the record: one per aperture plus the closing sample.
    pub fn record_length(&self) -> usize {
        ((self.measurement_duration / self.aperture_time.as_secs_f64()) as usize).saturating_add(1)
    }
}

/// Outputs of the output voltage accuracy measurement.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OutputAccuracyOutputs {
    /// Load voltage against time.
    pub load_voltage_vs_time: XySeries,
    /// Mean output voltage.
    pub output_voltage: f64,
    /// Absolute error from nominal, volts.
    pub output_voltage_error: f64,
    /// Absolute error from nominal, percent.
    pub output_voltage_accuracy: f64,
    /// Status line.
    pub status: String,
}

impl OutputAccuracyOutputs {
    /// Reduce a voltage record taken over `duration` seconds.
    ///
    /// Sample `i` (1-based) sits at `i * duration / len`.
    pub fn from_record(voltages: Vec<f64>, duration: f64, nominal: f64) -> BenchResult<Self> {
        let output_voltage = mean(&voltages)
            .ok_or_else(|| BenchError::Processing("voltage record is empty".into()))?;
        let dt = duration / voltages.len() as f64;
        let x = (1..=voltages.len()).map(|i| i as f64 * dt).collect();
        let error = (output_voltage - nominal).abs();
        Ok(Self {
            load_voltage_vs_time: XySeries::new(x, voltages),
            output_voltage,
            output_voltage_error: error,
            output_voltage_accuracy: error / nominal * 100.0,
            status: String::new(),
        })
    }

    /// These outputs with a status line.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }
}

/// Energize source and load, record the load voltage and reduce it.
pub async fn measure(
    driver: &dyn InstrumentDriver,
    params: &OutputAccuracyParams,
) -> BenchResult<OutputAccuracyOutputs> {
    params.validate()?;
    let timing = StepTiming {
        source_delay: params.dut_setup_time,
        aperture_time: params.aperture_time,
    };

    let source = open_guarded(driver, "source", &params.source).await?;
    let energized = async {
        let channel = source.session()?;
        configure_source_on_demand(
            channel,
            params.source_voltage_level,
            params.source_current_limit,
            timing,
        )
        .await?;
        measure_on_demand(channel).await
    }
    .await;
    if let Err(err) = energized {
        return finish(vec![source], Err(err)).await;
    }

    let load = match open_guarded(driver, "load", &params.load).await {
        Ok(guard) => guard,
        Err(err) => return finish(vec![source], Err(err)).await,
    };
    let outcome = async {
        let channel = load.session()?;
        configure_load_on_demand(
            channel,
            params.load_current_level,
            params.load_voltage_limit,
            timing,
        )
        .await?;
        measure_on_demand(channel).await?;
        let voltages = record_voltage(channel, params.record_length(), params.fetch_timeout).await?;
        OutputAccuracyOutputs::from_record(
            voltages,
            params.measurement_duration,
            params.nominal_output_voltage,
        )
    }
    .await;

    let guards: Vec<DcPowerGuard> = vec![load, source];
    finish(guards, outcome).await
}

/// Acquire a finite record of `length` samples, draining the backlog as it
/// fills.
async fn record_voltage(
    channel: &dyn DcPowerChannel,
    length: usize,
    timeout: Duration,
) -> BenchResult<Vec<f64>> {
    apply(
        channel,
        [
            DcPowerSetting::MeasureRecordLength(length),
            DcPowerSetting::MeasureRecordLengthIsFinite(true),
            DcPowerSetting::MeasureWhen(MeasureWhen::AutomaticallyAfterSourceComplete),
        ],
    )
    .await?;
    channel.commit().await?;
    channel.initiate().await?;

    let mut voltages = Vec::with_capacity(length);
    let acquired = async {
        while voltages.len() < length {
            let backlog = channel.fetch_backlog().await?;
            let count = if backlog == 0 {
                length - voltages.len()
            } else {
                backlog.min(length - voltages.len())
            };
            let samples = channel.fetch_multiple(count, timeout).await?;
            voltages.extend(samples.iter().map(|sample| sample.voltage));
            debug!(acquired = voltages.len(), length, "record fetch");
        }
        Ok::<(), BenchError>(())
    }
    .await;
    let aborted = channel.abort().await;
    acquired?;
    aborted?;
    Ok(voltages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_length_includes_closing_sample() {
        assert_eq!(OutputAccuracyParams::default().record_length(), 1001);
    }

    #[test]
    fn zero_aperture_is_rejected() {
        let params = OutputAccuracyParams {
            aperture_time: Duration::ZERO,
            ..OutputAccuracyParams::default()
        };
        assert_eq!(params.record_length(), usize::MAX);
        let err = params.validate().unwrap_err().to_string();
        assert!(err.contains("[output_accuracy]"), "{}", err);
        assert!(err.contains("aperture_time"), "{}", err);
    }

    #[test]
    fn oversized_record_is_rejected() {
        let params = OutputAccuracyParams {
            aperture_time: Duration::from_nanos(1),
            measurement_duration: 60.0,
            ..OutputAccuracyParams::default()
        };
        assert!(matches!(params.validate(), Err(BenchError::Validation(_))));
        assert!(OutputAccuracyParams::default().validate().is_ok());
    }

    #[test]
    fn accuracy_from_record() {
        let outputs = OutputAccuracyOutputs::from_record(vec![3.2, 3.4, 3.27, 3.33], 1.0, 3.3)
            .unwrap();
        assert!((outputs.output_voltage - 3.3).abs() < 1e-12);
        assert!(outputs.output_voltage_accuracy < 1e-9);
        assert_eq!(outputs.load_voltage_vs_time.x, vec![0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn empty_record_is_a_processing_error() {
        assert!(matches!(
            OutputAccuracyOutputs::from_record(Vec::new(), 1.0, 3.3),
            Err(BenchError::Processing(_))
        ));
    }
}

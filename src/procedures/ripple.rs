//! Output ripple.
//!
//! Source and load are energized at fixed levels and read once each, then an
//! oscilloscope captures the AC component of the output in one-second
//! windows until the acquisition time is used up.

use super::dut_power::open_guarded;
use super::supervisor::{finish, DcPowerGuard, SessionGuard};
use super::{ChannelAddress, Checks, XySeries};
use crate::error::BenchResult;
use crate::hardware::capabilities::{
    Coupling, EdgeTrigger, HorizontalTiming, InstrumentDriver, MeasurementSample, ScopeChannel,
    Slope, VerticalConfig,
};
use crate::measurement::configurator::{
    configure_load_on_demand, configure_source_on_demand, measure_on_demand, StepTiming,
};
use crate::measurement::stream::{RippleStream, RippleWindow};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Scope input impedance in ohms.
const INPUT_IMPEDANCE: f64 = 1.0e6;

/// Scope vertical range in volts.
const VERTICAL_RANGE: f64 = 5.0;

/// Parameters of the ripple capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RippleParams {
    /// Settling time before each supply reading.
    #[serde(with = "humantime_serde")]
    pub dut_setup_time: Duration,
    /// Measurement integration window.
    #[serde(with = "humantime_serde")]
    pub aperture_time: Duration,
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
    pub load_voltage_limit_range: f64,
    /// Scope channel probing the DUT output.
    pub scope: ChannelAddress,
    /// Minimum scope sample rate in hertz.
    pub scope_sample_rate: f64,
    /// Total acquisition time in seconds.
    pub scope_acquisition_time: f64,
    /// Probe attenuation factor.
    pub scope_probe_attenuation: f64,
}

impl Default for RippleParams {
    fn default() -> Self {
        Self {
            dut_setup_time: Duration::from_secs(1),
            aperture_time: Duration::from_millis(5),
            source: ChannelAddress::first("PPS"),
            source_voltage_level: 10.0,
            source_current_limit: 15.0,
            load: ChannelAddress::first("E-load"),
            load_current_level: 1.0,
            load_voltage_limit_range: 6.0,
            scope: ChannelAddress::first("Scope"),
            scope_sample_rate: 10_000.0,
            scope_acquisition_time: 3.0,
            scope_probe_attenuation: 1.0,
        }
    }
}

impl RippleParams {
    /// Reject values no instrument could be programmed with.
    pub fn validate(&self) -> BenchResult<()> {
        Checks::new("ripple")
            .positive_time("dut_setup_time", self.dut_setup_time)
            .positive_time("aperture_time", self.aperture_time)
            .channel("source", &self.source)
            .channel("load", &self.load)
            .channel("scope", &self.scope)
            .positive("source_voltage_level", self.source_voltage_level)
            .positive("source_current_limit", self.source_current_limit)
            .positive("load_voltage_limit_range", self.load_voltage_limit_range)
            .finite("load_current_level", self.load_current_level)
            .positive("scope_sample_rate", self.scope_sample_rate)
            .positive("scope_acquisition_time", self.scope_acquisition_time)
            .positive("scope_probe_attenuation", self.scope_probe_attenuation)
            .finish()
    }

    fn timing(&self) -> StepTiming {
        StepTiming {
            source_delay: self.dut_setup_time,
            aperture_time: self.aperture_time,
        }
    }

    fn vertical(&self) -> VerticalConfig {
        VerticalConfig {
            range: VERTICAL_RANGE,
            offset: 0.0,
            probe_attenuation: self.scope_probe_attenuation,
            coupling: Coupling::Ac,
            input_impedance: INPUT_IMPEDANCE,
            max_input_frequency: None,
        }
    }

    fn trigger(&self) -> EdgeTrigger {
        EdgeTrigger {
            source: self.scope.channel.clone(),
            level: 0.0,
            coupling: Coupling::Dc,
            slope: Slope::Positive,
            auto_trigger: true,
        }
    }

    fn horizontal(&self) -> HorizontalTiming {
        HorizontalTiming {
            min_sample_rate: self.scope_sample_rate,
            min_num_points: (self.scope_sample_rate * self.scope_acquisition_time) as usize,
            reference_position: 0.0,
            num_records: 1,
            enforce_realtime: true,
        }
    }
}

/// Cumulative outputs of the ripple capture.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RippleOutputs {
    /// Source voltage read before the capture.
    pub supply_voltage: f64,
    /// Source current read before the capture.
    pub supply_current: f64,
    /// Load voltage read before the capture.
    pub load_voltage: f64,
    /// Load current read before the capture.
    pub load_current: f64,
    /// RMS of every window so far.
    pub ripple_voltage_rms: f64,
    /// Peak-to-peak of every window so far.
    pub ripple_voltage_peak_to_peak: f64,
    /// Ripple waveform so far.
    pub ripple_graph: XySeries,
    /// Status line.
    pub status: String,
}

impl RippleOutputs {
    /// Outputs holding the supply readings.
    pub fn new(supply: MeasurementSample, load: MeasurementSample) -> Self {
        Self {
            supply_voltage: supply.voltage,
            supply_current: supply.current,
            load_voltage: load.voltage,
            load_current: load.current,
            ..Self::default()
        }
    }

    /// These outputs extended with one more window.
    #[must_use]
    pub fn with_window(self, window: RippleWindow) -> Self {
        Self {
            ripple_voltage_rms: window.stats.rms(),
            ripple_voltage_peak_to_peak: window.stats.peak_to_peak(),
            ripple_graph: self
                .ripple_graph
                .concat(XySeries::new(window.time, window.voltage)),
            ..self
        }
    }

    /// These outputs with a status line.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }
}

/// Energize and read the supplies, configure the scope and return the
/// window stream.
pub async fn measure(
    driver: &dyn InstrumentDriver,
    params: &RippleParams,
) -> BenchResult<(RippleOutputs, RippleStream)> {
    params.validate()?;
    let timing = params.timing();

    let source = open_guarded(driver, "source", &params.source).await?;
    let supply = async {
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
    let supply = match supply {
        Ok(sample) => sample,
        Err(err) => return finish(vec![source], Err(err)).await,
    };

    let load = match open_guarded(driver, "load", &params.load).await {
        Ok(guard) => guard,
        Err(err) => return finish(vec![source], Err(err)).await,
    };
    let reading = async {
        let channel = load.session()?;
        configure_load_on_demand(
            channel,
            params.load_current_level,
            params.load_voltage_limit_range,
            timing,
        )
        .await?;
        measure_on_demand(channel).await
    }
    .await;
    let supplies: Vec<DcPowerGuard> = vec![source, load];
    let reading = match reading {
        Ok(sample) => sample,
        Err(err) => return finish(supplies, Err(err)).await,
    };
    info!(
        supply_voltage = supply.voltage,
        load_voltage = reading.voltage,
        "supplies energized for ripple capture"
    );

    let scope = match driver
        .open_scope(&params.scope.resource, &params.scope.channel)
        .await
    {
        Ok(session) => SessionGuard::new("scope", session),
        Err(err) => return finish(supplies, Err(err.into())).await,
    };
    let sample_rate = async {
        let channel = scope.session()?;
        configure_scope(channel, params).await
    }
    .await;
    let sample_rate = match sample_rate {
        Ok(rate) => rate,
        Err(err) => {
            scope.recover().await;
            return finish(supplies, Err(err)).await;
        }
    };

    let stream = RippleStream::new(
        scope,
        supplies,
        params.scope_sample_rate,
        1.0 / sample_rate,
        params.scope_acquisition_time,
    );
    Ok((RippleOutputs::new(supply, reading), stream))
}

/// Program vertical, trigger and horizontal settings; returns the actual
/// sample rate.
async fn configure_scope(scope: &dyn ScopeChannel, params: &RippleParams) -> BenchResult<f64> {
    scope.configure_vertical(params.vertical()).await?;
    scope.configure_trigger(params.trigger()).await?;
    scope.configure_horizontal(params.horizontal()).await?;
    Ok(scope.sample_rate().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::metrics::RippleStats;

    #[test]
    fn horizontal_timing_covers_acquisition() {
        let timing = RippleParams::default().horizontal();
        assert_eq!(timing.min_num_points, 30_000);
        assert_eq!(timing.num_records, 1);
        assert!(timing.enforce_realtime);
    }

    #[test]
    fn outputs_accumulate_graph() {
        let first = RippleWindow {
            window: 1,
            time: vec![0.0, 0.1],
            voltage: vec![0.01, -0.01],
            stats: RippleStats::from_samples(&[0.01, -0.01]),
        };
        let outputs = RippleOutputs::default().with_window(first);
        assert_eq!(outputs.ripple_graph.len(), 2);
        assert!((outputs.ripple_voltage_peak_to_peak - 0.02).abs() < 1e-12);
        assert!((outputs.ripple_voltage_rms - 0.01).abs() < 1e-12);
    }
}

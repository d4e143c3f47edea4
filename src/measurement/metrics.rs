//! Figures of merit computed from captured samples.
//!
//! Everything here is a pure function of its inputs. Series are built by
//! returning new values, never by appending to a caller-owned buffer.

use crate::error::{BenchError, BenchResult};
use crate::hardware::capabilities::MeasurementSample;
use serde::{Deserialize, Serialize};

/// Conversion efficiency in percent: `|P_load * 100 / P_source|`.
///
/// A source power of exactly zero is a processing error.
pub fn efficiency(source: &MeasurementSample, load: &MeasurementSample) -> BenchResult<f64> {
    let source_power = source.voltage * source.current;
    if source_power == 0.0 {
        return Err(BenchError::Processing(format!(
            "source power is zero ({} V, {} A), efficiency undefined",
            source.voltage, source.current
        )));
    }
    Ok((load.voltage * load.current * 100.0 / source_power).abs())
}

/// Output deviation from nominal, in percent.
pub fn deviation(load_voltage: f64, nominal_voltage: f64) -> f64 {
    (load_voltage - nominal_voltage) / nominal_voltage * 100.0
}

/// Root mean square of a waveform. `None` for an empty waveform.
pub fn rms(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mean_square = samples.iter().map(|v| v * v).sum::<f64>() / samples.len() as f64;
    Some(mean_square.sqrt())
}

/// Maximum minus minimum of a waveform. `None` for an empty waveform.
pub fn peak_to_peak(samples: &[f64]) -> Option<f64> {
    let (min, max) = min_max(samples)?;
    Some(max - min)
}

fn min_max(samples: &[f64]) -> Option<(f64, f64)> {
    let first = *samples.first()?;
    Some(
        samples
            .iter()
            .fold((first, first), |(lo, hi), v| (lo.min(*v), hi.max(*v))),
    )
}

/// Arithmetic mean. `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

// =============================================================================
// Per-step reduction
// =============================================================================

/// Metrics of one synchronized sweep step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Sample from the source channel.
    pub source: MeasurementSample,
    /// Sample from the load channel.
    pub load: MeasurementSample,
    /// Absolute load current.
    pub load_current: f64,
    /// Load voltage.
    pub load_voltage: f64,
    /// Efficiency in percent.
    pub efficiency_pct: f64,
    /// Deviation from nominal in percent.
    pub deviation_pct: f64,
}

impl StepMetrics {
    /// Reduce one source/load pair captured at the same step.
    pub fn from_pair(
        source: MeasurementSample,
        load: MeasurementSample,
        nominal_voltage: f64,
    ) -> BenchResult<Self> {
        Ok(Self {
            source,
            load,
            load_current: load.current.abs(),
            load_voltage: load.voltage,
            efficiency_pct: efficiency(&source, &load)?,
            deviation_pct: deviation(load.voltage, nominal_voltage),
        })
    }
}

/// Summary of a completed efficiency or line regulation sweep.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DerivedMetrics {
    /// Mean efficiency over the sweep, percent.
    pub efficiency_pct: f64,
    /// Mean deviation from nominal over the sweep, percent.
    pub deviation_pct: f64,
    /// RMS of the per-step load voltages.
    pub rms: f64,
    /// Spread (max minus min) of the per-step load voltages.
    pub peak_to_peak: f64,
}

impl DerivedMetrics {
    /// Summarize a sequence of steps. `None` when `steps` is empty.
    pub fn from_steps(steps: &[StepMetrics]) -> Option<Self> {
        let efficiencies: Vec<f64> = steps.iter().map(|s| s.efficiency_pct).collect();
        let deviations: Vec<f64> = steps.iter().map(|s| s.deviation_pct).collect();
        let voltages: Vec<f64> = steps.iter().map(|s| s.load_voltage).collect();
        Some(Self {
            efficiency_pct: mean(&efficiencies)?,
            deviation_pct: mean(&deviations)?,
            rms: rms(&voltages)?,
            peak_to_peak: peak_to_peak(&voltages)?,
        })
    }
}

// =============================================================================
// Ripple accumulation
// =============================================================================

/// Running RMS and peak-to-peak over every sample absorbed so far.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RippleStats {
    /// Samples absorbed.
    pub count: usize,
    sum_squares: f64,
    min: f64,
    max: f64,
}

impl RippleStats {
    /// Statistics of `samples` alone.
    pub fn from_samples(samples: &[f64]) -> Self {
        Self::default().absorb(samples)
    }

    /// Statistics over everything seen so far plus `window`.
    #[must_use]
    pub fn absorb(self, window: &[f64]) -> Self {
        let Some((lo, hi)) = min_max(window) else {
            return self;
        };
        let (min, max) = if self.count == 0 {
            (lo, hi)
        } else {
            (self.min.min(lo), self.max.max(hi))
        };
        Self {
            count: self.count + window.len(),
            sum_squares: self.sum_squares + window.iter().map(|v| v * v).sum::<f64>(),
            min,
            max,
        }
    }

    /// RMS of all absorbed samples, 0 before any sample.
    pub fn rms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum_squares / self.count as f64).sqrt()
        }
    }

    /// Peak-to-peak of all absorbed samples, 0 before any sample.
    pub fn peak_to_peak(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.max - self.min
        }
    }
}

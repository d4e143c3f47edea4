//! Sweep sequence generation and the source power-budget clamp.
//!
//! Both are pure functions with no hardware dependency. The generator never
//! fails: degenerate bounds produce an empty sequence and callers decide what
//! an empty sweep means for them.

use crate::error::BenchError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Spacing of the points in a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepKind {
    /// Evenly spaced points.
    Linear,
    /// Geometrically spaced points, `steps` per decade.
    Logarithmic,
}

impl fmt::Display for SweepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepKind::Linear => write!(f, "Linear"),
            SweepKind::Logarithmic => write!(f, "Logarithmic"),
        }
    }
}

impl FromStr for SweepKind {
    type Err = BenchError;

    /// Case-insensitive parse of `linear` / `logarithmic`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(SweepKind::Linear),
            "logarithmic" => Ok(SweepKind::Logarithmic),
            _ => Err(BenchError::Validation(format!(
                "Sweep type '{}' is not supported. Must be one of: linear, logarithmic",
                s
            ))),
        }
    }
}

/// Parameters of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepSpec {
    /// Point spacing.
    pub kind: SweepKind,
    /// First value.
    pub start: f64,
    /// Last value.
    pub stop: f64,
    /// Number of points (linear) or points per decade (logarithmic).
    pub steps: usize,
    /// Whether the interval `[start, stop]` bounds the points.
    #[serde(default = "default_include_endpoints")]
    pub include_endpoints: bool,
}

fn default_include_endpoints() -> bool {
    true
}

impl SweepSpec {
    /// Sweep including both endpoints.
    pub fn new(kind: SweepKind, start: f64, stop: f64, steps: usize) -> Self {
        Self {
            kind,
            start,
            stop,
            steps,
            include_endpoints: true,
        }
    }

    /// Linear sweep including both endpoints.
    pub fn linear(start: f64, stop: f64, steps: usize) -> Self {
        Self::new(SweepKind::Linear, start, stop, steps)
    }

    /// Toggle endpoint inclusion.
    pub fn with_endpoints(mut self, include_endpoints: bool) -> Self {
        self.include_endpoints = include_endpoints;
        self
    }

    /// Materialize the sweep values.
    pub fn generate(&self) -> Vec<f64> {
        generate(
            self.kind,
            self.start,
            self.stop,
            self.steps,
            self.include_endpoints,
        )
    }
}

/// Generate sweep values from `start` towards `stop`.
///
/// Returns an empty vector when `start >= stop` or `steps == 0`.
///
/// Linear without endpoints yields `steps + 2` values spaced by
/// `(stop - start) / (steps + 1)`, so the bounds are still the first and last
/// elements. Logarithmic sweeps multiply `start` by powers of
/// `10^(1 / (steps - 1))` (or `10^(1 / (steps + 1))` without endpoints) until a
/// value reaches `stop`, which is then emitted as exactly `stop`; the number of
/// points therefore follows the decade span, not `steps`.
pub fn generate(
    kind: SweepKind,
    start: f64,
    stop: f64,
    steps: usize,
    include_endpoints: bool,
) -> Vec<f64> {
    if !(start < stop) || steps == 0 {
        return Vec::new();
    }

    match kind {
        SweepKind::Linear => linear(start, stop, steps, include_endpoints),
        SweepKind::Logarithmic => logarithmic(start, stop, steps, include_endpoints),
    }
}

fn linear(start: f64, stop: f64, steps: usize, include_endpoints: bool) -> Vec<f64> {
    if include_endpoints {
        if steps == 1 {
            return vec![start];
        }
        let step = (stop - start) / (steps - 1) as f64;
        let mut values: Vec<f64> = (0..steps - 1).map(|i| start + i as f64 * step).collect();
        values.push(stop);
        values
    } else {
        let step = (stop - start) / (steps + 1) as f64;
        (0..steps + 2).map(|i| start + i as f64 * step).collect()
    }
}

fn logarithmic(start: f64, stop: f64, steps: usize, include_endpoints: bool) -> Vec<f64> {
    // A non-positive start never grows towards stop.
    if start <= 0.0 {
        return Vec::new();
    }

    let divisor = if include_endpoints {
        steps as f64 - 1.0
    } else {
        steps as f64 + 1.0
    };
    let ratio = 10f64.powf(1.0 / divisor);
    if !(ratio > 1.0) {
        return Vec::new();
    }

    let mut values = Vec::new();
    loop {
        let value = start * ratio.powf(values.len() as f64);
        if value >= stop {
            values.push(stop);
            break;
        }
        values.push(value);
    }
    values
}

/// Current limit that keeps `voltage * limit` within `power_ceiling`.
///
/// Returns `requested_limit` unchanged when it already fits, otherwise
/// `power_ceiling / voltage` truncated (not rounded) to 3 decimals.
pub fn clamp_current(voltage: f64, requested_limit: f64, power_ceiling: f64) -> f64 {
    if voltage * requested_limit > power_ceiling {
        truncate_decimals(power_ceiling / voltage, 3)
    } else {
        requested_limit
    }
}

/// Truncate the shortest decimal representation of `value` after `decimals`
/// fractional digits.
///
/// Works on the printed digits so values like `0.29` stay `0.29` instead of
/// becoming `0.289` through binary scaling.
pub fn truncate_decimals(value: f64, decimals: usize) -> f64 {
    let repr = value.to_string();
    match repr.find('.') {
        Some(dot) if repr.len() > dot + 1 + decimals => {
            repr[..dot + 1 + decimals].parse().unwrap_or(value)
        }
        _ => value,
    }
}

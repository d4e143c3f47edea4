//! Bench Test Procedures
//!
//! One module per bench test. Each exposes a serde parameter struct whose
//! defaults match the bench defaults, and an async entry point for the
//! `Measure` mode. `PowerOn` and `PowerOff` are shared and live in
//! [`dut_power`].
//!
//! | Module | Test |
//! |---|---|
//! | [`efficiency`] | Efficiency and load regulation (voltage x current sweep) and its single-point variant |
//! | [`line_regulation`] | Output voltage against a source-voltage sweep |
//! | [`ripple`] | Output ripple captured on an oscilloscope |
//! | [`output_accuracy`] | Mean output voltage against nominal |
//! | [`load_transient`] | Output response to a load current step |
//!
//! Every session a procedure opens is held by a
//! [`SessionGuard`](supervisor::SessionGuard) and released through the
//! [`supervisor`] on every exit path.

pub mod dut_power;
pub mod efficiency;
pub mod engine;
pub mod line_regulation;
pub mod load_transient;
pub mod output_accuracy;
pub mod ripple;
pub mod supervisor;

use crate::error::{BenchError, BenchResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Status reported after a successful measurement.
pub const STATUS_MEASURED: &str = "The measurement is performed successfully";

/// Status reported after powering the DUT off.
pub const STATUS_POWERED_OFF: &str = "The DUT is powered off";

/// Resource and channel of one instrument channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelAddress {
    /// Instrument resource name.
    pub resource: String,
    /// Channel on the instrument.
    #[serde(default = "default_channel")]
    pub channel: String,
}

fn default_channel() -> String {
    "0".to_string()
}

impl ChannelAddress {
    /// Address of `channel` on `resource`.
    pub fn new(resource: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            channel: channel.into(),
        }
    }

    /// Channel `0` of `resource`.
    pub fn first(resource: impl Into<String>) -> Self {
        Self::new(resource, default_channel())
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource, self.channel)
    }
}

/// Ordered `(x, y)` numeric series.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct XySeries {
    /// Abscissae.
    pub x: Vec<f64>,
    /// Ordinates.
    pub y: Vec<f64>,
}

impl XySeries {
    /// Series from matching coordinate vectors.
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Self {
        Self { x, y }
    }

    /// Series with `y[i]` placed at `x = (offset + i) * dt`.
    pub fn uniform(y: Vec<f64>, offset: usize, dt: f64) -> Self {
        let x = (offset..offset + y.len()).map(|i| i as f64 * dt).collect();
        Self { x, y }
    }

    /// This series followed by one more point.
    #[must_use]
    pub fn with_point(mut self, x: f64, y: f64) -> Self {
        self.x.push(x);
        self.y.push(y);
        self
    }

    /// This series followed by `other`.
    #[must_use]
    pub fn concat(mut self, other: XySeries) -> Self {
        self.x.extend(other.x);
        self.y.extend(other.y);
        self
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.y.len()
    }

    /// `true` for a series without points.
    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }
}

/// Collects every parameter violation of one test so they are reported together.
pub(crate) struct Checks {
    section: &'static str,
    errors: Vec<String>,
}

impl Checks {
    pub(crate) fn new(section: &'static str) -> Self {
        Self {
            section,
            errors: Vec::new(),
        }
    }

    pub(crate) fn positive_time(&mut self, field: &str, value: Duration) -> &mut Self {
        if value.is_zero() {
            self.errors.push(format!("{} must be greater than zero", field));
        }
        self
    }

    pub(crate) fn positive(&mut self, field: &str, value: f64) -> &mut Self {
        if !(value.is_finite() && value > 0.0) {
            self.errors
                .push(format!("{} must be a positive number, got {}", field, value));
        }
        self
    }

    pub(crate) fn finite(&mut self, field: &str, value: f64) -> &mut Self {
        if !value.is_finite() {
            self.errors
                .push(format!("{} must be a finite number, got {}", field, value));
        }
        self
    }

    pub(crate) fn channel(&mut self, field: &str, address: &ChannelAddress) -> &mut Self {
        if address.resource.trim().is_empty() {
            self.errors.push(format!("{}.resource must not be empty", field));
        }
        self
    }

    pub(crate) fn require(&mut self, holds: bool, message: impl Into<String>) -> &mut Self {
        if !holds {
            self.errors.push(message.into());
        }
        self
    }

    pub(crate) fn finish(&mut self) -> BenchResult<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(BenchError::Validation(format!(
            "[{}] {}",
            self.section,
            self.errors.join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_series_continues_from_offset() {
        let series = XySeries::uniform(vec![1.0, 2.0], 3, 0.5);
        assert_eq!(series.x, vec![1.5, 2.0]);
        let joined = XySeries::uniform(vec![0.0], 0, 0.5).concat(series);
        assert_eq!(joined.len(), 3);
        assert_eq!(joined.x[0], 0.0);
    }

    #[test]
    fn channel_address_defaults_to_channel_zero() {
        let address: ChannelAddress = serde_json::from_str(r#"{"resource":"PPS"}"#).unwrap();
        assert_eq!(address, ChannelAddress::first("PPS"));
        assert_eq!(address.to_string(), "PPS/0");
    }
}

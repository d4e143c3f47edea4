//! Behavioral model of a buck regulator used as the simulated DUT.

use serde::{Deserialize, Serialize};

/// Static and dynamic characteristics of the simulated regulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DutModel {
    /// Regulated output at `reference_input` and no load, in volts.
    pub nominal_output: f64,
    /// Input voltage at which the output equals `nominal_output`.
    pub reference_input: f64,
    /// Output change per volt of input change.
    pub line_sensitivity: f64,
    /// Output droop per amp of load, in ohms.
    pub output_resistance: f64,
    /// Conversion efficiency, 0 to 1.
    pub efficiency: f64,
    /// Input current drawn with no load, in amps.
    pub quiescent_current: f64,
    /// Input voltage below which the regulator stays off.
    pub undervoltage_lockout: f64,
    /// Peak amplitude of the switching ripple, in volts.
    pub ripple_amplitude: f64,
    /// Ripple frequency in hertz.
    pub ripple_frequency: f64,
    /// Peak uniform noise added to scope samples, in volts.
    pub ripple_noise: f64,
    /// Peak uniform noise added to DC voltage readings, in volts.
    pub measurement_noise: f64,
    /// Extra output deviation per amp of load step, in volts.
    pub transient_deviation_per_amp: f64,
    /// Settling time constant after a load step, in seconds.
    pub transient_time_constant: f64,
}

impl Default for DutModel {
    fn default() -> Self {
        Self {
            nominal_output: 3.3,
            reference_input: 12.0,
            line_sensitivity: 0.0005,
            output_resistance: 0.002,
            efficiency: 0.9,
            quiescent_current: 0.005,
            undervoltage_lockout: 4.0,
            ripple_amplitude: 0.02,
            ripple_frequency: 500.0,
            ripple_noise: 0.0,
            measurement_noise: 0.0,
            transient_deviation_per_amp: 0.01,
            transient_time_constant: 20e-6,
        }
    }
}

/// Electrical state at both ports of the DUT.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OperatingPoint {
    /// Input voltage.
    pub input_voltage: f64,
    /// Input current.
    pub input_current: f64,
    /// Output voltage.
    pub output_voltage: f64,
    /// Output (load) current.
    pub output_current: f64,
}

impl DutModel {
    /// Whether the regulator is switching at `input_voltage`.
    pub fn is_on(&self, input_voltage: f64) -> bool {
        input_voltage >= self.undervoltage_lockout
    }

    /// Steady-state output voltage.
    pub fn output_voltage(&self, input_voltage: f64, load_current: f64) -> f64 {
        if !self.is_on(input_voltage) {
            return 0.0;
        }
        let line = self.line_sensitivity * (input_voltage - self.reference_input);
        (self.nominal_output + line - self.output_resistance * load_current).max(0.0)
    }

    /// Steady-state operating point for a source voltage and load current.
    pub fn operating_point(&self, input_voltage: f64, load_current: f64) -> OperatingPoint {
        if !self.is_on(input_voltage) || input_voltage <= 0.0 {
            return OperatingPoint {
                input_voltage: input_voltage.max(0.0),
                input_current: 0.0,
                output_voltage: 0.0,
                output_current: 0.0,
            };
        }
        let output_voltage = self.output_voltage(input_voltage, load_current);
        let output_power = output_voltage * load_current;
        let input_current = output_power / (self.efficiency * input_voltage) + self.quiescent_current;
        OperatingPoint {
            input_voltage,
            input_current,
            output_voltage,
            output_current: load_current,
        }
    }

    /// Output voltage `elapsed` seconds after the load stepped from `from_current` to `to_current`.
    pub fn transient_voltage(
        &self,
        input_voltage: f64,
        from_current: f64,
        to_current: f64,
        elapsed: f64,
    ) -> f64 {
        let settled = self.output_voltage(input_voltage, to_current);
        if !self.is_on(input_voltage) || self.transient_time_constant <= 0.0 {
            return settled;
        }
        let start = self.output_voltage(input_voltage, from_current)
            - self.transient_deviation_per_amp * (to_current - from_current);
        settled + (start - settled) * (-elapsed / self.transient_time_constant).exp()
    }

    /// Ripple voltage at time `t` with the regulator running.
    pub fn ripple(&self, t: f64) -> f64 {
        self.ripple_amplitude * (2.0 * std::f64::consts::PI * self.ripple_frequency * t).sin()
    }
}

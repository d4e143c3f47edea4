//! Error types for bench measurements.
//!
//! Two layers live here:
//!
//! - **`DriverError`**: what an instrument session reports. It carries the
//!   resource that failed, the operation that was attempted and a
//!   [`DriverErrorKind`] classifying the failure.
//! - **`BenchError`**: what the measurement core and the service boundary
//!   return. Driver errors are folded into it with `?`: a driver `Timeout`
//!   becomes [`BenchError::HardwareTimeout`], every other driver failure
//!   becomes [`BenchError::DriverFault`].
//!
//! `Validation` errors are produced before any hardware is touched, so they
//! never trigger session recovery.

use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the bench error type.
pub type BenchResult<T> = std::result::Result<T, BenchError>;

/// Classification of a failure reported by an instrument session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// A property could not be applied or committed.
    Configuration,
    /// The session could not talk to the instrument.
    Communication,
    /// The instrument reported a hardware fault.
    Hardware,
    /// A bounded wait or fetch elapsed.
    Timeout,
    /// The channel is already owned by another session.
    ResourceBusy,
    /// A value was rejected by the driver.
    InvalidParameter,
    /// The session was used after `close()`.
    Closed,
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::ResourceBusy => "resource_busy",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Closed => "closed",
        };
        write!(f, "{}", label)
    }
}

/// Failure surfaced by an instrument session.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Instrument '{resource}' {kind} error during {operation}: {message}")]
pub struct DriverError {
    /// Resource name of the instrument that failed.
    pub resource: String,
    /// Operation being attempted (`commit`, `wait_for_event`, ...).
    pub operation: String,
    /// Failure classification.
    pub kind: DriverErrorKind,
    /// Driver-provided detail.
    pub message: String,
}

impl DriverError {
    /// Create a new driver error.
    pub fn new(
        resource: impl Into<String>,
        operation: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            resource: resource.into(),
            operation: operation.into(),
            kind,
            message: message.into(),
        }
    }

    /// Whether this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        self.kind == DriverErrorKind::Timeout
    }
}

/// Errors returned by the measurement core.
#[derive(Error, Debug)]
pub enum BenchError {
    /// Rejected input, reported before any hardware side effect.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A wait-for-event or fetch exceeded its bound.
    #[error("Hardware timeout: {0}")]
    HardwareTimeout(DriverError),

    /// Any other failure surfaced by an instrument session.
    #[error("Driver fault: {0}")]
    DriverFault(DriverError),

    /// Numeric reduction could not be performed.
    #[error("Data processing error: {0}")]
    Processing(String),

    /// A protocol operation was called from the wrong state.
    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState {
        /// State the operation requires.
        expected: String,
        /// State the protocol was in.
        actual: String,
    },

    /// A guard was used after its session had been handed back.
    #[error("Session already released: {0}")]
    SessionReleased(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),
}

impl BenchError {
    /// Whether this error came from the hardware and requires session recovery.
    pub fn requires_recovery(&self) -> bool {
        matches!(
            self,
            BenchError::HardwareTimeout(_) | BenchError::DriverFault(_)
        )
    }
}

impl From<DriverError> for BenchError {
    fn from(err: DriverError) -> Self {
        if err.is_timeout() {
            BenchError::HardwareTimeout(err)
        } else {
            BenchError::DriverFault(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_timeout_maps_to_hardware_timeout() {
        let err: BenchError = DriverError::new(
            "E-load",
            "wait_for_event",
            DriverErrorKind::Timeout,
            "sequence engine done not signalled",
        )
        .into();
        assert!(matches!(err, BenchError::HardwareTimeout(_)));
        assert!(err.requires_recovery());
    }

    #[test]
    fn other_driver_errors_map_to_fault() {
        let err: BenchError =
            DriverError::new("PPS", "commit", DriverErrorKind::Configuration, "bad level").into();
        assert!(matches!(err, BenchError::DriverFault(_)));
        assert!(err
            .to_string()
            .contains("Instrument 'PPS' configuration error during commit"));
    }

    #[test]
    fn validation_does_not_require_recovery() {
        let err = BenchError::Validation("Sweep type 'cubic' is not supported".into());
        assert!(!err.requires_recovery());
    }
}

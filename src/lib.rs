//! # PMIC Bench Core Library
//!
//! Synchronized source/load sweep measurements for bench validation of a
//! power-management DUT. A programmable source steps the DUT input while an
//! electronic load, hardware-triggered by the source, draws current from the
//! output and measures it in lockstep.
//!
//! ## Crate Structure
//!
//! - **`sweep`**: sweep value generation (linear, logarithmic) and the
//!   power-budget current clamp.
//! - **`hardware`**: the instrument session traits the core is written
//!   against, trigger terminal naming, and a simulated bench.
//! - **`measurement`**: the dual-instrument configurator, the
//!   synchronization protocol, metric reduction and the partial-result
//!   streams.
//! - **`procedures`**: the bench tests (efficiency, line regulation, ripple,
//!   output accuracy, load transient) and the session supervisor that
//!   guarantees every opened channel is released.
//! - **`service`**: the mode controller (`PowerOn`, `Measure`, `PowerOff`)
//!   exposed to a hosting framework.
//! - **`config`**: layered configuration (defaults, TOML, environment).
//! - **`tracing_setup`**: structured logging initialisation.
//! - **`error`**: the `BenchError` taxonomy.

pub mod config;
pub mod error;
pub mod hardware;
pub mod measurement;
pub mod procedures;
pub mod service;
pub mod sweep;
pub mod tracing_setup;

pub use error::{BenchError, BenchResult};
pub use service::{Invocation, MeasureRequest, ModeOfOperation, Outputs, Report, TestKind};

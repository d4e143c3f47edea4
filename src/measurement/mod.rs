//! Measurement Core
//!
//! Programs the instruments, runs the trigger protocol between them and
//! reduces what they captured:
//!
//! - [`configurator`] builds single-point and sequence programs
//! - [`protocol`] arms, starts, waits on and drains a synchronized sweep
//! - [`metrics`] turns sample pairs and waveforms into figures of merit
//! - [`stream`] exposes long captures as pull-based partial results

pub mod configurator;
pub mod metrics;
pub mod protocol;
pub mod stream;

pub use configurator::{ChannelProgram, Setpoint, SweepProgram};
pub use metrics::{DerivedMetrics, RippleStats, StepMetrics};
pub use protocol::{SyncState, SynchronizedSweep};
pub use stream::{RippleStream, RippleWindow, SweepProgress, SweepStream};

//! Instrument Abstractions
//!
//! Session traits the measurement core is written against, trigger line
//! naming, and the simulated bench used when no vendor driver is attached.

pub mod capabilities;
pub mod simulated;
pub mod terminal;

pub use capabilities::{
    DcPowerChannel, DcPowerEvent, DcPowerSetting, DriverResult, InstrumentDriver, ManagedSession,
    MeasurementSample, ScopeChannel,
};
pub use simulated::SimulatedBench;
pub use terminal::{TerminalEvent, TriggerTerminal};

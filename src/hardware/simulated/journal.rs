//! Ordered record of every call made against the simulated bench.

use crate::hardware::capabilities::{DcPowerEvent, DcPowerSetting};

/// One session call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    /// Session opened.
    Open,
    /// Channel property applied.
    Configure(DcPowerSetting),
    /// Advanced sequence created.
    CreateAdvancedSequence(String),
    /// Advanced sequence step appended.
    CreateAdvancedSequenceStep,
    /// Simple sequence programmed.
    SetSequence(Vec<f64>),
    /// Settings committed.
    Commit,
    /// Channel started.
    Initiate,
    /// Wait on an event.
    WaitForEvent(DcPowerEvent),
    /// Buffered fetch of a number of samples.
    FetchMultiple(usize),
    /// On-demand measurement.
    MeasureMultiple,
    /// Backlog query.
    FetchBacklog,
    /// Record spacing query.
    MeasureRecordDeltaTime,
    /// Acquisition stopped.
    Abort,
    /// Output relay opened.
    DisableOutput,
    /// Channel reset.
    Reset,
    /// Session closed.
    Close,
    /// Scope vertical configured.
    ConfigureVertical,
    /// Scope trigger configured.
    ConfigureTrigger,
    /// Scope horizontal timing configured.
    ConfigureHorizontal,
    /// Scope sample rate queried.
    SampleRate,
    /// Scope waveform fetch.
    FetchWaveform(usize),
}

/// A call tagged with the channel it targeted.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    /// Resource name.
    pub resource: String,
    /// Channel name.
    pub channel: String,
    /// The call.
    pub call: Call,
}

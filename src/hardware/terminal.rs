//! Trigger line names shared between instruments.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Events a source channel exports on its trigger lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminalEvent {
    /// Pulsed when the source advances to its next step.
    SourceTrigger,
    /// Pulsed when the source output settles at the current step.
    SourceCompleteEvent,
}

impl TerminalEvent {
    /// Name of the event as it appears in a terminal path.
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalEvent::SourceTrigger => "SourceTrigger",
            TerminalEvent::SourceCompleteEvent => "SourceCompleteEvent",
        }
    }
}

/// Fully qualified name of a trigger line exported by one channel.
///
/// Formatted as `/{resource}/Engine{channel}/{event}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerTerminal(String);

impl TriggerTerminal {
    /// Terminal exported by `channel` of `resource` for `event`.
    pub fn new(resource: &str, channel: &str, event: TerminalEvent) -> Self {
        Self(format!("/{}/Engine{}/{}", resource, channel, event.as_str()))
    }

    /// Terminal path as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TriggerTerminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_engine_path() {
        let terminal = TriggerTerminal::new("PPS", "0", TerminalEvent::SourceTrigger);
        assert_eq!(terminal.as_str(), "/PPS/Engine0/SourceTrigger");

        let complete = TriggerTerminal::new("PXI1Slot2", "3", TerminalEvent::SourceCompleteEvent);
        assert_eq!(complete.to_string(), "/PXI1Slot2/Engine3/SourceCompleteEvent");
    }

    #[test]
    fn same_inputs_same_terminal() {
        assert_eq!(
            TriggerTerminal::new("PPS", "0", TerminalEvent::SourceTrigger),
            TriggerTerminal::new("PPS", "0", TerminalEvent::SourceTrigger)
        );
    }
}

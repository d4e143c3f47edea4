//! Fault injection for the simulated bench.
//!
//! Scenarios are matched against the resource name and the operation being
//! performed. Every simulated session checks its operation here before doing
//! any work, after the call has been journaled.

use crate::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Session operations that can be targeted by a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Opening the session.
    Open,
    /// Applying a channel setting or program.
    Configure,
    /// Committing settings.
    Commit,
    /// Starting the channel.
    Initiate,
    /// Waiting on an event.
    WaitForEvent,
    /// Reading buffered or on-demand samples.
    Fetch,
    /// Aborting.
    Abort,
    /// Opening the output relay.
    DisableOutput,
    /// Resetting.
    Reset,
    /// Closing.
    Close,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Operation::Open => "open",
            Operation::Configure => "configure",
            Operation::Commit => "commit",
            Operation::Initiate => "initiate",
            Operation::WaitForEvent => "wait_for_event",
            Operation::Fetch => "fetch",
            Operation::Abort => "abort",
            Operation::DisableOutput => "disable_output",
            Operation::Reset => "reset",
            Operation::Close => "close",
        };
        write!(f, "{}", label)
    }
}

/// One injected failure.
#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Fail every call of `operation` on `resource` with a hardware fault.
    Fail {
        /// Targeted resource name.
        resource: String,
        /// Targeted operation.
        operation: Operation,
    },
    /// Let `count` calls succeed, then fail every later one.
    FailAfterN {
        /// Targeted resource name.
        resource: String,
        /// Targeted operation.
        operation: Operation,
        /// Calls allowed to succeed.
        count: u32,
    },
    /// Events of `resource` never fire, so every wait times out.
    StallEvents {
        /// Targeted resource name.
        resource: String,
    },
}

/// Shared set of scenarios with per-operation counters.
#[derive(Clone, Debug, Default)]
pub struct ErrorConfig {
    scenarios: Arc<Vec<ErrorScenario>>,
    counts: Arc<Mutex<HashMap<(String, Operation), u32>>>,
}

impl ErrorConfig {
    /// No injected failures.
    pub fn none() -> Self {
        Self::default()
    }

    /// A single scenario.
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scenarios, all active at once.
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self {
            scenarios: Arc::new(scenarios),
            counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Return the injected error for `operation` on `resource`, if any.
    pub fn check_operation(&self, resource: &str, operation: Operation) -> Result<(), DriverError> {
        let mut counts = self.counts.lock();
        let seen = counts
            .entry((resource.to_string(), operation))
            .or_insert(0);
        *seen += 1;
        let seen = *seen;

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::Fail {
                    resource: target,
                    operation: op,
                } if target == resource && *op == operation => {
                    return Err(injected(resource, operation));
                }
                ErrorScenario::FailAfterN {
                    resource: target,
                    operation: op,
                    count,
                } if target == resource && *op == operation && seen > *count => {
                    return Err(injected(resource, operation));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Whether events of `resource` are suppressed.
    pub fn events_stalled(&self, resource: &str) -> bool {
        self.scenarios.iter().any(|scenario| {
            matches!(scenario, ErrorScenario::StallEvents { resource: target } if target == resource)
        })
    }
}

fn injected(resource: &str, operation: Operation) -> DriverError {
    DriverError::new(
        resource,
        operation.to_string(),
        DriverErrorKind::Hardware,
        "injected fault",
    )
}

//! Failure/Recovery Supervisor
//!
//! Every session opened by a procedure is wrapped in a [`SessionGuard`]. The
//! guard is released explicitly through [`finish`], which picks the teardown
//! from the procedure's outcome:
//!
//! - success: abort, disable output, reset and close every session, and
//!   report the first teardown failure
//! - failure: the same sequence, best effort, logging and swallowing every
//!   secondary error, then return the original error
//!
//! Teardown runs stage by stage across all sessions (abort all, then disable
//! all, then reset all, then close all). A failing stage never skips later
//! stages, so `close()` is always attempted.
//!
//! A guard dropped without release (a panic, or an early return that bypassed
//! [`finish`]) logs an error and schedules best-effort recovery on the current
//! tokio runtime.
//!
//! # Example
//!
//! ```rust,ignore
//! let source = SessionGuard::new("source", driver.open_dcpower("PPS", "0").await?);
//! let load = SessionGuard::new("load", driver.open_dcpower("E-load", "0").await?);
//! let outcome = run(source.session()?, load.session()?).await;
//! finish(vec![source, load], outcome).await
//! ```

use crate::error::{BenchError, BenchResult, DriverError};
use crate::hardware::capabilities::{DcPowerChannel, ManagedSession, ScopeChannel};
use std::fmt;
use tracing::{debug, error, warn};

// =============================================================================
// Teardown stages
// =============================================================================

/// One step of the teardown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStage {
    /// Stop running sequences and acquisitions.
    Abort,
    /// Open the output relay.
    DisableOutput,
    /// Return to power-on defaults.
    Reset,
    /// Release the channel.
    Close,
}

impl TeardownStage {
    /// All stages, in execution order.
    pub const ORDER: [TeardownStage; 4] = [
        TeardownStage::Abort,
        TeardownStage::DisableOutput,
        TeardownStage::Reset,
        TeardownStage::Close,
    ];

    async fn run<S: ?Sized + ManagedSession>(self, session: &S) -> Result<(), DriverError> {
        match self {
            TeardownStage::Abort => session.abort().await,
            TeardownStage::DisableOutput => session.disable_output().await,
            TeardownStage::Reset => session.reset().await,
            TeardownStage::Close => session.close().await,
        }
    }
}

impl fmt::Display for TeardownStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TeardownStage::Abort => "abort",
            TeardownStage::DisableOutput => "disable_output",
            TeardownStage::Reset => "reset",
            TeardownStage::Close => "close",
        };
        write!(f, "{}", label)
    }
}

/// Run `stages` on every session, collecting failures instead of stopping.
async fn teardown<S: ?Sized + ManagedSession>(
    sessions: &[(String, Box<S>)],
    stages: &[TeardownStage],
) -> Vec<(String, TeardownStage, DriverError)> {
    let mut failures = Vec::new();
    for &stage in stages {
        for (label, session) in sessions {
            if let Err(err) = stage.run(session.as_ref()).await {
                failures.push((label.clone(), stage, err));
            }
        }
    }
    failures
}

// =============================================================================
// Session guard
// =============================================================================

/// Guard over a source-measure channel.
pub type DcPowerGuard = SessionGuard<dyn DcPowerChannel>;

/// Guard over an oscilloscope channel.
pub type ScopeGuard = SessionGuard<dyn ScopeChannel>;

/// Exclusive owner of one open session.
pub struct SessionGuard<S: ?Sized + ManagedSession + 'static> {
    label: String,
    session: Option<Box<S>>,
}

impl<S: ?Sized + ManagedSession + 'static> SessionGuard<S> {
    /// Take ownership of an opened session.
    pub fn new(label: impl Into<String>, session: Box<S>) -> Self {
        let label = label.into();
        debug!(
            role = %label,
            resource = session.resource_name(),
            channel = session.channel_name(),
            "session acquired"
        );
        Self {
            label,
            session: Some(session),
        }
    }

    /// Role of the session (`source`, `load`, ...).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Borrow the guarded session.
    pub fn session(&self) -> BenchResult<&S> {
        self.session
            .as_deref()
            .ok_or_else(|| BenchError::SessionReleased(self.label.clone()))
    }

    fn take(&mut self) -> Option<(String, Box<S>)> {
        self.session
            .take()
            .map(|session| (self.label.clone(), session))
    }

    /// Tear this session down and report the first failure.
    pub async fn shutdown(self) -> BenchResult<()> {
        shutdown_all(vec![self]).await
    }

    /// Tear this session down, swallowing failures.
    pub async fn recover(self) {
        recover_all(vec![self]).await
    }
}

impl<S: ?Sized + ManagedSession + 'static> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        let Some((label, session)) = self.take() else {
            return;
        };
        error!(
            role = %label,
            resource = session.resource_name(),
            "session dropped without release, scheduling recovery"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    log_failures(teardown(&[(label, session)], &TeardownStage::ORDER).await);
                });
            }
            Err(_) => error!(role = %label, "no runtime available, session left open"),
        }
    }
}

// =============================================================================
// Release
// =============================================================================

/// Tear down every guarded session, returning the first failure.
pub async fn shutdown_all<S: ?Sized + ManagedSession + 'static>(
    guards: Vec<SessionGuard<S>>,
) -> BenchResult<()> {
    release_all(guards, &TeardownStage::ORDER).await
}

/// Run only `stages` on every guarded session, returning the first failure.
///
/// Every stage is attempted on every session even after a failure.
pub async fn release_all<S: ?Sized + ManagedSession + 'static>(
    mut guards: Vec<SessionGuard<S>>,
    stages: &[TeardownStage],
) -> BenchResult<()> {
    let sessions: Vec<_> = guards.iter_mut().filter_map(SessionGuard::take).collect();
    let failures = teardown(&sessions, stages).await;
    match failures.into_iter().next() {
        Some((label, stage, err)) => {
            warn!(role = %label, %stage, error = %err, "teardown failed");
            Err(err.into())
        }
        None => {
            debug!(sessions = sessions.len(), "sessions released");
            Ok(())
        }
    }
}

/// Tear down every guarded session, logging and swallowing failures.
pub async fn recover_all<S: ?Sized + ManagedSession + 'static>(mut guards: Vec<SessionGuard<S>>) {
    let sessions: Vec<_> = guards.iter_mut().filter_map(SessionGuard::take).collect();
    warn!(sessions = sessions.len(), "recovering sessions after failure");
    log_failures(teardown(&sessions, &TeardownStage::ORDER).await);
}

fn log_failures(failures: Vec<(String, TeardownStage, DriverError)>) {
    for (label, stage, err) in failures {
        warn!(role = %label, %stage, error = %err, "recovery step failed");
    }
}

/// Release `guards` according to `outcome` and return the outcome.
///
/// On success the teardown error, if any, replaces the value. On failure the
/// original error is returned after best-effort recovery.
pub async fn finish<T, S: ?Sized + ManagedSession + 'static>(
    guards: Vec<SessionGuard<S>>,
    outcome: BenchResult<T>,
) -> BenchResult<T> {
    match outcome {
        Ok(value) => {
            shutdown_all(guards).await?;
            Ok(value)
        }
        Err(err) => {
            error!(error = %err, "measurement failed");
            recover_all(guards).await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulated::{Call, ErrorConfig, ErrorScenario, Operation};
    use crate::hardware::{DcPowerChannel, InstrumentDriver, SimulatedBench};
    use tracing_test::traced_test;

    async fn pair(bench: &SimulatedBench) -> Vec<SessionGuard<dyn DcPowerChannel>> {
        vec![
            SessionGuard::new("source", bench.open_dcpower("PPS", "0").await.unwrap()),
            SessionGuard::new("load", bench.open_dcpower("E-load", "0").await.unwrap()),
        ]
    }

    #[tokio::test]
    async fn teardown_runs_stage_by_stage() {
        let bench = SimulatedBench::new();
        let guards = pair(&bench).await;
        shutdown_all(guards).await.unwrap();

        let order: Vec<(String, Call)> = bench
            .journal()
            .into_iter()
            .filter(|entry| entry.call != Call::Open)
            .map(|entry| (entry.resource, entry.call))
            .collect();
        let expected = [
            Call::Abort,
            Call::DisableOutput,
            Call::Reset,
            Call::Close,
        ]
        .into_iter()
        .flat_map(|call| [("PPS".to_string(), call.clone()), ("E-load".to_string(), call)])
        .collect::<Vec<_>>();
        assert_eq!(order, expected);
        assert_eq!(bench.open_sessions(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn recovery_swallows_secondary_errors() {
        let bench = SimulatedBench::new().with_faults(ErrorConfig::scenario(ErrorScenario::Fail {
            resource: "PPS".into(),
            operation: Operation::Abort,
        }));
        let guards = pair(&bench).await;
        let outcome: BenchResult<()> = Err(BenchError::Processing("boom".into()));

        let err = finish(guards, outcome).await.unwrap_err();
        assert!(matches!(err, BenchError::Processing(_)));
        assert!(bench.calls("PPS").contains(&Call::Close));
        assert!(bench.calls("E-load").contains(&Call::Close));
        assert_eq!(bench.open_sessions(), 0);
        assert!(logs_contain("recovery step failed"));
    }

    #[tokio::test]
    async fn shutdown_reports_teardown_failure() {
        let bench = SimulatedBench::new().with_faults(ErrorConfig::scenario(ErrorScenario::Fail {
            resource: "E-load".into(),
            operation: Operation::Reset,
        }));
        let guards = pair(&bench).await;
        let err = finish(guards, Ok(())).await.unwrap_err();
        assert!(matches!(err, BenchError::DriverFault(_)));
        // Close still ran after the failed reset.
        assert!(bench.calls("E-load").contains(&Call::Close));
    }

    #[tokio::test]
    async fn partial_release_skips_abort() {
        let bench = SimulatedBench::new();
        let guards = pair(&bench).await;
        release_all(
            guards,
            &[
                TeardownStage::DisableOutput,
                TeardownStage::Reset,
                TeardownStage::Close,
            ],
        )
        .await
        .unwrap();
        assert!(!bench.calls("PPS").contains(&Call::Abort));
        assert_eq!(bench.open_sessions(), 0);
    }

    #[tokio::test]
    async fn released_guard_refuses_access() {
        let bench = SimulatedBench::new();
        let mut guard = SessionGuard::new("source", bench.open_dcpower("PPS", "0").await.unwrap());
        let _ = guard.take();
        assert!(matches!(
            guard.session(),
            Err(BenchError::SessionReleased(_))
        ));
    }

    #[tokio::test]
    async fn dropped_guard_schedules_recovery() {
        let bench = SimulatedBench::new();
        {
            let _guard = SessionGuard::new("source", bench.open_dcpower("PPS", "0").await.unwrap());
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(bench.calls("PPS").contains(&Call::Close));
    }
}

//! Synchronization Protocol
//!
//! Drives one synchronized sweep through its states:
//!
//! ```text
//! Configured --arm_load--> LoadArmed --start_source--> SourceRunning
//!     --await_completion--> Synchronized --next_pair--> Draining --finish--> Idle
//! ```
//!
//! The source owns the step clock and the load only reacts to it, so the
//! load is always initiated first and completion is judged by the load's own
//! `SequenceEngineDone` event. Any hardware failure after configuration tears
//! both sessions down before the error is returned, and the sweep ends in
//! [`SyncState::Idle`].

use crate::error::{BenchError, BenchResult};
use crate::hardware::capabilities::{DcPowerChannel, DcPowerEvent, MeasurementSample};
use crate::procedures::supervisor::{recover_all, shutdown_all, DcPowerGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error};

/// Protocol state of a synchronized sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Both channels are programmed and idle.
    Configured,
    /// The load waits on the source's trigger lines.
    LoadArmed,
    /// The source is stepping through its sequence.
    SourceRunning,
    /// The load signalled the end of its sequence.
    Synchronized,
    /// Sample pairs are being fetched.
    Draining,
    /// Sessions are released.
    Idle,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One source/load sweep running in hardware lockstep.
pub struct SynchronizedSweep {
    guards: Option<(DcPowerGuard, DcPowerGuard)>,
    steps: usize,
    drained: usize,
    state: SyncState,
    fetch_timeout: Duration,
}

impl SynchronizedSweep {
    /// Take over two channels already programmed for `steps` steps.
    pub fn new(
        source: DcPowerGuard,
        load: DcPowerGuard,
        steps: usize,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            guards: Some((source, load)),
            steps,
            drained: 0,
            state: SyncState::Configured,
            fetch_timeout,
        }
    }

    /// Current protocol state.
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Steps in the sweep.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Pairs fetched so far.
    pub fn drained(&self) -> usize {
        self.drained
    }

    fn sessions(&self) -> BenchResult<(&dyn DcPowerChannel, &dyn DcPowerChannel)> {
        let (source, load) = self
            .guards
            .as_ref()
            .ok_or_else(|| BenchError::SessionReleased("synchronized sweep".into()))?;
        Ok((source.session()?, load.session()?))
    }

    fn require(&self, allowed: &[SyncState]) -> BenchResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            let expected = allowed
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" or ");
            Err(BenchError::InvalidState {
                expected,
                actual: self.state.to_string(),
            })
        }
    }

    fn transition(&mut self, next: SyncState) {
        debug!(from = %self.state, to = %next, "sweep state");
        self.state = next;
    }

    /// Pass `outcome` through, releasing both sessions first if it failed.
    async fn supervise<T>(&mut self, outcome: BenchResult<T>) -> BenchResult<T> {
        if let Err(err) = &outcome {
            error!(state = %self.state, error = %err, "synchronized sweep failed");
            self.abandon().await;
        }
        outcome
    }

    /// Initiate the load so it waits on the source's lines.
    pub async fn arm_load(&mut self) -> BenchResult<()> {
        self.require(&[SyncState::Configured])?;
        let outcome = match self.sessions() {
            Ok((_, load)) => load.initiate().await.map_err(BenchError::from),
            Err(err) => Err(err),
        };
        self.supervise(outcome).await?;
        self.transition(SyncState::LoadArmed);
        Ok(())
    }

    /// Initiate the source; it starts stepping and clocking the load.
    pub async fn start_source(&mut self) -> BenchResult<()> {
        self.require(&[SyncState::LoadArmed])?;
        let outcome = match self.sessions() {
            Ok((source, _)) => source.initiate().await.map_err(BenchError::from),
            Err(err) => Err(err),
        };
        self.supervise(outcome).await?;
        self.transition(SyncState::SourceRunning);
        Ok(())
    }

    /// Block until the load reports the end of its sequence.
    pub async fn await_completion(&mut self, timeout: Duration) -> BenchResult<()> {
        self.require(&[SyncState::SourceRunning])?;
        let outcome = match self.sessions() {
            Ok((_, load)) => load
                .wait_for_event(DcPowerEvent::SequenceEngineDone, timeout)
                .await
                .map_err(BenchError::from),
            Err(err) => Err(err),
        };
        self.supervise(outcome).await?;
        self.transition(SyncState::Synchronized);
        Ok(())
    }

    /// Arm, start and wait in the required order.
    pub async fn run(&mut self, timeout: Duration) -> BenchResult<()> {
        self.arm_load().await?;
        self.start_source().await?;
        self.await_completion(timeout).await
    }

    /// Fetch the next `(source, load)` pair, or `None` once every step is drained.
    ///
    /// Exactly one sample is taken from the source, then one from the load,
    /// so index `i` of both streams refers to the same sweep point.
    pub async fn next_pair(
        &mut self,
    ) -> BenchResult<Option<(MeasurementSample, MeasurementSample)>> {
        self.require(&[SyncState::Synchronized, SyncState::Draining])?;
        if self.drained == self.steps {
            return Ok(None);
        }
        if self.state == SyncState::Synchronized {
            self.transition(SyncState::Draining);
        }

        let timeout = self.fetch_timeout;
        let outcome = match self.sessions() {
            Ok((source, load)) => fetch_pair(source, load, timeout).await,
            Err(err) => Err(err),
        };
        let pair = self.supervise(outcome).await?;
        self.drained += 1;
        Ok(Some(pair))
    }

    /// Release both sessions and report the first teardown failure.
    pub async fn finish(&mut self) -> BenchResult<()> {
        self.require(&[
            SyncState::Configured,
            SyncState::LoadArmed,
            SyncState::SourceRunning,
            SyncState::Synchronized,
            SyncState::Draining,
        ])?;
        self.transition(SyncState::Idle);
        match self.guards.take() {
            Some((source, load)) => shutdown_all(vec![source, load]).await,
            None => Ok(()),
        }
    }

    /// Release both sessions best effort, swallowing teardown failures.
    pub async fn abandon(&mut self) {
        if let Some((source, load)) = self.guards.take() {
            recover_all(vec![source, load]).await;
        }
        self.transition(SyncState::Idle);
    }
}

async fn fetch_pair(
    source: &dyn DcPowerChannel,
    load: &dyn DcPowerChannel,
    timeout: Duration,
) -> BenchResult<(MeasurementSample, MeasurementSample)> {
    let source_sample = first(source, source.fetch_multiple(1, timeout).await?)?;
    let load_sample = first(load, load.fetch_multiple(1, timeout).await?)?;
    Ok((source_sample, load_sample))
}

fn first(
    channel: &dyn DcPowerChannel,
    samples: Vec<MeasurementSample>,
) -> BenchResult<MeasurementSample> {
    samples.into_iter().next().ok_or_else(|| {
        BenchError::Processing(format!(
            "'{}' returned an empty fetch",
            channel.resource_name()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulated::Call;
    use crate::hardware::{InstrumentDriver, SimulatedBench};
    use crate::measurement::configurator::{
        program_load_sequence, program_source_sequence, PowerBudget, StepTiming, SweepProgram,
    };
    use crate::procedures::supervisor::SessionGuard;

    const TIMEOUT: Duration = Duration::from_secs(10);

    async fn programmed(bench: &SimulatedBench, voltages: &[f64], currents: &[f64]) -> SynchronizedSweep {
        let source = SessionGuard::new("source", bench.open_dcpower("PPS", "0").await.unwrap());
        let load = SessionGuard::new("load", bench.open_dcpower("E-load", "0").await.unwrap());
        let program = SweepProgram::cartesian(
            voltages,
            currents,
            PowerBudget {
                current_limit: 25.0,
                power_ceiling: 300.0,
            },
            5.0,
        )
        .unwrap();
        let timing = StepTiming {
            source_delay: Duration::from_millis(5),
            aperture_time: Duration::from_millis(5),
        };
        program_source_sequence(source.session().unwrap(), &program.source, timing)
            .await
            .unwrap();
        program_load_sequence(
            load.session().unwrap(),
            &program.load,
            5.0,
            timing.aperture_time,
            ("PPS", "0"),
        )
        .await
        .unwrap();
        SynchronizedSweep::new(source, load, program.len(), TIMEOUT)
    }

    #[tokio::test]
    async fn drains_one_pair_per_step() {
        let bench = SimulatedBench::new();
        let mut sweep = programmed(&bench, &[6.0, 12.0], &[0.5, 1.0, 2.0]).await;
        sweep.run(TIMEOUT).await.unwrap();
        assert_eq!(sweep.state(), SyncState::Synchronized);

        let mut pairs = Vec::new();
        while let Some(pair) = sweep.next_pair().await.unwrap() {
            pairs.push(pair);
        }
        assert_eq!(pairs.len(), 6);
        assert_eq!(sweep.state(), SyncState::Draining);

        let source_voltages: Vec<f64> = pairs.iter().map(|(s, _)| s.voltage).collect();
        assert_eq!(source_voltages, vec![6.0, 6.0, 6.0, 12.0, 12.0, 12.0]);
        let load_currents: Vec<f64> = pairs.iter().map(|(_, l)| -l.current).collect();
        assert_eq!(load_currents, vec![0.5, 1.0, 2.0, 0.5, 1.0, 2.0]);

        sweep.finish().await.unwrap();
        assert_eq!(sweep.state(), SyncState::Idle);
        assert_eq!(bench.open_sessions(), 0);
    }

    #[tokio::test]
    async fn load_is_initiated_before_source() {
        let bench = SimulatedBench::new();
        let mut sweep = programmed(&bench, &[6.0], &[1.0]).await;
        sweep.run(TIMEOUT).await.unwrap();
        let load = bench.position("E-load", &Call::Initiate).unwrap();
        let source = bench.position("PPS", &Call::Initiate).unwrap();
        assert!(load < source);
        sweep.finish().await.unwrap();
    }

    #[tokio::test]
    async fn out_of_order_calls_are_rejected() {
        let bench = SimulatedBench::new();
        let mut sweep = programmed(&bench, &[6.0], &[1.0]).await;
        let err = sweep.start_source().await.unwrap_err();
        assert!(matches!(err, BenchError::InvalidState { .. }));
        assert!(matches!(
            sweep.next_pair().await,
            Err(BenchError::InvalidState { .. })
        ));
        // Nothing was initiated by the rejected calls.
        assert!(bench.position("PPS", &Call::Initiate).is_none());
        sweep.finish().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn completion_timeout_releases_both_sessions() {
        let bench = SimulatedBench::new();
        let mut sweep = programmed(&bench, &[6.0], &[1.0, 2.0]).await;
        // Source first: the load is not listening yet and misses every step.
        {
            let (source, _) = sweep.sessions().unwrap();
            source.initiate().await.unwrap();
        }
        sweep.arm_load().await.unwrap();
        sweep.state = SyncState::SourceRunning;

        let err = sweep.await_completion(TIMEOUT).await.unwrap_err();
        assert!(matches!(err, BenchError::HardwareTimeout(_)));
        assert_eq!(sweep.state(), SyncState::Idle);
        assert!(bench.calls("PPS").contains(&Call::Close));
        assert!(bench.calls("E-load").contains(&Call::Close));
        assert_eq!(bench.open_sessions(), 0);
    }
}

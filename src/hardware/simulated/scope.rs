//! Simulated oscilloscope channel session.

use super::faults::{ErrorConfig, Operation};
use super::journal::Call;
use super::state::{BenchState, ChannelKey};
use crate::error::{DriverError, DriverErrorKind};
use crate::hardware::capabilities::{
    DriverResult, EdgeTrigger, HorizontalTiming, ManagedSession, ScopeChannel, VerticalConfig,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_SAMPLE_RATE: f64 = 1.0e6;

/// Session on one simulated scope channel.
pub struct SimulatedScope {
    state: Arc<Mutex<BenchState>>,
    faults: ErrorConfig,
    key: ChannelKey,
    session: u64,
}

impl SimulatedScope {
    pub(crate) fn new(
        state: Arc<Mutex<BenchState>>,
        faults: ErrorConfig,
        key: ChannelKey,
        session: u64,
    ) -> Self {
        Self {
            state,
            faults,
            key,
            session,
        }
    }

    fn call<T>(
        &self,
        call: Call,
        operation: Operation,
        f: impl FnOnce(&mut BenchState) -> DriverResult<T>,
    ) -> DriverResult<T> {
        let mut state = self.state.lock();
        state.record(&self.key, call);
        self.faults.check_operation(&self.key.0, operation)?;
        f(&mut *state)
    }
}

#[async_trait]
impl ManagedSession for SimulatedScope {
    fn resource_name(&self) -> &str {
        &self.key.0
    }

    fn channel_name(&self) -> &str {
        &self.key.1
    }

    async fn abort(&self) -> DriverResult<()> {
        self.call(Call::Abort, Operation::Abort, |state| {
            state.scope_mut(&self.key, self.session, "abort")?.armed = false;
            Ok(())
        })
    }

    async fn reset(&self) -> DriverResult<()> {
        self.call(Call::Reset, Operation::Reset, |state| {
            let scope = state.scope_mut(&self.key, self.session, "reset")?;
            scope.vertical = None;
            scope.trigger = None;
            scope.horizontal = None;
            scope.armed = false;
            Ok(())
        })
    }

    async fn close(&self) -> DriverResult<()> {
        self.call(Call::Close, Operation::Close, |state| {
            let scope = state.scope_mut(&self.key, self.session, "close")?;
            scope.owner = None;
            scope.armed = false;
            Ok(())
        })
    }
}

#[async_trait]
impl ScopeChannel for SimulatedScope {
    async fn configure_vertical(&self, vertical: VerticalConfig) -> DriverResult<()> {
        self.call(Call::ConfigureVertical, Operation::Configure, |state| {
            state.scope_mut(&self.key, self.session, "configure_vertical")?.vertical =
                Some(vertical);
            Ok(())
        })
    }

    async fn configure_trigger(&self, trigger: EdgeTrigger) -> DriverResult<()> {
        self.call(Call::ConfigureTrigger, Operation::Configure, |state| {
            state.scope_mut(&self.key, self.session, "configure_trigger")?.trigger = Some(trigger);
            Ok(())
        })
    }

    async fn configure_horizontal(&self, timing: HorizontalTiming) -> DriverResult<()> {
        self.call(Call::ConfigureHorizontal, Operation::Configure, |state| {
            if timing.min_sample_rate <= 0.0 {
                return Err(DriverError::new(
                    &self.key.0,
                    "configure_horizontal",
                    DriverErrorKind::InvalidParameter,
                    "sample rate must be positive",
                ));
            }
            state.scope_mut(&self.key, self.session, "configure_horizontal")?.horizontal =
                Some(timing);
            Ok(())
        })
    }

    async fn sample_rate(&self) -> DriverResult<f64> {
        self.call(Call::SampleRate, Operation::Fetch, |state| {
            let scope = state.scope_mut(&self.key, self.session, "sample_rate")?;
            Ok(scope
                .horizontal
                .map(|timing| timing.min_sample_rate)
                .unwrap_or(DEFAULT_SAMPLE_RATE))
        })
    }

    async fn initiate(&self) -> DriverResult<()> {
        self.call(Call::Initiate, Operation::Initiate, |state| {
            state.scope_mut(&self.key, self.session, "initiate")?.armed = true;
            Ok(())
        })
    }

    async fn fetch(&self, num_samples: usize, timeout: Duration) -> DriverResult<Vec<f64>> {
        let waveform = self.call(Call::FetchWaveform(num_samples), Operation::Fetch, |state| {
            let scope = state.scope_mut(&self.key, self.session, "fetch")?;
            if !scope.armed {
                return Ok(None);
            }
            let rate = scope
                .horizontal
                .map(|timing| timing.min_sample_rate)
                .unwrap_or(DEFAULT_SAMPLE_RATE);
            Ok(Some(state.scope_samples(&self.key, num_samples, rate)))
        })?;

        match waveform {
            Some(samples) => Ok(samples),
            None => {
                tokio::time::sleep(timeout).await;
                Err(DriverError::new(
                    &self.key.0,
                    "fetch",
                    DriverErrorKind::Timeout,
                    "acquisition was not initiated",
                ))
            }
        }
    }
}

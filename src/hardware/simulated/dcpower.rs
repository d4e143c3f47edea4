//! Simulated source-measure channel session.

use super::faults::{ErrorConfig, Operation};
use super::journal::Call;
use super::state::{AdvancedStep, BenchState, ChannelKey, BACKLOG_CHUNK};
use crate::error::{DriverError, DriverErrorKind};
use crate::hardware::capabilities::{
    DcPowerChannel, DcPowerEvent, DcPowerSetting, DriverResult, ManagedSession, MeasurementSample,
    SequenceProperty,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Session on one simulated source-measure channel.
pub struct SimulatedDcPower {
    state: Arc<Mutex<BenchState>>,
    faults: ErrorConfig,
    key: ChannelKey,
    session: u64,
}

impl SimulatedDcPower {
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

    /// Journal `call`, apply fault injection, then run `f` under the bench lock.
    fn call<T>(
        &self,
        call: Call,
        operation: Operation,
        f: impl FnOnce(&mut BenchState) -> DriverResult<T>,
    ) -> DriverResult<T> {
        let mut state = self.state.lock();
        trace!(resource = %self.key.0, channel = %self.key.1, ?call, "simulated call");
        state.record(&self.key, call);
        self.faults.check_operation(&self.key.0, operation)?;
        f(&mut *state)
    }

    fn timeout(&self, operation: &str, message: String) -> DriverError {
        DriverError::new(&self.key.0, operation, DriverErrorKind::Timeout, message)
    }
}

#[async_trait]
impl ManagedSession for SimulatedDcPower {
    fn resource_name(&self) -> &str {
        &self.key.0
    }

    fn channel_name(&self) -> &str {
        &self.key.1
    }

    async fn abort(&self) -> DriverResult<()> {
        self.call(Call::Abort, Operation::Abort, |state| {
            state.abort_channel(&self.key, self.session)
        })
    }

    async fn disable_output(&self) -> DriverResult<()> {
        self.call(Call::DisableOutput, Operation::DisableOutput, |state| {
            state.apply_setting(&self.key, self.session, DcPowerSetting::OutputEnabled(false))
        })
    }

    async fn reset(&self) -> DriverResult<()> {
        self.call(Call::Reset, Operation::Reset, |state| {
            state.reset_channel(&self.key, self.session)
        })
    }

    async fn close(&self) -> DriverResult<()> {
        self.call(Call::Close, Operation::Close, |state| {
            let channel = state.channel_mut(&self.key, self.session, "close")?;
            channel.owner = None;
            channel.running = false;
            Ok(())
        })
    }
}

#[async_trait]
impl DcPowerChannel for SimulatedDcPower {
    async fn configure(&self, setting: DcPowerSetting) -> DriverResult<()> {
        self.call(
            Call::Configure(setting.clone()),
            Operation::Configure,
            |state| state.apply_setting(&self.key, self.session, setting),
        )
    }

    async fn create_advanced_sequence(
        &self,
        name: &str,
        properties: &[SequenceProperty],
    ) -> DriverResult<()> {
        self.call(
            Call::CreateAdvancedSequence(name.to_string()),
            Operation::Configure,
            |state| {
                let channel = state.channel_mut(&self.key, self.session, "create_advanced_sequence")?;
                channel.advanced_properties = properties.to_vec();
                channel.advanced_steps.clear();
                Ok(())
            },
        )
    }

    async fn create_advanced_sequence_step(&self) -> DriverResult<()> {
        self.call(Call::CreateAdvancedSequenceStep, Operation::Configure, |state| {
            let channel =
                state.channel_mut(&self.key, self.session, "create_advanced_sequence_step")?;
            if channel.advanced_properties.is_empty() {
                return Err(DriverError::new(
                    &self.key.0,
                    "create_advanced_sequence_step",
                    DriverErrorKind::Configuration,
                    "no advanced sequence is active",
                ));
            }
            channel.advanced_steps.push(AdvancedStep::default());
            Ok(())
        })
    }

    async fn set_sequence(&self, levels: &[f64], source_delays: &[Duration]) -> DriverResult<()> {
        self.call(
            Call::SetSequence(levels.to_vec()),
            Operation::Configure,
            |state| {
                if levels.len() != source_delays.len() {
                    return Err(DriverError::new(
                        &self.key.0,
                        "set_sequence",
                        DriverErrorKind::InvalidParameter,
                        format!(
                            "{} levels but {} source delays",
                            levels.len(),
                            source_delays.len()
                        ),
                    ));
                }
                let channel = state.channel_mut(&self.key, self.session, "set_sequence")?;
                channel.sequence = levels.to_vec();
                Ok(())
            },
        )
    }

    async fn commit(&self) -> DriverResult<()> {
        self.call(Call::Commit, Operation::Commit, |state| {
            state.commit(&self.key, self.session)
        })
    }

    async fn initiate(&self) -> DriverResult<()> {
        self.call(Call::Initiate, Operation::Initiate, |state| {
            state.initiate(&self.key, self.session)
        })
    }

    async fn wait_for_event(&self, event: DcPowerEvent, timeout: Duration) -> DriverResult<()> {
        let stalled = self.faults.events_stalled(&self.key.0);
        let signalled = self.call(Call::WaitForEvent(event), Operation::WaitForEvent, |state| {
            let channel = state.channel_mut(&self.key, self.session, "wait_for_event")?;
            Ok(!stalled && channel.events.remove(&event))
        })?;
        if signalled {
            return Ok(());
        }

        // Nothing left to run on the bench, so the event can no longer fire.
        tokio::time::sleep(timeout).await;
        Err(self.timeout(
            "wait_for_event",
            format!("{:?} not signalled within {:?}", event, timeout),
        ))
    }

    async fn fetch_multiple(
        &self,
        count: usize,
        timeout: Duration,
    ) -> DriverResult<Vec<MeasurementSample>> {
        let fetched = self.call(Call::FetchMultiple(count), Operation::Fetch, |state| {
            state.drain(&self.key, self.session, count)
        })?;
        match fetched {
            Some(samples) => Ok(samples),
            None => {
                tokio::time::sleep(timeout).await;
                Err(self.timeout(
                    "fetch_multiple",
                    format!("{} samples not acquired within {:?}", count, timeout),
                ))
            }
        }
    }

    async fn measure_multiple(&self) -> DriverResult<Vec<MeasurementSample>> {
        self.call(Call::MeasureMultiple, Operation::Fetch, |state| {
            let channel = state.channel_mut(&self.key, self.session, "measure_multiple")?;
            if !channel.running {
                return Err(DriverError::new(
                    &self.key.0,
                    "measure_multiple",
                    DriverErrorKind::Configuration,
                    "channel must be initiated before measuring",
                ));
            }
            Ok(vec![state.sample(&self.key)])
        })
    }

    async fn fetch_backlog(&self) -> DriverResult<usize> {
        self.call(Call::FetchBacklog, Operation::Fetch, |state| {
            let channel = state.channel_mut(&self.key, self.session, "fetch_backlog")?;
            Ok(channel.buffer.len().min(BACKLOG_CHUNK))
        })
    }

    async fn measure_record_delta_time(&self) -> DriverResult<Duration> {
        self.call(Call::MeasureRecordDeltaTime, Operation::Fetch, |state| {
            let channel = state.channel_mut(&self.key, self.session, "measure_record_delta_time")?;
            Ok(channel.settings.aperture_time)
        })
    }
}

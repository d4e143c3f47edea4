//! `PowerOn` and `PowerOff` modes, shared by every bench test.

use super::supervisor::{finish, recover_all, release_all, DcPowerGuard, SessionGuard, TeardownStage};
use super::{ChannelAddress, Checks};
use crate::error::BenchResult;
use crate::hardware::capabilities::{
    DcPowerSetting, InstrumentDriver, MeasureWhen, MeasurementSample, OutputFunction, Sense,
    SourceMode,
};
use crate::measurement::configurator::{apply, measure_on_demand};
use crate::sweep::truncate_decimals;
use tracing::info;

/// Open a source-measure channel under a guard labelled `role`.
pub async fn open_guarded(
    driver: &dyn InstrumentDriver,
    role: &str,
    address: &ChannelAddress,
) -> BenchResult<DcPowerGuard> {
    let session = driver
        .open_dcpower(&address.resource, &address.channel)
        .await?;
    Ok(SessionGuard::new(role, session))
}

/// Open the source, then the load. A failed second open releases the first.
pub async fn open_pair(
    driver: &dyn InstrumentDriver,
    source: &ChannelAddress,
    load: &ChannelAddress,
) -> BenchResult<(DcPowerGuard, DcPowerGuard)> {
    let source = open_guarded(driver, "source", source).await?;
    match open_guarded(driver, "load", load).await {
        Ok(load) => Ok((source, load)),
        Err(err) => {
            recover_all(vec![source]).await;
            Err(err)
        }
    }
}

/// Energize the source once, read back its level, then de-energize and close.
///
/// Used to check that the DUT is present and draws a sane current.
pub async fn power_on(
    driver: &dyn InstrumentDriver,
    source: &ChannelAddress,
    voltage: f64,
    current_limit: f64,
) -> BenchResult<MeasurementSample> {
    Checks::new("power_on")
        .channel("source", source)
        .positive("voltage", voltage)
        .positive("current_limit", current_limit)
        .finish()?;
    let guard = open_guarded(driver, "source", source).await?;
    let outcome = async {
        let channel = guard.session()?;
        apply(
            channel,
            [
                DcPowerSetting::Sense(Sense::Remote),
                DcPowerSetting::SourceMode(SourceMode::SinglePoint),
                DcPowerSetting::OutputFunction(OutputFunction::DcVoltage),
                DcPowerSetting::VoltageLevelAutorange(true),
                DcPowerSetting::CurrentLimitAutorange(true),
                DcPowerSetting::CurrentLimit(current_limit),
                DcPowerSetting::VoltageLevel(voltage),
            ],
        )
        .await?;
        channel.commit().await?;
        channel
            .configure(DcPowerSetting::MeasureWhen(MeasureWhen::OnDemand))
            .await?;
        measure_on_demand(channel).await
    }
    .await;

    let sample = finish(vec![guard], outcome).await?;
    info!(
        source = %source,
        voltage = sample.voltage,
        current = sample.current,
        "DUT powered on"
    );
    Ok(sample)
}

/// Disable, reset and close the load and the source, whatever they were doing.
pub async fn power_off(
    driver: &dyn InstrumentDriver,
    source: &ChannelAddress,
    load: &ChannelAddress,
) -> BenchResult<()> {
    let load_guard = open_guarded(driver, "load", load).await?;
    let source_guard = match open_guarded(driver, "source", source).await {
        Ok(guard) => guard,
        Err(err) => {
            recover_all(vec![load_guard]).await;
            return Err(err);
        }
    };
    release_all(
        vec![load_guard, source_guard],
        &[
            TeardownStage::DisableOutput,
            TeardownStage::Reset,
            TeardownStage::Close,
        ],
    )
    .await?;
    info!(source = %source, load = %load, "DUT powered off");
    Ok(())
}

/// Status line reported after `PowerOn`, levels truncated to 3 decimals.
pub fn power_on_status(sample: &MeasurementSample) -> String {
    format!(
        "The DUT is powered ON\nVoltage Level: {:?}\nCurrent Level: {:?}",
        truncate_decimals(sample.voltage, 3),
        truncate_decimals(sample.current, 3)
    )
}

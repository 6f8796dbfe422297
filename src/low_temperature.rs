//! Low-temperature handling.
//!
//! A background task samples the configured IEB temperature sensor and
//! switches the array between three regimes: normal, cold (reduced
//! motor RPM), and very cold (reduced RPM plus raised holding current
//! so the arms do not sag). Mode changes are pushed exactly on the
//! regime edges; a failed sensor read parks the array in
//! TEMPERATURE_UNKNOWN and keeps retrying silently.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use canopus_proto::{data, CommandId, FpsStatus};

use crate::command::CommandData;
use crate::error::FpsError;
use crate::fps::{Fps, SendOptions, WeakFps};
use crate::ieb::read_temperature;

pub(crate) fn spawn(fps: &Fps) -> JoinHandle<()> {
    let weak = fps.downgrade();
    tokio::spawn(run(weak))
}

async fn run(weak: WeakFps) {
    loop {
        let Some(fps) = weak.upgrade() else {
            break;
        };

        let interval = fps.config().low_temperature.interval;
        tick(&fps).await;
        drop(fps);

        tokio::time::sleep(Duration::from_secs_f64(interval)).await;
    }
}

async fn set_rpm(fps: &Fps, cold: bool) {
    let low_temperature = fps.config().low_temperature;
    let rpm = if cold {
        warn!(rpm = low_temperature.rpm_cold, "low temperature mode; setting RPM");
        low_temperature.rpm_cold
    } else {
        warn!(
            rpm = low_temperature.rpm_normal,
            "disabling low temperature mode; setting RPM"
        );
        low_temperature.rpm_normal
    };

    fps.set_motor_speed(rpm);
}

async fn set_holding_current(fps: &Fps, very_cold: bool) -> Result<(), FpsError> {
    let low_temperature = fps.config().low_temperature;
    let (alpha, beta) = if very_cold {
        warn!("very low temperature mode; raising the holding current");
        low_temperature.holding_torque_very_cold
    } else {
        warn!("disabling very low temperature mode; restoring the holding current");
        low_temperature.holding_torque_normal
    };

    let data = data::motor_pair_data(alpha, beta).map_err(crate::error::CommandError::from)?;

    // Addressed to every non-disabled positioner; the firmware does not
    // accept this command as a broadcast.
    let command = fps
        .send_command(
            CommandId::SetHoldingCurrent,
            SendOptions::default().data(CommandData::Single(data)),
        )
        .await?;
    command.wait().await;

    Ok(())
}

async fn tick(fps: &Fps) {
    let config = fps.config().low_temperature;

    let temperature = match fps.ieb().filter(|bank| !bank.disabled()) {
        Some(bank) => read_temperature(&bank, &config.sensor).await,
        None => Err(crate::ieb::DeviceError::Disabled),
    };

    let status = fps.status();
    let base = status & !FpsStatus::TEMPERATURE_BITS;

    let temperature = match temperature {
        Ok(temperature) => temperature,
        Err(err) => {
            warn!(
                sensor = %config.sensor,
                %err,
                "cannot read the temperature sensor; low-temperature tracking disabled until it recovers"
            );
            fps.set_status(base | FpsStatus::TEMPERATURE_UNKNOWN);
            return;
        }
    };

    let result: Result<(), FpsError> = async {
        if temperature <= config.very_cold_threshold {
            if status.contains(FpsStatus::TEMPERATURE_NORMAL) {
                set_rpm(fps, true).await;
                set_holding_current(fps, true).await?;
            } else if status.contains(FpsStatus::TEMPERATURE_COLD) {
                set_holding_current(fps, true).await?;
            }
            fps.set_status(base | FpsStatus::TEMPERATURE_VERY_COLD);
        } else if temperature <= config.cold_threshold {
            if status.contains(FpsStatus::TEMPERATURE_NORMAL) {
                set_rpm(fps, true).await;
            } else if status.contains(FpsStatus::TEMPERATURE_VERY_COLD)
                || status.contains(FpsStatus::TEMPERATURE_UNKNOWN)
            {
                set_holding_current(fps, false).await?;
            }
            fps.set_status(base | FpsStatus::TEMPERATURE_COLD);
        } else {
            if status.contains(FpsStatus::TEMPERATURE_COLD) {
                set_rpm(fps, false).await;
            } else if status.contains(FpsStatus::TEMPERATURE_VERY_COLD)
                || status.contains(FpsStatus::TEMPERATURE_UNKNOWN)
            {
                set_rpm(fps, false).await;
                set_holding_current(fps, false).await?;
            }
            fps.set_status(base | FpsStatus::TEMPERATURE_NORMAL);
        }
        Ok(())
    }
    .await;

    if let Err(err) = result {
        warn!(%err, "could not push a low-temperature mode change");
    }
}

//! Temperature-driven mode changes.

mod common;

use std::time::Duration;

use canopus::proto::{CommandId, FpsStatus};

#[tokio::test(start_paused = true)]
async fn cold_transitions_switch_rpm_exactly_once() {
    let rig = common::setup(
        &[4, 5],
        |config| {
            config.low_temperature.interval = 10.0;
            config.low_temperature.cold_threshold = 0.0;
            config.low_temperature.very_cold_threshold = -10.0;
            config.low_temperature.rpm_cold = 1000.0;
            config.low_temperature.rpm_normal = 2000.0;
        },
        canopus::InitialiseOptions::default(),
    )
    .await;

    assert!(rig.fps.status().contains(FpsStatus::TEMPERATURE_NORMAL));
    assert_eq!(rig.fps.config().positioner.motor_speed, 2000.0);

    // Drop just below the cold threshold.
    rig.ieb.set_temperature("rtd2", -1.0);
    tokio::time::sleep(Duration::from_secs(15)).await;

    assert!(rig.fps.status().contains(FpsStatus::TEMPERATURE_COLD));
    assert_eq!(rig.fps.config().positioner.motor_speed, 1000.0);

    // Staying cold must not re-apply the mode change: a manual value
    // survives further ticks at the same temperature.
    rig.fps.set_motor_speed(1234.0);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(rig.fps.config().positioner.motor_speed, 1234.0);

    // Warming up restores the normal speed exactly once.
    rig.ieb.set_temperature("rtd2", 15.0);
    tokio::time::sleep(Duration::from_secs(15)).await;

    assert!(rig.fps.status().contains(FpsStatus::TEMPERATURE_NORMAL));
    assert_eq!(rig.fps.config().positioner.motor_speed, 2000.0);

    rig.fps.set_motor_speed(4321.0);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(rig.fps.config().positioner.motor_speed, 4321.0);

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn very_cold_raises_the_holding_current() {
    let rig = common::setup(
        &[4],
        |config| {
            config.low_temperature.interval = 10.0;
        },
        canopus::InitialiseOptions::default(),
    )
    .await;

    // The holding-current command goes to each positioner, never to the
    // broadcast id.
    let holding_commands = |rig: &common::TestRig| {
        rig.firmware
            .commands_seen()
            .into_iter()
            .filter(|&(pid, id)| pid != 0 && id == CommandId::SetHoldingCurrent)
            .count()
    };
    let baseline = holding_commands(&rig);

    rig.ieb.set_temperature("rtd2", -20.0);
    tokio::time::sleep(Duration::from_secs(15)).await;

    assert!(rig.fps.status().contains(FpsStatus::TEMPERATURE_VERY_COLD));
    assert_eq!(rig.fps.config().positioner.motor_speed, 1000.0);
    assert_eq!(holding_commands(&rig), baseline + 1);

    // Back to normal restores speed and holding current.
    rig.ieb.set_temperature("rtd2", 15.0);
    tokio::time::sleep(Duration::from_secs(15)).await;

    assert!(rig.fps.status().contains(FpsStatus::TEMPERATURE_NORMAL));
    assert_eq!(rig.fps.config().positioner.motor_speed, 2000.0);
    assert_eq!(holding_commands(&rig), baseline + 2);

    assert!(!rig
        .firmware
        .commands_seen()
        .iter()
        .any(|&(pid, id)| pid == 0 && id == CommandId::SetHoldingCurrent));

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sensor_failure_parks_in_unknown_and_recovers() {
    let rig = common::setup(
        &[4],
        |config| {
            config.low_temperature.interval = 10.0;
            config.low_temperature.sensor = "rtd9".to_string();
        },
        canopus::InitialiseOptions::default(),
    )
    .await;

    // The sensor does not exist; the first tick parks the status.
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(rig.fps.status().contains(FpsStatus::TEMPERATURE_UNKNOWN));

    // When the device appears the monitor recovers silently.
    rig.ieb.set_temperature("rtd9", 12.0);
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(rig.fps.status().contains(FpsStatus::TEMPERATURE_NORMAL));

    rig.fps.shutdown().await;
}

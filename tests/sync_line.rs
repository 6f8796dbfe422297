//! Hardware sync-line start semantics.

mod common;

use canopus::ieb::DeviceValue;
use canopus::proto::CommandId;
use canopus::trajectory::{send_trajectory, ArmPath, TrajectoryOptions};
use canopus::TrajectoryData;

#[tokio::test(start_paused = true)]
async fn sync_line_pulses_once_and_start_is_not_broadcast() {
    let rig = common::setup(
        &[4],
        |config| {
            config.fps.use_sync_line = true;
        },
        canopus::InitialiseOptions {
            enable_low_temperature: false,
            ..Default::default()
        },
    )
    .await;

    // Closing the relay is what starts the loaded trajectories.
    let firmware = rig.firmware.clone();
    rig.ieb.set_on_sync_close(move || firmware.trigger_sync());

    // The relay must be open before the start.
    let sync = rig.fps.sync_line().expect("IEB connected");
    assert!(!sync.is_closed().await.unwrap());

    let mut data = TrajectoryData::new();
    data.insert(
        4,
        ArmPath {
            alpha: vec![(0.0, 0.1), (20.0, 2.0)],
            beta: vec![(180.0, 0.1), (170.0, 2.0)],
        },
    );

    let trajectory = send_trajectory(&rig.fps, data, TrajectoryOptions::default())
        .await
        .expect("sync-line trajectory should complete");
    assert!(!trajectory.failed);

    // Exactly one close, released within a second.
    let sync_writes: Vec<DeviceValue> = rig
        .ieb
        .write_history()
        .into_iter()
        .filter_map(|(device, value)| (device == "sync").then_some(value))
        .collect();
    assert_eq!(
        sync_writes,
        vec![DeviceValue::Relay(true), DeviceValue::Relay(false)]
    );
    assert!(!sync.is_closed().await.unwrap());

    // No START_TRAJECTORY broadcast went over the bus.
    assert!(!rig
        .firmware
        .commands_seen()
        .iter()
        .any(|&(_, id)| id == CommandId::StartTrajectory));

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sync_line_start_refuses_a_high_line() {
    let rig = common::setup(
        &[4],
        |config| {
            config.fps.use_sync_line = true;
        },
        canopus::InitialiseOptions {
            enable_low_temperature: false,
            ..Default::default()
        },
    )
    .await;

    rig.fps.sync_line().unwrap().close().await.unwrap();

    let mut data = TrajectoryData::new();
    data.insert(
        4,
        ArmPath {
            alpha: vec![(0.0, 0.1), (20.0, 2.0)],
            beta: vec![(180.0, 0.1), (170.0, 2.0)],
        },
    );

    assert!(send_trajectory(&rig.fps, data, TrajectoryOptions::default())
        .await
        .is_err());

    rig.fps.shutdown().await;
}

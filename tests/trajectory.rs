//! Trajectory engine: preconditions, safe mode, execution, journal.

mod common;

use std::collections::HashMap;

use canopus::config::SafeMode;
use canopus::error::FailureKind;
use canopus::proto::{FpsStatus, PositionerStatus, ResponseCode};
use canopus::testing::default_status;
use canopus::trajectory::{send_trajectory, ArmPath, DumpMode, TrajectoryOptions};
use canopus::{CommandData, TrajectoryData};
use canopus_proto::CommandId;

fn two_point_path(alpha: (f64, f64), beta: (f64, f64), time: f64) -> ArmPath {
    ArmPath {
        alpha: vec![(alpha.0, 0.1), (alpha.1, time)],
        beta: vec![(beta.0, 0.1), (beta.1, time)],
    }
}

#[tokio::test(start_paused = true)]
async fn trajectory_runs_to_completion_and_journals() -> anyhow::Result<()> {
    let dump_dir = tempfile::tempdir()?;
    let dump_path = dump_dir.path().to_path_buf();

    let rig = common::setup(
        &[4, 5],
        |config| {
            config.positioner.trajectory_dump_path = dump_path.clone();
        },
        canopus::InitialiseOptions {
            enable_low_temperature: false,
            ..Default::default()
        },
    )
    .await;

    let mut data = TrajectoryData::new();
    data.insert(4, two_point_path((0.0, 20.0), (180.0, 170.0), 3.0));
    data.insert(5, two_point_path((0.0, 15.0), (180.0, 175.0), 4.0));

    let trajectory = send_trajectory(&rig.fps, data, TrajectoryOptions::default())
        .await
        .expect("trajectory should complete");

    assert!(!trajectory.failed);
    assert_eq!(trajectory.move_time, Some(4.0));

    // The array never stays MOVING after a trajectory.
    assert!(rig.fps.status().contains(FpsStatus::IDLE));

    let positioner = rig.fps.positioner(4).unwrap();
    let (alpha, beta) = positioner.position().unwrap();
    assert!((alpha - 20.0).abs() <= 0.1);
    assert!((beta - 170.0).abs() <= 0.1);

    // The journal records the run.
    let dump_file = trajectory.dump_file().expect("journalling enabled");
    let record: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(dump_file)?)?;
    assert_eq!(record["success"], serde_json::Value::Bool(true));
    assert_eq!(record["use_sync_line"], serde_json::Value::Bool(false));
    assert!(record["trajectory"]["4"]["alpha"].is_array());

    rig.fps.shutdown().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn not_ready_positioner_fails_the_preconditions() {
    let rig = common::setup_default(&[4, 5]).await;

    // Positioner 5 lost its beta datum.
    rig.firmware
        .set_status(5, default_status() - PositionerStatus::DATUM_BETA_INITIALIZED);

    let mut data = TrajectoryData::new();
    data.insert(4, two_point_path((0.0, 20.0), (180.0, 170.0), 3.0));
    data.insert(5, two_point_path((0.0, 15.0), (180.0, 175.0), 3.0));

    let err = send_trajectory(&rig.fps, data, TrajectoryOptions::default())
        .await
        .expect_err("preconditions must fail");

    assert_eq!(err.failed_positioners.get(&5), Some(&FailureKind::NotReady));
    assert!(err.failed_positioners.get(&4).is_none());

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn safe_mode_rejects_low_beta() {
    let rig = common::setup(
        &[4],
        |config| {
            config.safe_mode = SafeMode::MinBeta { min_beta: 160.0 };
        },
        canopus::InitialiseOptions {
            enable_low_temperature: false,
            ..Default::default()
        },
    )
    .await;

    let mut data = TrajectoryData::new();
    data.insert(
        4,
        ArmPath {
            alpha: vec![(0.0, 0.1), (20.0, 3.0)],
            beta: vec![(180.0, 0.1), (150.0, 3.0)],
        },
    );

    let err = send_trajectory(&rig.fps, data, TrajectoryOptions::default())
        .await
        .expect_err("safe mode must reject beta below the minimum");

    assert_eq!(err.failed_positioners.get(&4), Some(&FailureKind::SafeMode));

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn missing_arm_data_is_rejected() {
    let rig = common::setup_default(&[4]).await;

    let mut data = TrajectoryData::new();
    data.insert(
        4,
        ArmPath {
            alpha: vec![(0.0, 0.1), (20.0, 3.0)],
            beta: Vec::new(),
        },
    );

    let err = send_trajectory(&rig.fps, data, TrajectoryOptions::default())
        .await
        .expect_err("an empty arm list is invalid");
    assert_eq!(err.failed_positioners.get(&4), Some(&FailureKind::NoData));

    // Decreasing time samples are invalid too.
    let mut data = TrajectoryData::new();
    data.insert(
        4,
        ArmPath {
            alpha: vec![(0.0, 3.0), (20.0, 1.0)],
            beta: vec![(180.0, 0.1), (170.0, 3.0)],
        },
    );
    let err = send_trajectory(&rig.fps, data, TrajectoryOptions::default())
        .await
        .expect_err("time samples must be non-decreasing");
    assert_eq!(
        err.failed_positioners.get(&4),
        Some(&FailureKind::Response(ResponseCode::ValueOutOfRange))
    );

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_trajectory_reply_fails_the_send() {
    let rig = common::setup_default(&[4]).await;

    rig.firmware.set_response_override(
        4,
        CommandId::TrajectoryDataEnd,
        ResponseCode::InvalidTrajectory,
    );

    let mut data = TrajectoryData::new();
    data.insert(4, two_point_path((0.0, 20.0), (180.0, 170.0), 3.0));

    let err = send_trajectory(&rig.fps, data, TrajectoryOptions::default())
        .await
        .expect_err("INVALID_TRAJECTORY must fail the transmission");

    assert_eq!(
        err.failed_positioners.get(&4),
        Some(&FailureKind::Response(ResponseCode::InvalidTrajectory))
    );

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn trajectory_must_start_from_the_current_position() {
    let rig = common::setup_default(&[4]).await;

    // The robot is parked at (0, 180); this path begins at (40, 170).
    let mut data = TrajectoryData::new();
    data.insert(4, two_point_path((40.0, 60.0), (170.0, 165.0), 3.0));

    let err = send_trajectory(&rig.fps, data, TrajectoryOptions::default())
        .await
        .expect_err("a path starting away from the robot must be refused");
    assert_eq!(err.failed_positioners.get(&4), Some(&FailureKind::NotReady));

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cowboy_goto_uses_the_trajectory_engine() {
    let rig = common::setup_default(&[4, 5]).await;

    let trajectory = rig
        .fps
        .goto(
            HashMap::from([(4, (30.0, 170.0)), (5, (10.0, 175.0))]),
            canopus::GotoOptions {
                go_cowboy: true,
                speed: Some(2000.0),
                ..Default::default()
            },
        )
        .await
        .expect("cowboy goto should complete");

    assert!(!trajectory.failed);
    assert!(rig.fps.status().contains(FpsStatus::IDLE));

    let (alpha, beta) = rig.fps.positioner(4).unwrap().position().unwrap();
    assert!((alpha - 30.0).abs() <= 0.1);
    assert!((beta - 170.0).abs() <= 0.1);

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stop_trajectory_is_idempotent() {
    let rig = common::setup_default(&[4]).await;

    rig.fps.stop_trajectory(false).await.unwrap();
    let status_after_first = rig.fps.status();

    rig.fps.stop_trajectory(false).await.unwrap();
    rig.fps.stop_trajectory(true).await.unwrap();

    rig.fps
        .update_status(None, std::time::Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(rig.fps.status(), status_after_first);

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disabled_positioner_cannot_be_in_a_trajectory() {
    let rig = common::setup_default(&[4, 5]).await;
    rig.fps.positioner(5).unwrap().set_disabled(true);

    let mut data = TrajectoryData::new();
    data.insert(5, two_point_path((0.0, 20.0), (180.0, 170.0), 3.0));

    assert!(send_trajectory(&rig.fps, data, TrajectoryOptions::default())
        .await
        .is_err());

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn chunked_streaming_sends_every_point() {
    // 25 points per arm with 10-point chunks exercises the chunk loop.
    let rig = common::setup(
        &[4],
        |config| {
            config.positioner.trajectory_data_n_points = 10;
        },
        canopus::InitialiseOptions {
            enable_low_temperature: false,
            ..Default::default()
        },
    )
    .await;

    let alpha: Vec<(f64, f64)> = (0..25).map(|i| (i as f64, 0.1 + i as f64 * 0.1)).collect();
    let beta: Vec<(f64, f64)> = (0..25)
        .map(|i| (180.0 - i as f64 * 0.2, 0.1 + i as f64 * 0.1))
        .collect();

    let mut data = TrajectoryData::new();
    data.insert(4, ArmPath { alpha, beta });

    let trajectory = send_trajectory(
        &rig.fps,
        data,
        TrajectoryOptions {
            dump: DumpMode::Disabled,
            ..Default::default()
        },
    )
    .await
    .expect("a chunked trajectory should complete");

    assert_eq!(trajectory.n_points[&4], (25, 25));

    // 3 chunks per arm.
    let data_commands = rig
        .firmware
        .commands_seen()
        .into_iter()
        .filter(|&(_, id)| id == CommandId::SendTrajectoryData)
        .count();
    assert_eq!(data_commands, 50);

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn holding_current_addresses_each_positioner() {
    // SET_HOLDING_CURRENT is what the low-temperature monitor relies
    // on; the firmware refuses it as a broadcast, so the default send
    // path must address every non-disabled positioner individually.
    let rig = common::setup_default(&[4, 5]).await;

    let payload = canopus::proto::data::motor_pair_data(30.0, 30.0).unwrap();
    let command = rig
        .fps
        .send_command(
            CommandId::SetHoldingCurrent,
            canopus::SendOptions::default().data(CommandData::Single(payload)),
        )
        .await
        .unwrap();

    command.result().await.expect("both positioners accept");
    assert_eq!(command.replies().len(), 2);

    let targets: Vec<u16> = rig
        .firmware
        .commands_seen()
        .into_iter()
        .filter(|&(_, id)| id == CommandId::SetHoldingCurrent)
        .map(|(pid, _)| pid)
        .collect();
    assert_eq!(targets, vec![4, 5]);

    rig.fps.shutdown().await;
}

//! Supervisor initialisation and bookkeeping.

mod common;

use std::collections::HashMap;

use canopus::fps::{Fps, InitialiseOptions};
use canopus::proto::FpsStatus;

#[tokio::test(start_paused = true)]
async fn initialise_finds_the_array_and_is_idempotent() {
    let rig = common::setup_default(&[1, 2, 3, 4]).await;

    assert_eq!(rig.fps.positioner_ids(), vec![1, 2, 3, 4]);
    assert!(rig.fps.initialised());
    assert!(rig.fps.status().contains(FpsStatus::IDLE));

    let firmware: HashMap<u16, Option<String>> = rig
        .fps
        .positioners()
        .iter()
        .map(|p| (p.positioner_id(), p.firmware()))
        .collect();
    assert_eq!(firmware[&1].as_deref(), Some("04.01.21"));

    // A second initialise reports the same layout and firmware.
    rig.fps
        .initialise(InitialiseOptions {
            enable_low_temperature: false,
            ..Default::default()
        })
        .await
        .expect("re-initialise should succeed");

    assert_eq!(rig.fps.positioner_ids(), vec![1, 2, 3, 4]);
    let firmware_again: HashMap<u16, Option<String>> = rig
        .fps
        .positioners()
        .iter()
        .map(|p| (p.positioner_id(), p.firmware()))
        .collect();
    assert_eq!(firmware, firmware_again);

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn configured_disabled_and_offline_positioners_are_applied() {
    let rig = common::setup(
        &[1, 2, 3],
        |config| {
            config.fps.disabled_positioners = vec![2];
            config.fps.offline_positioners = HashMap::from([(9, (3.5, 178.0))]);
        },
        InitialiseOptions {
            enable_low_temperature: false,
            ..Default::default()
        },
    )
    .await;

    assert_eq!(rig.fps.positioner_ids(), vec![1, 2, 3, 9]);

    let disabled = rig.fps.positioner(2).unwrap();
    assert!(disabled.disabled());
    assert!(!disabled.offline());

    let offline = rig.fps.positioner(9).unwrap();
    assert!(offline.offline());
    assert!(offline.disabled());
    assert_eq!(offline.position(), Some((3.5, 178.0)));

    // Offline robots are not counted as repliers.
    assert_eq!(rig.fps.online_count(), 3);

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disabled_set_is_kept_across_initialisations() {
    let rig = common::setup_default(&[1, 2]).await;

    rig.fps.positioner(2).unwrap().set_disabled(true);

    rig.fps
        .initialise(InitialiseOptions {
            enable_low_temperature: false,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(rig.fps.positioner(2).unwrap().disabled());

    // Dropping the sticky set brings the robot back.
    rig.fps
        .initialise(InitialiseOptions {
            enable_low_temperature: false,
            keep_disabled: false,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(!rig.fps.positioner(2).unwrap().disabled());

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn fibre_assignment_mismatches_can_be_fatal() {
    use canopus::can::BusInterface;
    use canopus::testing::VirtualFirmware;

    let mut config = common::test_config();
    config.fps.expected_positioners = vec![1, 2, 3];

    let fps = Fps::new(config.clone(), None);
    fps.start_can(None).await.unwrap();

    let bus = fps.can().unwrap().interface(0).unwrap();
    let _firmware = match bus.as_ref() {
        BusInterface::Virtual(virtual_bus) => VirtualFirmware::start(
            virtual_bus,
            &[1, 2],
            config.can.uid_bits,
            config.positioner.motor_steps,
            config.positioner.time_step,
        ),
        _ => unreachable!(),
    };

    // Positioner 3 is expected but not connected; strict mode fails.
    let result = fps
        .initialise(InitialiseOptions {
            enable_low_temperature: false,
            check_assignments: true,
            ..Default::default()
        })
        .await;
    assert!(result.is_err());

    // The default treats the mismatch as a warning.
    fps.initialise(InitialiseOptions {
        enable_low_temperature: false,
        ..Default::default()
    })
    .await
    .expect("warn-only initialise succeeds");

    fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn report_status_covers_the_array() {
    let rig = common::setup_default(&[4, 5]).await;

    let report = rig.fps.report_status();
    assert_eq!(report.n_positioners, 2);
    assert!(!report.locked);
    assert!(report.ieb);
    assert!(report.positioners[&4].firmware.is_some());

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn snapshots_are_persisted_under_the_configured_path() {
    let snapshot_dir = tempfile::tempdir().unwrap();
    let snapshot_path = snapshot_dir.path().to_path_buf();

    let rig = common::setup(
        &[4],
        |config| {
            config.fps.snapshot_path = snapshot_path.clone();
        },
        InitialiseOptions {
            enable_low_temperature: false,
            ..Default::default()
        },
    )
    .await;

    let written = rig
        .fps
        .save_snapshot()
        .await
        .expect("snapshot should be written");
    assert!(written.starts_with(&snapshot_path));

    let record: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&written).unwrap()).unwrap();
    assert_eq!(record["n_positioners"], serde_json::json!(1));
    assert!(record["positioners"]["4"]["firmware"].is_string());

    // The next snapshot gets a fresh sequence number.
    let second = rig.fps.save_snapshot().await.unwrap();
    assert_ne!(written, second);

    rig.fps.shutdown().await;
}


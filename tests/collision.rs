//! Collision handling and the array lock.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use canopus::error::FpsError;
use canopus::fps::GotoOptions;

#[tokio::test(start_paused = true)]
async fn collision_locks_the_fps_and_blocks_moves() {
    let rig = common::setup_default(&[4, 17]).await;
    assert!(!rig.fps.locked());

    rig.firmware.inject_collision(17);

    // The lock is taken by a background task off the reply listener.
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(rig.fps.locked());
    assert_eq!(rig.fps.locked_by(), vec![17]);

    // Non-safe commands are refused while locked.
    let result = rig
        .fps
        .goto(
            HashMap::from([(4, (90.0, 180.0))]),
            GotoOptions {
                go_cowboy: true,
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(FpsError::Locked)));

    let positioner = rig.fps.positioner(4).unwrap();
    assert!(matches!(
        positioner.goto(90.0, 180.0, None, false).await,
        Err(FpsError::Locked)
    ));

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn secondary_collision_reports_do_not_relock() {
    let rig = common::setup_default(&[4, 17]).await;

    rig.firmware.inject_collision(17);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(rig.fps.locked_by(), vec![17]);

    // Stopping trajectories makes more robots cry collision; those
    // reports must not extend the lock.
    rig.firmware.inject_collision(4);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(rig.fps.locked());
    assert_eq!(rig.fps.locked_by(), vec![17]);

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unlock_requires_clear_collision_flags() {
    let rig = common::setup_default(&[4, 17]).await;

    rig.firmware.inject_collision(17);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(rig.fps.locked());

    // STOP_TRAJECTORY clears the flags in the firmware, so unlocking
    // succeeds and the array is usable again.
    rig.fps.unlock().await.expect("unlock should succeed");
    assert!(!rig.fps.locked());
    assert!(rig.fps.locked_by().is_empty());

    let positioner = rig.fps.positioner(4).unwrap();
    positioner
        .goto(10.0, 170.0, None, false)
        .await
        .expect("moves work again after unlocking");

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn safe_commands_pass_while_locked() {
    let rig = common::setup_default(&[4]).await;

    rig.firmware.inject_collision(4);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(rig.fps.locked());

    // Status refreshes are safe and keep working.
    assert!(rig
        .fps
        .update_status(None, Duration::from_secs(2))
        .await
        .unwrap());

    rig.fps.shutdown().await;
}

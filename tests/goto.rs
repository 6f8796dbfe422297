//! Single-positioner moves against the virtual firmware.

mod common;

use std::time::Duration;

use canopus::proto::CommandId;

#[tokio::test(start_paused = true)]
async fn goto_absolute_reaches_the_commanded_position() {
    let rig = common::setup_default(&[4]).await;

    let positioner = rig.fps.positioner(4).expect("positioner 4 is connected");
    assert!(positioner.initialised());

    positioner
        .goto(90.0, 20.0, Some(1000.0), false)
        .await
        .expect("goto should complete");

    // Ask the hardware again rather than trusting cached state.
    let command = rig
        .fps
        .send_command(
            CommandId::GetActualPosition,
            canopus::SendOptions::to(vec![4]),
        )
        .await
        .unwrap();
    command.result().await.unwrap();

    let positions = command.positions(rig.fps.config().positioner.motor_steps);
    let (alpha, beta) = positions[&4];
    assert!((alpha - 90.0).abs() <= 0.1, "alpha = {alpha}");
    assert!((beta - 20.0).abs() <= 0.1, "beta = {beta}");

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn goto_rejects_disabled_and_out_of_range() {
    let rig = common::setup_default(&[4, 5]).await;

    let positioner = rig.fps.positioner(5).unwrap();
    positioner.set_disabled(true);
    assert!(positioner.goto(90.0, 180.0, None, false).await.is_err());

    let positioner = rig.fps.positioner(4).unwrap();
    assert!(positioner.goto(400.0, 180.0, None, false).await.is_err());

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn relative_goto_moves_from_the_current_position() {
    let rig = common::setup_default(&[7]).await;
    rig.firmware.set_position(7, 10.0, 170.0);

    let positioner = rig.fps.positioner(7).unwrap();
    positioner.update_position(None).await.unwrap();

    positioner
        .goto(5.0, -10.0, Some(2000.0), true)
        .await
        .expect("relative goto should complete");

    positioner.update_position(None).await.unwrap();
    let (alpha, beta) = positioner.position().unwrap();
    assert!((alpha - 15.0).abs() <= 0.1);
    assert!((beta - 160.0).abs() <= 0.1);

    rig.fps.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn goto_times_out_on_a_silent_positioner() {
    let rig = common::setup_default(&[4]).await;

    rig.firmware.set_silent(4, true);

    let positioner = rig.fps.positioner(4).unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(30),
        positioner.goto(90.0, 180.0, None, false),
    )
    .await
    .expect("goto must terminate via the command timeout");

    assert!(result.is_err());

    rig.fps.shutdown().await;
}

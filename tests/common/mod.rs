//! Shared harness: a supervisor wired to an emulated positioner array
//! over the in-process bus.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;

use canopus::can::BusInterface;
use canopus::config::Config;
use canopus::fps::{Fps, InitialiseOptions};
use canopus::ieb::DeviceBank;
use canopus::testing::{MockIeb, VirtualFirmware};

pub struct TestRig {
    pub fps: Fps,
    pub firmware: VirtualFirmware,
    pub ieb: Arc<MockIeb>,
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.fps.use_lock = false;
    config.fps.use_sync_line = false;
    config.fps.start_pollers = false;
    config.fps.initialise_timeouts = 1.0;
    config
}

/// Brings up a supervisor against virtual firmware for the given robot
/// ids. Low-temperature monitoring stays off unless a test opts in.
pub async fn setup(
    positioner_ids: &[u16],
    customise: impl FnOnce(&mut Config),
    initialise: InitialiseOptions,
) -> TestRig {
    let mut config = test_config();
    customise(&mut config);

    let ieb = Arc::new(MockIeb::new());
    let bank: Arc<dyn DeviceBank> = ieb.clone();
    let fps = Fps::new(config.clone(), Some(bank));

    fps.start_can(None).await.expect("CAN should start");

    let bus = fps
        .can()
        .expect("network is up")
        .interface(0)
        .expect("one interface");

    let firmware = match bus.as_ref() {
        BusInterface::Virtual(virtual_bus) => VirtualFirmware::start(
            virtual_bus,
            positioner_ids,
            config.can.uid_bits,
            config.positioner.motor_steps,
            config.positioner.time_step,
        ),
        _ => panic!("test profile must use the virtual interface"),
    };

    fps.initialise(initialise).await.expect("initialise should succeed");

    TestRig { fps, firmware, ieb }
}

pub async fn setup_default(positioner_ids: &[u16]) -> TestRig {
    setup(
        positioner_ids,
        |_| {},
        InitialiseOptions {
            enable_low_temperature: false,
            ..Default::default()
        },
    )
    .await
}

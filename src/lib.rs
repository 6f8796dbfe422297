//! canopus: asynchronous controller for a focal-plane array of two-axis
//! fiber positioners driven over CAN.
//!
//! The crate is organised in layers. [`can`] owns the transport: bus
//! variants, the notifier that fans inbound frames out to listeners,
//! and the network manager with its command queue and reply matching.
//! [`command`] is the request/reply aggregate everything above speaks
//! in. [`positioner`] tracks per-robot state, [`trajectory`] streams
//! and supervises coordinated moves, and [`fps`] is the supervisor that
//! ties it all together behind a single command choke point.
//!
//! External collaborators (the electronics box, the path planner) are
//! consumed through the narrow seams in [`ieb`] and [`planner`]. The
//! [`testing`] module carries a virtual firmware rig that emulates a
//! positioner array over the in-process bus.

pub mod can;
pub mod command;
pub mod config;
pub mod error;
pub mod fps;
pub mod ieb;
pub mod low_temperature;
pub mod planner;
pub mod pollers;
pub mod positioner;
pub mod testing;
pub mod trajectory;

pub use canopus_proto as proto;

pub use command::{Command, CommandData, Timeout};
pub use config::Config;
pub use error::{CanError, CommandError, ConfigError, FailureKind, FpsError, TrajectoryError};
pub use fps::{Fps, GotoOptions, InitialiseOptions, Observer, ObserverEvent, SendOptions};
pub use positioner::Positioner;
pub use trajectory::{send_trajectory, ArmPath, Trajectory, TrajectoryData, TrajectoryOptions};

/// Installs the default tracing subscriber, honouring `RUST_LOG`.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

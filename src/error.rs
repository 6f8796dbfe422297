//! Error taxonomy for the controller.
//!
//! Errors are grouped by layer: transport (`CanError`), a single command's
//! request/reply cycle (`CommandError`), the trajectory engine
//! (`TrajectoryError`), configuration (`ConfigError`), and the supervisor
//! (`FpsError`). Collision handling and lock transitions are side effects
//! of the reply listener, not errors; callers only see them as
//! `FpsError::Locked` when they try to issue a non-safe command afterwards.

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;

use canopus_proto::{
    CommandId, IdentifierError, PayloadError, ResponseCode, UnknownCommandId,
};

/// Transport-level failures on a CAN channel.
#[derive(Debug, Error)]
pub enum CanError {
    #[error("connection to {channel} failed: {source}")]
    Connection {
        channel: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error on CAN channel: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel is not open")]
    NotOpen,

    #[error("frame payload of {0} bytes does not fit in a CAN frame")]
    FrameTooLong(usize),

    #[error("cannot build CAN frame: {0}")]
    InvalidFrame(String),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),
}

/// A single command failed to construct, send, or complete.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0} cannot be broadcast")]
    NotBroadcastable(CommandId),

    #[error("{command}: {reason}")]
    Invalid { command: CommandId, reason: String },

    #[error("({command}, {command_uid}): no data for positioner {positioner_id}")]
    MissingData {
        command: CommandId,
        command_uid: u64,
        positioner_id: u16,
    },

    #[error("({command}, {command_uid}): {n_messages} messages exceed the {max_uids} available UIDs")]
    UidPoolExhausted {
        command: CommandId,
        command_uid: u64,
        n_messages: usize,
        max_uids: usize,
    },

    #[error("({command}, {command_uid}): command failed")]
    Failed {
        command: CommandId,
        command_uid: u64,
        /// Non-accepted response codes, by positioner.
        outcomes: HashMap<u16, ResponseCode>,
    },

    #[error("({command}, {command_uid}): command timed out")]
    TimedOut { command: CommandId, command_uid: u64 },

    #[error("({command}, {command_uid}): command was cancelled")]
    Cancelled { command: CommandId, command_uid: u64 },

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    #[error(transparent)]
    UnknownCommand(#[from] UnknownCommandId),
}

/// Why a positioner was left out of, or failed during, a trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Missing alpha or beta data in the submitted trajectory.
    NoData,
    /// Datums not initialised or a move still in progress.
    NotReady,
    /// A beta sample below the safe-mode minimum.
    SafeMode,
    /// The wire response code the positioner replied with.
    Response(ResponseCode),
}

impl FailureKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NoData => "NO_DATA",
            Self::NotReady => "NOT_READY",
            Self::SafeMode => "SAFE_MODE",
            Self::Response(code) => code.name(),
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A trajectory failed at some stage. `failed_positioners` names the
/// robots responsible, where they are known.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct TrajectoryError {
    pub reason: String,
    pub failed_positioners: HashMap<u16, FailureKind>,
}

impl TrajectoryError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            failed_positioners: HashMap::new(),
        }
    }

    pub fn with_failed(
        reason: impl Into<String>,
        failed_positioners: HashMap<u16, FailureKind>,
    ) -> Self {
        Self {
            reason: reason.into(),
            failed_positioners,
        }
    }
}

/// Invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid CAN interface type {0:?}")]
    InvalidInterface(String),

    #[error("profile {0:?} does not define a channel")]
    MissingChannel(String),

    #[error("profile {0:?} is not defined in the configuration")]
    UnknownProfile(String),

    #[error("uid_bits={0} is out of range")]
    InvalidUidBits(u32),

    #[error("cannot read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Supervisor-level failures.
#[derive(Debug, Error)]
pub enum FpsError {
    #[error("the FPS is locked")]
    Locked,

    #[error("cannot send a move command while the FPS is moving")]
    Moving,

    #[error("CAN connection not established")]
    NoCanConnection,

    #[error("positioner {0} is not connected")]
    NotConnected(u16),

    #[error("some commanded positioners are disabled: {0:?}")]
    DisabledPositioners(Vec<u16>),

    #[error("cannot send {0} while in bootloader mode")]
    BootloaderMode(CommandId),

    #[error("{0} is a bootloader command and the positioners are not in bootloader mode")]
    NotInBootloaderMode(CommandId),

    #[error("positioner {positioner_id}: {reason}")]
    Positioner { positioner_id: u16, reason: String },

    #[error("another instance appears to be running (lock file {0})")]
    AlreadyRunning(PathBuf),

    #[error("cannot unlock the FPS until all collisions have been cleared")]
    StillCollided,

    #[error("{0}")]
    State(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Can(#[from] CanError),

    #[error(transparent)]
    Trajectory(#[from] TrajectoryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

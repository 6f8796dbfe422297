//! Status maskbits and response codes.
//!
//! Bit layouts follow the positioner firmware (>= 4.1) status register,
//! the bootloader status register, and the gateway response code field.

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Positioner status register (firmware >= 4.1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PositionerStatus: u64 {
        const SYSTEM_INITIALIZED = 0x0000_0000_0000_0001;
        const CONFIG_CHANGED = 0x0000_0000_0000_0002;
        const BSETTINGS_CHANGED = 0x0000_0000_0000_0004;
        const DATA_STREAMING = 0x0000_0000_0000_0008;
        const RECEIVING_TRAJECTORY = 0x0000_0000_0000_0010;
        const TRAJECTORY_ALPHA_RECEIVED = 0x0000_0000_0000_0020;
        const TRAJECTORY_BETA_RECEIVED = 0x0000_0000_0000_0040;
        const LOW_POWER_AFTER_MOVE = 0x0000_0000_0000_0080;
        const DISPLACEMENT_COMPLETED = 0x0000_0000_0000_0100;
        const DISPLACEMENT_COMPLETED_ALPHA = 0x0000_0000_0000_0200;
        const DISPLACEMENT_COMPLETED_BETA = 0x0000_0000_0000_0400;
        const COLLISION_ALPHA = 0x0000_0000_0000_0800;
        const COLLISION_BETA = 0x0000_0000_0000_1000;
        const CLOSED_LOOP_ALPHA = 0x0000_0000_0000_2000;
        const CLOSED_LOOP_BETA = 0x0000_0000_0000_4000;
        const PRECISE_POSITIONING_ALPHA = 0x0000_0000_0000_8000;
        const PRECISE_POSITIONING_BETA = 0x0000_0000_0001_0000;
        const COLLISION_DETECT_ALPHA_DISABLE = 0x0000_0000_0002_0000;
        const COLLISION_DETECT_BETA_DISABLE = 0x0000_0000_0004_0000;
        const MOTOR_CALIBRATION = 0x0000_0000_0008_0000;
        const MOTOR_ALPHA_CALIBRATED = 0x0000_0000_0010_0000;
        const MOTOR_BETA_CALIBRATED = 0x0000_0000_0020_0000;
        const DATUM_CALIBRATION = 0x0000_0000_0040_0000;
        const DATUM_ALPHA_CALIBRATED = 0x0000_0000_0080_0000;
        const DATUM_BETA_CALIBRATED = 0x0000_0000_0100_0000;
        const DATUM_INITIALIZATION = 0x0000_0000_0200_0000;
        const DATUM_ALPHA_INITIALIZED = 0x0000_0000_0400_0000;
        const DATUM_BETA_INITIALIZED = 0x0000_0000_0800_0000;
        const HALL_ALPHA_DISABLE = 0x0000_0000_1000_0000;
        const HALL_BETA_DISABLE = 0x0000_0000_2000_0000;
        const COGGING_CALIBRATION = 0x0000_0000_4000_0000;
        const COGGING_ALPHA_CALIBRATED = 0x0000_0000_8000_0000;
        const COGGING_BETA_CALIBRATED = 0x0000_0001_0000_0000;
        const ESTIMATED_POSITION = 0x0000_0002_0000_0000;
        const POSITION_RESTORED = 0x0000_0004_0000_0000;
        const SWITCH_OFF_AFTER_MOVE = 0x0000_0008_0000_0000;
        const CALIBRATION_SAVED = 0x0000_0010_0000_0000;
        const PRECISE_MOVE_IN_OPEN_LOOP_ALPHA = 0x0000_0020_0000_0000;
        const PRECISE_MOVE_IN_OPEN_LOOP_BETA = 0x0000_0040_0000_0000;
        const SWITCH_OFF_HALL_AFTER_MOVE = 0x0000_0080_0000_0000;
        const UNKNOWN = 0x0000_0100_0000_0000;
    }
}

impl PositionerStatus {
    /// Either arm reports a collision.
    pub fn collision(&self) -> bool {
        self.intersects(Self::COLLISION_ALPHA | Self::COLLISION_BETA)
    }

    /// The control system has booted.
    pub fn initialised(&self) -> bool {
        self.contains(Self::SYSTEM_INITIALIZED)
    }

    /// Both datums have been initialised and no motion is in progress.
    pub fn ready_for_trajectory(&self) -> bool {
        self.contains(
            Self::DATUM_ALPHA_INITIALIZED
                | Self::DATUM_BETA_INITIALIZED
                | Self::DISPLACEMENT_COMPLETED,
        )
    }
}

bitflags! {
    /// Positioner status register while in bootloader mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BootloaderStatus: u64 {
        const BOOTLOADER_INIT = 0x0000_0001;
        const BOOTLOADER_TIMEOUT = 0x0000_0002;
        const BSETTINGS_CHANGED = 0x0000_0200;
        const RECEIVING_NEW_FIRMWARE = 0x0001_0000;
        const NEW_FIRMWARE_RECEIVED = 0x0100_0000;
        const NEW_FIRMWARE_CHECK_OK = 0x0200_0000;
        const NEW_FIRMWARE_CHECK_BAD = 0x0400_0000;
        const UNKNOWN = 0x4000_0000;
    }
}

bitflags! {
    /// Lifecycle state of a command aggregate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandStatus: u8 {
        const DONE = 0x01;
        const CANCELLED = 0x02;
        const FAILED = 0x04;
        const READY = 0x08;
        const RUNNING = 0x10;
        const TIMEDOUT = 0x20;
    }
}

impl CommandStatus {
    /// Terminal, one way or another.
    pub fn is_done(&self) -> bool {
        self.intersects(Self::DONE | Self::TIMEDOUT) || self.failed()
    }

    pub fn failed(&self) -> bool {
        self.intersects(Self::CANCELLED | Self::FAILED)
    }

    pub fn timed_out(&self) -> bool {
        self.contains(Self::TIMEDOUT)
    }

    pub fn is_running(&self) -> bool {
        self.contains(Self::RUNNING)
    }
}

bitflags! {
    /// Aggregate state of the whole array.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FpsStatus: u8 {
        const IDLE = 0x01;
        const MOVING = 0x02;
        const COLLIDED = 0x04;
        const ERRORED = 0x08;
        const TEMPERATURE_NORMAL = 0x10;
        const TEMPERATURE_COLD = 0x20;
        const TEMPERATURE_VERY_COLD = 0x40;
        const TEMPERATURE_UNKNOWN = 0x80;
    }
}

impl FpsStatus {
    pub const STATUS_BITS: FpsStatus = FpsStatus::IDLE
        .union(FpsStatus::MOVING)
        .union(FpsStatus::COLLIDED)
        .union(FpsStatus::ERRORED);

    pub const TEMPERATURE_BITS: FpsStatus = FpsStatus::TEMPERATURE_NORMAL
        .union(FpsStatus::TEMPERATURE_COLD)
        .union(FpsStatus::TEMPERATURE_VERY_COLD)
        .union(FpsStatus::TEMPERATURE_UNKNOWN);
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid response code {0}")]
pub struct InvalidResponseCode(pub u8);

/// Reply response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseCode {
    CommandAccepted = 0,
    ValueOutOfRange = 1,
    InvalidTrajectory = 2,
    AlreadyInMotion = 3,
    DatumNotInitialized = 4,
    IncorrectAmountOfData = 5,
    CalibrationModeActive = 6,
    MotorNotCalibrated = 7,
    CollisionDetected = 8,
    HallSensorDisabled = 9,
    InvalidBroadcastCommand = 10,
    InvalidBootloaderCommand = 11,
    InvalidCommand = 12,
    UnknownCommand = 13,
    DatumNotCalibrated = 14,
    HallSensorsDisabled = 15,
}

impl ResponseCode {
    pub fn name(self) -> &'static str {
        match self {
            Self::CommandAccepted => "COMMAND_ACCEPTED",
            Self::ValueOutOfRange => "VALUE_OUT_OF_RANGE",
            Self::InvalidTrajectory => "INVALID_TRAJECTORY",
            Self::AlreadyInMotion => "ALREADY_IN_MOTION",
            Self::DatumNotInitialized => "DATUM_NOT_INITIALIZED",
            Self::IncorrectAmountOfData => "INCORRECT_AMOUNT_OF_DATA",
            Self::CalibrationModeActive => "CALIBRATION_MODE_ACTIVE",
            Self::MotorNotCalibrated => "MOTOR_NOT_CALIBRATED",
            Self::CollisionDetected => "COLLISION_DETECTED",
            Self::HallSensorDisabled => "HALL_SENSOR_DISABLED",
            Self::InvalidBroadcastCommand => "INVALID_BROADCAST_COMMAND",
            Self::InvalidBootloaderCommand => "INVALID_BOOTLOADER_COMMAND",
            Self::InvalidCommand => "INVALID_COMMAND",
            Self::UnknownCommand => "UNKNOWN_COMMAND",
            Self::DatumNotCalibrated => "DATUM_NOT_CALIBRATED",
            Self::HallSensorsDisabled => "HALL_SENSORS_DISABLED",
        }
    }

    pub fn accepted(self) -> bool {
        self == Self::CommandAccepted
    }
}

impl TryFrom<u8> for ResponseCode {
    type Error = InvalidResponseCode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let code = match value {
            0 => Self::CommandAccepted,
            1 => Self::ValueOutOfRange,
            2 => Self::InvalidTrajectory,
            3 => Self::AlreadyInMotion,
            4 => Self::DatumNotInitialized,
            5 => Self::IncorrectAmountOfData,
            6 => Self::CalibrationModeActive,
            7 => Self::MotorNotCalibrated,
            8 => Self::CollisionDetected,
            9 => Self::HallSensorDisabled,
            10 => Self::InvalidBroadcastCommand,
            11 => Self::InvalidBootloaderCommand,
            12 => Self::InvalidCommand,
            13 => Self::UnknownCommand,
            14 => Self::DatumNotCalibrated,
            15 => Self::HallSensorsDisabled,
            other => return Err(InvalidResponseCode(other)),
        };
        Ok(code)
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

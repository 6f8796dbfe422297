//! Static command descriptors.
//!
//! Each command code carries a fixed capability set: whether it may be
//! broadcast to positioner id 0, whether it is safe to issue while the
//! array is locked, whether it moves motors (and is therefore refused
//! while the array is moving), and whether it belongs to the bootloader
//! command set. The table is fixed at build time; dynamic dispatch over
//! command subclasses is replaced by lookups into it.

use std::time::Duration;

use crate::command_id::CommandId;

/// Default reply timeout applied when the caller does not override it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct CommandDescriptor {
    pub id: CommandId,
    /// Wire name as the firmware documentation spells it.
    pub name: &'static str,
    /// May be addressed to positioner id 0 (all listeners).
    pub broadcastable: bool,
    /// Allowed while the FPS is locked.
    pub safe: bool,
    /// Moves motors; refused while the FPS is moving.
    pub move_command: bool,
    /// Part of the bootloader command set.
    pub bootloader: bool,
    /// Default reply timeout; `None` waits for replies indefinitely.
    pub timeout: Option<Duration>,
}

impl CommandDescriptor {
    const fn new(id: CommandId, name: &'static str) -> Self {
        Self {
            id,
            name,
            broadcastable: false,
            safe: false,
            move_command: false,
            bootloader: false,
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }

    const fn broadcastable(mut self) -> Self {
        self.broadcastable = true;
        self
    }

    const fn safe(mut self) -> Self {
        self.safe = true;
        self
    }

    const fn move_command(mut self) -> Self {
        self.move_command = true;
        self
    }

    const fn bootloader(mut self) -> Self {
        self.bootloader = true;
        self
    }
}

static DESCRIPTORS: &[CommandDescriptor] = &[
    CommandDescriptor::new(CommandId::GetId, "GET_ID").broadcastable().safe(),
    CommandDescriptor::new(CommandId::GetFirmwareVersion, "GET_FIRMWARE_VERSION")
        .broadcastable()
        .safe()
        .bootloader(),
    CommandDescriptor::new(CommandId::GetStatus, "GET_STATUS")
        .broadcastable()
        .safe()
        .bootloader(),
    CommandDescriptor::new(CommandId::SendNewTrajectory, "SEND_NEW_TRAJECTORY").move_command(),
    CommandDescriptor::new(CommandId::SendTrajectoryData, "SEND_TRAJECTORY_DATA").move_command(),
    CommandDescriptor::new(CommandId::TrajectoryDataEnd, "TRAJECTORY_DATA_END").move_command(),
    CommandDescriptor::new(CommandId::SendTrajectoryAbort, "SEND_TRAJECTORY_ABORT").safe(),
    CommandDescriptor::new(CommandId::StartTrajectory, "START_TRAJECTORY")
        .broadcastable()
        .safe()
        .move_command(),
    CommandDescriptor::new(CommandId::StopTrajectory, "STOP_TRAJECTORY")
        .broadcastable()
        .safe(),
    // Inbound only; never constructed for sending.
    CommandDescriptor::new(CommandId::CollisionDetected, "COLLISION_DETECTED").safe(),
    CommandDescriptor::new(CommandId::GoToDatums, "GO_TO_DATUMS").move_command(),
    CommandDescriptor::new(CommandId::GoToDatumAlpha, "GO_TO_DATUM_ALPHA").move_command(),
    CommandDescriptor::new(CommandId::GoToDatumBeta, "GO_TO_DATUM_BETA").move_command(),
    CommandDescriptor::new(CommandId::StartDatumCalibration, "START_DATUM_CALIBRATION")
        .move_command(),
    CommandDescriptor::new(
        CommandId::StartDatumCalibrationAlpha,
        "START_DATUM_CALIBRATION_ALPHA",
    )
    .move_command(),
    CommandDescriptor::new(
        CommandId::StartDatumCalibrationBeta,
        "START_DATUM_CALIBRATION_BETA",
    )
    .move_command(),
    CommandDescriptor::new(CommandId::StartMotorCalibration, "START_MOTOR_CALIBRATION")
        .move_command(),
    CommandDescriptor::new(
        CommandId::StartMotorCalibrationBeta,
        "START_MOTOR_CALIBRATION_BETA",
    )
    .move_command(),
    CommandDescriptor::new(CommandId::GoToAbsolutePosition, "GO_TO_ABSOLUTE_POSITION")
        .move_command(),
    CommandDescriptor::new(CommandId::GoToRelativePosition, "GO_TO_RELATIVE_POSITION")
        .move_command(),
    CommandDescriptor::new(CommandId::GetActualPosition, "GET_ACTUAL_POSITION")
        .broadcastable()
        .safe(),
    // Not strictly a move command, but it must not land mid-move.
    CommandDescriptor::new(CommandId::SetActualPosition, "SET_ACTUAL_POSITION")
        .safe()
        .move_command(),
    CommandDescriptor::new(CommandId::GetOffsets, "GET_OFFSETS").safe(),
    CommandDescriptor::new(CommandId::SetOffsets, "SET_OFFSETS").safe(),
    CommandDescriptor::new(CommandId::SetSpeed, "SET_SPEED").safe(),
    CommandDescriptor::new(CommandId::SetCurrent, "SET_CURRENT").safe().move_command(),
    CommandDescriptor::new(CommandId::GetHallCalibError, "GET_HALL_CALIB_ERROR").safe(),
    CommandDescriptor::new(CommandId::StartCoggingCalibration, "START_COGGING_CALIBRATION")
        .move_command(),
    CommandDescriptor::new(
        CommandId::StartCoggingCalibrationAlpha,
        "START_COGGING_CALIBRATION_ALPHA",
    )
    .move_command(),
    CommandDescriptor::new(
        CommandId::StartCoggingCalibrationBeta,
        "START_COGGING_CALIBRATION_BETA",
    )
    .move_command(),
    CommandDescriptor::new(CommandId::SaveInternalCalibration, "SAVE_INTERNAL_CALIBRATION"),
    CommandDescriptor::new(CommandId::GetCurrent, "GET_CURRENT").safe(),
    CommandDescriptor::new(CommandId::GetAlphaHallCalib, "GET_ALPHA_HALL_CALIB").safe(),
    CommandDescriptor::new(CommandId::GetBetaHallCalib, "GET_BETA_HALL_CALIB").safe(),
    CommandDescriptor::new(
        CommandId::SetIncreaseCollisionMargin,
        "SET_INCREASE_COLLISION_MARGIN",
    ),
    CommandDescriptor::new(CommandId::SetHoldingCurrent, "SET_HOLDING_CURRENT").safe(),
    CommandDescriptor::new(CommandId::GetHoldingCurrent, "GET_HOLDING_CURRENT").safe(),
    CommandDescriptor::new(CommandId::HallOn, "HALL_ON"),
    CommandDescriptor::new(CommandId::HallOff, "HALL_OFF"),
    CommandDescriptor::new(
        CommandId::AlphaClosedLoopCollisionDetection,
        "ALPHA_CLOSED_LOOP_COLLISION_DETECTION",
    ),
    CommandDescriptor::new(
        CommandId::AlphaClosedLoopWithoutCollisionDetection,
        "ALPHA_CLOSED_LOOP_WITHOUT_COLLISION_DETECTION",
    ),
    CommandDescriptor::new(
        CommandId::AlphaOpenLoopCollisionDetection,
        "ALPHA_OPEN_LOOP_COLLISION_DETECTION",
    ),
    CommandDescriptor::new(
        CommandId::AlphaOpenLoopWithoutCollisionDetection,
        "ALPHA_OPEN_LOOP_WITHOUT_COLLISION_DETECTION",
    ),
    CommandDescriptor::new(
        CommandId::BetaClosedLoopCollisionDetection,
        "BETA_CLOSED_LOOP_COLLISION_DETECTION",
    ),
    CommandDescriptor::new(
        CommandId::BetaClosedLoopWithoutCollisionDetection,
        "BETA_CLOSED_LOOP_WITHOUT_COLLISION_DETECTION",
    ),
    CommandDescriptor::new(
        CommandId::BetaOpenLoopCollisionDetection,
        "BETA_OPEN_LOOP_COLLISION_DETECTION",
    ),
    CommandDescriptor::new(
        CommandId::BetaOpenLoopWithoutCollisionDetection,
        "BETA_OPEN_LOOP_WITHOUT_COLLISION_DETECTION",
    ),
    CommandDescriptor::new(CommandId::SwitchLedOn, "SWITCH_LED_ON").safe(),
    CommandDescriptor::new(CommandId::SwitchLedOff, "SWITCH_LED_OFF").safe(),
    CommandDescriptor::new(CommandId::SwitchOnPreciseMoveAlpha, "SWITCH_ON_PRECISE_MOVE_ALPHA")
        .safe(),
    CommandDescriptor::new(
        CommandId::SwitchOffPreciseMoveAlpha,
        "SWITCH_OFF_PRECISE_MOVE_ALPHA",
    )
    .safe(),
    CommandDescriptor::new(CommandId::SwitchOnPreciseMoveBeta, "SWITCH_ON_PRECISE_MOVE_BETA")
        .safe(),
    CommandDescriptor::new(
        CommandId::SwitchOffPreciseMoveBeta,
        "SWITCH_OFF_PRECISE_MOVE_BETA",
    )
    .safe(),
    CommandDescriptor::new(CommandId::GetRawTemperature, "GET_RAW_TEMPERATURE").safe(),
    CommandDescriptor::new(CommandId::GetNumberTrajectories, "GET_NUMBER_TRAJECTORIES").safe(),
    CommandDescriptor::new(CommandId::SetNumberTrajectories, "SET_NUMBER_TRAJECTORIES"),
    CommandDescriptor::new(CommandId::StartFirmwareUpgrade, "START_FIRMWARE_UPGRADE")
        .broadcastable()
        .bootloader(),
    CommandDescriptor::new(CommandId::SendFirmwareData, "SEND_FIRMWARE_DATA")
        .broadcastable()
        .bootloader(),
];

/// Returns the descriptor for a command code. Total over [`CommandId`].
pub fn descriptor(id: CommandId) -> &'static CommandDescriptor {
    DESCRIPTORS
        .iter()
        .find(|d| d.id == id)
        .expect("every command id has a descriptor")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_total() {
        for &id in CommandId::ALL {
            let d = descriptor(id);
            assert_eq!(d.id, id);
        }
        assert_eq!(DESCRIPTORS.len(), CommandId::ALL.len());
    }

    #[test]
    fn capability_flags() {
        assert!(descriptor(CommandId::GetFirmwareVersion).broadcastable);
        assert!(descriptor(CommandId::StartTrajectory).broadcastable);
        assert!(descriptor(CommandId::StartTrajectory).safe);
        assert!(descriptor(CommandId::StopTrajectory).safe);
        assert!(!descriptor(CommandId::GoToAbsolutePosition).broadcastable);
        assert!(descriptor(CommandId::GoToAbsolutePosition).move_command);
        assert!(descriptor(CommandId::SendFirmwareData).bootloader);
        assert!(!descriptor(CommandId::SetSpeed).move_command);

        // Calibration settings stay usable on a locked array.
        assert!(descriptor(CommandId::SetOffsets).safe);
        assert!(descriptor(CommandId::SetHoldingCurrent).safe);
        assert!(!descriptor(CommandId::SetHoldingCurrent).broadcastable);
        for id in [
            CommandId::SwitchOnPreciseMoveAlpha,
            CommandId::SwitchOffPreciseMoveAlpha,
            CommandId::SwitchOnPreciseMoveBeta,
            CommandId::SwitchOffPreciseMoveBeta,
        ] {
            assert!(descriptor(id).safe);
            assert!(!descriptor(id).broadcastable);
        }
    }
}

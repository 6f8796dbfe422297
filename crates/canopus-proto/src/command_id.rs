//! Firmware command codes.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown command id {0}")]
pub struct UnknownCommandId(pub u16);

/// The command codes understood by positioner firmware.
///
/// The set is closed: codes not listed here are rejected at the protocol
/// boundary. `COLLISION_DETECTED` is inbound-only; the firmware emits it
/// spontaneously when an arm hits something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum CommandId {
    GetId = 1,
    GetFirmwareVersion = 2,
    GetStatus = 3,
    SendNewTrajectory = 10,
    SendTrajectoryData = 11,
    TrajectoryDataEnd = 12,
    SendTrajectoryAbort = 13,
    StartTrajectory = 14,
    StopTrajectory = 15,
    CollisionDetected = 18,
    GoToDatums = 20,
    GoToDatumAlpha = 21,
    GoToDatumBeta = 22,
    StartDatumCalibration = 23,
    StartDatumCalibrationAlpha = 24,
    StartDatumCalibrationBeta = 25,
    StartMotorCalibration = 26,
    StartMotorCalibrationBeta = 27,
    GoToAbsolutePosition = 30,
    GoToRelativePosition = 31,
    GetActualPosition = 32,
    SetActualPosition = 33,
    GetOffsets = 34,
    SetOffsets = 35,
    SetSpeed = 40,
    SetCurrent = 41,
    GetHallCalibError = 45,
    StartCoggingCalibration = 47,
    StartCoggingCalibrationAlpha = 48,
    StartCoggingCalibrationBeta = 49,
    SaveInternalCalibration = 53,
    GetCurrent = 56,
    GetAlphaHallCalib = 104,
    GetBetaHallCalib = 105,
    SetIncreaseCollisionMargin = 111,
    SetHoldingCurrent = 112,
    GetHoldingCurrent = 113,
    HallOn = 116,
    HallOff = 117,
    AlphaClosedLoopCollisionDetection = 118,
    AlphaClosedLoopWithoutCollisionDetection = 119,
    AlphaOpenLoopCollisionDetection = 120,
    AlphaOpenLoopWithoutCollisionDetection = 121,
    BetaClosedLoopCollisionDetection = 122,
    BetaClosedLoopWithoutCollisionDetection = 123,
    BetaOpenLoopCollisionDetection = 124,
    BetaOpenLoopWithoutCollisionDetection = 125,
    SwitchLedOn = 126,
    SwitchLedOff = 127,
    SwitchOnPreciseMoveAlpha = 128,
    SwitchOffPreciseMoveAlpha = 129,
    SwitchOnPreciseMoveBeta = 130,
    SwitchOffPreciseMoveBeta = 131,
    GetRawTemperature = 132,
    GetNumberTrajectories = 139,
    SetNumberTrajectories = 140,
    StartFirmwareUpgrade = 200,
    SendFirmwareData = 201,
}

impl CommandId {
    /// Every command code, in wire order.
    pub const ALL: &'static [CommandId] = &[
        CommandId::GetId,
        CommandId::GetFirmwareVersion,
        CommandId::GetStatus,
        CommandId::SendNewTrajectory,
        CommandId::SendTrajectoryData,
        CommandId::TrajectoryDataEnd,
        CommandId::SendTrajectoryAbort,
        CommandId::StartTrajectory,
        CommandId::StopTrajectory,
        CommandId::CollisionDetected,
        CommandId::GoToDatums,
        CommandId::GoToDatumAlpha,
        CommandId::GoToDatumBeta,
        CommandId::StartDatumCalibration,
        CommandId::StartDatumCalibrationAlpha,
        CommandId::StartDatumCalibrationBeta,
        CommandId::StartMotorCalibration,
        CommandId::StartMotorCalibrationBeta,
        CommandId::GoToAbsolutePosition,
        CommandId::GoToRelativePosition,
        CommandId::GetActualPosition,
        CommandId::SetActualPosition,
        CommandId::GetOffsets,
        CommandId::SetOffsets,
        CommandId::SetSpeed,
        CommandId::SetCurrent,
        CommandId::GetHallCalibError,
        CommandId::StartCoggingCalibration,
        CommandId::StartCoggingCalibrationAlpha,
        CommandId::StartCoggingCalibrationBeta,
        CommandId::SaveInternalCalibration,
        CommandId::GetCurrent,
        CommandId::GetAlphaHallCalib,
        CommandId::GetBetaHallCalib,
        CommandId::SetIncreaseCollisionMargin,
        CommandId::SetHoldingCurrent,
        CommandId::GetHoldingCurrent,
        CommandId::HallOn,
        CommandId::HallOff,
        CommandId::AlphaClosedLoopCollisionDetection,
        CommandId::AlphaClosedLoopWithoutCollisionDetection,
        CommandId::AlphaOpenLoopCollisionDetection,
        CommandId::AlphaOpenLoopWithoutCollisionDetection,
        CommandId::BetaClosedLoopCollisionDetection,
        CommandId::BetaClosedLoopWithoutCollisionDetection,
        CommandId::BetaOpenLoopCollisionDetection,
        CommandId::BetaOpenLoopWithoutCollisionDetection,
        CommandId::SwitchLedOn,
        CommandId::SwitchLedOff,
        CommandId::SwitchOnPreciseMoveAlpha,
        CommandId::SwitchOffPreciseMoveAlpha,
        CommandId::SwitchOnPreciseMoveBeta,
        CommandId::SwitchOffPreciseMoveBeta,
        CommandId::GetRawTemperature,
        CommandId::GetNumberTrajectories,
        CommandId::SetNumberTrajectories,
        CommandId::StartFirmwareUpgrade,
        CommandId::SendFirmwareData,
    ];

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// The wire name, as the firmware documentation spells it.
    pub fn name(self) -> &'static str {
        crate::registry::descriptor(self).name
    }
}

impl TryFrom<u16> for CommandId {
    type Error = UnknownCommandId;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        CommandId::ALL
            .iter()
            .copied()
            .find(|id| id.as_u16() == value)
            .ok_or(UnknownCommandId(value))
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_is_complete_and_unique() {
        let mut codes: Vec<u16> = CommandId::ALL.iter().map(|id| id.as_u16()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), CommandId::ALL.len());
    }

    #[test]
    fn wire_code_roundtrip() {
        for &id in CommandId::ALL {
            assert_eq!(CommandId::try_from(id.as_u16()), Ok(id));
        }
        assert_eq!(CommandId::try_from(999), Err(UnknownCommandId(999)));
        assert_eq!(CommandId::try_from(0), Err(UnknownCommandId(0)));
    }

    #[test]
    fn display_uses_wire_names() {
        assert_eq!(CommandId::GoToAbsolutePosition.to_string(), "GO_TO_ABSOLUTE_POSITION");
        assert_eq!(CommandId::GetStatus.to_string(), "GET_STATUS");
    }
}

//! Payload codecs.
//!
//! All multi-byte fields on the wire are little-endian. Angles travel as
//! signed 32-bit motor steps (`steps = round(deg / 360 * motor_steps)`),
//! times as unsigned 32-bit ticks of `time_step` seconds.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("payload has {got} bytes, expected {expected}")]
    WrongLength { expected: usize, got: usize },

    #[error("value {0} is out of range for the field")]
    OutOfRange(f64),
}

fn read_i32(data: &[u8], offset: usize) -> Result<i32, PayloadError> {
    let end = offset + 4;
    let bytes: [u8; 4] = data
        .get(offset..end)
        .and_then(|s| s.try_into().ok())
        .ok_or(PayloadError::WrongLength {
            expected: end,
            got: data.len(),
        })?;
    Ok(i32::from_le_bytes(bytes))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, PayloadError> {
    read_i32(data, offset).map(|v| v as u32)
}

/// Converts an angle in degrees to motor steps.
pub fn angle_to_steps(degrees: f64, motor_steps: u32) -> i32 {
    (degrees / 360.0 * motor_steps as f64).round() as i32
}

/// Converts motor steps back to an angle in degrees.
pub fn steps_to_angle(steps: i32, motor_steps: u32) -> f64 {
    steps as f64 / motor_steps as f64 * 360.0
}

/// Converts a time in seconds to firmware ticks.
pub fn seconds_to_ticks(seconds: f64, time_step: f64) -> u32 {
    (seconds / time_step).round() as u32
}

/// Converts firmware ticks back to seconds.
pub fn ticks_to_seconds(ticks: u32, time_step: f64) -> f64 {
    ticks as f64 * time_step
}

/// GO_TO_ABSOLUTE_POSITION / GO_TO_RELATIVE_POSITION / SET_ACTUAL_POSITION
/// payload: alpha steps then beta steps.
pub fn position_data(alpha: f64, beta: f64, motor_steps: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&angle_to_steps(alpha, motor_steps).to_le_bytes());
    data.extend_from_slice(&angle_to_steps(beta, motor_steps).to_le_bytes());
    data
}

/// Decodes a GET_ACTUAL_POSITION reply. The firmware reports beta steps
/// first, then alpha; the return value is `(alpha, beta)` in degrees.
pub fn position_from_reply(data: &[u8], motor_steps: u32) -> Result<(f64, f64), PayloadError> {
    let beta_steps = read_i32(data, 0)?;
    let alpha_steps = read_i32(data, 4)?;
    Ok((
        steps_to_angle(alpha_steps, motor_steps),
        steps_to_angle(beta_steps, motor_steps),
    ))
}

/// Decodes the two move-time fields (ticks) a goto reply carries, in
/// seconds, as `(alpha, beta)`.
pub fn move_time_from_reply(data: &[u8], time_step: f64) -> Result<(f64, f64), PayloadError> {
    let alpha_ticks = read_u32(data, 0)?;
    let beta_ticks = read_u32(data, 4)?;
    Ok((
        ticks_to_seconds(alpha_ticks, time_step),
        ticks_to_seconds(beta_ticks, time_step),
    ))
}

/// SET_SPEED / SET_CURRENT / SET_HOLDING_CURRENT payload: two unsigned
/// 32-bit fields, alpha then beta.
pub fn motor_pair_data(alpha: f64, beta: f64) -> Result<Vec<u8>, PayloadError> {
    if alpha < 0.0 || beta < 0.0 {
        return Err(PayloadError::OutOfRange(alpha.min(beta)));
    }

    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&(alpha.round() as u32).to_le_bytes());
    data.extend_from_slice(&(beta.round() as u32).to_le_bytes());
    Ok(data)
}

/// SEND_NEW_TRAJECTORY payload: number of alpha points then beta points.
pub fn new_trajectory_data(n_alpha: u32, n_beta: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&n_alpha.to_le_bytes());
    data.extend_from_slice(&n_beta.to_le_bytes());
    data
}

/// SEND_TRAJECTORY_DATA payloads: one 8-byte message per `(degrees,
/// seconds)` sample.
pub fn trajectory_point_data(
    points: &[(f64, f64)],
    motor_steps: u32,
    time_step: f64,
) -> Vec<Vec<u8>> {
    points
        .iter()
        .map(|&(angle, time)| {
            let mut data = Vec::with_capacity(8);
            data.extend_from_slice(&angle_to_steps(angle, motor_steps).to_le_bytes());
            data.extend_from_slice(&seconds_to_ticks(time, time_step).to_le_bytes());
            data
        })
        .collect()
}

/// Decodes a GET_STATUS reply into the raw status register. Replies are
/// 4 bytes on older firmware and 8 bytes on >= 4.1.
pub fn status_from_reply(data: &[u8]) -> Result<u64, PayloadError> {
    match data.len() {
        4 => Ok(read_u32(data, 0)? as u64),
        8 => {
            let low = read_u32(data, 0)? as u64;
            let high = read_u32(data, 4)? as u64;
            Ok((high << 32) | low)
        }
        got => Err(PayloadError::WrongLength { expected: 8, got }),
    }
}

/// Formats a GET_FIRMWARE_VERSION reply as `"MM.mm.pp"` from bytes 1..4.
pub fn firmware_from_reply(data: &[u8]) -> Result<String, PayloadError> {
    if data.len() < 4 {
        return Err(PayloadError::WrongLength {
            expected: 4,
            got: data.len(),
        });
    }
    Ok(format!("{:02}.{:02}.{:02}", data[1], data[2], data[3]))
}

/// Whether a firmware version string denotes bootloader mode.
pub fn is_bootloader(firmware: &str) -> bool {
    firmware.split('.').nth(1) == Some("80")
}

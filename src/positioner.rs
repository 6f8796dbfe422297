//! Per-robot state and operations.
//!
//! A [`Positioner`] tracks one robot: its arm angles, status register,
//! firmware, and whether it is disabled or offline (physically present
//! but unresponsive; an offline robot is always disabled). Status and
//! position are refreshed by per-robot pollers and by the supervisor's
//! broadcast updates.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info};

use canopus_proto::{data, BootloaderStatus, CommandId, PositionerStatus};

use crate::command::{CommandData, Timeout};
use crate::error::FpsError;
use crate::fps::{Fps, SendOptions, WeakFps};
use crate::pollers::Poller;

/// Extra wait for DISPLACEMENT_COMPLETED after a goto's predicted move
/// time has elapsed.
const GOTO_STATUS_TIMEOUT: Duration = Duration::from_secs(3);

/// The raw status register, interpreted according to the firmware mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRegister {
    Unknown,
    Normal(PositionerStatus),
    Bootloader(BootloaderStatus),
}

struct PositionerState {
    alpha: Option<f64>,
    beta: Option<f64>,
    register: StatusRegister,
    firmware: Option<String>,
    disabled: bool,
    offline: bool,
    precise_moves: bool,
    interface: Option<usize>,
    bus: Option<u8>,
}

struct PositionerInner {
    positioner_id: u16,
    fps: WeakFps,
    state: Mutex<PositionerState>,
    status_poller: Poller,
    position_poller: Poller,
}

#[derive(Clone)]
pub struct Positioner {
    inner: Arc<PositionerInner>,
}

/// Snapshot of one robot for status reports.
#[derive(Debug, Clone, Serialize)]
pub struct PositionerReport {
    pub positioner_id: u16,
    pub alpha: Option<f64>,
    pub beta: Option<f64>,
    pub status: u64,
    pub status_names: String,
    pub firmware: Option<String>,
    pub disabled: bool,
    pub offline: bool,
}

impl Positioner {
    pub fn new(
        positioner_id: u16,
        fps: WeakFps,
        status_poller_delay: Duration,
        position_poller_delay: Duration,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<PositionerInner>| {
            let status_weak = weak.clone();
            let position_weak = weak.clone();

            PositionerInner {
                positioner_id,
                fps,
                state: Mutex::new(PositionerState {
                    alpha: None,
                    beta: None,
                    register: StatusRegister::Unknown,
                    firmware: None,
                    disabled: false,
                    offline: false,
                    precise_moves: true,
                    interface: None,
                    bus: None,
                }),
                status_poller: Poller::new(
                    format!("status-{positioner_id}"),
                    status_poller_delay,
                    move || {
                        let weak = status_weak.clone();
                        async move {
                            if let Some(inner) = weak.upgrade() {
                                let _ = Positioner { inner }.update_status(None).await;
                            }
                        }
                    },
                ),
                position_poller: Poller::new(
                    format!("position-{positioner_id}"),
                    position_poller_delay,
                    move || {
                        let weak = position_weak.clone();
                        async move {
                            if let Some(inner) = weak.upgrade() {
                                let _ = Positioner { inner }.update_position(None).await;
                            }
                        }
                    },
                ),
            }
        });

        Positioner { inner }
    }

    fn fps(&self) -> Result<Fps, FpsError> {
        self.inner.fps.upgrade().ok_or(FpsError::NoCanConnection)
    }

    fn with_state<T>(&self, f: impl FnOnce(&PositionerState) -> T) -> T {
        f(&self.inner.state.lock().expect("positioner state lock"))
    }

    fn with_state_mut<T>(&self, f: impl FnOnce(&mut PositionerState) -> T) -> T {
        f(&mut self.inner.state.lock().expect("positioner state lock"))
    }

    pub fn positioner_id(&self) -> u16 {
        self.inner.positioner_id
    }

    pub fn alpha(&self) -> Option<f64> {
        self.with_state(|s| s.alpha)
    }

    pub fn beta(&self) -> Option<f64> {
        self.with_state(|s| s.beta)
    }

    /// Both arm angles, when both are known.
    pub fn position(&self) -> Option<(f64, f64)> {
        self.with_state(|s| s.alpha.zip(s.beta))
    }

    /// The status register in normal mode, or UNKNOWN.
    pub fn status(&self) -> PositionerStatus {
        self.with_state(|s| match s.register {
            StatusRegister::Normal(status) => status,
            _ => PositionerStatus::UNKNOWN,
        })
    }

    pub fn register(&self) -> StatusRegister {
        self.with_state(|s| s.register)
    }

    pub fn firmware(&self) -> Option<String> {
        self.with_state(|s| s.firmware.clone())
    }

    pub fn disabled(&self) -> bool {
        self.with_state(|s| s.disabled)
    }

    pub fn offline(&self) -> bool {
        self.with_state(|s| s.offline)
    }

    pub fn precise_moves(&self) -> bool {
        self.with_state(|s| s.precise_moves)
    }

    pub fn interface(&self) -> Option<usize> {
        self.with_state(|s| s.interface)
    }

    pub fn bus(&self) -> Option<u8> {
        self.with_state(|s| s.bus)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.with_state_mut(|s| s.disabled = disabled);
    }

    /// Marks the robot offline. Offline implies disabled.
    pub fn set_offline(&self, offline: bool) {
        self.with_state_mut(|s| {
            s.offline = offline;
            if offline {
                s.disabled = true;
            }
        });
    }

    pub fn set_firmware(&self, firmware: Option<String>) {
        self.with_state_mut(|s| s.firmware = firmware);
    }

    pub fn set_route(&self, interface: Option<usize>, bus: Option<u8>) {
        self.with_state_mut(|s| {
            s.interface = interface;
            s.bus = bus;
        });
    }

    /// Fixes the position without talking to the robot, for offline
    /// robots whose pose is configured.
    pub fn set_fixed_position(&self, alpha: f64, beta: f64) {
        self.with_state_mut(|s| {
            s.alpha = Some(alpha);
            s.beta = Some(beta);
        });
    }

    /// Whether the firmware minor version denotes bootloader mode.
    /// `None` when the firmware is not yet known.
    pub fn is_bootloader(&self) -> Option<bool> {
        self.with_state(|s| s.firmware.as_deref().map(data::is_bootloader))
    }

    /// Either arm reports a collision. Collision bits are sticky in the
    /// firmware until a STOP_TRAJECTORY clears them.
    pub fn collision(&self) -> bool {
        self.status().collision()
    }

    /// System booted and both datums initialised (or, in bootloader
    /// mode, any known status).
    pub fn initialised(&self) -> bool {
        match self.register() {
            StatusRegister::Unknown => false,
            StatusRegister::Bootloader(status) => !status.contains(BootloaderStatus::UNKNOWN),
            StatusRegister::Normal(status) => {
                status.contains(
                    PositionerStatus::SYSTEM_INITIALIZED
                        | PositionerStatus::DATUM_ALPHA_INITIALIZED
                        | PositionerStatus::DATUM_BETA_INITIALIZED,
                )
            }
        }
    }

    /// Clears runtime state and stops the pollers.
    pub async fn reset(&self) {
        self.with_state_mut(|s| {
            s.alpha = None;
            s.beta = None;
            s.register = StatusRegister::Unknown;
            s.firmware = None;
        });
        self.stop_pollers().await;
    }

    pub fn start_pollers(&self) {
        self.inner.status_poller.start();
        self.inner.position_poller.start();
    }

    pub async fn stop_pollers(&self) {
        self.inner.status_poller.stop().await;
        self.inner.position_poller.stop().await;
    }

    /// Interprets a raw status register according to the firmware mode.
    pub fn update_status_raw(&self, raw: u64) {
        let bootloader = self.is_bootloader() == Some(true);

        self.with_state_mut(|s| {
            s.register = if bootloader {
                StatusRegister::Bootloader(BootloaderStatus::from_bits_truncate(raw))
            } else {
                StatusRegister::Normal(PositionerStatus::from_bits_truncate(raw))
            };
        });

        debug!(
            positioner_id = self.positioner_id(),
            status = ?self.register(),
            "status updated"
        );
    }

    pub fn update_position_values(&self, alpha: f64, beta: f64) {
        self.with_state_mut(|s| {
            s.alpha = Some(alpha);
            s.beta = Some(beta);
        });
    }

    /// Queries and stores this robot's status register.
    pub async fn update_status(&self, timeout: Option<Duration>) -> Result<(), FpsError> {
        let fps = self.fps()?;
        let pid = self.positioner_id();

        let command = fps
            .send_command(
                CommandId::GetStatus,
                SendOptions::to(vec![pid]).timeout(
                    timeout.map(Timeout::After).unwrap_or(Timeout::After(Duration::from_secs(1))),
                ),
            )
            .await?;
        command.result().await?;

        match command.positioner_status().get(&pid) {
            Some(&raw) => {
                self.update_status_raw(raw);
                Ok(())
            }
            None => Err(FpsError::Positioner {
                positioner_id: pid,
                reason: "no status reply".to_string(),
            }),
        }
    }

    /// Queries and stores the current arm angles.
    pub async fn update_position(&self, timeout: Option<Duration>) -> Result<(), FpsError> {
        let fps = self.fps()?;
        let pid = self.positioner_id();
        let motor_steps = fps.config().positioner.motor_steps;

        let command = fps
            .send_command(
                CommandId::GetActualPosition,
                SendOptions::to(vec![pid]).timeout(
                    timeout.map(Timeout::After).unwrap_or(Timeout::After(Duration::from_secs(1))),
                ),
            )
            .await?;
        command.result().await?;

        match command.positions(motor_steps).get(&pid) {
            Some(&(alpha, beta)) => {
                self.update_position_values(alpha, beta);
                debug!(positioner_id = pid, alpha, beta, "position updated");
                Ok(())
            }
            None => Err(FpsError::Positioner {
                positioner_id: pid,
                reason: "no position reply".to_string(),
            }),
        }
    }

    /// Polls the status until all requested bits are present. Returns
    /// `false` on timeout.
    pub async fn wait_for_status(
        &self,
        bits: PositionerStatus,
        poll_interval: Duration,
        timeout: Duration,
    ) -> bool {
        if self.is_bootloader() == Some(true) {
            error!(
                positioner_id = self.positioner_id(),
                "cannot wait for status in bootloader mode"
            );
            return false;
        }

        let wait = async {
            loop {
                let _ = self.update_status(Some(Duration::from_secs(1))).await;
                if self.status().contains(bits) {
                    return;
                }
                tokio::time::sleep(poll_interval).await;
            }
        };

        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Brings the robot to a known, stopped, configured state after its
    /// firmware and status have been probed.
    pub async fn initialise(&self, disable_precise_moves: bool) -> Result<(), FpsError> {
        let fps = self.fps()?;
        let pid = self.positioner_id();

        debug!(positioner_id = pid, "initialising");

        self.update_status(Some(Duration::from_secs(2))).await?;

        // Bootloader mode accepts no motion setup.
        if self.is_bootloader() == Some(true) {
            debug!(positioner_id = pid, "positioner is in bootloader mode");
            return Ok(());
        }

        if !self.initialised() {
            return Err(FpsError::Positioner {
                positioner_id: pid,
                reason: "system or datums not initialised".to_string(),
            });
        }

        // Abort any half-received trajectory before touching settings.
        let abort = fps
            .send_command(
                CommandId::SendTrajectoryAbort,
                SendOptions::to(vec![pid]),
            )
            .await?;
        abort.result().await?;

        let motor_speed = fps.config().positioner.motor_speed;
        self.set_speed(motor_speed, motor_speed).await?;

        if disable_precise_moves {
            for command_id in [
                CommandId::SwitchOffPreciseMoveAlpha,
                CommandId::SwitchOffPreciseMoveBeta,
            ] {
                let command = fps
                    .send_command(command_id, SendOptions::to(vec![pid]))
                    .await?;
                command.result().await?;
            }
            self.with_state_mut(|s| s.precise_moves = false);
        }

        debug!(positioner_id = pid, "initialisation complete");

        Ok(())
    }

    /// Sets the motor speeds, RPM.
    pub async fn set_speed(&self, alpha: f64, beta: f64) -> Result<(), FpsError> {
        let fps = self.fps()?;
        let data = data::motor_pair_data(alpha, beta).map_err(crate::error::CommandError::from)?;

        let command = fps
            .send_command(
                CommandId::SetSpeed,
                SendOptions::to(vec![self.positioner_id()]).data(CommandData::Single(data)),
            )
            .await?;
        command.result().await?;
        Ok(())
    }

    /// Overwrites the firmware's idea of the current arm angles.
    pub async fn set_position(&self, alpha: f64, beta: f64) -> Result<(), FpsError> {
        let fps = self.fps()?;
        let motor_steps = fps.config().positioner.motor_steps;

        let command = fps
            .send_command(
                CommandId::SetActualPosition,
                SendOptions::to(vec![self.positioner_id()])
                    .data(CommandData::Single(data::position_data(alpha, beta, motor_steps))),
            )
            .await?;
        command.result().await?;

        self.update_position_values(alpha, beta);
        Ok(())
    }

    /// Moves both arms and blocks until the move completes or times out.
    pub async fn goto(
        &self,
        alpha: f64,
        beta: f64,
        speed: Option<f64>,
        relative: bool,
    ) -> Result<(), FpsError> {
        let fps = self.fps()?;
        let pid = self.positioner_id();

        if self.disabled() {
            return Err(FpsError::Positioner {
                positioner_id: pid,
                reason: "positioner is disabled".to_string(),
            });
        }

        if !self.initialised() {
            return Err(FpsError::Positioner {
                positioner_id: pid,
                reason: "positioner is not initialised".to_string(),
            });
        }

        if !relative && !((0.0..=360.0).contains(&alpha) && (0.0..=360.0).contains(&beta)) {
            return Err(FpsError::Positioner {
                positioner_id: pid,
                reason: format!("({alpha}, {beta}) is outside the 0-360 range"),
            });
        }

        if let Some(speed) = speed {
            self.set_speed(speed, speed).await?;
        }

        let config = fps.config();
        let motor_steps = config.positioner.motor_steps;
        let time_step = config.positioner.time_step;

        let command_id = if relative {
            CommandId::GoToRelativePosition
        } else {
            CommandId::GoToAbsolutePosition
        };

        info!(positioner_id = pid, alpha, beta, relative, "goto");

        let command = fps
            .send_command(
                command_id,
                SendOptions::to(vec![pid])
                    .data(CommandData::Single(data::position_data(alpha, beta, motor_steps))),
            )
            .await?;
        command.result().await?;

        // The firmware reports how long it thinks the move will take.
        let move_time = command
            .move_times(time_step)
            .get(&pid)
            .map(|&(a, b)| a.max(b))
            .unwrap_or(0.0);

        debug!(positioner_id = pid, move_time, "waiting for the move to finish");
        tokio::time::sleep(Duration::from_secs_f64(move_time)).await;

        let reached = self
            .wait_for_status(
                PositionerStatus::DISPLACEMENT_COMPLETED,
                Duration::from_millis(100),
                GOTO_STATUS_TIMEOUT,
            )
            .await;

        if !reached {
            return Err(FpsError::Positioner {
                positioner_id: pid,
                reason: "did not reach the commanded position".to_string(),
            });
        }

        self.update_position(None).await?;

        info!(positioner_id = pid, "position reached");

        Ok(())
    }

    pub fn report(&self) -> PositionerReport {
        let (status_bits, status_names) = match self.register() {
            StatusRegister::Unknown => (0, "UNKNOWN".to_string()),
            StatusRegister::Normal(status) => (status.bits(), format!("{status:?}")),
            StatusRegister::Bootloader(status) => (status.bits(), format!("{status:?}")),
        };

        self.with_state(|s| PositionerReport {
            positioner_id: self.inner.positioner_id,
            alpha: s.alpha,
            beta: s.beta,
            status: status_bits,
            status_names,
            firmware: s.firmware.clone(),
            disabled: s.disabled,
            offline: s.offline,
        })
    }
}

impl std::fmt::Debug for Positioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Positioner")
            .field("positioner_id", &self.positioner_id())
            .field("register", &self.register())
            .field("disabled", &self.disabled())
            .field("offline", &self.offline())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare(positioner_id: u16) -> Positioner {
        Positioner::new(
            positioner_id,
            WeakFps::default(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn offline_implies_disabled() {
        let positioner = bare(12);
        assert!(!positioner.disabled());

        positioner.set_offline(true);
        assert!(positioner.disabled());
        assert!(positioner.offline());

        positioner.set_offline(false);
        // Coming back online does not silently re-enable the robot.
        assert!(positioner.disabled());
    }

    #[tokio::test]
    async fn status_interpretation_follows_firmware_mode() {
        let positioner = bare(4);

        positioner.set_firmware(Some("04.01.21".to_string()));
        positioner.update_status_raw(
            (PositionerStatus::SYSTEM_INITIALIZED
                | PositionerStatus::DATUM_ALPHA_INITIALIZED
                | PositionerStatus::DATUM_BETA_INITIALIZED)
                .bits(),
        );
        assert!(positioner.initialised());
        assert!(!positioner.collision());

        positioner.set_firmware(Some("04.80.21".to_string()));
        assert_eq!(positioner.is_bootloader(), Some(true));
        positioner.update_status_raw(BootloaderStatus::BOOTLOADER_INIT.bits());
        assert!(matches!(
            positioner.register(),
            StatusRegister::Bootloader(_)
        ));
        assert!(positioner.initialised());
    }

    #[tokio::test]
    async fn collision_bits_are_visible() {
        let positioner = bare(17);
        positioner.set_firmware(Some("04.01.21".to_string()));
        positioner.update_status_raw(PositionerStatus::COLLISION_BETA.bits());
        assert!(positioner.collision());
    }

    #[tokio::test]
    async fn reset_clears_runtime_state() {
        let positioner = bare(9);
        positioner.set_firmware(Some("04.01.21".to_string()));
        positioner.update_position_values(10.0, 170.0);

        positioner.reset().await;
        assert_eq!(positioner.position(), None);
        assert_eq!(positioner.firmware(), None);
        assert!(matches!(positioner.register(), StatusRegister::Unknown));
    }
}

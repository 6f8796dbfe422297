//! Virtual positioner firmware.
//!
//! [`VirtualFirmware`] binds to a [`VirtualBus`] and emulates an array
//! of positioners: it answers the query commands, executes goto moves
//! and trajectories on virtual time, and can be told to misbehave
//! (silent robots, forced response codes, injected collisions) to drive
//! failure paths in tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use canopus_proto::{
    data, encode_identifier, CommandId, PositionerStatus, ResponseCode,
};

use crate::can::message::Message;
use crate::can::virtual_bus::VirtualBus;
use crate::ieb::{DeviceBank, DeviceError, DeviceValue, SYNC_DEVICE};
use crate::trajectory::goto_move_time;

/// Status of a healthy, initialised, parked robot.
pub fn default_status() -> PositionerStatus {
    PositionerStatus::SYSTEM_INITIALIZED
        | PositionerStatus::DATUM_ALPHA_INITIALIZED
        | PositionerStatus::DATUM_BETA_INITIALIZED
        | PositionerStatus::DATUM_ALPHA_CALIBRATED
        | PositionerStatus::DATUM_BETA_CALIBRATED
        | PositionerStatus::MOTOR_ALPHA_CALIBRATED
        | PositionerStatus::MOTOR_BETA_CALIBRATED
        | PositionerStatus::DISPLACEMENT_COMPLETED
        | PositionerStatus::DISPLACEMENT_COMPLETED_ALPHA
        | PositionerStatus::DISPLACEMENT_COMPLETED_BETA
}

struct VirtualPositioner {
    firmware: (u8, u8, u8),
    status: PositionerStatus,
    alpha: f64,
    beta: f64,
    speed: (f64, f64),
    /// Never replies; emulates an offline robot.
    silent: bool,
    /// Forced response codes per command.
    overrides: HashMap<CommandId, ResponseCode>,
    expected_points: Option<(u32, u32)>,
    alpha_points: Vec<(f64, f64)>,
    beta_points: Vec<(f64, f64)>,
}

impl VirtualPositioner {
    fn new() -> Self {
        Self {
            firmware: (4, 1, 21),
            status: default_status(),
            alpha: 0.0,
            beta: 180.0,
            speed: (2000.0, 2000.0),
            silent: false,
            overrides: HashMap::new(),
            expected_points: None,
            alpha_points: Vec::new(),
            beta_points: Vec::new(),
        }
    }
}

struct FirmwareInner {
    uid_bits: u32,
    motor_steps: u32,
    time_step: f64,
    positioners: Mutex<HashMap<u16, VirtualPositioner>>,
    command_log: Mutex<Vec<(u16, CommandId)>>,
    inject: mpsc::UnboundedSender<Message>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// An emulated positioner array attached to a virtual bus.
#[derive(Clone)]
pub struct VirtualFirmware {
    inner: Arc<FirmwareInner>,
}

impl VirtualFirmware {
    /// Attaches an array of robots to the bus and starts answering.
    pub fn start(
        bus: &VirtualBus,
        positioner_ids: &[u16],
        uid_bits: u32,
        motor_steps: u32,
        time_step: f64,
    ) -> Self {
        let (sent_rx, inject) = bus.attach();

        let positioners = positioner_ids
            .iter()
            .map(|&pid| (pid, VirtualPositioner::new()))
            .collect();

        let inner = Arc::new(FirmwareInner {
            uid_bits,
            motor_steps,
            time_step,
            positioners: Mutex::new(positioners),
            command_log: Mutex::new(Vec::new()),
            inject,
            task: Mutex::new(None),
        });

        let firmware = VirtualFirmware { inner };
        firmware.spawn_listener(sent_rx);
        firmware
    }

    fn spawn_listener(&self, mut sent_rx: broadcast::Receiver<Message>) {
        let weak = Arc::downgrade(&self.inner);

        let task = tokio::spawn(async move {
            loop {
                match sent_rx.recv().await {
                    Ok(message) => {
                        let Some(inner) = weak.upgrade() else { break };
                        VirtualFirmware { inner }.handle(message);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "virtual firmware lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        *self.inner.task.lock().expect("firmware task lock") = Some(task);
    }

    pub fn stop(&self) {
        if let Some(task) = self.inner.task.lock().expect("firmware task lock").take() {
            task.abort();
        }
    }

    /// Forces a response code for one command of one robot.
    pub fn set_response_override(
        &self,
        positioner_id: u16,
        command_id: CommandId,
        code: ResponseCode,
    ) {
        if let Some(state) = self.positioners().get_mut(&positioner_id) {
            state.overrides.insert(command_id, code);
        }
    }

    /// Makes a robot stop answering entirely.
    pub fn set_silent(&self, positioner_id: u16, silent: bool) {
        if let Some(state) = self.positioners().get_mut(&positioner_id) {
            state.silent = silent;
        }
    }

    /// Overwrites the status register of one robot.
    pub fn set_status(&self, positioner_id: u16, status: PositionerStatus) {
        if let Some(state) = self.positioners().get_mut(&positioner_id) {
            state.status = status;
        }
    }

    pub fn status(&self, positioner_id: u16) -> Option<PositionerStatus> {
        self.positioners().get(&positioner_id).map(|s| s.status)
    }

    pub fn position(&self, positioner_id: u16) -> Option<(f64, f64)> {
        self.positioners()
            .get(&positioner_id)
            .map(|s| (s.alpha, s.beta))
    }

    pub fn set_position(&self, positioner_id: u16, alpha: f64, beta: f64) {
        if let Some(state) = self.positioners().get_mut(&positioner_id) {
            state.alpha = alpha;
            state.beta = beta;
        }
    }

    /// Marks a robot collided and emits the spontaneous
    /// COLLISION_DETECTED frame the firmware sends.
    pub fn inject_collision(&self, positioner_id: u16) {
        if let Some(state) = self.positioners().get_mut(&positioner_id) {
            state.status |= PositionerStatus::COLLISION_BETA;
            state.status -= PositionerStatus::DISPLACEMENT_COMPLETED;
        }

        self.reply(
            positioner_id,
            CommandId::CollisionDetected,
            0,
            ResponseCode::CommandAccepted,
            Vec::new(),
        );
    }

    /// Starts every loaded trajectory, as the hardware sync line would.
    pub fn trigger_sync(&self) {
        let ids: Vec<u16> = self.positioners().keys().copied().collect();
        for pid in ids {
            self.start_motion(pid);
        }
    }

    fn positioners(&self) -> std::sync::MutexGuard<'_, HashMap<u16, VirtualPositioner>> {
        self.inner.positioners.lock().expect("virtual positioner lock")
    }

    fn reply(
        &self,
        positioner_id: u16,
        command_id: CommandId,
        uid: u8,
        code: ResponseCode,
        data: Vec<u8>,
    ) {
        let Ok(arbitration_id) = encode_identifier(
            positioner_id,
            command_id.as_u16(),
            uid,
            code as u8,
            self.inner.uid_bits,
        ) else {
            return;
        };

        let Ok(message) =
            Message::from_frame(arbitration_id, data, self.inner.uid_bits, None, None)
        else {
            return;
        };

        let _ = self.inner.inject.send(message);
    }

    /// Every `(positioner_id, command)` pair seen on the bus, with
    /// `positioner_id` 0 for broadcasts.
    pub fn commands_seen(&self) -> Vec<(u16, CommandId)> {
        self.inner.command_log.lock().expect("command log lock").clone()
    }

    fn handle(&self, message: Message) {
        let Ok(command_id) = CommandId::try_from(message.command_id) else {
            return;
        };

        self.inner
            .command_log
            .lock()
            .expect("command log lock")
            .push((message.positioner_id, command_id));

        let targets: Vec<u16> = if message.positioner_id == 0 {
            let mut ids: Vec<u16> = self.positioners().keys().copied().collect();
            ids.sort_unstable();
            ids
        } else if self.positioners().contains_key(&message.positioner_id) {
            vec![message.positioner_id]
        } else {
            return;
        };

        for pid in targets {
            self.handle_for(pid, command_id, &message);
        }
    }

    fn handle_for(&self, pid: u16, command_id: CommandId, message: &Message) {
        let uid = message.uid;
        let motor_steps = self.inner.motor_steps;
        let time_step = self.inner.time_step;

        enum Action {
            None,
            Goto { alpha: f64, beta: f64, move_time: f64 },
            StartMotion,
        }

        let mut action = Action::None;

        let outcome: Option<(ResponseCode, Vec<u8>)> = {
            let mut positioners = self.positioners();
            let Some(state) = positioners.get_mut(&pid) else {
                return;
            };

            if state.silent {
                None
            } else if let Some(&code) = state.overrides.get(&command_id) {
                Some((code, Vec::new()))
            } else {
                let ok = ResponseCode::CommandAccepted;

                match command_id {
                    CommandId::GetId => Some((ok, Vec::new())),

                    CommandId::GetFirmwareVersion => {
                        let (major, minor, patch) = state.firmware;
                        Some((ok, vec![0, major, minor, patch]))
                    }

                    CommandId::GetStatus => {
                        Some((ok, state.status.bits().to_le_bytes().to_vec()))
                    }

                    CommandId::GetActualPosition => {
                        let mut data = Vec::with_capacity(8);
                        data.extend_from_slice(
                            &data::angle_to_steps(state.beta, motor_steps).to_le_bytes(),
                        );
                        data.extend_from_slice(
                            &data::angle_to_steps(state.alpha, motor_steps).to_le_bytes(),
                        );
                        Some((ok, data))
                    }

                    CommandId::GoToAbsolutePosition | CommandId::GoToRelativePosition => {
                        if state.status.collision() {
                            Some((ResponseCode::CollisionDetected, Vec::new()))
                        } else {
                            match parse_position(&message.data, motor_steps) {
                                Some((alpha_target, beta_target)) => {
                                    let (alpha, beta) =
                                        if command_id == CommandId::GoToRelativePosition {
                                            (state.alpha + alpha_target, state.beta + beta_target)
                                        } else {
                                            (alpha_target, beta_target)
                                        };

                                    let alpha_time =
                                        goto_move_time(alpha - state.alpha, state.speed.0);
                                    let beta_time =
                                        goto_move_time(beta - state.beta, state.speed.1);

                                    state.status -= PositionerStatus::DISPLACEMENT_COMPLETED
                                        | PositionerStatus::DISPLACEMENT_COMPLETED_ALPHA
                                        | PositionerStatus::DISPLACEMENT_COMPLETED_BETA;

                                    let mut reply = Vec::with_capacity(8);
                                    reply.extend_from_slice(
                                        &data::seconds_to_ticks(alpha_time, time_step)
                                            .to_le_bytes(),
                                    );
                                    reply.extend_from_slice(
                                        &data::seconds_to_ticks(beta_time, time_step)
                                            .to_le_bytes(),
                                    );

                                    action = Action::Goto {
                                        alpha,
                                        beta,
                                        move_time: alpha_time.max(beta_time),
                                    };

                                    Some((ok, reply))
                                }
                                None => Some((ResponseCode::IncorrectAmountOfData, Vec::new())),
                            }
                        }
                    }

                    CommandId::SetActualPosition => {
                        match parse_position(&message.data, motor_steps) {
                            Some((alpha, beta)) => {
                                state.alpha = alpha;
                                state.beta = beta;
                                Some((ok, Vec::new()))
                            }
                            None => Some((ResponseCode::IncorrectAmountOfData, Vec::new())),
                        }
                    }

                    CommandId::SetSpeed => match parse_pair_u32(&message.data) {
                        Some((alpha, beta)) => {
                            state.speed = (alpha as f64, beta as f64);
                            Some((ok, Vec::new()))
                        }
                        None => Some((ResponseCode::IncorrectAmountOfData, Vec::new())),
                    },

                    CommandId::SendTrajectoryAbort => {
                        state.expected_points = None;
                        state.alpha_points.clear();
                        state.beta_points.clear();
                        state.status -= PositionerStatus::RECEIVING_TRAJECTORY
                            | PositionerStatus::TRAJECTORY_ALPHA_RECEIVED
                            | PositionerStatus::TRAJECTORY_BETA_RECEIVED;
                        Some((ok, Vec::new()))
                    }

                    CommandId::StopTrajectory => {
                        state.status -= PositionerStatus::COLLISION_ALPHA
                            | PositionerStatus::COLLISION_BETA
                            | PositionerStatus::RECEIVING_TRAJECTORY;
                        state.status |= PositionerStatus::DISPLACEMENT_COMPLETED
                            | PositionerStatus::DISPLACEMENT_COMPLETED_ALPHA
                            | PositionerStatus::DISPLACEMENT_COMPLETED_BETA;
                        Some((ok, Vec::new()))
                    }

                    CommandId::SendNewTrajectory => {
                        if state.status.collision() {
                            Some((ResponseCode::CollisionDetected, Vec::new()))
                        } else if !state.status.ready_for_trajectory() {
                            Some((ResponseCode::DatumNotInitialized, Vec::new()))
                        } else {
                            match parse_pair_u32(&message.data) {
                                Some((n_alpha, n_beta)) => {
                                    state.expected_points = Some((n_alpha, n_beta));
                                    state.alpha_points.clear();
                                    state.beta_points.clear();
                                    state.status |= PositionerStatus::RECEIVING_TRAJECTORY;
                                    Some((ok, Vec::new()))
                                }
                                None => {
                                    Some((ResponseCode::IncorrectAmountOfData, Vec::new()))
                                }
                            }
                        }
                    }

                    CommandId::SendTrajectoryData => {
                        let Some((n_alpha, _)) = state.expected_points else {
                            return;
                        };

                        match parse_trajectory_point(&message.data, motor_steps, time_step) {
                            Some(point) => {
                                // Alpha samples stream first; the counts
                                // announced upfront tell the arms apart.
                                if (state.alpha_points.len() as u32) < n_alpha {
                                    state.alpha_points.push(point);
                                } else {
                                    state.beta_points.push(point);
                                }
                                Some((ok, Vec::new()))
                            }
                            None => Some((ResponseCode::IncorrectAmountOfData, Vec::new())),
                        }
                    }

                    CommandId::TrajectoryDataEnd => match state.expected_points {
                        Some((n_alpha, n_beta))
                            if state.alpha_points.len() as u32 == n_alpha
                                && state.beta_points.len() as u32 == n_beta =>
                        {
                            state.status -= PositionerStatus::RECEIVING_TRAJECTORY;
                            state.status |= PositionerStatus::TRAJECTORY_ALPHA_RECEIVED
                                | PositionerStatus::TRAJECTORY_BETA_RECEIVED;
                            Some((ok, Vec::new()))
                        }
                        _ => Some((ResponseCode::InvalidTrajectory, Vec::new())),
                    },

                    CommandId::StartTrajectory => {
                        action = Action::StartMotion;
                        Some((ok, Vec::new()))
                    }

                    // Settings and mode switches are accepted silently.
                    _ => Some((ok, Vec::new())),
                }
            }
        };

        match action {
            Action::Goto {
                alpha,
                beta,
                move_time,
            } => self.finish_move_later(pid, alpha, beta, move_time),
            Action::StartMotion => self.start_motion(pid),
            Action::None => {}
        }

        if let Some((code, data)) = outcome {
            self.reply(pid, command_id, uid, code, data);
        }
    }

    /// Begins executing a loaded trajectory on virtual time.
    fn start_motion(&self, pid: u16) {
        let (target, move_time) = {
            let mut positioners = self.positioners();
            let Some(state) = positioners.get_mut(&pid) else {
                return;
            };

            if !state
                .status
                .contains(PositionerStatus::TRAJECTORY_ALPHA_RECEIVED)
            {
                return;
            }

            let Some(&(alpha_end, _)) = state.alpha_points.last() else {
                return;
            };
            let Some(&(beta_end, _)) = state.beta_points.last() else {
                return;
            };

            let move_time = state
                .alpha_points
                .iter()
                .chain(&state.beta_points)
                .map(|&(_, time)| time)
                .fold(0.0f64, f64::max);

            state.status -= PositionerStatus::DISPLACEMENT_COMPLETED
                | PositionerStatus::DISPLACEMENT_COMPLETED_ALPHA
                | PositionerStatus::DISPLACEMENT_COMPLETED_BETA
                | PositionerStatus::TRAJECTORY_ALPHA_RECEIVED
                | PositionerStatus::TRAJECTORY_BETA_RECEIVED;

            ((alpha_end, beta_end), move_time)
        };

        self.finish_move_later(pid, target.0, target.1, move_time);
    }

    fn finish_move_later(&self, pid: u16, alpha: f64, beta: f64, move_time: f64) {
        let weak: Weak<FirmwareInner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(move_time)).await;

            let Some(inner) = weak.upgrade() else { return };
            let mut positioners = inner.positioners.lock().expect("virtual positioner lock");
            if let Some(state) = positioners.get_mut(&pid) {
                // A collision mid-move leaves the robot where it is.
                if state.status.collision() {
                    return;
                }
                state.alpha = alpha;
                state.beta = beta;
                state.status |= PositionerStatus::DISPLACEMENT_COMPLETED
                    | PositionerStatus::DISPLACEMENT_COMPLETED_ALPHA
                    | PositionerStatus::DISPLACEMENT_COMPLETED_BETA;
            }
        });
    }
}

fn parse_position(data: &[u8], motor_steps: u32) -> Option<(f64, f64)> {
    if data.len() != 8 {
        return None;
    }
    let alpha_steps = i32::from_le_bytes(data[0..4].try_into().ok()?);
    let beta_steps = i32::from_le_bytes(data[4..8].try_into().ok()?);
    Some((
        data::steps_to_angle(alpha_steps, motor_steps),
        data::steps_to_angle(beta_steps, motor_steps),
    ))
}

fn parse_pair_u32(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() != 8 {
        return None;
    }
    Some((
        u32::from_le_bytes(data[0..4].try_into().ok()?),
        u32::from_le_bytes(data[4..8].try_into().ok()?),
    ))
}

fn parse_trajectory_point(data: &[u8], motor_steps: u32, time_step: f64) -> Option<(f64, f64)> {
    if data.len() != 8 {
        return None;
    }
    let steps = i32::from_le_bytes(data[0..4].try_into().ok()?);
    let ticks = u32::from_le_bytes(data[4..8].try_into().ok()?);
    Some((
        data::steps_to_angle(steps, motor_steps),
        data::ticks_to_seconds(ticks, time_step),
    ))
}

/// In-memory device bank with a settable temperature sensor and a
/// recorded sync-line relay.
pub struct MockIeb {
    devices: Mutex<HashMap<String, DeviceValue>>,
    writes: Mutex<Vec<(String, DeviceValue)>>,
    on_sync_close: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    disabled: std::sync::atomic::AtomicBool,
}

impl MockIeb {
    pub fn new() -> Self {
        let mut devices = HashMap::new();
        devices.insert(SYNC_DEVICE.to_string(), DeviceValue::Relay(false));
        devices.insert("rtd2".to_string(), DeviceValue::Measured(10.0));

        Self {
            devices: Mutex::new(devices),
            writes: Mutex::new(Vec::new()),
            on_sync_close: Mutex::new(None),
            disabled: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_temperature(&self, sensor: &str, value: f64) {
        self.devices
            .lock()
            .expect("mock device lock")
            .insert(sensor.to_string(), DeviceValue::Measured(value));
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled
            .store(disabled, std::sync::atomic::Ordering::SeqCst);
    }

    /// Invoked when the sync relay is driven closed; wire this to
    /// [`VirtualFirmware::trigger_sync`].
    pub fn set_on_sync_close(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_sync_close.lock().expect("sync hook lock") = Some(Box::new(hook));
    }

    /// Every write seen, in order.
    pub fn write_history(&self) -> Vec<(String, DeviceValue)> {
        self.writes.lock().expect("mock write lock").clone()
    }
}

impl Default for MockIeb {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceBank for MockIeb {
    async fn read(&self, device: &str) -> Result<DeviceValue, DeviceError> {
        if self.disabled() {
            return Err(DeviceError::Disabled);
        }
        self.devices
            .lock()
            .expect("mock device lock")
            .get(device)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownDevice(device.to_string()))
    }

    async fn write(&self, device: &str, value: DeviceValue) -> Result<(), DeviceError> {
        if self.disabled() {
            return Err(DeviceError::Disabled);
        }

        self.devices
            .lock()
            .expect("mock device lock")
            .insert(device.to_string(), value.clone());
        self.writes
            .lock()
            .expect("mock write lock")
            .push((device.to_string(), value.clone()));

        if device == SYNC_DEVICE && value == DeviceValue::Relay(true) {
            if let Some(hook) = self.on_sync_close.lock().expect("sync hook lock").as_ref() {
                hook();
            }
        }

        Ok(())
    }

    fn disabled(&self) -> bool {
        self.disabled.load(std::sync::atomic::Ordering::SeqCst)
    }
}

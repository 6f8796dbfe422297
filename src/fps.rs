//! The FPS supervisor.
//!
//! [`Fps`] owns the positioners, the CAN network, the lock state, and
//! the background machinery (pollers, low-temperature monitor). Every
//! outbound command funnels through [`Fps::send_command`], which is
//! where the lock, motion, bootloader and disabled-robot guards live.
//!
//! A collision report locks the array: all trajectories are stopped
//! (without clearing the collision flags) and every non-safe command is
//! refused until [`Fps::unlock`] verifies the collisions are gone.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use canopus_proto::{descriptor, CommandId, FpsStatus, PositionerStatus};

use crate::can::CanNetwork;
use crate::command::{Command, CommandData, Timeout};
use crate::config::Config;
use crate::error::FpsError;
use crate::ieb::{DeviceBank, SyncLine};
use crate::planner::{GridEntry, PathPlanner};
use crate::pollers::{Poller, PollerList};
use crate::positioner::{Positioner, PositionerReport};
use crate::trajectory::{
    goto_move_time, send_trajectory, ArmPath, Trajectory, TrajectoryData, TrajectoryOptions,
};

/// Settle time after an emergency stop before new commands are safe.
const STOP_TRAJECTORY_SETTLE: Duration = Duration::from_millis(500);

/// Valid motor speed range, RPM.
const SPEED_RANGE: std::ops::RangeInclusive<f64> = 500.0..=5000.0;

static FPS_INSTANCE: Mutex<Option<Weak<FpsInner>>> = Mutex::new(None);

/// Events pushed to observers (the thin actor layer subscribes to
/// these; the core never calls into it directly).
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    Info(String),
    Warning(String),
    Error(String),
    Event {
        name: &'static str,
        data: serde_json::Value,
    },
}

pub trait Observer: Send + Sync {
    fn notify(&self, event: &ObserverEvent);
}

/// Options for [`Fps::send_command`].
#[derive(Clone, Default)]
pub struct SendOptions {
    /// Targets; `None` addresses every non-disabled positioner,
    /// `[0]` broadcasts.
    pub positioner_ids: Option<Vec<u16>>,
    pub data: CommandData,
    pub timeout: Timeout,
    /// Expected number of repliers for a broadcast.
    pub n_positioners: Option<usize>,
    /// Skip the queue and send synchronously (emergency stops).
    pub now: bool,
}

impl SendOptions {
    pub fn to(positioner_ids: Vec<u16>) -> Self {
        Self {
            positioner_ids: Some(positioner_ids),
            ..Default::default()
        }
    }

    pub fn broadcast() -> Self {
        Self::to(vec![0])
    }

    pub fn data(mut self, data: CommandData) -> Self {
        self.data = data;
        self
    }

    pub fn timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn n_positioners(mut self, n: usize) -> Self {
        self.n_positioners = Some(n);
        self
    }

    pub fn now(mut self) -> Self {
        self.now = true;
        self
    }
}

#[derive(Clone)]
pub struct InitialiseOptions {
    /// `None` follows the configuration.
    pub start_pollers: Option<bool>,
    pub enable_low_temperature: bool,
    /// Keep the accumulated disabled/offline set from previous
    /// initialisations.
    pub keep_disabled: bool,
    /// Turn fibre-assignment mismatches into errors instead of
    /// warnings.
    pub check_assignments: bool,
}

impl Default for InitialiseOptions {
    fn default() -> Self {
        Self {
            start_pollers: None,
            enable_low_temperature: true,
            keep_disabled: true,
            check_assignments: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct GotoOptions {
    pub speed: Option<f64>,
    pub relative: bool,
    pub use_sync_line: Option<bool>,
    /// Skip the path planner and drive straight to the target.
    pub go_cowboy: bool,
    /// Accept a plan even if the planner reports deadlocks.
    pub force: bool,
}

/// Full status blob for observers and reports.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: String,
    pub locked: bool,
    pub locked_by: Vec<u16>,
    pub n_positioners: usize,
    pub positioners: BTreeMap<u16, PositionerReport>,
    pub devices: serde_json::Value,
    pub ieb: bool,
}

struct PidLock {
    path: PathBuf,
}

impl PidLock {
    fn acquire(path: PathBuf) -> Result<PidLock, FpsError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => {
                use std::io::Write;
                let mut file = file;
                let _ = writeln!(file, "{}", std::process::id());
                Ok(PidLock { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(FpsError::AlreadyRunning(path))
            }
            Err(err) => Err(FpsError::Can(crate::error::CanError::Io(err))),
        }
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub(crate) struct FpsInner {
    config: RwLock<Config>,
    can: Mutex<Option<CanNetwork>>,
    positioners: RwLock<HashMap<u16, Positioner>>,
    status_tx: watch::Sender<FpsStatus>,
    locked: AtomicBool,
    locked_by: Mutex<Vec<u16>>,
    disabled: Mutex<HashSet<u16>>,
    ieb: Mutex<Option<Arc<dyn DeviceBank>>>,
    planner: Mutex<Option<Arc<dyn PathPlanner>>>,
    pollers: PollerList,
    temperature_task: Mutex<Option<JoinHandle<()>>>,
    pid_lock: Mutex<Option<PidLock>>,
    observers: Mutex<Vec<Arc<dyn Observer>>>,
    initialised: AtomicBool,
}

/// Cloneable handle to the supervisor.
#[derive(Clone)]
pub struct Fps {
    inner: Arc<FpsInner>,
}

/// Non-owning handle used by background tasks and positioners.
#[derive(Clone, Default)]
pub struct WeakFps(Weak<FpsInner>);

impl WeakFps {
    pub fn upgrade(&self) -> Option<Fps> {
        self.0.upgrade().map(|inner| Fps { inner })
    }
}

impl Fps {
    /// Builds a new supervisor and installs it as the process instance,
    /// replacing any previous one.
    pub fn new(config: Config, ieb: Option<Arc<dyn DeviceBank>>) -> Fps {
        let status_poller_delay = Duration::from_secs_f64(config.fps.status_poller_delay);
        let position_poller_delay = Duration::from_secs_f64(config.fps.position_poller_delay);

        let inner = Arc::new_cyclic(|weak: &Weak<FpsInner>| {
            let status_weak = WeakFps(weak.clone());
            let position_weak = WeakFps(weak.clone());

            let (status_tx, _) =
                watch::channel(FpsStatus::IDLE | FpsStatus::TEMPERATURE_NORMAL);

            FpsInner {
                config: RwLock::new(config),
                can: Mutex::new(None),
                positioners: RwLock::new(HashMap::new()),
                status_tx,
                locked: AtomicBool::new(false),
                locked_by: Mutex::new(Vec::new()),
                disabled: Mutex::new(HashSet::new()),
                ieb: Mutex::new(ieb),
                planner: Mutex::new(None),
                pollers: PollerList::new(vec![
                    Poller::new("status", status_poller_delay, move || {
                        let weak = status_weak.clone();
                        async move {
                            if let Some(fps) = weak.upgrade() {
                                let _ = fps.update_status(None, Duration::from_secs(2)).await;
                            }
                        }
                    }),
                    Poller::new("position", position_poller_delay, move || {
                        let weak = position_weak.clone();
                        async move {
                            if let Some(fps) = weak.upgrade() {
                                let _ = fps.update_position(None, Duration::from_secs(2)).await;
                            }
                        }
                    }),
                ]),
                temperature_task: Mutex::new(None),
                pid_lock: Mutex::new(None),
                observers: Mutex::new(Vec::new()),
                initialised: AtomicBool::new(false),
            }
        });

        let fps = Fps { inner };

        *FPS_INSTANCE.lock().expect("instance slot lock") = Some(Arc::downgrade(&fps.inner));

        fps
    }

    /// The running process instance, if one exists.
    pub fn get_instance() -> Option<Fps> {
        FPS_INSTANCE
            .lock()
            .expect("instance slot lock")
            .as_ref()
            .and_then(|weak| weak.upgrade())
            .map(|inner| Fps { inner })
    }

    /// Builds, connects and initialises a supervisor in one call.
    pub async fn create(
        config: Config,
        ieb: Option<Arc<dyn DeviceBank>>,
    ) -> Result<Fps, FpsError> {
        let fps = Fps::new(config, ieb);
        fps.start_can(None).await?;
        fps.initialise(InitialiseOptions::default()).await?;
        Ok(fps)
    }

    pub fn downgrade(&self) -> WeakFps {
        WeakFps(Arc::downgrade(&self.inner))
    }

    /// A snapshot of the configuration tree.
    pub fn config(&self) -> Config {
        self.inner.config.read().expect("config lock").clone()
    }

    /// Rewrites the default motor speed (the low-temperature monitor
    /// does this on mode changes).
    pub fn set_motor_speed(&self, rpm: f64) {
        self.inner
            .config
            .write()
            .expect("config lock")
            .positioner
            .motor_speed = rpm;
    }

    pub fn add_observer(&self, observer: Arc<dyn Observer>) {
        self.inner
            .observers
            .lock()
            .expect("observer list lock")
            .push(observer);
    }

    pub fn set_planner(&self, planner: Arc<dyn PathPlanner>) {
        *self.inner.planner.lock().expect("planner lock") = Some(planner);
    }

    fn notify(&self, event: ObserverEvent) {
        for observer in self
            .inner
            .observers
            .lock()
            .expect("observer list lock")
            .iter()
        {
            observer.notify(&event);
        }
    }

    /// Connects the CAN network using the named configuration profile.
    pub async fn start_can(&self, profile: Option<&str>) -> Result<(), FpsError> {
        let config = self.config();

        if config.fps.use_lock {
            let mut pid_lock = self.inner.pid_lock.lock().expect("pid lock slot");
            if pid_lock.is_none() {
                *pid_lock = Some(PidLock::acquire(config.fps.lock_file.clone())?);
            }
        }

        let profile = config.profile(profile)?;
        let network = CanNetwork::start(profile, config.can.uid_bits).await;

        // Collision frames lock the array. Reports that arrive once the
        // FPS is already locked are a side effect of stopping
        // trajectories and are ignored.
        let weak = self.downgrade();
        network.set_collision_handler(Arc::new(move |positioner_id| {
            let Some(fps) = weak.upgrade() else { return };

            if fps.locked() {
                debug!(positioner_id, "collision report while locked; ignoring");
                return;
            }

            error!(
                positioner_id,
                "a collision was detected; stopping trajectories and locking the FPS"
            );
            fps.notify(ObserverEvent::Error(format!(
                "collision detected in positioner {positioner_id}"
            )));

            tokio::spawn(async move {
                if let Err(err) = fps.lock(vec![positioner_id]).await {
                    error!(%err, "failed locking the FPS after a collision");
                }
            });
        }));

        *self.inner.can.lock().expect("can slot lock") = Some(network);

        Ok(())
    }

    pub fn can(&self) -> Result<CanNetwork, FpsError> {
        self.inner
            .can
            .lock()
            .expect("can slot lock")
            .clone()
            .ok_or(FpsError::NoCanConnection)
    }

    pub fn status(&self) -> FpsStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn set_status(&self, status: FpsStatus) {
        if status != self.status() {
            self.inner.status_tx.send_replace(status);
        }
    }

    /// Watch channel for status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<FpsStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn locked(&self) -> bool {
        self.inner.locked.load(Ordering::SeqCst)
    }

    pub fn locked_by(&self) -> Vec<u16> {
        self.inner.locked_by.lock().expect("locked_by lock").clone()
    }

    pub fn moving(&self) -> bool {
        self.status().contains(FpsStatus::MOVING)
    }

    pub fn initialised(&self) -> bool {
        self.inner.initialised.load(Ordering::SeqCst)
    }

    pub fn pollers(&self) -> PollerList {
        self.inner.pollers.clone()
    }

    pub fn ieb(&self) -> Option<Arc<dyn DeviceBank>> {
        self.inner.ieb.lock().expect("ieb lock").clone()
    }

    /// The sync-line relay, when an enabled device bank is connected.
    pub fn sync_line(&self) -> Option<SyncLine> {
        self.ieb()
            .filter(|bank| !bank.disabled())
            .map(SyncLine::new)
    }

    pub fn positioner(&self, positioner_id: u16) -> Option<Positioner> {
        self.inner
            .positioners
            .read()
            .expect("positioner map lock")
            .get(&positioner_id)
            .cloned()
    }

    pub fn positioners(&self) -> Vec<Positioner> {
        let mut positioners: Vec<Positioner> = self
            .inner
            .positioners
            .read()
            .expect("positioner map lock")
            .values()
            .cloned()
            .collect();
        positioners.sort_by_key(|positioner| positioner.positioner_id());
        positioners
    }

    pub fn positioner_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self
            .inner
            .positioners
            .read()
            .expect("positioner map lock")
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    fn non_disabled_ids(&self) -> Vec<u16> {
        self.positioners()
            .iter()
            .filter(|positioner| !positioner.disabled())
            .map(|positioner| positioner.positioner_id())
            .collect()
    }

    /// Robots that are physically expected to reply.
    pub fn online_count(&self) -> usize {
        self.positioners()
            .iter()
            .filter(|positioner| !positioner.offline())
            .count()
    }

    /// Any known positioner reports bootloader firmware.
    pub fn is_bootloader(&self) -> bool {
        self.positioners()
            .iter()
            .any(|positioner| positioner.is_bootloader() == Some(true))
    }

    /// Current `(alpha, beta)` per robot, known or not.
    pub fn positions_map(&self) -> HashMap<u16, (Option<f64>, Option<f64>)> {
        self.positioners()
            .iter()
            .map(|positioner| {
                (
                    positioner.positioner_id(),
                    (positioner.alpha(), positioner.beta()),
                )
            })
            .collect()
    }

    /// Adds a positioner, wiring it to this supervisor. Replaces any
    /// existing entry with the same id.
    pub fn add_positioner(&self, positioner_id: u16) -> Positioner {
        let config = self.config();
        let positioner = Positioner::new(
            positioner_id,
            self.downgrade(),
            Duration::from_secs_f64(config.positioner.status_poller_delay),
            Duration::from_secs_f64(config.positioner.position_poller_delay),
        );

        self.inner
            .positioners
            .write()
            .expect("positioner map lock")
            .insert(positioner_id, positioner.clone());

        positioner
    }

    /// The single choke point for outbound commands.
    pub async fn send_command(
        &self,
        command_id: CommandId,
        options: SendOptions,
    ) -> Result<Command, FpsError> {
        let can = self.can()?;
        let descriptor = descriptor(command_id);

        let positioner_ids = match options.positioner_ids {
            Some(ids) => ids,
            None => self.non_disabled_ids(),
        };

        let is_broadcast = positioner_ids == [0];

        if !descriptor.safe {
            let disabled: Vec<u16> = if is_broadcast {
                self.positioners()
                    .iter()
                    .filter(|p| p.disabled())
                    .map(|p| p.positioner_id())
                    .collect()
            } else {
                positioner_ids
                    .iter()
                    .copied()
                    .filter(|pid| {
                        self.positioner(*pid)
                            .map(|p| p.disabled())
                            .unwrap_or(false)
                    })
                    .collect()
            };

            if !disabled.is_empty() {
                return Err(FpsError::DisabledPositioners(disabled));
            }
        }

        if !is_broadcast {
            if let Some(&missing) = positioner_ids
                .iter()
                .find(|pid| self.positioner(**pid).is_none())
            {
                return Err(FpsError::NotConnected(missing));
            }
        }

        let any_bootloader = if is_broadcast {
            self.is_bootloader()
        } else {
            positioner_ids.iter().any(|pid| {
                self.positioner(*pid)
                    .and_then(|p| p.is_bootloader())
                    .unwrap_or(false)
            })
        };

        if any_bootloader && !descriptor.bootloader {
            return Err(FpsError::BootloaderMode(command_id));
        }

        let bootloader_only = matches!(
            command_id,
            CommandId::StartFirmwareUpgrade | CommandId::SendFirmwareData
        );
        if bootloader_only && !any_bootloader {
            return Err(FpsError::NotInBootloaderMode(command_id));
        }

        if self.locked() {
            if descriptor.safe {
                debug!(command = descriptor.name, "FPS is locked but the command is safe");
            } else {
                return Err(FpsError::Locked);
            }
        } else if descriptor.move_command && self.moving() {
            return Err(FpsError::Moving);
        }

        let command = Command::new(
            command_id,
            positioner_ids,
            options.data,
            options.timeout,
            options.n_positioners,
            can.uid_bits(),
        )?;

        if options.now {
            can.send_now(&command).await;
        } else {
            can.send(&command)?;
        }

        Ok(command)
    }

    /// Locks the array: trajectories are stopped (collision flags are
    /// left as they are) and non-safe commands are refused.
    pub async fn lock(&self, by: Vec<u16>) -> Result<(), FpsError> {
        self.inner.locked.store(true, Ordering::SeqCst);
        warn!("locking the FPS");
        self.notify(ObserverEvent::Warning("locking the FPS".to_string()));

        if let Err(err) = self.stop_trajectory(false).await {
            warn!(%err, "could not stop trajectories while locking");
        }

        let _ = self.update_status(None, Duration::from_secs(2)).await;

        if !by.is_empty() {
            self.inner
                .locked_by
                .lock()
                .expect("locked_by lock")
                .extend(&by);
        }

        let locked_by = self.locked_by();
        let (alpha, beta) = by
            .first()
            .and_then(|pid| self.positioner(*pid))
            .and_then(|p| p.position())
            .map(|(a, b)| (Some(a), Some(b)))
            .unwrap_or((None, None));

        self.notify(ObserverEvent::Event {
            name: "locked",
            data: json!({
                "locked": true,
                "locked_by": locked_by,
                "locked_alpha": alpha,
                "locked_beta": beta,
            }),
        });

        let _ = self.save_snapshot().await;

        Ok(())
    }

    /// Unlocks the array if every collision flag has cleared.
    pub async fn unlock(&self) -> Result<(), FpsError> {
        // STOP_TRAJECTORY clears the collision flags.
        self.stop_trajectory(true).await?;

        let _ = self.update_status(None, Duration::from_secs(2)).await;

        let collided: Vec<u16> = self
            .positioners()
            .iter()
            .filter(|p| p.collision())
            .map(|p| p.positioner_id())
            .collect();

        if !collided.is_empty() {
            self.inner.locked.store(true, Ordering::SeqCst);
            return Err(FpsError::StillCollided);
        }

        self.inner.locked.store(false, Ordering::SeqCst);
        self.inner.locked_by.lock().expect("locked_by lock").clear();

        self.notify(ObserverEvent::Event {
            name: "unlocked",
            data: json!({"locked": false}),
        });

        Ok(())
    }

    /// Refreshes firmware and status for all (or the given) robots and
    /// re-derives the array status. A timed-out broadcast is retried
    /// once. Returns whether the update got replies.
    pub async fn update_status(
        &self,
        positioner_ids: Option<Vec<u16>>,
        timeout: Duration,
    ) -> Result<bool, FpsError> {
        if self.positioner_ids().is_empty() {
            return Ok(true);
        }

        let targets = positioner_ids.unwrap_or_else(|| vec![0]);
        let n_positioners = if targets == [0] {
            let online = self.online_count();
            (online > 0).then_some(online)
        } else {
            None
        };

        if let Err(err) = self.update_firmware_version(timeout).await {
            warn!(%err, "firmware refresh failed during update_status");
        }

        let mut command = None;
        for attempt in 0..2 {
            let mut options =
                SendOptions::to(targets.clone()).timeout(Timeout::After(timeout));
            if let Some(n) = n_positioners {
                options = options.n_positioners(n);
            }

            let this = self.send_command(CommandId::GetStatus, options).await?;
            this.wait().await;

            if this.status().failed() {
                warn!("GET_STATUS failed during update_status");
                return Ok(false);
            }

            let timed_out = this.status().timed_out();
            command = Some(this);

            if timed_out && n_positioners.is_some() && attempt == 0 {
                warn!("GET_STATUS timed out; retrying");
                continue;
            }
            break;
        }

        let command = command.expect("at least one GET_STATUS attempt");

        for (pid, raw) in command.positioner_status() {
            if let Some(positioner) = self.positioner(pid) {
                positioner.update_status_raw(raw);
            }
        }

        self.derive_status();

        Ok(true)
    }

    /// Folds the per-robot status bits into the array status.
    fn derive_status(&self) {
        let current = self.status() & !FpsStatus::STATUS_BITS;

        let active: Vec<PositionerStatus> = self
            .positioners()
            .iter()
            .filter(|p| !p.disabled())
            .map(|p| p.status())
            .collect();

        let status = if active.iter().any(|s| s.collision()) {
            current | FpsStatus::COLLIDED
        } else if active
            .iter()
            .all(|s| s.contains(PositionerStatus::DISPLACEMENT_COMPLETED))
        {
            current | FpsStatus::IDLE
        } else {
            current | FpsStatus::MOVING
        };

        self.set_status(status);
    }

    /// Refreshes the arm angles of the given (or all initialised)
    /// robots. A timed-out request is retried once.
    pub async fn update_position(
        &self,
        positioner_ids: Option<Vec<u16>>,
        timeout: Duration,
    ) -> Result<bool, FpsError> {
        let targets: Vec<u16> = positioner_ids
            .unwrap_or_else(|| {
                self.positioners()
                    .iter()
                    .filter(|p| p.initialised() && p.is_bootloader() != Some(true))
                    .map(|p| p.positioner_id())
                    .collect()
            })
            .into_iter()
            .filter(|pid| {
                self.positioner(*pid)
                    .map(|p| !p.disabled() && !p.offline())
                    .unwrap_or(false)
            })
            .collect();

        if targets.is_empty() {
            return Ok(true);
        }

        let motor_steps = self.config().positioner.motor_steps;

        for attempt in 0..2 {
            let command = self
                .send_command(
                    CommandId::GetActualPosition,
                    SendOptions::to(targets.clone()).timeout(Timeout::After(timeout)),
                )
                .await?;
            command.wait().await;

            if command.status().failed() {
                error!("GET_ACTUAL_POSITION failed during update_position");
                return Ok(false);
            }

            if command.status().timed_out() && attempt == 0 {
                warn!("GET_ACTUAL_POSITION timed out; retrying");
                continue;
            }

            for (pid, (alpha, beta)) in command.positions(motor_steps) {
                if let Some(positioner) = self.positioner(pid) {
                    positioner.update_position_values(alpha, beta);
                }
            }
            break;
        }

        Ok(true)
    }

    /// Broadcast firmware refresh with one retry on timeout.
    pub async fn update_firmware_version(&self, timeout: Duration) -> Result<bool, FpsError> {
        if self.positioner_ids().is_empty() {
            return Ok(true);
        }

        let online = self.online_count();
        let n_positioners = (online > 0).then_some(online);

        for attempt in 0..2 {
            let mut options = SendOptions::broadcast().timeout(Timeout::After(timeout));
            if let Some(n) = n_positioners {
                options = options.n_positioners(n);
            }

            let command = self
                .send_command(CommandId::GetFirmwareVersion, options)
                .await?;
            command.wait().await;

            if command.status().failed() {
                error!("failed retrieving firmware versions");
                return Ok(false);
            }

            if command.status().timed_out() && n_positioners.is_some() && attempt == 0 {
                warn!("GET_FIRMWARE_VERSION timed out; retrying");
                continue;
            }

            for (pid, firmware) in command.firmware_versions() {
                if let Some(positioner) = self.positioner(pid) {
                    positioner.set_firmware(Some(firmware));
                }
            }
            break;
        }

        Ok(true)
    }

    /// Stops all positioners. `SEND_TRAJECTORY_ABORT` leaves collision
    /// flags alone; `clear_flags` sends `STOP_TRAJECTORY`, which clears
    /// them.
    pub async fn stop_trajectory(&self, clear_flags: bool) -> Result<(), FpsError> {
        if clear_flags {
            self.send_command(
                CommandId::StopTrajectory,
                SendOptions::broadcast()
                    .timeout(Timeout::After(Duration::ZERO))
                    .now(),
            )
            .await?;
        } else {
            let targets = self.non_disabled_ids();
            if !targets.is_empty() {
                self.send_command(
                    CommandId::SendTrajectoryAbort,
                    SendOptions::to(targets)
                        .timeout(Timeout::After(Duration::ZERO))
                        .now(),
                )
                .await?;
            }
        }

        if let Ok(can) = self.can() {
            can.cancel_move_commands();
            can.refresh_running_commands();
        }

        // The stop is fire-and-forget; give the robots a moment before
        // anything else hits the bus.
        tokio::time::sleep(STOP_TRAJECTORY_SETTLE).await;

        Ok(())
    }

    /// Probes the array and brings every responding robot to a known
    /// state. Idempotent: a second call re-probes and reports the same
    /// layout.
    pub async fn initialise(&self, options: InitialiseOptions) -> Result<(), FpsError> {
        let config = self.config();
        let start_pollers = options.start_pollers.unwrap_or(config.fps.start_pollers);

        // Carry the disabled/offline set across re-initialisations.
        {
            let mut disabled = self.inner.disabled.lock().expect("disabled set lock");
            if options.keep_disabled {
                for positioner in self.positioners() {
                    if positioner.offline() || positioner.disabled() {
                        disabled.insert(positioner.positioner_id());
                    } else {
                        disabled.remove(&positioner.positioner_id());
                    }
                }
            } else {
                disabled.clear();
            }
        }

        for positioner in self.positioners() {
            positioner.stop_pollers().await;
        }
        self.inner
            .positioners
            .write()
            .expect("positioner map lock")
            .clear();

        self.inner.pollers.stop().await;

        if self.inner.can.lock().expect("can slot lock").is_none() {
            self.start_can(None).await?;
        }
        let can = self.can()?;

        if let Some(ieb) = self.ieb() {
            if ieb.disabled() {
                warn!("IEB device bank is disabled");
            }
        }

        if can.n_interfaces() == 0 {
            warn!("no CAN interfaces found");
            return Ok(());
        }

        let initialise_timeout = Duration::from_secs_f64(config.fps.initialise_timeouts);

        // On a multibus setup, learn which interface and bus each robot
        // answers on.
        if can.is_multibus() {
            let id_command = self
                .send_command(
                    CommandId::GetId,
                    SendOptions::broadcast().timeout(Timeout::After(initialise_timeout)),
                )
                .await?;
            id_command.wait().await;

            let routes: HashMap<u16, (usize, Option<u8>)> = id_command
                .replies()
                .iter()
                .filter_map(|reply| {
                    reply
                        .interface
                        .map(|interface| (reply.positioner_id, (interface, reply.bus)))
                })
                .collect();
            can.set_routes(routes);
        }

        // Probe who is out there.
        let firmware_command = self
            .send_command(
                CommandId::GetFirmwareVersion,
                SendOptions::broadcast().timeout(Timeout::After(initialise_timeout)),
            )
            .await?;
        firmware_command.wait().await;

        if !firmware_command.succeeded() {
            return Err(FpsError::State(
                "failed retrieving firmware versions".to_string(),
            ));
        }

        let disabled_config: HashSet<u16> =
            config.fps.disabled_positioners.iter().copied().collect();

        for reply in firmware_command.replies() {
            let pid = reply.positioner_id;

            if self.positioner(pid).is_none() {
                let positioner = self.add_positioner(pid);
                positioner.set_route(reply.interface, reply.bus);
            }

            let positioner = self.positioner(pid).expect("just added");

            if let Some(firmware) = firmware_command.firmware_versions().get(&pid) {
                positioner.set_firmware(Some(firmware.clone()));
            }

            let sticky = self.inner.disabled.lock().expect("disabled set lock");
            if disabled_config.contains(&pid) || sticky.contains(&pid) {
                positioner.set_disabled(true);
            }
        }

        // Offline robots do not reply; their pose comes from the
        // configuration and they behave as disabled.
        for (&pid, &(alpha, beta)) in &config.fps.offline_positioners {
            let positioner = match self.positioner(pid) {
                Some(positioner) => positioner,
                None => self.add_positioner(pid),
            };
            positioner.set_offline(true);
            positioner.set_fixed_position(alpha, beta);
            self.inner
                .disabled
                .lock()
                .expect("disabled set lock")
                .insert(pid);
        }

        self.inner.initialised.store(true, Ordering::SeqCst);

        let connected: Vec<u16> = self
            .positioners()
            .iter()
            .filter(|p| !p.offline())
            .map(|p| p.positioner_id())
            .collect();

        if connected.is_empty() {
            warn!("no positioners found");
            return Ok(());
        }
        info!(count = connected.len(), ids = ?connected, "connected positioners");
        self.notify(ObserverEvent::Info(format!(
            "found {} connected positioners",
            connected.len()
        )));

        let firmwares: HashSet<String> = self
            .positioners()
            .iter()
            .filter(|p| !p.offline())
            .filter_map(|p| p.firmware())
            .collect();
        if firmwares.len() > 1 {
            warn!(?firmwares, "found positioners with different firmware versions");
        }

        // Stop everything, just in case. This does not clear collision
        // flags.
        if !self.is_bootloader() {
            self.stop_trajectory(false).await?;
        }

        let disable_precise_moves = config.positioner.disable_precise_moves;
        let results = join_all(
            self.positioners()
                .iter()
                .filter(|p| !p.offline())
                .map(|positioner| {
                    let positioner = positioner.clone();
                    async move { positioner.initialise(disable_precise_moves).await }
                }),
        )
        .await;

        let failed: Vec<String> = results
            .into_iter()
            .filter_map(|result| result.err().map(|err| err.to_string()))
            .collect();
        if !failed.is_empty() {
            return Err(FpsError::State(format!(
                "some positioners failed to initialise: {failed:?}"
            )));
        }

        if self.is_bootloader() {
            let bootloader_ids: Vec<u16> = self
                .positioners()
                .iter()
                .filter(|p| p.is_bootloader() == Some(true))
                .map(|p| p.positioner_id())
                .collect();
            warn!(?bootloader_ids, "positioners in bootloader mode");
            return Ok(());
        }

        // A collided array comes up locked.
        let collided: Vec<u16> = self
            .positioners()
            .iter()
            .filter(|p| p.collision())
            .map(|p| p.positioner_id())
            .collect();
        if !collided.is_empty() {
            warn!(?collided, "the FPS was collided and has been locked");
            self.lock(collided).await?;
        }

        if let Some(min_beta) = config.safe_mode.min_beta() {
            warn!(min_beta, "safe mode enabled");
        }

        self.apply_loop_modes(&config).await?;

        self.check_fibre_assignments(&config, options.check_assignments)?;

        // Low-temperature watcher.
        if let Some(task) = self
            .inner
            .temperature_task
            .lock()
            .expect("temperature task lock")
            .take()
        {
            task.abort();
        }
        let ieb_enabled = self.ieb().map(|bank| !bank.disabled()).unwrap_or(false);
        if ieb_enabled && options.enable_low_temperature {
            *self
                .inner
                .temperature_task
                .lock()
                .expect("temperature task lock") = Some(crate::low_temperature::spawn(self));
        } else {
            let status = self.status() & !FpsStatus::TEMPERATURE_BITS;
            self.set_status(status | FpsStatus::TEMPERATURE_UNKNOWN);
        }

        self.update_status(None, Duration::from_secs(2)).await?;

        if start_pollers && !self.is_bootloader() {
            self.inner.pollers.start();
        }

        Ok(())
    }

    /// Applies the configured collision-detection and loop-mode groups.
    async fn apply_loop_modes(&self, config: &Config) -> Result<(), FpsError> {
        let disable_collision = &config.fps.disable_collision_detection_positioners;
        let open_loop = &config.fps.open_loop_positioners;

        if !disable_collision.is_empty() {
            if self.locked() {
                warn!("the FPS is locked; cannot disable collision detection");
            } else {
                warn!(ids = ?disable_collision, "disabling collision detection");
                for command_id in [
                    CommandId::AlphaClosedLoopWithoutCollisionDetection,
                    CommandId::BetaClosedLoopWithoutCollisionDetection,
                ] {
                    self.send_command(command_id, SendOptions::to(disable_collision.clone()))
                        .await?
                        .result()
                        .await?;
                }
            }
        }

        if !open_loop.is_empty() {
            if self.locked() {
                warn!("the FPS is locked; cannot set open-loop mode");
            } else {
                warn!(ids = ?open_loop, "setting open-loop mode");
                for command_id in [
                    CommandId::AlphaOpenLoopWithoutCollisionDetection,
                    CommandId::BetaOpenLoopWithoutCollisionDetection,
                ] {
                    self.send_command(command_id, SendOptions::to(open_loop.clone()))
                        .await?
                        .result()
                        .await?;
                }
            }
        }

        // Everyone else runs closed-loop with collision detection. This
        // does not work while collided, so skip when locked.
        if !self.locked() {
            let excluded: HashSet<u16> = disable_collision
                .iter()
                .chain(open_loop.iter())
                .copied()
                .collect();
            let closed_loop: Vec<u16> = self
                .non_disabled_ids()
                .into_iter()
                .filter(|pid| !excluded.contains(pid))
                .collect();

            if !closed_loop.is_empty() {
                for command_id in [
                    CommandId::AlphaClosedLoopCollisionDetection,
                    CommandId::BetaClosedLoopCollisionDetection,
                ] {
                    self.send_command(command_id, SendOptions::to(closed_loop.clone()))
                        .await?
                        .result()
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Compares the connected robots with the fibre-assignment table.
    fn check_fibre_assignments(
        &self,
        config: &Config,
        raise_error: bool,
    ) -> Result<(), FpsError> {
        let expected = &config.fps.expected_positioners;
        if expected.is_empty() {
            return Ok(());
        }

        let connected: HashSet<u16> = self.positioner_ids().into_iter().collect();
        let expected_set: HashSet<u16> = expected.iter().copied().collect();

        let mut mismatch = false;

        for pid in expected_set.difference(&connected) {
            warn!(positioner_id = pid, "expected by the fibre assignments but not connected");
            mismatch = true;
        }
        for pid in connected.difference(&expected_set) {
            warn!(positioner_id = pid, "connected but not in the fibre assignments");
            mismatch = true;
        }

        if mismatch && raise_error {
            return Err(FpsError::State(
                "some positioners do not match the fibre assignments".to_string(),
            ));
        }

        Ok(())
    }

    /// Sends positioners to new (alpha, beta) targets via a planned (or,
    /// with `go_cowboy`, direct) trajectory.
    pub async fn goto(
        &self,
        new_positions: HashMap<u16, (f64, f64)>,
        options: GotoOptions,
    ) -> Result<Trajectory, FpsError> {
        let result = self.goto_inner(new_positions, options).await;

        let _ = self.update_status(None, Duration::from_secs(2)).await;
        let _ = self.update_position(None, Duration::from_secs(2)).await;

        result
    }

    async fn goto_inner(
        &self,
        new_positions: HashMap<u16, (f64, f64)>,
        options: GotoOptions,
    ) -> Result<Trajectory, FpsError> {
        if self.locked() {
            return Err(FpsError::Locked);
        }
        if self.moving() {
            return Err(FpsError::Moving);
        }

        for pid in new_positions.keys() {
            if self.positioner(*pid).is_none() {
                return Err(FpsError::NotConnected(*pid));
            }
        }

        let speed = options
            .speed
            .unwrap_or(self.config().positioner.motor_speed);
        if !SPEED_RANGE.contains(&speed) {
            return Err(FpsError::State(format!("invalid speed {speed}")));
        }

        let target_ids: Vec<u16> = new_positions.keys().copied().collect();
        self.update_position(Some(target_ids), Duration::from_secs(2))
            .await?;

        let trajectories: TrajectoryData = if options.go_cowboy {
            let mut trajectories = TrajectoryData::new();

            for (&pid, &(target_alpha, target_beta)) in &new_positions {
                let positioner = self.positioner(pid).expect("checked above");
                let (alpha, beta) = positioner.position().ok_or(FpsError::Positioner {
                    positioner_id: pid,
                    reason: "cannot goto with unknown position".to_string(),
                })?;

                let (alpha_end, beta_end) = if options.relative {
                    (alpha + target_alpha, beta + target_beta)
                } else {
                    (target_alpha, target_beta)
                };

                let alpha_time = goto_move_time(alpha_end - alpha, speed);
                let beta_time = goto_move_time(beta_end - beta, speed);

                trajectories.insert(
                    pid,
                    ArmPath {
                        alpha: vec![(alpha, 0.1), (alpha_end, alpha_time + 0.1)],
                        beta: vec![(beta, 0.1), (beta_end, beta_time + 0.1)],
                    },
                );
            }

            trajectories
        } else {
            if options.relative {
                return Err(FpsError::State(
                    "relative moves require go_cowboy".to_string(),
                ));
            }

            let planner = self
                .inner
                .planner
                .lock()
                .expect("planner lock")
                .clone()
                .ok_or_else(|| FpsError::State("no path planner configured".to_string()))?;

            let mut grid = HashMap::new();
            for positioner in self.positioners() {
                let pid = positioner.positioner_id();
                let (alpha, beta) = positioner.position().ok_or(FpsError::Positioner {
                    positioner_id: pid,
                    reason: "does not know its position".to_string(),
                })?;

                let (dest_alpha, dest_beta) =
                    new_positions.get(&pid).copied().unwrap_or((alpha, beta));

                grid.insert(
                    pid,
                    GridEntry {
                        alpha,
                        beta,
                        dest_alpha,
                        dest_beta,
                        disabled: positioner.disabled(),
                    },
                );
            }

            let plan = planner
                .plan_paths(grid)
                .await
                .map_err(|err| FpsError::State(err.to_string()))?;

            if plan.did_fail {
                if !options.force {
                    return Err(FpsError::Trajectory(crate::error::TrajectoryError::new(
                        format!(
                            "cannot execute trajectory: found {} deadlocks ({:?})",
                            plan.deadlocks.len(),
                            plan.deadlocks
                        ),
                    )));
                }
                warn!(
                    deadlocks = ?plan.deadlocks,
                    "found deadlocks but applying the trajectory"
                );
            }

            plan.to_destination
        };

        let trajectory = send_trajectory(
            self,
            trajectories,
            TrajectoryOptions {
                use_sync_line: options.use_sync_line,
                extra: json!({"planner_trajectory": !options.go_cowboy}),
                ..Default::default()
            },
        )
        .await?;

        Ok(trajectory)
    }

    /// The array is parked at the folded (lattice) pose, within a
    /// degree.
    pub async fn is_folded(&self) -> bool {
        let (lattice_alpha, lattice_beta) = self.config().fps.lattice_position;

        let _ = self.update_position(None, Duration::from_secs(2)).await;

        let positioners: Vec<Positioner> = self
            .positioners()
            .into_iter()
            .filter(|p| !p.disabled())
            .collect();

        if positioners.is_empty() {
            return false;
        }

        positioners.iter().all(|positioner| {
            matches!(
                positioner.position(),
                Some((alpha, beta))
                    if (alpha - lattice_alpha).abs() <= 1.0 && (beta - lattice_beta).abs() <= 1.0
            )
        })
    }

    /// Structured status blob for observers and the actor layer.
    pub fn report_status(&self) -> StatusReport {
        let positioners: BTreeMap<u16, PositionerReport> = self
            .positioners()
            .iter()
            .map(|positioner| (positioner.positioner_id(), positioner.report()))
            .collect();

        StatusReport {
            status: format!("{:?}", self.status()),
            locked: self.locked(),
            locked_by: self.locked_by(),
            n_positioners: positioners.len(),
            positioners,
            devices: self
                .can()
                .map(|can| can.device_status())
                .unwrap_or(serde_json::Value::Null),
            ieb: self.ieb().map(|bank| !bank.disabled()).unwrap_or(false),
        }
    }

    fn next_snapshot_path(base: &Path) -> PathBuf {
        let date = Utc::now().format("%Y%m%d").to_string();
        let dir = base.join(&date);

        let seq = std::fs::read_dir(&dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter_map(|entry| {
                        entry.file_name().to_str().and_then(|name| {
                            name.strip_prefix(&format!("fps_snapshot_{date}_"))
                                .and_then(|rest| rest.strip_suffix(".json"))
                                .and_then(|seq| seq.parse::<u32>().ok())
                        })
                    })
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
            + 1;

        dir.join(format!("fps_snapshot_{date}_{seq:04}.json"))
    }

    /// Persists the status blob as a sequence-numbered JSON file under
    /// the configured snapshot directory and announces it to observers.
    /// A failed write is logged, never fatal; the event still carries
    /// the report.
    pub async fn save_snapshot(&self) -> Option<PathBuf> {
        let report = self.report_status();
        let data = serde_json::to_value(&report).unwrap_or(serde_json::Value::Null);

        let path = Self::next_snapshot_path(&self.config().fps.snapshot_path);

        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(&data)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
            std::fs::write(&path, json)
        })();

        let written = match result {
            Ok(()) => {
                debug!(path = %path.display(), "snapshot written");
                Some(path)
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "could not write snapshot");
                None
            }
        };

        self.notify(ObserverEvent::Event {
            name: "snapshot",
            data: json!({
                "path": written.as_ref().map(|p| p.display().to_string()),
                "report": data,
            }),
        });

        written
    }

    /// Stops motion and background machinery and releases the process
    /// instance slot.
    pub async fn shutdown(&self) {
        if self.initialised() && !self.is_bootloader() && self.can().is_ok() {
            info!("stopping positioners and shutting down");
            let _ = self.stop_trajectory(false).await;
        }

        self.inner.pollers.stop().await;

        for positioner in self.positioners() {
            positioner.stop_pollers().await;
        }

        if let Some(task) = self
            .inner
            .temperature_task
            .lock()
            .expect("temperature task lock")
            .take()
        {
            task.abort();
        }

        if let Ok(can) = self.can() {
            can.stop().await;
        }
        *self.inner.can.lock().expect("can slot lock") = None;

        *self.inner.pid_lock.lock().expect("pid lock slot") = None;

        self.discard();
    }

    /// Clears the process instance slot if it points at this
    /// supervisor.
    pub fn discard(&self) {
        let mut slot = FPS_INSTANCE.lock().expect("instance slot lock");
        if let Some(weak) = slot.as_ref() {
            if weak.ptr_eq(&Arc::downgrade(&self.inner)) {
                *slot = None;
            }
        }
    }
}

impl std::fmt::Debug for Fps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fps")
            .field("status", &self.status())
            .field("locked", &self.locked())
            .field("n_positioners", &self.positioner_ids().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The process-instance slot is shared state, so everything about it
    // lives in this one test.
    #[tokio::test]
    async fn instance_slot_follows_the_latest_supervisor() {
        let mut config = Config::default();
        config.fps.use_lock = false;

        let first = Fps::new(config.clone(), None);
        let instance = Fps::get_instance().expect("an instance is registered");
        assert!(Arc::ptr_eq(&instance.inner, &first.inner));

        // A newer supervisor takes over the slot.
        let second = Fps::new(config, None);
        let instance = Fps::get_instance().expect("an instance is registered");
        assert!(Arc::ptr_eq(&instance.inner, &second.inner));

        // Discarding the stale one leaves the slot alone.
        first.discard();
        assert!(Fps::get_instance().is_some());

        second.shutdown().await;
        assert!(Fps::get_instance().is_none());
    }

    #[test]
    fn send_options_builders_compose() {
        let options = SendOptions::broadcast()
            .timeout(Timeout::After(Duration::from_secs(1)))
            .n_positioners(5)
            .now();

        assert_eq!(options.positioner_ids, Some(vec![0]));
        assert_eq!(options.n_positioners, Some(5));
        assert!(options.now);
    }
}

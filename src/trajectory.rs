//! The trajectory engine.
//!
//! A trajectory drives many robots through coordinated paths. The engine
//! is an explicit state machine: validate the submitted paths, stream
//! them to the involved positioners, start them (hardware sync line or
//! START_TRAJECTORY broadcast), supervise to completion, and journal the
//! outcome. Every failure path stops the array before surfacing the
//! error, and the final positions are always checked against the
//! commanded ones, since some firmware revisions assert completion
//! without having moved.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use canopus_proto::{data, CommandId, FpsStatus, ResponseCode};

use crate::command::{CommandData, Timeout};
use crate::error::{FailureKind, TrajectoryError};
use crate::fps::{Fps, SendOptions};

/// How long the sync line is held high before being released.
const SYNC_LINE_PULSE: Duration = Duration::from_millis(500);

/// Grace period past the expected move time before the move is declared
/// stuck.
const MOVE_TIME_GRACE: Duration = Duration::from_secs(3);

/// Tolerance between commanded and reached angles at the end of a move.
const REACH_TOLERANCE: f64 = 0.1;

/// How far a robot may sit from its path's first sample when the
/// trajectory starts.
const START_TOLERANCE: f64 = 1.0;

/// Output-shaft reduction of both axes; motor RPM over this gives the
/// arm speed.
const GEAR_RATIO: f64 = 337.5;

/// Approximate time, in seconds, for an arm to move `delta` degrees at
/// the given motor speed.
pub fn goto_move_time(delta: f64, speed_rpm: f64) -> f64 {
    delta.abs() / 360.0 * 60.0 / speed_rpm * GEAR_RATIO
}

/// One robot's path: `(degrees, seconds)` samples per arm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmPath {
    pub alpha: Vec<(f64, f64)>,
    pub beta: Vec<(f64, f64)>,
}

pub type TrajectoryData = HashMap<u16, ArmPath>;

/// Reads a trajectory from a YAML file, or a JSON dump with a top-level
/// `trajectory` key.
pub fn load_trajectory_file(path: impl AsRef<Path>) -> Result<TrajectoryData, TrajectoryError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|err| TrajectoryError::new(format!("cannot read {}: {err}", path.display())))?;

    if path.extension().map(|ext| ext == "json").unwrap_or(false) {
        #[derive(Deserialize)]
        struct Dump {
            trajectory: TrajectoryData,
        }
        let dump: Dump = serde_json::from_str(&text)
            .map_err(|err| TrajectoryError::new(format!("invalid trajectory dump: {err}")))?;
        Ok(dump.trajectory)
    } else {
        serde_yaml::from_str(&text)
            .map_err(|err| TrajectoryError::new(format!("invalid trajectory file: {err}")))
    }
}

/// Where to journal the trajectory.
#[derive(Debug, Clone, Default)]
pub enum DumpMode {
    /// Sequence-numbered file under the configured dump directory.
    #[default]
    Default,
    Path(PathBuf),
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
struct DumpData {
    start_time: DateTime<Utc>,
    success: bool,
    trajectory_send_time: Option<f64>,
    trajectory_start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    use_sync_line: bool,
    extra: serde_json::Value,
    trajectory: TrajectoryData,
    initial_positions: HashMap<u16, (Option<f64>, Option<f64>)>,
    final_positions: HashMap<u16, (Option<f64>, Option<f64>)>,
}

#[derive(Debug, Clone)]
pub struct TrajectoryOptions {
    /// `None` follows the configuration.
    pub use_sync_line: Option<bool>,
    /// Send the data to the positioners.
    pub send: bool,
    /// Start the trajectory after sending.
    pub start: bool,
    pub dump: DumpMode,
    /// Extra fields for the journal record.
    pub extra: serde_json::Value,
}

impl Default for TrajectoryOptions {
    fn default() -> Self {
        Self {
            use_sync_line: None,
            send: true,
            start: true,
            dump: DumpMode::Default,
            extra: serde_json::Value::Null,
        }
    }
}

/// Sends a set of trajectories to the positioners and, by default,
/// executes them. Returns the trajectory handle for inspection.
pub async fn send_trajectory(
    fps: &Fps,
    trajectories: TrajectoryData,
    options: TrajectoryOptions,
) -> Result<Trajectory, TrajectoryError> {
    let use_sync_line = options
        .use_sync_line
        .unwrap_or(fps.config().fps.use_sync_line);

    let mut trajectory = Trajectory::new(fps, trajectories, options.dump, options.extra)?;

    if use_sync_line {
        let sync = fps
            .sync_line()
            .ok_or_else(|| TrajectoryError::new("IEB is not connected; cannot use sync line"))?;
        let closed = sync
            .is_closed()
            .await
            .map_err(|err| TrajectoryError::new(format!("cannot read sync line: {err}")))?;
        if closed {
            return Err(TrajectoryError::new("the sync line is high"));
        }
    }

    if !options.send {
        return Ok(trajectory);
    }

    debug!("sending trajectory data");
    trajectory.send().await?;

    info!(
        send_time = trajectory.data_send_time,
        move_time = trajectory.move_time,
        "trajectory sent"
    );

    if !options.start {
        trajectory.dump_trajectory();
        return Ok(trajectory);
    }

    info!("starting trajectory");
    trajectory.start(use_sync_line).await?;

    info!("all positioners have reached their destinations");

    Ok(trajectory)
}

/// A prepared trajectory. `send` then `start` mirror the two firmware
/// phases: loading the paths and executing them.
pub struct Trajectory {
    fps: Fps,
    trajectories: TrajectoryData,
    /// Robots that caused a failure, by kind.
    pub failed_positioners: HashMap<u16, FailureKind>,
    /// `(n_alpha, n_beta)` points sent to each robot.
    pub n_points: HashMap<u16, (usize, usize)>,
    /// Seconds the slowest arm needs to complete.
    pub move_time: Option<f64>,
    /// Seconds it took to stream the data.
    pub data_send_time: Option<f64>,
    pub failed: bool,
    ready_to_start: bool,
    use_sync_line: bool,
    start_instant: Option<Instant>,
    dump_file: Option<PathBuf>,
    dump_data: DumpData,
}

impl std::fmt::Debug for Trajectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trajectory")
            .field("failed_positioners", &self.failed_positioners)
            .field("n_points", &self.n_points)
            .field("move_time", &self.move_time)
            .field("data_send_time", &self.data_send_time)
            .field("failed", &self.failed)
            .field("ready_to_start", &self.ready_to_start)
            .field("use_sync_line", &self.use_sync_line)
            .field("dump_file", &self.dump_file)
            .finish()
    }
}

impl Trajectory {
    pub fn new(
        fps: &Fps,
        trajectories: TrajectoryData,
        dump: DumpMode,
        extra: serde_json::Value,
    ) -> Result<Self, TrajectoryError> {
        let dump_data = DumpData {
            start_time: Utc::now(),
            success: false,
            trajectory_send_time: None,
            trajectory_start_time: None,
            end_time: None,
            use_sync_line: true,
            extra,
            trajectory: trajectories.clone(),
            initial_positions: fps.positions_map(),
            final_positions: HashMap::new(),
        };

        let dump_file = match dump {
            DumpMode::Disabled => None,
            DumpMode::Path(path) => Some(path),
            DumpMode::Default => Some(Self::next_dump_path(
                &fps.config().positioner.trajectory_dump_path,
            )),
        };

        let mut trajectory = Self {
            fps: fps.clone(),
            trajectories,
            failed_positioners: HashMap::new(),
            n_points: HashMap::new(),
            move_time: None,
            data_send_time: None,
            failed: false,
            ready_to_start: false,
            use_sync_line: true,
            start_instant: None,
            dump_file,
            dump_data,
        };

        trajectory.validate()?;

        Ok(trajectory)
    }

    fn next_dump_path(base: &Path) -> PathBuf {
        let date = Utc::now().format("%Y%m%d").to_string();
        let dir = base.join(&date);

        let seq = std::fs::read_dir(&dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter_map(|entry| {
                        entry
                            .file_name()
                            .to_str()
                            .and_then(|name| {
                                name.strip_prefix(&format!("trajectory-{date}-"))
                                    .and_then(|rest| rest.strip_suffix(".json"))
                                    .and_then(|seq| seq.parse::<u32>().ok())
                            })
                    })
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
            + 1;

        dir.join(format!("trajectory-{date}-{seq:04}.json"))
    }

    /// Checks the submitted paths before anything touches the wire.
    fn validate(&mut self) -> Result<(), TrajectoryError> {
        if self.trajectories.is_empty() {
            return Err(self.fail_validation("trajectory is empty"));
        }

        let min_beta = self.fps.config().safe_mode.min_beta();

        let pids: Vec<u16> = self.trajectories.keys().copied().collect();
        for pid in pids {
            let path = self.trajectories[&pid].clone();

            if path.alpha.is_empty() || path.beta.is_empty() {
                self.failed_positioners.insert(pid, FailureKind::NoData);
                return Err(
                    self.fail_validation(format!("positioner {pid} is missing alpha or beta data"))
                );
            }

            for arm in [&path.alpha, &path.beta] {
                if arm[0].1 < 0.0
                    || arm.windows(2).any(|pair| pair[1].1 < pair[0].1)
                {
                    self.failed_positioners
                        .insert(pid, FailureKind::Response(ResponseCode::ValueOutOfRange));
                    return Err(self.fail_validation(format!(
                        "positioner {pid}: time samples must be non-decreasing and start at or after zero"
                    )));
                }
            }

            if let Some(min_beta) = min_beta {
                if path.beta.iter().any(|&(angle, _)| angle < min_beta) {
                    self.failed_positioners.insert(pid, FailureKind::SafeMode);
                    return Err(self.fail_validation(format!(
                        "positioner {pid}: safe mode is on and beta < {min_beta}"
                    )));
                }
            }

            let max_time = path
                .alpha
                .iter()
                .chain(&path.beta)
                .map(|&(_, time)| time)
                .fold(0.0f64, f64::max);

            if max_time > self.move_time.unwrap_or(0.0) {
                self.move_time = Some(max_time);
            }

            self.n_points.insert(pid, (path.alpha.len(), path.beta.len()));
        }

        Ok(())
    }

    fn fail_validation(&mut self, reason: impl Into<String>) -> TrajectoryError {
        self.failed = true;
        TrajectoryError::with_failed(reason, self.failed_positioners.clone())
    }

    /// Fails the trajectory, stopping the array first.
    async fn fail(&mut self, reason: impl Into<String>) -> TrajectoryError {
        self.failed = true;
        self.ready_to_start = false;

        if let Err(err) = self.fps.stop_trajectory(false).await {
            warn!(%err, "could not stop trajectories during failure cleanup");
        }

        TrajectoryError::with_failed(reason, self.failed_positioners.clone())
    }

    /// Streams the trajectory to the positioners without starting it.
    pub async fn send(&mut self) -> Result<(), TrajectoryError> {
        if self.fps.locked() {
            let locked_by = self.fps.locked_by();
            return Err(self.fail(format!("FPS is locked by {locked_by:?}")).await);
        }

        // Clear any previous trajectory state and collision flags.
        self.fps
            .stop_trajectory(false)
            .await
            .map_err(|err| TrajectoryError::new(err.to_string()))?;
        self.fps
            .stop_trajectory(true)
            .await
            .map_err(|err| TrajectoryError::new(err.to_string()))?;

        if !self
            .fps
            .update_status(None, Duration::from_secs(1))
            .await
            .unwrap_or(false)
        {
            return Err(self.fail("some positioners did not respond").await);
        }

        if self.fps.moving() {
            return Err(self.fail("the FPS is moving; cannot send a trajectory").await);
        }

        for (&pid, _) in &self.trajectories.clone() {
            let positioner = match self.fps.positioner(pid) {
                Some(positioner) => positioner,
                None => {
                    self.failed_positioners.insert(pid, FailureKind::NotReady);
                    return Err(self.fail(format!("positioner {pid} is not connected")).await);
                }
            };

            if positioner.disabled() {
                return Err(self
                    .fail(format!(
                        "positioner {pid} is disabled/offline but was included in the trajectory"
                    ))
                    .await);
            }

            if !positioner.status().ready_for_trajectory() {
                self.failed_positioners.insert(pid, FailureKind::NotReady);
                return Err(self
                    .fail(format!("positioner {pid} is not ready to receive a trajectory"))
                    .await);
            }
        }

        let pids: Vec<u16> = self.trajectories.keys().copied().collect();

        // Announce the new trajectory with the point counts per robot.
        let new_trajectory_data: HashMap<u16, Vec<Vec<u8>>> = self
            .n_points
            .iter()
            .map(|(&pid, &(n_alpha, n_beta))| {
                (pid, vec![data::new_trajectory_data(n_alpha as u32, n_beta as u32)])
            })
            .collect();

        let command = match self
            .fps
            .send_command(
                CommandId::SendNewTrajectory,
                SendOptions::to(pids.clone())
                    .data(CommandData::PerPositioner(new_trajectory_data)),
            )
            .await
        {
            Ok(command) => command,
            Err(err) => return Err(self.fail(format!("SEND_NEW_TRAJECTORY failed: {err}")).await),
        };

        if command.result().await.is_err() {
            self.record_failed_replies(&command);
            return Err(self.fail("failed sending SEND_NEW_TRAJECTORY").await);
        }

        let send_start = Instant::now();

        let config = self.fps.config();
        let n_chunk = config.positioner.trajectory_data_n_points.max(1);
        let motor_steps = config.positioner.motor_steps;
        let time_step = config.positioner.time_step;

        let max_alpha = self.n_points.values().map(|&(a, _)| a).max().unwrap_or(0);
        let max_beta = self.n_points.values().map(|&(_, b)| b).max().unwrap_or(0);

        // Stream the data in chunks: all alpha chunks first, then beta.
        // Each chunk is addressed only to the robots that still have
        // samples in that range.
        for (arm, max_points) in [("alpha", max_alpha), ("beta", max_beta)] {
            for offset in (0..max_points).step_by(n_chunk) {
                let mut chunk_data: HashMap<u16, Vec<Vec<u8>>> = HashMap::new();

                for (&pid, path) in &self.trajectories {
                    let samples = if arm == "alpha" { &path.alpha } else { &path.beta };
                    if offset >= samples.len() {
                        continue;
                    }

                    let end = (offset + n_chunk).min(samples.len());
                    chunk_data.insert(
                        pid,
                        data::trajectory_point_data(&samples[offset..end], motor_steps, time_step),
                    );
                }

                if chunk_data.is_empty() {
                    continue;
                }

                let chunk_pids: Vec<u16> = chunk_data.keys().copied().collect();
                let command = match self
                    .fps
                    .send_command(
                        CommandId::SendTrajectoryData,
                        SendOptions::to(chunk_pids).data(CommandData::PerPositioner(chunk_data)),
                    )
                    .await
                {
                    Ok(command) => command,
                    Err(err) => {
                        return Err(self.fail(format!("SEND_TRAJECTORY_DATA failed: {err}")).await)
                    }
                };

                if command.result().await.is_err() {
                    self.record_failed_replies(&command);
                    return Err(self.fail("at least one SEND_TRAJECTORY_DATA failed").await);
                }
            }
        }

        // Close the transmission; the firmware validates the point
        // counts here.
        let command = match self
            .fps
            .send_command(CommandId::TrajectoryDataEnd, SendOptions::to(pids))
            .await
        {
            Ok(command) => command,
            Err(err) => return Err(self.fail(format!("TRAJECTORY_DATA_END failed: {err}")).await),
        };

        if command.result().await.is_err() {
            self.record_failed_replies(&command);

            if self
                .failed_positioners
                .values()
                .any(|kind| matches!(kind, FailureKind::Response(ResponseCode::InvalidTrajectory)))
            {
                return Err(self.fail("a positioner rejected the trajectory as invalid").await);
            }
            return Err(self.fail("TRAJECTORY_DATA_END failed").await);
        }

        self.data_send_time = Some(send_start.elapsed().as_secs_f64());
        self.dump_data.trajectory_send_time = self.data_send_time;
        self.ready_to_start = true;
        self.failed = false;

        Ok(())
    }

    fn record_failed_replies(&mut self, command: &crate::command::Command) {
        for (pid, code) in command.failed_outcomes() {
            self.failed_positioners
                .insert(pid, FailureKind::Response(code));
        }
    }

    /// Starts a previously sent trajectory and supervises it to
    /// completion.
    pub async fn start(&mut self, use_sync_line: bool) -> Result<(), TrajectoryError> {
        if !self.ready_to_start || self.failed {
            return Err(TrajectoryError::new("the trajectory has not been sent"));
        }

        let move_time = match self.move_time {
            Some(move_time) => move_time,
            None => return Err(TrajectoryError::new("move_time not set")),
        };

        self.use_sync_line = use_sync_line;
        self.dump_data.use_sync_line = use_sync_line;

        // The loaded paths start from where the robots are now; a robot
        // away from its first sample would sweep through unplanned
        // space.
        let involved = self.positioner_ids();
        let _ = self
            .fps
            .update_position(Some(involved), Duration::from_secs(2))
            .await;

        for (&pid, path) in &self.trajectories.clone() {
            let start_alpha = path.alpha.first().map(|&(angle, _)| angle).unwrap_or(0.0);
            let start_beta = path.beta.first().map(|&(angle, _)| angle).unwrap_or(0.0);

            let position = self
                .fps
                .positioner(pid)
                .and_then(|positioner| positioner.position());

            let at_start = matches!(
                position,
                Some((alpha, beta))
                    if (alpha - start_alpha).abs() <= START_TOLERANCE
                        && (beta - start_beta).abs() <= START_TOLERANCE
            );

            if !at_start {
                self.failed_positioners.insert(pid, FailureKind::NotReady);
                return Err(self
                    .fail(format!("positioner {pid} is not at the start of its trajectory"))
                    .await);
            }
        }

        if use_sync_line {
            let sync = match self.fps.sync_line() {
                Some(sync) => sync,
                None => {
                    return Err(self.fail("IEB is not connected; cannot use sync line").await)
                }
            };

            match sync.is_closed().await {
                Ok(false) => {}
                Ok(true) => return Err(self.fail("the sync line is high").await),
                Err(err) => {
                    return Err(self.fail(format!("cannot read the sync line: {err}")).await)
                }
            }

            if let Err(err) = sync.close().await {
                return Err(self.fail(format!("cannot close the sync line: {err}")).await);
            }

            // Release the line shortly after; the pulse is what starts
            // the trajectories.
            let sync_release = sync.clone();
            tokio::spawn(async move {
                tokio::time::sleep(SYNC_LINE_PULSE).await;
                if let Err(err) = sync_release.open().await {
                    warn!(%err, "could not reopen the sync line");
                }
            });
        } else {
            let n_expected = self.fps.online_count();
            let command = match self
                .fps
                .send_command(
                    CommandId::StartTrajectory,
                    SendOptions::broadcast()
                        .timeout(Timeout::After(Duration::from_secs(1)))
                        .n_positioners(n_expected),
                )
                .await
            {
                Ok(command) => command,
                Err(err) => {
                    return Err(self.fail(format!("START_TRAJECTORY failed: {err}")).await)
                }
            };

            if command.result().await.is_err() {
                return Err(self.fail("START_TRAJECTORY failed").await);
            }
        }

        let restart_pollers = self.fps.pollers().running();
        self.fps.pollers().stop().await;

        self.start_instant = Some(Instant::now());
        self.dump_data.trajectory_start_time = Some(Utc::now());

        // If the caller is cancelled mid-supervision, stop the array.
        let mut stop_guard = StopGuard::new(self.fps.clone());

        let result = self.supervise(move_time).await;

        stop_guard.disarm();

        self.dump_data.end_time = Some(Utc::now());
        self.dump_data.final_positions = self.fps.positions_map();
        self.dump_data.success = !self.failed;
        self.dump_trajectory();

        if restart_pollers {
            self.fps.pollers().start();
        }

        let _ = self.fps.save_snapshot().await;

        result
    }

    async fn supervise(&mut self, move_time: f64) -> Result<(), TrajectoryError> {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;

            if self.fps.locked() {
                return Err(self.fail("the FPS got locked during the trajectory").await);
            }

            let _ = self.fps.update_status(None, Duration::from_secs(2)).await;

            if self.fps.status().contains(FpsStatus::IDLE) {
                break;
            }

            let elapsed = self
                .start_instant
                .map(|start| start.elapsed().as_secs_f64())
                .unwrap_or(0.0);
            if elapsed > move_time + MOVE_TIME_GRACE.as_secs_f64() {
                return Err(self.fail("some positioners did not complete the move").await);
            }
        }

        // The status register can report completion without the arm
        // having moved. Stop, refresh, and check actual positions.
        if let Err(err) = self.fps.stop_trajectory(false).await {
            warn!(%err, "could not send the end-of-trajectory stop");
        }

        let _ = self.fps.update_position(None, Duration::from_secs(2)).await;

        let mut missed = false;
        for (&pid, path) in &self.trajectories.clone() {
            let target_alpha = path.alpha.last().map(|&(angle, _)| angle).unwrap_or(0.0);
            let target_beta = path.beta.last().map(|&(angle, _)| angle).unwrap_or(0.0);

            let reached = self
                .fps
                .positioner(pid)
                .and_then(|positioner| positioner.position());

            let ok = matches!(
                reached,
                Some((alpha, beta))
                    if (alpha - target_alpha).abs() <= REACH_TOLERANCE
                        && (beta - target_beta).abs() <= REACH_TOLERANCE
            );

            if !ok {
                warn!(
                    positioner_id = pid,
                    ?reached,
                    target_alpha,
                    target_beta,
                    "positioner may not have reached its destination"
                );
                self.failed_positioners.insert(pid, FailureKind::NotReady);
                missed = true;
            }
        }

        if missed {
            return Err(self.fail("some positioners did not reach their destinations").await);
        }

        self.failed = false;

        Ok(())
    }

    /// Writes the journal record. Failures to write are logged, never
    /// fatal.
    pub fn dump_trajectory(&mut self) {
        let Some(path) = self.dump_file.clone() else {
            return;
        };

        self.dump_data.success = !self.failed;

        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(&self.dump_data)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
            std::fs::write(&path, json)
        })();

        match result {
            Ok(()) => debug!(path = %path.display(), "trajectory journalled"),
            Err(err) => warn!(path = %path.display(), %err, "could not write trajectory dump"),
        }
    }

    pub fn dump_file(&self) -> Option<&Path> {
        self.dump_file.as_deref()
    }

    pub fn positioner_ids(&self) -> Vec<u16> {
        self.trajectories.keys().copied().collect()
    }

    /// Aborts the trajectory transmission on the involved robots.
    pub async fn abort(&self) -> Result<(), TrajectoryError> {
        let command = self
            .fps
            .send_command(
                CommandId::SendTrajectoryAbort,
                SendOptions::to(self.positioner_ids()),
            )
            .await
            .map_err(|err| TrajectoryError::new(err.to_string()))?;

        command
            .result()
            .await
            .map_err(|_| TrajectoryError::new("cannot abort trajectory transmission"))
    }
}

/// Stops the array if dropped while armed; covers cancellation of the
/// supervision loop.
struct StopGuard {
    fps: Option<Fps>,
}

impl StopGuard {
    fn new(fps: Fps) -> Self {
        Self { fps: Some(fps) }
    }

    fn disarm(&mut self) {
        self.fps = None;
    }
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        if let Some(fps) = self.fps.take() {
            tokio::spawn(async move {
                let _ = fps.stop_trajectory(false).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goto_move_time_scales_with_speed() {
        let slow = goto_move_time(90.0, 1000.0);
        let fast = goto_move_time(90.0, 2000.0);
        assert!((slow - 2.0 * fast).abs() < 1e-9);
        assert!(slow > 0.0);
        assert_eq!(goto_move_time(0.0, 1000.0), 0.0);
    }

    #[test]
    fn trajectory_files_roundtrip() {
        let dir = tempfile::tempdir().unwrap();

        let yaml_path = dir.path().join("trajectory.yaml");
        std::fs::write(
            &yaml_path,
            "4:\n  alpha: [[90, 0], [91, 3]]\n  beta: [[170, 0], [173, 4]]\n",
        )
        .unwrap();

        let data = load_trajectory_file(&yaml_path).unwrap();
        assert_eq!(data[&4].alpha, vec![(90.0, 0.0), (91.0, 3.0)]);
        assert_eq!(data[&4].beta.len(), 2);

        let json_path = dir.path().join("trajectory.json");
        std::fs::write(
            &json_path,
            r#"{"trajectory": {"7": {"alpha": [[10, 0]], "beta": [[170, 0]]}}}"#,
        )
        .unwrap();

        let data = load_trajectory_file(&json_path).unwrap();
        assert_eq!(data[&7].alpha, vec![(10.0, 0.0)]);
    }
}

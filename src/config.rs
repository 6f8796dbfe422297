//! Runtime configuration.
//!
//! The configuration is a YAML tree mirrored into serde structs. Every
//! field has a default so a partial file (or none at all) yields a
//! working configuration for a virtual setup. The controller holds the
//! tree behind an `RwLock`: the low-temperature monitor rewrites
//! `positioner.motor_speed` when the array gets cold.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use canopus_proto::ident::MAX_UID_BITS;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub positioner: PositionerConfig,
    pub fps: FpsConfig,
    pub safe_mode: SafeMode,
    pub low_temperature: LowTemperatureConfig,
    pub can: CanConfig,
}

impl Config {
    /// Loads a configuration from a YAML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.can.uid_bits == 0 || self.can.uid_bits > MAX_UID_BITS {
            return Err(ConfigError::InvalidUidBits(self.can.uid_bits));
        }
        for (name, profile) in &self.can.profiles {
            if profile.channels().is_empty() {
                return Err(ConfigError::MissingChannel(name.clone()));
            }
        }
        Ok(())
    }

    /// Looks up a CAN profile, or the `default` one.
    pub fn profile(&self, name: Option<&str>) -> Result<&CanProfile, ConfigError> {
        let name = name.unwrap_or("default");
        self.can
            .profiles
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionerConfig {
    /// Default motor speed, RPM.
    pub motor_speed: f64,
    /// Motor steps per full revolution of the arm.
    pub motor_steps: u32,
    /// Duration of one firmware tick, seconds.
    pub time_step: f64,
    /// Trajectory points packed into each SEND_TRAJECTORY_DATA command.
    pub trajectory_data_n_points: usize,
    pub disable_precise_moves: bool,
    pub position_poller_delay: f64,
    pub status_poller_delay: f64,
    pub trajectory_dump_path: PathBuf,
}

impl Default for PositionerConfig {
    fn default() -> Self {
        Self {
            motor_speed: 2000.0,
            motor_steps: 1 << 30,
            time_step: 5e-4,
            trajectory_data_n_points: 10,
            disable_precise_moves: false,
            position_poller_delay: 5.0,
            status_poller_delay: 5.0,
            trajectory_dump_path: PathBuf::from("/data/logs/canopus/trajectories"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FpsConfig {
    /// Start trajectories over the hardware sync line rather than a
    /// START_TRAJECTORY broadcast.
    pub use_sync_line: bool,
    /// Acquire a PID lock file on startup.
    pub use_lock: bool,
    pub lock_file: PathBuf,
    pub start_pollers: bool,
    /// Timeout for the initialise-time broadcast probes, seconds.
    pub initialise_timeouts: f64,
    pub status_poller_delay: f64,
    pub position_poller_delay: f64,
    pub disabled_positioners: Vec<u16>,
    /// Robots physically present but unresponsive; values are their fixed
    /// (alpha, beta) positions.
    pub offline_positioners: HashMap<u16, (f64, f64)>,
    pub disable_collision_detection_positioners: Vec<u16>,
    pub open_loop_positioners: Vec<u16>,
    /// Positioner ids the fibre-assignment table expects to be connected.
    /// Empty skips the check.
    pub expected_positioners: Vec<u16>,
    /// The folded (alpha, beta) pose.
    pub lattice_position: (f64, f64),
    /// Directory for status snapshot files.
    pub snapshot_path: PathBuf,
}

impl Default for FpsConfig {
    fn default() -> Self {
        Self {
            use_sync_line: true,
            use_lock: true,
            lock_file: PathBuf::from("/var/tmp/canopus/canopus.lock"),
            start_pollers: true,
            initialise_timeouts: 2.0,
            status_poller_delay: 5.0,
            position_poller_delay: 5.0,
            disabled_positioners: Vec::new(),
            offline_positioners: HashMap::new(),
            disable_collision_detection_positioners: Vec::new(),
            open_loop_positioners: Vec::new(),
            expected_positioners: Vec::new(),
            lattice_position: (0.0, 180.0),
            snapshot_path: PathBuf::from("/data/logs/canopus/snapshots"),
        }
    }
}

/// Safe mode restricts the beta range accepted in trajectories.
///
/// In YAML this is `false`, `true` (160 degree minimum) or
/// `{min_beta: <degrees>}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SafeMode {
    Enabled(bool),
    MinBeta { min_beta: f64 },
}

/// Default minimum beta when safe mode is enabled without a value.
pub const SAFE_MODE_MIN_BETA: f64 = 160.0;

impl SafeMode {
    /// The active minimum beta, or `None` when safe mode is off.
    pub fn min_beta(&self) -> Option<f64> {
        match self {
            SafeMode::Enabled(false) => None,
            SafeMode::Enabled(true) => Some(SAFE_MODE_MIN_BETA),
            SafeMode::MinBeta { min_beta } => Some(*min_beta),
        }
    }
}

impl Default for SafeMode {
    fn default() -> Self {
        SafeMode::Enabled(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LowTemperatureConfig {
    /// Name of the IEB temperature device to read.
    pub sensor: String,
    /// Below this the array is cold, degrees C.
    pub cold_threshold: f64,
    /// Below this the array is very cold, degrees C.
    pub very_cold_threshold: f64,
    /// Seconds between sensor reads.
    pub interval: f64,
    pub rpm_cold: f64,
    pub rpm_normal: f64,
    /// (alpha, beta) holding current while very cold.
    pub holding_torque_very_cold: (f64, f64),
    pub holding_torque_normal: (f64, f64),
}

impl Default for LowTemperatureConfig {
    fn default() -> Self {
        Self {
            sensor: "rtd2".to_string(),
            cold_threshold: 0.0,
            very_cold_threshold: -10.0,
            interval: 60.0,
            rpm_cold: 1000.0,
            rpm_normal: 2000.0,
            holding_torque_very_cold: (30.0, 30.0),
            holding_torque_normal: (0.0, 30.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanConfig {
    /// Width of the per-message UID field in the arbitration id.
    pub uid_bits: u32,
    pub profiles: HashMap<String, CanProfile>,
}

impl Default for CanConfig {
    fn default() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(
            "default".to_string(),
            CanProfile {
                interface: InterfaceType::Virtual,
                channel: Some("vcan0".to_string()),
                ..CanProfile::default()
            },
        );
        Self {
            uid_bits: canopus_proto::ident::DEFAULT_UID_BITS,
            profiles,
        }
    }
}

/// The supported bus interface flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    #[default]
    Virtual,
    Socketcan,
    Slcan,
    Cannet,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CanProfile {
    pub interface: InterfaceType,
    /// Single channel; mutually redundant with `channels`.
    pub channel: Option<String>,
    pub channels: Vec<String>,
    /// Serial baudrate (slcan).
    pub baudrate: Option<u32>,
    /// TCP port (cannet).
    pub port: Option<u16>,
    /// Gateway bus numbers to drive (cannet); defaults to bus 1.
    pub buses: Vec<u8>,
    /// Poll interval for gateway device status, seconds (cannet).
    pub status_interval: Option<f64>,
}

impl CanProfile {
    /// The channel list, folding `channel` and `channels` together.
    pub fn channels(&self) -> Vec<String> {
        if let Some(channel) = &self.channel {
            vec![channel.clone()]
        } else {
            self.channels.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.can.uid_bits, 6);
        assert!(config.profile(None).is_ok());
        assert!(config.profile(Some("missing")).is_err());
    }

    #[test]
    fn safe_mode_forms() {
        let off: SafeMode = serde_yaml::from_str("false").unwrap();
        assert_eq!(off.min_beta(), None);

        let on: SafeMode = serde_yaml::from_str("true").unwrap();
        assert_eq!(on.min_beta(), Some(160.0));

        let custom: SafeMode = serde_yaml::from_str("{min_beta: 155.5}").unwrap();
        assert_eq!(custom.min_beta(), Some(155.5));
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str(
            r#"
            positioner:
              motor_speed: 1000
            can:
              uid_bits: 4
              profiles:
                default:
                  interface: cannet
                  channels: ["10.1.10.110"]
                  port: 19228
                  buses: [1, 2, 3, 4]
            "#,
        )
        .unwrap();

        assert_eq!(config.positioner.motor_speed, 1000.0);
        assert_eq!(config.positioner.motor_steps, 1 << 30);
        assert_eq!(config.can.uid_bits, 4);

        let profile = config.profile(None).unwrap();
        assert_eq!(profile.interface, InterfaceType::Cannet);
        assert_eq!(profile.channels(), vec!["10.1.10.110".to_string()]);
        config.validate().unwrap();
    }

    #[test]
    fn empty_channels_are_rejected() {
        let config: Config = serde_yaml::from_str(
            r#"
            can:
              profiles:
                default:
                  interface: socketcan
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingChannel(_))
        ));
    }

    #[test]
    fn oversize_uid_bits_are_rejected() {
        let mut config = Config::default();
        config.can.uid_bits = 20;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUidBits(20))
        ));
    }
}

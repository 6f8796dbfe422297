//! Instrument electronics seam.
//!
//! The controller needs very little from the electronics box: named
//! devices it can read (temperature sensors) and write (relays). The
//! PLC protocol itself lives outside this crate; implementations of
//! [`DeviceBank`] adapt it. The one device the core drives directly is
//! the sync-line relay that starts pre-loaded trajectories.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unknown device {0:?}")]
    UnknownDevice(String),

    #[error("the device bank is disabled")]
    Disabled,

    #[error("device {device:?} returned a {got} value, expected {expected}")]
    TypeMismatch {
        device: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("device i/o failed: {0}")]
    Io(String),
}

/// A typed device reading or setting.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceValue {
    /// Relay state; `true` is closed.
    Relay(bool),
    /// A measured quantity in engineering units.
    Measured(f64),
    Text(String),
}

impl DeviceValue {
    fn kind(&self) -> &'static str {
        match self {
            DeviceValue::Relay(_) => "relay",
            DeviceValue::Measured(_) => "measured",
            DeviceValue::Text(_) => "text",
        }
    }
}

/// Narrow typed key/value interface to the instrument electronics.
#[async_trait]
pub trait DeviceBank: Send + Sync {
    async fn read(&self, device: &str) -> Result<DeviceValue, DeviceError>;

    async fn write(&self, device: &str, value: DeviceValue) -> Result<(), DeviceError>;

    /// A disabled bank refuses all traffic; the supervisor degrades
    /// gracefully when it is.
    fn disabled(&self) -> bool {
        false
    }
}

/// Name of the sync-line relay device.
pub const SYNC_DEVICE: &str = "sync";

/// The digital output every positioner watches to start a pre-loaded
/// trajectory simultaneously.
#[derive(Clone)]
pub struct SyncLine {
    bank: Arc<dyn DeviceBank>,
}

impl SyncLine {
    pub fn new(bank: Arc<dyn DeviceBank>) -> Self {
        Self { bank }
    }

    pub async fn is_closed(&self) -> Result<bool, DeviceError> {
        match self.bank.read(SYNC_DEVICE).await? {
            DeviceValue::Relay(closed) => Ok(closed),
            other => Err(DeviceError::TypeMismatch {
                device: SYNC_DEVICE.to_string(),
                expected: "relay",
                got: other.kind(),
            }),
        }
    }

    /// Drives the line high.
    pub async fn close(&self) -> Result<(), DeviceError> {
        self.bank.write(SYNC_DEVICE, DeviceValue::Relay(true)).await
    }

    /// Releases the line.
    pub async fn open(&self) -> Result<(), DeviceError> {
        self.bank.write(SYNC_DEVICE, DeviceValue::Relay(false)).await
    }
}

/// Reads a temperature device as a float.
pub async fn read_temperature(
    bank: &Arc<dyn DeviceBank>,
    device: &str,
) -> Result<f64, DeviceError> {
    match bank.read(device).await? {
        DeviceValue::Measured(value) => Ok(value),
        other => Err(DeviceError::TypeMismatch {
            device: device.to_string(),
            expected: "measured",
            got: other.kind(),
        }),
    }
}

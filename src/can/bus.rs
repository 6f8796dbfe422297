//! Bus interface variants.
//!
//! A channel from the configuration becomes one [`BusInterface`]. All
//! variants expose the same capability set (open, send, receive) and
//! the concrete flavour is chosen from the profile at startup.

use async_trait::async_trait;

use crate::can::cannet::CanNetBus;
use crate::can::message::Message;
use crate::can::slcan::SlcanBus;
use crate::can::socketcan_bus::SocketCanBus;
use crate::can::virtual_bus::VirtualBus;
use crate::config::{CanProfile, InterfaceType};
use crate::error::CanError;

/// A physical (or virtual) CAN channel.
///
/// `send` is non-blocking from the caller's perspective apart from
/// cooperative yields; ordering within a single bus is FIFO. `recv`
/// resolves with the next inbound frame and is drained by a single
/// reader task per bus.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn open(&self) -> Result<(), CanError>;

    async fn send(&self, message: &Message) -> Result<(), CanError>;

    async fn recv(&self) -> Result<Message, CanError>;

    async fn close(&self);
}

/// Tagged union over the supported channel flavours.
pub enum BusInterface {
    Virtual(VirtualBus),
    SocketCan(SocketCanBus),
    Slcan(SlcanBus),
    CanNet(CanNetBus),
}

impl BusInterface {
    /// Builds a closed interface for one channel of a profile.
    pub fn from_profile(profile: &CanProfile, channel: &str, uid_bits: u32) -> Self {
        match profile.interface {
            InterfaceType::Virtual => BusInterface::Virtual(VirtualBus::new(channel, uid_bits)),
            InterfaceType::Socketcan => {
                BusInterface::SocketCan(SocketCanBus::new(channel, uid_bits))
            }
            InterfaceType::Slcan => BusInterface::Slcan(SlcanBus::new(
                channel,
                profile.baudrate.unwrap_or(115_200),
                uid_bits,
            )),
            InterfaceType::Cannet => BusInterface::CanNet(CanNetBus::new(
                channel,
                profile.port.unwrap_or(19228),
                if profile.buses.is_empty() {
                    vec![1]
                } else {
                    profile.buses.clone()
                },
                uid_bits,
            )),
        }
    }

    /// Whether this interface drives more than one bus.
    pub fn is_multibus(&self) -> bool {
        matches!(self, BusInterface::CanNet(_))
    }

    /// Gateway bus numbers, for multibus interfaces.
    pub fn buses(&self) -> &[u8] {
        match self {
            BusInterface::CanNet(bus) => bus.buses(),
            _ => &[],
        }
    }

    /// Channel name, for logs.
    pub fn channel(&self) -> &str {
        match self {
            BusInterface::Virtual(b) => b.channel(),
            BusInterface::SocketCan(b) => b.channel(),
            BusInterface::Slcan(b) => b.channel(),
            BusInterface::CanNet(b) => b.channel(),
        }
    }

    /// Writes a control-plane line to the device, where the interface has
    /// one (the CAN@net gateway).
    pub async fn write_device_command(&self, line: &str) -> Result<(), CanError> {
        match self {
            BusInterface::CanNet(bus) => bus.write_device_command(line).await,
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Bus for BusInterface {
    async fn open(&self) -> Result<(), CanError> {
        match self {
            BusInterface::Virtual(b) => b.open().await,
            BusInterface::SocketCan(b) => b.open().await,
            BusInterface::Slcan(b) => b.open().await,
            BusInterface::CanNet(b) => b.open().await,
        }
    }

    async fn send(&self, message: &Message) -> Result<(), CanError> {
        match self {
            BusInterface::Virtual(b) => b.send(message).await,
            BusInterface::SocketCan(b) => b.send(message).await,
            BusInterface::Slcan(b) => b.send(message).await,
            BusInterface::CanNet(b) => b.send(message).await,
        }
    }

    async fn recv(&self) -> Result<Message, CanError> {
        match self {
            BusInterface::Virtual(b) => b.recv().await,
            BusInterface::SocketCan(b) => b.recv().await,
            BusInterface::Slcan(b) => b.recv().await,
            BusInterface::CanNet(b) => b.recv().await,
        }
    }

    async fn close(&self) {
        match self {
            BusInterface::Virtual(b) => b.close().await,
            BusInterface::SocketCan(b) => b.close().await,
            BusInterface::Slcan(b) => b.close().await,
            BusInterface::CanNet(b) => b.close().await,
        }
    }
}

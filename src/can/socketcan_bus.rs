//! Linux socketcan channel.
//!
//! One network interface (`can0`, `vcan0`, ...) per [`SocketCanBus`].
//! Only extended data frames are relevant to positioner firmware; error
//! and remote frames are skipped.

use async_trait::async_trait;
use socketcan::tokio::CanSocket;
use socketcan::{CanFrame, EmbeddedFrame, ExtendedId, Id};
use tokio::sync::RwLock;
use tracing::debug;

use crate::can::bus::Bus;
use crate::can::message::Message;
use crate::error::CanError;

pub struct SocketCanBus {
    channel: String,
    uid_bits: u32,
    socket: RwLock<Option<CanSocket>>,
}

impl SocketCanBus {
    pub fn new(channel: &str, uid_bits: u32) -> Self {
        Self {
            channel: channel.to_string(),
            uid_bits,
            socket: RwLock::new(None),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl Bus for SocketCanBus {
    async fn open(&self) -> Result<(), CanError> {
        let socket = CanSocket::open(&self.channel).map_err(|source| CanError::Connection {
            channel: self.channel.clone(),
            source,
        })?;

        *self.socket.write().await = Some(socket);
        debug!(channel = %self.channel, "socketcan channel open");

        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<(), CanError> {
        if message.data.len() > 8 {
            return Err(CanError::FrameTooLong(message.data.len()));
        }

        let id = ExtendedId::new(message.arbitration_id).ok_or_else(|| {
            CanError::InvalidFrame(format!("arbitration id {:#x}", message.arbitration_id))
        })?;
        let frame = CanFrame::new(Id::Extended(id), &message.data)
            .ok_or(CanError::FrameTooLong(message.data.len()))?;

        let guard = self.socket.read().await;
        let socket = guard.as_ref().ok_or(CanError::NotOpen)?;
        socket.write_frame(frame).await?;

        Ok(())
    }

    async fn recv(&self) -> Result<Message, CanError> {
        loop {
            let frame = {
                let guard = self.socket.read().await;
                let socket = guard.as_ref().ok_or(CanError::NotOpen)?;
                socket.read_frame().await?
            };

            let raw_id = match frame.id() {
                Id::Extended(id) => id.as_raw(),
                Id::Standard(_) => continue,
            };

            match Message::from_frame(raw_id, frame.data().to_vec(), self.uid_bits, None, None)
            {
                Ok(message) => return Ok(message),
                Err(err) => {
                    debug!(channel = %self.channel, %err, "dropping undecodable frame");
                    continue;
                }
            }
        }
    }

    async fn close(&self) {
        *self.socket.write().await = None;
    }
}

//! In-process loopback bus.
//!
//! Messages sent by the controller are published on a broadcast channel
//! that emulated firmware (see [`crate::testing`]) subscribes to; frames
//! the firmware injects come back through `recv` like any other bus.

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::can::bus::Bus;
use crate::can::message::Message;
use crate::error::CanError;

pub struct VirtualBus {
    channel: String,
    #[allow(dead_code)]
    uid_bits: u32,
    sent_tx: broadcast::Sender<Message>,
    inject_tx: mpsc::UnboundedSender<Message>,
    inbound: Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl VirtualBus {
    pub fn new(channel: &str, uid_bits: u32) -> Self {
        let (sent_tx, _) = broadcast::channel(1024);
        let (inject_tx, inbound) = mpsc::unbounded_channel();

        Self {
            channel: channel.to_string(),
            uid_bits,
            sent_tx,
            inject_tx,
            inbound: Mutex::new(inbound),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Firmware side: a stream of everything the controller sends and a
    /// handle to push replies back.
    pub fn attach(&self) -> (broadcast::Receiver<Message>, mpsc::UnboundedSender<Message>) {
        (self.sent_tx.subscribe(), self.inject_tx.clone())
    }
}

#[async_trait]
impl Bus for VirtualBus {
    async fn open(&self) -> Result<(), CanError> {
        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<(), CanError> {
        // No receiver just means nothing is listening yet; frames on a
        // real bus with no listeners are dropped the same way.
        let _ = self.sent_tx.send(message.clone());
        Ok(())
    }

    async fn recv(&self) -> Result<Message, CanError> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.ok_or(CanError::NotOpen)
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopus_proto::ident::DEFAULT_UID_BITS;
    use canopus_proto::CommandId;

    #[tokio::test]
    async fn loopback_roundtrip() {
        let bus = VirtualBus::new("vcan0", DEFAULT_UID_BITS);
        let (mut sent_rx, inject) = bus.attach();

        let msg =
            Message::new(CommandId::GetStatus, 7, 0, vec![], DEFAULT_UID_BITS).unwrap();
        bus.send(&msg).await.unwrap();

        let seen = sent_rx.recv().await.unwrap();
        assert_eq!(seen.positioner_id, 7);

        inject.send(seen.clone()).unwrap();
        let received = bus.recv().await.unwrap();
        assert_eq!(received.arbitration_id, msg.arbitration_id);
    }
}

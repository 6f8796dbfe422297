//! Fan-out of inbound frames.
//!
//! One reader task per bus drains frames and hands each one to every
//! registered listener on its own task, so a slow listener never holds
//! up the others. Delivery is best effort; listeners must tolerate
//! seeing a message more than once.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::can::bus::{Bus, BusInterface};
use crate::can::message::Message;
use crate::error::CanError;

#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: Message);
}

#[derive(Default)]
pub struct Notifier {
    listeners: Arc<std::sync::RwLock<Vec<Arc<dyn MessageListener>>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) {
        self.listeners
            .write()
            .expect("listener list lock")
            .push(listener);
    }

    /// Starts draining a bus. Frames are stamped with the interface
    /// index before dispatch.
    pub fn watch_bus(&mut self, bus: Arc<BusInterface>, interface: usize) {
        let listeners = Arc::clone(&self.listeners);

        self.tasks.push(tokio::spawn(async move {
            loop {
                match bus.recv().await {
                    Ok(mut message) => {
                        message.interface = Some(interface);

                        let current: Vec<Arc<dyn MessageListener>> =
                            listeners.read().expect("listener list lock").clone();
                        for listener in current {
                            let message = message.clone();
                            tokio::spawn(async move {
                                listener.on_message(message).await;
                            });
                        }
                    }
                    Err(CanError::NotOpen) => {
                        debug!(interface, "bus closed; reader exiting");
                        break;
                    }
                    Err(err) => {
                        warn!(interface, %err, "error reading from bus");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }));
    }

    /// Cancels all reader tasks.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::virtual_bus::VirtualBus;
    use canopus_proto::ident::DEFAULT_UID_BITS;
    use canopus_proto::CommandId;
    use tokio::sync::mpsc;

    struct Forwarder(mpsc::UnboundedSender<Message>);

    #[async_trait]
    impl MessageListener for Forwarder {
        async fn on_message(&self, message: Message) {
            let _ = self.0.send(message);
        }
    }

    #[tokio::test]
    async fn delivers_to_all_listeners_with_interface_tag() {
        let bus = Arc::new(BusInterface::Virtual(VirtualBus::new(
            "vcan0",
            DEFAULT_UID_BITS,
        )));
        let inject = match bus.as_ref() {
            BusInterface::Virtual(b) => b.attach().1,
            _ => unreachable!(),
        };

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let mut notifier = Notifier::new();
        notifier.add_listener(Arc::new(Forwarder(tx_a)));
        notifier.add_listener(Arc::new(Forwarder(tx_b)));
        notifier.watch_bus(Arc::clone(&bus), 3);

        let msg = Message::new(CommandId::GetStatus, 9, 0, vec![], DEFAULT_UID_BITS).unwrap();
        inject.send(msg).unwrap();

        let got_a = rx_a.recv().await.unwrap();
        let got_b = rx_b.recv().await.unwrap();
        assert_eq!(got_a.interface, Some(3));
        assert_eq!(got_b.positioner_id, 9);

        notifier.stop();
    }
}

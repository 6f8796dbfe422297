//! The CAN network manager.
//!
//! Owns the bus interfaces and the notifier, serialises outbound
//! commands through a queue, and routes replies back to the originating
//! command by the composite key `(positioner_id << 25) | (command_id <<
//! 15) | uid`. Broadcast messages are registered under positioner id 0.
//!
//! Inbound COLLISION_DETECTED frames are special-cased: they never match
//! a command and instead trigger the collision handler installed by the
//! supervisor, which locks the array. Stopping trajectories makes more
//! robots report collisions, so the handler ignores reports that arrive
//! once the array is already locked.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use canopus_proto::CommandId;

use crate::can::bus::{Bus, BusInterface};
use crate::can::cannet::DeviceStatusTracker;
use crate::can::message::Message;
use crate::can::notifier::{MessageListener, Notifier};
use crate::command::Command;
use crate::config::CanProfile;
use crate::error::CommandError;

/// Delay before retrying a broadcast whose UID pool was exhausted.
const REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// Composite key used to match replies to running commands.
pub fn command_key(positioner_id: u16, command_id: u16, uid: u8) -> u64 {
    ((positioner_id as u64) << 25) | ((command_id as u64) << 15) | uid as u64
}

/// Installed by the supervisor; invoked with the reporting positioner id
/// when a COLLISION_DETECTED frame arrives.
pub type CollisionHandler = Arc<dyn Fn(u16) + Send + Sync>;

struct NetworkInner {
    interfaces: Vec<Arc<BusInterface>>,
    multibus: bool,
    uid_bits: u32,
    command_tx: mpsc::UnboundedSender<Command>,
    running: Mutex<HashMap<u64, Command>>,
    routes: Mutex<HashMap<u16, (usize, Option<u8>)>>,
    collision_handler: Mutex<Option<CollisionHandler>>,
    device_status: Mutex<DeviceStatusTracker>,
    notifier: Mutex<Notifier>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the CAN network. Clones share state.
#[derive(Clone)]
pub struct CanNetwork {
    inner: Arc<NetworkInner>,
}

impl CanNetwork {
    /// Opens every channel of a profile and starts the dispatcher and
    /// reply listener. Channels that fail to open are logged and
    /// skipped; the network runs with whatever opened.
    pub async fn start(profile: &CanProfile, uid_bits: u32) -> CanNetwork {
        let mut interfaces: Vec<Arc<BusInterface>> = Vec::new();

        for channel in profile.channels() {
            let bus = BusInterface::from_profile(profile, &channel, uid_bits);
            match bus.open().await {
                Ok(()) => {
                    info!(channel = %channel, "CAN channel open");
                    interfaces.push(Arc::new(bus));
                }
                Err(err) => {
                    error!(channel = %channel, %err, "connection failed; skipping channel");
                }
            }
        }

        let multibus = interfaces.iter().any(|bus| bus.is_multibus());

        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(NetworkInner {
            interfaces,
            multibus,
            uid_bits,
            command_tx,
            running: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            collision_handler: Mutex::new(None),
            device_status: Mutex::new(DeviceStatusTracker::new()),
            notifier: Mutex::new(Notifier::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let network = CanNetwork { inner };
        network.start_tasks(command_rx, profile.status_interval.unwrap_or(5.0)).await;
        network
    }

    async fn start_tasks(
        &self,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        status_interval: f64,
    ) {
        let inner = &self.inner;

        {
            let mut notifier = inner.notifier.lock().expect("notifier lock");
            notifier.add_listener(Arc::new(ReplyRouter {
                network: Arc::downgrade(inner),
            }));
            for (index, bus) in inner.interfaces.iter().enumerate() {
                notifier.watch_bus(Arc::clone(bus), index);
            }
        }

        // Identify multibus gateways once; their status is then polled.
        for bus in &inner.interfaces {
            if bus.is_multibus() {
                let _ = bus.write_device_command("DEV IDENTIFY").await;
                let _ = bus.write_device_command("DEV VERSION").await;
            }
        }

        let mut tasks = inner.tasks.lock().expect("task list lock");

        let dispatcher = Arc::downgrade(inner);
        tasks.push(tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let Some(inner) = dispatcher.upgrade() else {
                    break;
                };
                NetworkInner::process_command(&inner, command).await;
            }
        }));

        if inner.interfaces.iter().any(|bus| bus.is_multibus()) {
            let poller = Arc::downgrade(inner);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs_f64(status_interval)).await;
                    let Some(inner) = poller.upgrade() else { break };
                    for bus in inner.interfaces.iter().filter(|b| b.is_multibus()) {
                        for n in bus.buses().to_vec() {
                            let _ = bus.write_device_command(&format!("CAN {n} STATUS")).await;
                        }
                    }
                }
            }));
        }
    }

    pub fn n_interfaces(&self) -> usize {
        self.inner.interfaces.len()
    }

    pub fn interface(&self, index: usize) -> Option<Arc<BusInterface>> {
        self.inner.interfaces.get(index).cloned()
    }

    pub fn is_multibus(&self) -> bool {
        self.inner.multibus || self.inner.interfaces.len() > 1
    }

    pub fn uid_bits(&self) -> u32 {
        self.inner.uid_bits
    }

    /// Queues a command for transmission.
    pub fn send(&self, command: &Command) -> Result<(), CommandError> {
        self.inner
            .command_tx
            .send(command.clone())
            .map_err(|_| CommandError::Cancelled {
                command: command.command_id(),
                command_uid: command.command_uid(),
            })
    }

    /// Sends a command immediately, bypassing the queue. For emergency
    /// stops and shutdown paths.
    pub async fn send_now(&self, command: &Command) {
        NetworkInner::process_command(&self.inner, command.clone()).await;
    }

    /// Replaces the positioner-to-bus routing map.
    pub fn set_routes(&self, routes: HashMap<u16, (usize, Option<u8>)>) {
        *self.inner.routes.lock().expect("route map lock") = routes;
    }

    pub fn routes(&self) -> HashMap<u16, (usize, Option<u8>)> {
        self.inner.routes.lock().expect("route map lock").clone()
    }

    /// Installs the supervisor's collision handler.
    pub fn set_collision_handler(&self, handler: CollisionHandler) {
        *self
            .inner
            .collision_handler
            .lock()
            .expect("collision handler lock") = Some(handler);
    }

    /// Cancels every in-flight move command. Used by emergency stops.
    pub fn cancel_move_commands(&self) {
        let running = self.inner.running.lock().expect("running commands lock");
        for command in running.values() {
            if command.descriptor().move_command && !command.status().is_done() {
                command.cancel(true);
            }
        }
    }

    /// Drops finished commands from the reply-matching map.
    pub fn refresh_running_commands(&self) {
        self.inner
            .running
            .lock()
            .expect("running commands lock")
            .retain(|_, command| !command.status().is_done());
    }

    /// Gateway device status, serialised for reports.
    pub fn device_status(&self) -> serde_json::Value {
        let tracker = self.inner.device_status.lock().expect("device status lock");
        serde_json::to_value(tracker.status()).unwrap_or(serde_json::Value::Null)
    }

    /// Stops reader tasks, the dispatcher, and closes every channel.
    pub async fn stop(&self) {
        self.inner.notifier.lock().expect("notifier lock").stop();

        for task in self.inner.tasks.lock().expect("task list lock").drain(..) {
            task.abort();
        }

        for bus in &self.inner.interfaces {
            bus.close().await;
        }
    }
}

impl NetworkInner {
    async fn process_command(inner: &Arc<NetworkInner>, command: Command) {
        let status = command.status();
        if !status.contains(canopus_proto::CommandStatus::READY) {
            if !status.contains(canopus_proto::CommandStatus::CANCELLED) {
                error!(
                    command = %command.name(),
                    command_uid = command.command_uid(),
                    ?status,
                    "command is not ready"
                );
                command.cancel(true);
            }
            return;
        }

        let messages = match command.get_messages() {
            Ok(messages) => messages,
            Err(err @ CommandError::UidPoolExhausted { .. }) if command.is_broadcast() => {
                debug!(%err, "requeueing broadcast after UID pool exhaustion");
                Self::requeue_later(inner, command);
                return;
            }
            Err(err) => {
                error!(
                    command = %command.name(),
                    command_uid = command.command_uid(),
                    %err,
                    "error building messages"
                );
                command.cancel(true);
                return;
            }
        };

        // Register reply-matching keys, refusing to overwrite a live
        // command with the same key. A blocked broadcast retries later;
        // a blocked unicast command is cancelled.
        {
            let mut running = inner.running.lock().expect("running commands lock");
            running.retain(|_, cmd| !cmd.status().is_done());

            let keys: Vec<u64> = messages
                .iter()
                .map(|m| command_key(m.positioner_id, m.command_id, m.uid))
                .collect();

            if keys.iter().any(|key| running.contains_key(key)) {
                drop(running);
                if command.is_broadcast() {
                    debug!(
                        command = %command.name(),
                        command_uid = command.command_uid(),
                        "reply keys are busy; requeueing broadcast"
                    );
                    Self::requeue_later(inner, command);
                } else {
                    error!(
                        command = %command.name(),
                        command_uid = command.command_uid(),
                        "another command with the same reply keys is running"
                    );
                    command.cancel(false);
                }
                return;
            }

            for key in keys {
                running.insert(key, command.clone());
            }
        }

        let is_multibus = inner.multibus || inner.interfaces.len() > 1;

        for mut message in messages {
            if command.status().failed() {
                debug!(
                    command = %command.name(),
                    command_uid = command.command_uid(),
                    "not sending more messages for a failed command"
                );
                break;
            }

            let targets: Vec<Arc<BusInterface>> = if message.positioner_id != 0 && is_multibus {
                let route = inner
                    .routes
                    .lock()
                    .expect("route map lock")
                    .get(&message.positioner_id)
                    .copied();
                match route {
                    Some((index, bus)) if index < inner.interfaces.len() => {
                        message.bus = bus;
                        vec![Arc::clone(&inner.interfaces[index])]
                    }
                    // Unknown target: send everywhere.
                    _ => inner.interfaces.iter().cloned().collect(),
                }
            } else {
                inner.interfaces.iter().cloned().collect()
            };

            debug!(
                command = %command.name(),
                command_uid = command.command_uid(),
                positioner_id = message.positioner_id,
                uid = message.uid,
                data = %hex::encode(&message.data),
                "sending message"
            );

            for bus in targets {
                if let Err(err) = bus.send(&message).await {
                    error!(
                        command = %command.name(),
                        command_uid = command.command_uid(),
                        channel = %bus.channel(),
                        %err,
                        "error sending message"
                    );
                    command.cancel(true);
                    return;
                }
            }
        }

        command.mark_running();
    }

    fn requeue_later(inner: &Arc<NetworkInner>, command: Command) {
        let tx = inner.command_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REQUEUE_DELAY).await;
            let _ = tx.send(command);
        });
    }
}

/// The single notifier listener that matches replies to commands.
struct ReplyRouter {
    network: Weak<NetworkInner>,
}

#[async_trait]
impl MessageListener for ReplyRouter {
    async fn on_message(&self, message: Message) {
        let Some(inner) = self.network.upgrade() else {
            return;
        };

        // Gateway control-plane traffic never matches a command.
        if message.is_device_frame() {
            if let Ok(line) = std::str::from_utf8(&message.data) {
                inner
                    .device_status
                    .lock()
                    .expect("device status lock")
                    .handle_line(message.interface.unwrap_or(0), line);
            }
            return;
        }

        if message.command_id == 0 {
            warn!(
                arbitration_id = message.arbitration_id,
                "invalid reply with command_id=0; ignoring"
            );
            return;
        }

        if message.command_id == CommandId::CollisionDetected.as_u16() {
            let handler = inner
                .collision_handler
                .lock()
                .expect("collision handler lock")
                .clone();
            if let Some(handler) = handler {
                handler(message.positioner_id);
            } else {
                error!(
                    positioner_id = message.positioner_id,
                    "collision detected but no handler is installed"
                );
            }
            return;
        }

        {
            let mut running = inner.running.lock().expect("running commands lock");
            running.retain(|_, cmd| !cmd.status().is_done());

            let unicast = command_key(message.positioner_id, message.command_id, message.uid);
            let broadcast = command_key(0, message.command_id, message.uid);

            let command = running.get(&unicast).or_else(|| running.get(&broadcast));

            match command {
                Some(command) => {
                    let command = command.clone();
                    drop(running);
                    command.process_reply(&message);
                }
                None => {
                    debug!(
                        command_id = message.command_id,
                        positioner_id = message.positioner_id,
                        uid = message.uid,
                        "no matching running command for reply"
                    );
                }
            }
        }
    }
}

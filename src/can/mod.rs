//! CAN transport: frame types, bus variants, fan-out, and the network
//! manager that owns the command queue and reply matching.

pub mod bus;
pub mod cannet;
pub mod message;
pub mod network;
pub mod notifier;
pub mod slcan;
pub mod socketcan_bus;
pub mod virtual_bus;

pub use bus::{Bus, BusInterface};
pub use message::{Message, Reply};
pub use network::{command_key, CanNetwork};
pub use notifier::{MessageListener, Notifier};
pub use virtual_bus::VirtualBus;

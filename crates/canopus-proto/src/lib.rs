//! Wire protocol for the canopus fiber positioner controller.
//!
//! This crate is the pure, I/O-free layer shared by the controller and its
//! test tooling: the 29-bit extended arbitration identifier codec, the
//! closed set of firmware command codes with their capability descriptors,
//! the status maskbits reported by positioners, and the payload codecs
//! that translate between engineering units (degrees, seconds, RPM) and
//! the little-endian fields the firmware speaks.

pub mod command_id;
pub mod data;
pub mod ident;
pub mod maskbits;
pub mod registry;

pub use command_id::{CommandId, UnknownCommandId};
pub use data::PayloadError;
pub use ident::{decode_identifier, encode_identifier, Identifier, IdentifierError};
pub use maskbits::{
    BootloaderStatus, CommandStatus, FpsStatus, PositionerStatus, ResponseCode,
};
pub use registry::{descriptor, CommandDescriptor};

//! CAN frame types.

use canopus_proto::{
    decode_identifier, encode_identifier, CommandId, IdentifierError, ResponseCode,
};

/// An extended CAN frame, tagged with its decoded identifier fields and,
/// on receive, with the interface and gateway bus it came in on.
#[derive(Debug, Clone)]
pub struct Message {
    pub arbitration_id: u32,
    pub data: Vec<u8>,
    pub positioner_id: u16,
    pub command_id: u16,
    pub uid: u8,
    pub response_code: u8,
    /// Index of the owning interface, set on receive.
    pub interface: Option<usize>,
    /// Gateway bus number, set when the interface drives several buses.
    pub bus: Option<u8>,
}

impl Message {
    /// Builds an outbound message. The arbitration id is derived from the
    /// command, target and UID, with response code 0.
    pub fn new(
        command_id: CommandId,
        positioner_id: u16,
        uid: u8,
        data: Vec<u8>,
        uid_bits: u32,
    ) -> Result<Self, IdentifierError> {
        let arbitration_id =
            encode_identifier(positioner_id, command_id.as_u16(), uid, 0, uid_bits)?;

        Ok(Self {
            arbitration_id,
            data,
            positioner_id,
            command_id: command_id.as_u16(),
            uid,
            response_code: 0,
            interface: None,
            bus: None,
        })
    }

    /// Builds an inbound message from a raw frame, decoding the
    /// identifier fields.
    pub fn from_frame(
        arbitration_id: u32,
        data: Vec<u8>,
        uid_bits: u32,
        interface: Option<usize>,
        bus: Option<u8>,
    ) -> Result<Self, IdentifierError> {
        let ident = decode_identifier(arbitration_id, uid_bits)?;

        Ok(Self {
            arbitration_id,
            data,
            positioner_id: ident.positioner_id,
            command_id: ident.command_id,
            uid: ident.uid,
            response_code: ident.response_code,
            interface,
            bus,
        })
    }

    /// An out-of-band gateway frame rather than a positioner reply.
    pub fn is_device_frame(&self) -> bool {
        self.arbitration_id == 0
    }
}

/// A decoded reply from a positioner.
#[derive(Debug, Clone)]
pub struct Reply {
    pub positioner_id: u16,
    pub command_id: CommandId,
    pub uid: u8,
    pub response_code: ResponseCode,
    pub data: Vec<u8>,
    /// Interface and gateway bus the reply arrived on.
    pub interface: Option<usize>,
    pub bus: Option<u8>,
}

impl Reply {
    /// Decodes a received message into a reply. Fails on unknown command
    /// codes; the response code nibble is always valid.
    pub fn from_message(message: &Message) -> Result<Self, crate::error::CommandError> {
        let command_id = CommandId::try_from(message.command_id)?;
        let response_code = ResponseCode::try_from(message.response_code & 0x0f)
            .expect("a nibble is always a valid response code");

        Ok(Self {
            positioner_id: message.positioner_id,
            command_id,
            uid: message.uid,
            response_code,
            data: message.data.clone(),
            interface: message.interface,
            bus: message.bus,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopus_proto::ident::DEFAULT_UID_BITS;

    #[test]
    fn outbound_identifier_is_consistent() {
        let msg = Message::new(CommandId::GetStatus, 42, 3, vec![], DEFAULT_UID_BITS).unwrap();
        let decoded =
            Message::from_frame(msg.arbitration_id, vec![], DEFAULT_UID_BITS, None, None).unwrap();

        assert_eq!(decoded.positioner_id, 42);
        assert_eq!(decoded.command_id, CommandId::GetStatus.as_u16());
        assert_eq!(decoded.uid, 3);
        assert_eq!(decoded.response_code, 0);
    }

    #[test]
    fn reply_decodes_response_code() {
        let aid = canopus_proto::encode_identifier(
            17,
            CommandId::GoToAbsolutePosition.as_u16(),
            0,
            8,
            DEFAULT_UID_BITS,
        )
        .unwrap();
        let msg = Message::from_frame(aid, vec![], DEFAULT_UID_BITS, Some(0), None).unwrap();
        let reply = Reply::from_message(&msg).unwrap();

        assert_eq!(reply.positioner_id, 17);
        assert_eq!(reply.command_id, CommandId::GoToAbsolutePosition);
        assert_eq!(reply.response_code, ResponseCode::CollisionDetected);
    }
}

//! Arbitration identifier codec.
//!
//! Positioner firmware uses 29-bit extended CAN frames. The identifier
//! packs four fields most-significant-first:
//!
//! ```text
//! | positioner_id | command_id (10) | uid (B) | response_code (4) |
//! ```
//!
//! where `B` is the configured UID width (6 bits by default) and the
//! positioner field gets whatever remains of the 29 bits. Outbound
//! messages always carry `response_code = 0`; replies echo the command
//! and UID fields and set the response code.

use thiserror::Error;

/// Total width of an extended CAN identifier.
pub const ARBITRATION_ID_BITS: u32 = 29;

/// Width of the command identifier field.
pub const COMMAND_ID_BITS: u32 = 10;

/// Width of the response code field.
pub const RESPONSE_CODE_BITS: u32 = 4;

/// Default width of the per-message UID field.
pub const DEFAULT_UID_BITS: u32 = 6;

/// Widest UID field that still leaves room for a positioner id.
pub const MAX_UID_BITS: u32 = ARBITRATION_ID_BITS - COMMAND_ID_BITS - RESPONSE_CODE_BITS - 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("uid_bits={0} does not leave room for a positioner id")]
    InvalidUidBits(u32),

    #[error("{field}={value} does not fit in {bits} bits")]
    FieldTooWide {
        field: &'static str,
        value: u32,
        bits: u32,
    },
}

/// The four fields packed into an arbitration identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identifier {
    pub positioner_id: u16,
    pub command_id: u16,
    pub uid: u8,
    pub response_code: u8,
}

/// Number of bits available for the positioner id given a UID width.
pub const fn positioner_id_bits(uid_bits: u32) -> u32 {
    ARBITRATION_ID_BITS - COMMAND_ID_BITS - RESPONSE_CODE_BITS - uid_bits
}

fn check_width(field: &'static str, value: u32, bits: u32) -> Result<(), IdentifierError> {
    if value >= (1 << bits) {
        return Err(IdentifierError::FieldTooWide { field, value, bits });
    }
    Ok(())
}

/// Packs the four identifier fields into a 29-bit arbitration id.
pub fn encode_identifier(
    positioner_id: u16,
    command_id: u16,
    uid: u8,
    response_code: u8,
    uid_bits: u32,
) -> Result<u32, IdentifierError> {
    if uid_bits == 0 || uid_bits > MAX_UID_BITS {
        return Err(IdentifierError::InvalidUidBits(uid_bits));
    }

    check_width("positioner_id", positioner_id as u32, positioner_id_bits(uid_bits))?;
    check_width("command_id", command_id as u32, COMMAND_ID_BITS)?;
    check_width("uid", uid as u32, uid_bits)?;
    check_width("response_code", response_code as u32, RESPONSE_CODE_BITS)?;

    let mut id = positioner_id as u32;
    id = (id << COMMAND_ID_BITS) | command_id as u32;
    id = (id << uid_bits) | uid as u32;
    id = (id << RESPONSE_CODE_BITS) | response_code as u32;

    Ok(id)
}

/// Unpacks an arbitration id into its four fields. Exact inverse of
/// [`encode_identifier`] for any id the encoder can produce.
pub fn decode_identifier(arbitration_id: u32, uid_bits: u32) -> Result<Identifier, IdentifierError> {
    if uid_bits == 0 || uid_bits > MAX_UID_BITS {
        return Err(IdentifierError::InvalidUidBits(uid_bits));
    }

    let response_code = (arbitration_id & ((1 << RESPONSE_CODE_BITS) - 1)) as u8;
    let rest = arbitration_id >> RESPONSE_CODE_BITS;

    let uid = (rest & ((1 << uid_bits) - 1)) as u8;
    let rest = rest >> uid_bits;

    let command_id = (rest & ((1 << COMMAND_ID_BITS) - 1)) as u16;
    let positioner_id = (rest >> COMMAND_ID_BITS) as u16;

    Ok(Identifier {
        positioner_id,
        command_id,
        uid,
        response_code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn roundtrip_literal() {
        let aid = encode_identifier(123, 30, 5, 0, DEFAULT_UID_BITS).unwrap();
        let ident = decode_identifier(aid, DEFAULT_UID_BITS).unwrap();

        assert_eq!(ident.positioner_id, 123);
        assert_eq!(ident.command_id, 30);
        assert_eq!(ident.uid, 5);
        assert_eq!(ident.response_code, 0);
    }

    #[test]
    fn default_layout_fits_an_array() {
        // 500+ positioners must be addressable with the default UID width.
        assert!(1u32 << positioner_id_bits(DEFAULT_UID_BITS) >= 500);
    }

    #[test]
    fn rejects_wide_uid() {
        let err = encode_identifier(1, 3, 64, 0, DEFAULT_UID_BITS).unwrap_err();
        assert_eq!(
            err,
            IdentifierError::FieldTooWide {
                field: "uid",
                value: 64,
                bits: 6
            }
        );
    }

    #[test]
    fn rejects_invalid_uid_bits() {
        assert!(encode_identifier(1, 3, 0, 0, 0).is_err());
        assert!(encode_identifier(1, 3, 0, 0, MAX_UID_BITS + 1).is_err());
        assert!(decode_identifier(0, 0).is_err());
    }

    proptest! {
        #[test]
        fn roundtrip_exhaustive(
            pid in 0u16..512,
            cmd in 0u16..1024,
            uid in 0u8..64,
            rc in 0u8..16,
        ) {
            let aid = encode_identifier(pid, cmd, uid, rc, DEFAULT_UID_BITS).unwrap();
            prop_assert!(aid < (1 << ARBITRATION_ID_BITS));

            let ident = decode_identifier(aid, DEFAULT_UID_BITS).unwrap();
            prop_assert_eq!(
                ident,
                Identifier { positioner_id: pid, command_id: cmd, uid, response_code: rc }
            );
        }

        #[test]
        fn roundtrip_narrow_uid(pid in 0u16..2048, uid in 0u8..16) {
            let aid = encode_identifier(pid, 32, uid, 1, 4).unwrap();
            let ident = decode_identifier(aid, 4).unwrap();
            prop_assert_eq!(ident.positioner_id, pid);
            prop_assert_eq!(ident.uid, uid);
        }
    }
}

//! Memory Card Bus Protocol Library
//!
//! This crate holds the pieces of the memory card bus protocol that carry no
//! I/O of their own:
//!
//! - **Wire constants**: select, opcode, identifier, acknowledge and
//!   terminator bytes exchanged with the host
//! - **State variants**: [`ProtocolState`], the sole externally observable
//!   progress marker of the byte-at-a-time state machine
//! - **Opcodes**: [`Command`], decoded from the byte following a card select
//! - **Hot keys**: [`PadButtons`] decoding of sniffed controller traffic and
//!   the mapping to a [`SwapRequest`]
//!
//! # Transaction shape
//!
//! Every exchange is full duplex, one response byte per command byte:
//!
//! ```text
//! host:   81  52  00  00  MSB LSB 00  00  00  00 ... 00  00
//! card:   FLG 5A  5D  00  MSB 5C  5D  MSB LSB D0 ... CHK 47
//! ```
//!
//! # Example
//!
//! ```rust
//! use mc_protocol::{Command, PadButtons, SwapRequest, OP_READ};
//!
//! assert_eq!(Command::try_from(OP_READ).unwrap(), Command::Read);
//!
//! // Start + Select + Up held, everything else released (active low)
//! let raw = !(PadButtons::START | PadButtons::SELECT | PadButtons::UP).bits();
//! assert_eq!(PadButtons::from_raw(raw).hotkey(), Some(SwapRequest::Next));
//! ```

pub mod command;
pub mod error;
pub mod pad;

pub use command::{Command, ProtocolState};
pub use error::ProtocolError;
pub use pad::{PadButtons, SwapRequest};

/// Device select byte addressing the memory card
pub const CARD_SELECT: u8 = 0x81;
/// Device select byte addressing the controller sharing the bus
pub const PAD_SELECT: u8 = 0x01;
/// Controller "read switches" opcode
pub const PAD_READ: u8 = 0x42;

/// Read sector opcode
pub const OP_READ: u8 = 0x52;
/// Write sector opcode
pub const OP_WRITE: u8 = 0x57;
/// Identify opcode
pub const OP_IDENTIFY: u8 = 0x53;

/// First card identifier byte
pub const ID1: u8 = 0x5A;
/// Second card identifier byte
pub const ID2: u8 = 0x5D;

/// First acknowledge byte
pub const ACK1: u8 = 0x5C;
/// Second acknowledge byte
pub const ACK2: u8 = 0x5D;

/// Terminator sent when the transaction checksum matched
pub const END_GOOD: u8 = 0x47;
/// Terminator sent when the received checksum did not match
pub const END_BAD_CHECKSUM: u8 = 0x4E;

/// Abort and filler sentinel
pub const SENTINEL: u8 = 0xFF;

/// Filler byte sent while the address is being received
pub const ADDRESS_FILLER: u8 = 0x00;

/// Payload returned by the identify command after the id bytes
pub const IDENTIFY_PAYLOAD: [u8; 6] = [ACK1, ACK2, 0x04, 0x00, 0x00, 0x80];

/// Seed of the transaction checksum: XOR of both address bytes
pub fn address_checksum(address: u16) -> u8 {
    let [high, low] = address.to_be_bytes();
    high ^ low
}

/// Fold payload bytes into a running transaction checksum
pub fn fold_checksum(seed: u8, payload: &[u8]) -> u8 {
    payload.iter().fold(seed, |acc, &b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_checksum() {
        assert_eq!(address_checksum(0x0005), 0x05);
        assert_eq!(address_checksum(0x0305), 0x06);
        assert_eq!(address_checksum(0xFFFF), 0x00);
    }

    #[test]
    fn test_fold_checksum() {
        assert_eq!(fold_checksum(0x05, &[0u8; 128]), 0x05);
        assert_eq!(fold_checksum(0x00, &[0x01, 0x02, 0x04]), 0x07);
    }

    #[test]
    fn test_identify_payload_starts_with_acks() {
        assert_eq!(IDENTIFY_PAYLOAD[0], ACK1);
        assert_eq!(IDENTIFY_PAYLOAD[1], ACK2);
    }
}

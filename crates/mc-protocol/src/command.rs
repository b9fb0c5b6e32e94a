//! Opcodes and protocol states
//!
//! This module provides the `Command` enum decoded from the opcode byte and
//! the `ProtocolState` enum driven by the state machine.

use crate::error::ProtocolError;
use crate::{OP_IDENTIFY, OP_READ, OP_WRITE};

/// Memory card command selected by the opcode byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Command {
    /// Read one sector
    Read,
    /// Write one sector
    Write,
    /// Report the card identifier payload
    Identify,
}

impl Command {
    /// Opcode byte for this command
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Read => OP_READ,
            Self::Write => OP_WRITE,
            Self::Identify => OP_IDENTIFY,
        }
    }

    /// Whether the command is followed by a sector address
    pub fn takes_address(&self) -> bool {
        matches!(self, Self::Read | Self::Write)
    }

    /// State the machine enters once the command is ready to execute
    pub fn execute_state(&self) -> ProtocolState {
        match self {
            Self::Read => ProtocolState::ExecutingRead,
            Self::Write => ProtocolState::ExecutingWrite,
            Self::Identify => ProtocolState::ExecutingIdentify,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            OP_READ => Ok(Self::Read),
            OP_WRITE => Ok(Self::Write),
            OP_IDENTIFY => Ok(Self::Identify),
            _ => {
                tracing::trace!("Unknown opcode {:02X}", value);
                Err(ProtocolError::UnknownOpcode(value))
            }
        }
    }
}

/// State of the byte-at-a-time protocol machine
///
/// Names the handler for the *next* command byte. Exactly one value is live
/// per machine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProtocolState {
    /// Waiting for a device select byte
    #[default]
    Idle,
    /// Card selected, waiting for the opcode
    ReceivingCommand,
    /// Sending the second identifier byte
    SendingId,
    /// Receiving the two address bytes (after one filler)
    ReceivingAddress,
    /// Streaming a sector to the host
    ExecutingRead,
    /// Receiving a sector from the host
    ExecutingWrite,
    /// Streaming the identify payload
    ExecutingIdentify,
    /// Sending the abort sentinel after an invalid address
    Aborting,
    /// Sending the transaction terminator
    Ending,
    /// Controller selected, waiting for its opcode
    PadPassthrough,
    /// Listening to the controller's switch report
    PadSniffing,
}

impl ProtocolState {
    /// Human-readable name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ReceivingCommand => "receiving-command",
            Self::SendingId => "sending-id",
            Self::ReceivingAddress => "receiving-address",
            Self::ExecutingRead => "executing-read",
            Self::ExecutingWrite => "executing-write",
            Self::ExecutingIdentify => "executing-identify",
            Self::Aborting => "aborting",
            Self::Ending => "ending",
            Self::PadPassthrough => "pad-passthrough",
            Self::PadSniffing => "pad-sniffing",
        }
    }

    /// Returns true while the bus belongs to the controller
    ///
    /// The card must stay electrically silent in these states.
    pub fn is_pad_traffic(&self) -> bool {
        matches!(self, Self::PadPassthrough | Self::PadSniffing)
    }
}

//! Error types for memory card protocol decoding

use thiserror::Error;

/// Errors that can occur while decoding protocol values
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Byte following a card select is not a known opcode
    #[error("unknown opcode: 0x{0:02X}")]
    UnknownOpcode(u8),

    /// Stored request discriminant does not name a request
    #[error("invalid swap request discriminant: {0}")]
    InvalidRequest(u8),
}

//! Error types for the emulation engine

use mc_card::CardError;
use thiserror::Error;

use crate::channel::BusError;

/// Errors that can occur while running the emulator
#[derive(Debug, Error)]
pub enum EngineError {
    /// Storage medium or card image error
    #[error("storage error: {0}")]
    Storage(#[from] CardError),

    /// Byte channel failure
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// The background context stopped consuming the sync queue
    #[error("sync queue closed")]
    SyncClosed,

    /// Configuration file could not be parsed
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Configuration file could not be read
    #[error("config I/O error: {0}")]
    ConfigIo(std::io::Error),

    /// A context terminated abnormally
    #[error("task failed: {0}")]
    Task(String),
}

impl EngineError {
    /// Numeric code for the status indicator (blink count)
    pub fn code(&self) -> u8 {
        match self {
            Self::Storage(e) => e.code(),
            Self::Bus(_) | Self::SyncClosed => 8,
            Self::Config(_) | Self::ConfigIo(_) => 9,
            Self::Task(_) => 10,
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

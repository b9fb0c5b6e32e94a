//! Error types for the card image store

use thiserror::Error;

/// Errors that can occur while loading, validating or persisting card images
#[derive(Debug, Error)]
pub enum CardError {
    /// I/O error on the storage medium
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image is not exactly one card long
    #[error("invalid image size: expected {expected} bytes, got {actual}")]
    InvalidSize { expected: usize, actual: usize },

    /// Image does not start with the card magic
    #[error("invalid card header")]
    BadHeader,

    /// Named card does not exist on the medium
    #[error("card not found: {0}")]
    NotFound(String),

    /// Named card already exists on the medium
    #[error("card already exists: {0}")]
    AlreadyExists(String),

    /// Card name is empty, too long or contains path characters
    #[error("invalid card name: {0:?}")]
    InvalidName(String),

    /// Sector index beyond the end of the card
    #[error("sector out of range: {0}")]
    SectorOutOfRange(u16),

    /// No further card in the requested direction
    #[error("no more cards in the catalog")]
    CatalogExhausted,

    /// Every allocatable card name is taken
    #[error("catalog is full")]
    CatalogFull,
}

impl CardError {
    /// Numeric code for the status indicator (blink count)
    pub fn code(&self) -> u8 {
        match self {
            Self::Io(_) => 2,
            Self::InvalidSize { .. } | Self::BadHeader => 3,
            Self::NotFound(_) => 4,
            Self::AlreadyExists(_) | Self::InvalidName(_) => 5,
            Self::SectorOutOfRange(_) => 6,
            Self::CatalogExhausted | Self::CatalogFull => 7,
        }
    }
}

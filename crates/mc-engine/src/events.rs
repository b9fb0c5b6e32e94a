//! Status events
//!
//! Everything the status output collaborator shows (sync indicator, card
//! changes, error blinks, directory view) is emitted as a [`StatusEvent`] on
//! a broadcast channel. Sends are fire-and-forget: no subscriber is required
//! and nothing the subscribers do feeds back into the engine.

use mc_card::{CardName, CardSummary, DirectoryEntry};
use mc_protocol::SwapRequest;

/// Why a swap or catalog request was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapRejectReason {
    /// Arrived within the debounce interval of the previous request
    Debounced,
    /// No card further in the requested direction
    CatalogExhausted,
    /// No free `CARDnnn.MCR` name left
    CatalogFull,
    /// Target image failed the format check
    InvalidImage,
    /// Storage medium error while resolving the target
    Storage,
}

/// Events emitted by the background context
#[derive(Debug, Clone)]
pub enum StatusEvent {
    // -------------------------------------------------------------------------
    // Sync
    // -------------------------------------------------------------------------
    /// Dirty sectors are being written to the medium (true) or all caught up
    SyncActive(bool),

    /// A dirty sector could not be persisted
    SectorPersistFailed {
        card: CardName,
        sector: u16,
        /// Whether the sector will be retried
        retrying: bool,
        message: String,
    },

    // -------------------------------------------------------------------------
    // Swap
    // -------------------------------------------------------------------------
    /// The live card image was replaced
    CardChanged {
        card: CardName,
        summary: CardSummary,
    },

    /// A new blank card was created and is about to be inserted
    NewCardCreated(CardName),

    /// A request was dropped without changing the live card
    SwapRejected {
        request: SwapRequest,
        reason: SwapRejectReason,
    },

    // -------------------------------------------------------------------------
    // Display
    // -------------------------------------------------------------------------
    /// One directory frame of the live card, selected by the catalog cursor
    CatalogEntry {
        card: CardName,
        entry: DirectoryEntry,
        /// Title name for the first block of a save, if known
        title: Option<String>,
    },

    /// Error code for the indicator blink
    Error { code: u8, message: String },
}

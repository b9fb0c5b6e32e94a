//! Controller switch decoding and operator hot keys
//!
//! The card shares its bus with the controller. While the controller is
//! addressed the card listens to the switch report and maps a handful of
//! Start+Select chords to [`SwapRequest`]s.

use std::ops::BitOr;

use crate::error::ProtocolError;

/// Set of pressed controller buttons
///
/// The wire format is active low: a cleared bit means the button is held.
/// `PadButtons` stores the inverse, so a set bit means pressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PadButtons(u16);

impl PadButtons {
    pub const SELECT: Self = Self(1 << 0);
    pub const L3: Self = Self(1 << 1);
    pub const R3: Self = Self(1 << 2);
    pub const START: Self = Self(1 << 3);
    pub const UP: Self = Self(1 << 4);
    pub const RIGHT: Self = Self(1 << 5);
    pub const DOWN: Self = Self(1 << 6);
    pub const LEFT: Self = Self(1 << 7);
    pub const L2: Self = Self(1 << 8);
    pub const R2: Self = Self(1 << 9);
    pub const L1: Self = Self(1 << 10);
    pub const R1: Self = Self(1 << 11);
    pub const TRIANGLE: Self = Self(1 << 12);
    pub const CIRCLE: Self = Self(1 << 13);
    pub const CROSS: Self = Self(1 << 14);
    pub const SQUARE: Self = Self(1 << 15);

    /// Decode the active-low switch status sent by the controller
    pub fn from_raw(switch_status: u16) -> Self {
        Self(!switch_status)
    }

    /// Pressed-button mask (set bit = pressed)
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Returns true if every button in `other` is pressed
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if no button is pressed
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Map an exact hot-key chord to a request
    ///
    /// Only the chord itself may be held; any extra button cancels the match.
    pub fn hotkey(&self) -> Option<SwapRequest> {
        let chord = Self::START | Self::SELECT;
        HOTKEYS
            .iter()
            .find(|(key, _)| *self == (chord | *key))
            .map(|(_, req)| *req)
    }
}

impl BitOr for PadButtons {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

const HOTKEYS: [(PadButtons, SwapRequest); 5] = [
    (PadButtons::UP, SwapRequest::Next),
    (PadButtons::DOWN, SwapRequest::Previous),
    (PadButtons::TRIANGLE, SwapRequest::New),
    (PadButtons::LEFT, SwapRequest::ShowPreviousCatalogEntry),
    (PadButtons::RIGHT, SwapRequest::ShowNextCatalogEntry),
];

/// Operator request raised by a hot key
///
/// At most one request is in flight. "No request" is expressed as
/// `Option<SwapRequest>::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum SwapRequest {
    /// Replace the card with the next one in the catalog
    Next = 1,
    /// Replace the card with the previous one in the catalog
    Previous = 2,
    /// Create a blank card and switch to it
    New = 3,
    /// Show the next directory entry of the live card
    ShowNextCatalogEntry = 4,
    /// Show the previous directory entry of the live card
    ShowPreviousCatalogEntry = 5,
}

impl SwapRequest {
    /// Returns true if the request only walks the directory cursor
    pub fn is_catalog_walk(&self) -> bool {
        matches!(
            self,
            Self::ShowNextCatalogEntry | Self::ShowPreviousCatalogEntry
        )
    }

    /// Compact discriminant for lock-free storage (never zero)
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for SwapRequest {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Next),
            2 => Ok(Self::Previous),
            3 => Ok(Self::New),
            4 => Ok(Self::ShowNextCatalogEntry),
            5 => Ok(Self::ShowPreviousCatalogEntry),
            _ => Err(ProtocolError::InvalidRequest(value)),
        }
    }
}

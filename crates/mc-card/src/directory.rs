//! Save directory decoding
//!
//! Sectors 1..=15 each describe one 8 KiB block of the card. Only the first
//! byte (allocation state) and, for the first block of a save, the region and
//! product code are needed for the status display.

use serde::{Deserialize, Serialize};

use crate::image::Sector;
use crate::DIRECTORY_SLOTS;

const STATE_FIRST: u8 = 0x51;
const STATE_MIDDLE: u8 = 0x52;
const STATE_LAST: u8 = 0x53;

const REGION_OFFSET: usize = 0x0A;
const PRODUCT_CODE: std::ops::Range<usize> = 0x0C..0x16;

/// Sales region encoded in the save's file name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    Japan,
    America,
    Europe,
    Unknown,
}

impl Region {
    fn decode(code: [u8; 2]) -> Self {
        match &code {
            b"BI" => Self::Japan,
            b"BA" => Self::America,
            b"BE" => Self::Europe,
            _ => Self::Unknown,
        }
    }

    /// Single-letter region tag
    pub fn letter(&self) -> char {
        match self {
            Self::Japan => 'J',
            Self::America => 'U',
            Self::Europe => 'E',
            Self::Unknown => '?',
        }
    }
}

/// Allocation state of one directory block
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    /// Unused block
    Free,
    /// First block of a save
    First {
        region: Region,
        /// Product code such as `SLUS-00594`
        product_code: String,
    },
    /// Continuation block
    Middle,
    /// Final block of a multi-block save
    Last,
}

impl BlockKind {
    /// Returns true if the block holds save data
    pub fn is_used(&self) -> bool {
        !matches!(self, Self::Free)
    }
}

/// One decoded directory frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// Directory slot (0..15)
    pub slot: usize,
    /// Allocation state
    pub kind: BlockKind,
}

impl DirectoryEntry {
    /// Decode a directory frame
    pub fn decode(slot: usize, frame: &Sector) -> Self {
        let kind = match frame[0] {
            STATE_FIRST => BlockKind::First {
                region: Region::decode([frame[REGION_OFFSET], frame[REGION_OFFSET + 1]]),
                product_code: frame[PRODUCT_CODE]
                    .iter()
                    .take_while(|b| **b != 0)
                    .map(|&b| b as char)
                    .collect(),
            },
            STATE_MIDDLE => BlockKind::Middle,
            STATE_LAST => BlockKind::Last,
            _ => BlockKind::Free,
        };
        Self { slot, kind }
    }

    /// Product code of the save starting in this block
    pub fn product_code(&self) -> Option<&str> {
        match &self.kind {
            BlockKind::First { product_code, .. } => Some(product_code),
            _ => None,
        }
    }
}

/// How full the card is, as shown on the status display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capacity {
    /// Ten or more free blocks
    Plenty,
    /// Four to nine free blocks
    Moderate,
    /// One to three free blocks
    Low,
    /// No free blocks
    Full,
}

/// Block usage across the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardSummary {
    pub used_blocks: usize,
    pub free_blocks: usize,
}

impl CardSummary {
    /// Tally decoded entries
    pub fn from_entries(entries: impl IntoIterator<Item = DirectoryEntry>) -> Self {
        let used_blocks = entries.into_iter().filter(|e| e.kind.is_used()).count();
        Self {
            used_blocks,
            free_blocks: DIRECTORY_SLOTS.saturating_sub(used_blocks),
        }
    }

    pub fn capacity(&self) -> Capacity {
        match self.free_blocks {
            10.. => Capacity::Plenty,
            4..=9 => Capacity::Moderate,
            1..=3 => Capacity::Low,
            0 => Capacity::Full,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SECTOR_SIZE;

    fn first_frame(region: &[u8; 2], code: &[u8]) -> Sector {
        let mut frame = [0u8; SECTOR_SIZE];
        frame[0] = STATE_FIRST;
        frame[REGION_OFFSET..REGION_OFFSET + 2].copy_from_slice(region);
        frame[PRODUCT_CODE.start..PRODUCT_CODE.start + code.len()].copy_from_slice(code);
        frame
    }

    #[test]
    fn test_decode_first_block() {
        let entry = DirectoryEntry::decode(2, &first_frame(b"BA", b"SLUS-00594"));
        assert_eq!(entry.slot, 2);
        assert_eq!(
            entry.kind,
            BlockKind::First {
                region: Region::America,
                product_code: "SLUS-00594".to_string()
            }
        );
        assert_eq!(entry.product_code(), Some("SLUS-00594"));
    }

    #[test]
    fn test_decode_regions() {
        for (code, region) in [
            (b"BI", Region::Japan),
            (b"BA", Region::America),
            (b"BE", Region::Europe),
            (b"XX", Region::Unknown),
        ] {
            let entry = DirectoryEntry::decode(0, &first_frame(code, b"SCPS-10001"));
            assert!(matches!(entry.kind, BlockKind::First { region: r, .. } if r == region));
        }
        assert_eq!(Region::Japan.letter(), 'J');
    }

    #[test]
    fn test_decode_continuation_and_free() {
        let mut frame = [0u8; SECTOR_SIZE];
        frame[0] = STATE_MIDDLE;
        assert_eq!(DirectoryEntry::decode(0, &frame).kind, BlockKind::Middle);
        frame[0] = STATE_LAST;
        assert_eq!(DirectoryEntry::decode(0, &frame).kind, BlockKind::Last);
        frame[0] = 0xA0;
        assert_eq!(DirectoryEntry::decode(0, &frame).kind, BlockKind::Free);
        assert_eq!(DirectoryEntry::decode(0, &frame).product_code(), None);
    }

    #[test]
    fn test_summary_capacity() {
        let used = |n: usize| {
            CardSummary::from_entries((0..n).map(|slot| DirectoryEntry {
                slot,
                kind: BlockKind::Middle,
            }))
        };
        assert_eq!(used(0).capacity(), Capacity::Plenty);
        assert_eq!(used(5).free_blocks, 10);
        assert_eq!(used(6).capacity(), Capacity::Moderate);
        assert_eq!(used(12).capacity(), Capacity::Low);
        assert_eq!(used(15).capacity(), Capacity::Full);
    }

    proptest::proptest! {
        #[test]
        fn prop_only_allocation_states_are_used(
            bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), SECTOR_SIZE)
        ) {
            let mut frame = [0u8; SECTOR_SIZE];
            frame.copy_from_slice(&bytes);
            let entry = DirectoryEntry::decode(0, &frame);
            let allocated = (STATE_FIRST..=STATE_LAST).contains(&frame[0]);
            proptest::prop_assert_eq!(entry.kind.is_used(), allocated);
        }
    }
}

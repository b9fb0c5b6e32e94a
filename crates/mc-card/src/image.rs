//! In-memory card image
//!
//! A `CardImage` is the live copy of one card: 1024 sectors of 128 bytes,
//! the flag byte reported on select, and a dirty bit per sector. Sector
//! validity is purely range based; content is never inspected by the
//! protocol.

use mc_protocol::fold_checksum;

use crate::directory::{CardSummary, DirectoryEntry};
use crate::error::CardError;
use crate::{
    CARD_SIZE, DIRECTORY_SLOTS, FLAG_NOT_SEEN, FLAG_SEEN, SECTOR_COUNT, SECTOR_SIZE,
    WRITE_TEST_SECTOR,
};

/// One sector payload
pub type Sector = [u8; SECTOR_SIZE];

/// Magic at the start of sector 0
const HEADER_MAGIC: &[u8; 2] = b"MC";

/// Directory frame status of an unused block
const FRAME_FREE: u8 = 0xA0;

/// Broken-sector list frames follow the directory
const BROKEN_LIST: std::ops::RangeInclusive<u16> = 16..=35;

/// Live card contents with dirty tracking
#[derive(Clone)]
pub struct CardImage {
    sectors: Box<[Sector]>,
    dirty: Vec<bool>,
    flag: u8,
}

impl CardImage {
    /// Load an image from raw bytes after a format check
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CardError> {
        Self::validate(bytes)?;

        let sectors = bytes
            .chunks_exact(SECTOR_SIZE)
            .map(|chunk| {
                let mut sector = [0u8; SECTOR_SIZE];
                sector.copy_from_slice(chunk);
                sector
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            sectors,
            dirty: vec![false; SECTOR_COUNT as usize],
            flag: FLAG_NOT_SEEN,
        })
    }

    /// Check that `bytes` is a loadable card image
    pub fn validate(bytes: &[u8]) -> Result<(), CardError> {
        if bytes.len() != CARD_SIZE {
            return Err(CardError::InvalidSize {
                expected: CARD_SIZE,
                actual: bytes.len(),
            });
        }
        if !bytes.starts_with(HEADER_MAGIC) {
            return Err(CardError::BadHeader);
        }
        Ok(())
    }

    /// Create a freshly formatted card
    pub fn blank() -> Self {
        let mut sectors = vec![[0u8; SECTOR_SIZE]; SECTOR_COUNT as usize].into_boxed_slice();

        sectors[0][..2].copy_from_slice(HEADER_MAGIC);
        seal_frame(&mut sectors[0]);

        for frame in sectors.iter_mut().skip(1).take(DIRECTORY_SLOTS) {
            frame[0] = FRAME_FREE;
            frame[8..10].copy_from_slice(&[0xFF, 0xFF]);
            seal_frame(frame);
        }

        for index in BROKEN_LIST {
            let frame = &mut sectors[index as usize];
            frame[..4].copy_from_slice(&[0xFF; 4]);
            frame[8..10].copy_from_slice(&[0xFF, 0xFF]);
            seal_frame(frame);
        }

        sectors[WRITE_TEST_SECTOR as usize] = sectors[0];

        Self {
            sectors,
            dirty: vec![false; SECTOR_COUNT as usize],
            flag: FLAG_NOT_SEEN,
        }
    }

    /// Serialize the whole image
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CARD_SIZE);
        for sector in self.sectors.iter() {
            out.extend_from_slice(sector);
        }
        out
    }

    /// Number of sectors on the card
    pub fn sector_count(&self) -> u16 {
        SECTOR_COUNT
    }

    /// Returns true if `index` addresses a sector on this card
    pub fn is_valid_sector(&self, index: u16) -> bool {
        index < self.sector_count()
    }

    /// Borrow a sector
    pub fn sector(&self, index: u16) -> Option<&Sector> {
        self.sectors.get(index as usize)
    }

    /// Mutably borrow a sector
    pub fn sector_mut(&mut self, index: u16) -> Option<&mut Sector> {
        self.sectors.get_mut(index as usize)
    }

    /// Flag byte sent right after the card is selected
    pub fn flag_byte(&self) -> u8 {
        self.flag
    }

    /// Record that the host completed a write since insertion
    pub fn reset_seen_flag(&mut self) {
        self.flag = FLAG_SEEN;
    }

    /// Mark a sector as written but not yet persisted
    pub fn mark_dirty(&mut self, index: u16) -> Result<(), CardError> {
        let slot = self
            .dirty
            .get_mut(index as usize)
            .ok_or(CardError::SectorOutOfRange(index))?;
        *slot = true;
        Ok(())
    }

    /// Returns true if the sector has unpersisted changes
    pub fn is_dirty(&self, index: u16) -> bool {
        self.dirty.get(index as usize).copied().unwrap_or(false)
    }

    /// Number of sectors with unpersisted changes
    pub fn dirty_count(&self) -> usize {
        self.dirty.iter().filter(|d| **d).count()
    }

    /// Copy a sector for persistence and clear its dirty bit
    ///
    /// Clearing at snapshot time means a write landing after the copy marks
    /// the sector dirty again; that write is queued on its own.
    pub fn snapshot_sector(&mut self, index: u16) -> Result<Sector, CardError> {
        let sector = *self
            .sector(index)
            .ok_or(CardError::SectorOutOfRange(index))?;
        self.dirty[index as usize] = false;
        Ok(sector)
    }

    /// Decode one save directory frame (slot 0..15)
    pub fn directory_entry(&self, slot: usize) -> Option<DirectoryEntry> {
        if slot >= DIRECTORY_SLOTS {
            return None;
        }
        let frame = self.sector(1 + slot as u16)?;
        Some(DirectoryEntry::decode(slot, frame))
    }

    /// Summarize block usage across the directory
    pub fn summary(&self) -> CardSummary {
        CardSummary::from_entries((0..DIRECTORY_SLOTS).filter_map(|slot| self.directory_entry(slot)))
    }
}

impl Default for CardImage {
    fn default() -> Self {
        Self::blank()
    }
}

impl std::fmt::Debug for CardImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardImage")
            .field("flag", &format_args!("0x{:02X}", self.flag))
            .field("dirty", &self.dirty_count())
            .finish()
    }
}

/// Write the XOR of bytes 0..127 into byte 127
fn seal_frame(frame: &mut Sector) {
    frame[SECTOR_SIZE - 1] = fold_checksum(0, &frame[..SECTOR_SIZE - 1]);
}

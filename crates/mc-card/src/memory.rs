//! In-memory storage medium
//!
//! Holds card images in a map instead of files. Used by the simulation layer
//! and tests; it can be told to fail sector persistence to exercise the
//! runtime fault path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::CardError;
use crate::image::{CardImage, Sector};
use crate::name::CardName;
use crate::storage::StorageMedium;
use crate::{CARD_SIZE, SECTOR_COUNT, SECTOR_SIZE};

#[derive(Default)]
struct Medium {
    files: BTreeMap<CardName, Vec<u8>>,
    last_used: Option<CardName>,
}

/// Storage medium backed by memory
#[derive(Default)]
pub struct MemoryStorage {
    medium: Mutex<Medium>,
    fail_persist: AtomicBool,
    persisted: AtomicUsize,
}

impl MemoryStorage {
    /// Create an empty medium
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a medium holding blank cards with the given names
    pub fn with_blank_cards<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self, CardError> {
        let storage = Self::new();
        for name in names {
            storage.create_blank(&CardName::new(name)?)?;
        }
        Ok(storage)
    }

    /// Store raw bytes under a name, bypassing validation
    pub fn insert_raw(&self, name: &CardName, bytes: Vec<u8>) {
        self.medium.lock().files.insert(name.clone(), bytes);
    }

    /// Raw bytes of a stored card
    pub fn raw(&self, name: &CardName) -> Option<Vec<u8>> {
        self.medium.lock().files.get(name).cloned()
    }

    /// Make subsequent `persist_sector` calls fail (or succeed again)
    pub fn set_fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    /// Number of sectors persisted successfully
    pub fn persisted_count(&self) -> usize {
        self.persisted.load(Ordering::SeqCst)
    }
}

impl StorageMedium for MemoryStorage {
    fn import(&self, name: &CardName) -> Result<CardImage, CardError> {
        let medium = self.medium.lock();
        let bytes = medium
            .files
            .get(name)
            .ok_or_else(|| CardError::NotFound(name.to_string()))?;
        CardImage::from_bytes(bytes)
    }

    fn persist_sector(&self, name: &CardName, index: u16, bytes: &Sector) -> Result<(), CardError> {
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(CardError::Io(std::io::Error::other("injected write failure")));
        }
        if index >= SECTOR_COUNT {
            return Err(CardError::SectorOutOfRange(index));
        }

        let mut medium = self.medium.lock();
        let file = medium
            .files
            .get_mut(name)
            .ok_or_else(|| CardError::NotFound(name.to_string()))?;
        if file.len() != CARD_SIZE {
            return Err(CardError::InvalidSize {
                expected: CARD_SIZE,
                actual: file.len(),
            });
        }
        let start = index as usize * SECTOR_SIZE;
        file[start..start + SECTOR_SIZE].copy_from_slice(bytes);
        self.persisted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn create_blank(&self, name: &CardName) -> Result<(), CardError> {
        let mut medium = self.medium.lock();
        if medium.files.contains_key(name) {
            return Err(CardError::AlreadyExists(name.to_string()));
        }
        medium.files.insert(name.clone(), CardImage::blank().to_bytes());
        Ok(())
    }

    fn list_cards(&self) -> Result<Vec<CardName>, CardError> {
        Ok(self
            .medium
            .lock()
            .files
            .keys()
            .filter(|name| name.is_card_file())
            .cloned()
            .collect())
    }

    fn read_last_used(&self) -> Result<Option<CardName>, CardError> {
        Ok(self.medium.lock().last_used.clone())
    }

    fn write_last_used(&self, name: &CardName) -> Result<(), CardError> {
        self.medium.lock().last_used = Some(name.clone());
        Ok(())
    }
}

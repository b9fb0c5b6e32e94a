//! Storage medium collaborator
//!
//! The engine only needs a handful of named-file operations from the medium.
//! `DirectoryStorage` maps them onto a directory of `.mcr` files, which is how
//! the card files sit on the SD card's root.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::CardError;
use crate::image::{CardImage, Sector};
use crate::name::CardName;
use crate::{SECTOR_COUNT, SECTOR_SIZE};

/// File holding the name of the card that was active at power-off
pub const LAST_CARD_FILE: &str = "last_card.txt";

/// Persistence operations required from the storage medium
///
/// Implementations perform blocking I/O. Callers must not hold the
/// transaction lock across any of these calls.
pub trait StorageMedium: Send + Sync {
    /// Load and validate a card image
    fn import(&self, name: &CardName) -> Result<CardImage, CardError>;

    /// Write one sector of a card in place
    fn persist_sector(&self, name: &CardName, index: u16, bytes: &Sector) -> Result<(), CardError>;

    /// Create a freshly formatted card; fails if the name is taken
    fn create_blank(&self, name: &CardName) -> Result<(), CardError>;

    /// Names of all card files on the medium, in catalog order
    fn list_cards(&self) -> Result<Vec<CardName>, CardError>;

    /// Name of the card that was active last, if recorded
    fn read_last_used(&self) -> Result<Option<CardName>, CardError>;

    /// Record the active card
    fn write_last_used(&self, name: &CardName) -> Result<(), CardError>;

    /// Check a candidate image without loading it as the live card
    fn check(&self, name: &CardName) -> Result<(), CardError> {
        self.import(name).map(|_| ())
    }
}

/// Card files stored in one directory
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    /// Use `root` as the medium, creating it if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CardError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!("Mounted card directory {}", root.display());
        Ok(Self { root })
    }

    /// Root directory of the medium
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &CardName) -> PathBuf {
        self.root.join(name.as_str())
    }

    fn not_found(name: &CardName) -> impl FnOnce(std::io::Error) -> CardError + '_ {
        move |e| match e.kind() {
            ErrorKind::NotFound => CardError::NotFound(name.to_string()),
            _ => CardError::Io(e),
        }
    }
}

impl StorageMedium for DirectoryStorage {
    fn import(&self, name: &CardName) -> Result<CardImage, CardError> {
        let bytes = fs::read(self.path_of(name)).map_err(Self::not_found(name))?;
        let image = CardImage::from_bytes(&bytes)?;
        debug!("Imported card {}", name);
        Ok(image)
    }

    fn persist_sector(&self, name: &CardName, index: u16, bytes: &Sector) -> Result<(), CardError> {
        if index >= SECTOR_COUNT {
            return Err(CardError::SectorOutOfRange(index));
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(self.path_of(name))
            .map_err(Self::not_found(name))?;
        file.seek(SeekFrom::Start(index as u64 * SECTOR_SIZE as u64))?;
        file.write_all(bytes)?;
        file.sync_data()?;
        Ok(())
    }

    fn create_blank(&self, name: &CardName) -> Result<(), CardError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path_of(name))
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => CardError::AlreadyExists(name.to_string()),
                _ => CardError::Io(e),
            })?;
        file.write_all(&CardImage::blank().to_bytes())?;
        file.sync_all()?;
        info!("Created blank card {}", name);
        Ok(())
    }

    fn list_cards(&self) -> Result<Vec<CardName>, CardError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if let Ok(name) = CardName::new(file_name) {
                if name.is_card_file() {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_last_used(&self) -> Result<Option<CardName>, CardError> {
        match fs::read_to_string(self.root.join(LAST_CARD_FILE)) {
            Ok(contents) => Ok(CardName::new(contents.trim()).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_last_used(&self, name: &CardName) -> Result<(), CardError> {
        fs::write(self.root.join(LAST_CARD_FILE), name.as_str())?;
        Ok(())
    }

    fn check(&self, name: &CardName) -> Result<(), CardError> {
        let meta = fs::metadata(self.path_of(name)).map_err(Self::not_found(name))?;
        if meta.len() != crate::CARD_SIZE as u64 {
            return Err(CardError::InvalidSize {
                expected: crate::CARD_SIZE,
                actual: meta.len() as usize,
            });
        }
        self.import(name).map(|_| ())
    }
}

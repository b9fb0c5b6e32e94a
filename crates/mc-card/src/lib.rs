//! Memory Card Image Store
//!
//! This crate owns everything about the emulated card's contents and where
//! they live:
//!
//! - **CardImage**: the in-memory sectors, the flag byte and dirty tracking
//! - **Directory**: decoding of the 15 save directory frames for display
//! - **StorageMedium**: the persistence collaborator, with a directory-backed
//!   implementation and an in-memory one for simulation and tests
//! - **Catalog**: ordered walking of card files and new-name allocation
//! - **TitleLookup**: product code to title name mapping for display
//!
//! # Example
//!
//! ```rust
//! use mc_card::{CardImage, CardName, MemoryStorage, StorageMedium};
//!
//! let storage = MemoryStorage::new();
//! let name = CardName::new("CARD001.MCR").unwrap();
//! storage.create_blank(&name).unwrap();
//!
//! let mut card = storage.import(&name).unwrap();
//! assert!(card.is_valid_sector(1023));
//! assert!(!card.is_valid_sector(1024));
//!
//! card.sector_mut(5).unwrap()[0] = 0xAB;
//! storage.persist_sector(&name, 5, card.sector(5).unwrap()).unwrap();
//! assert_eq!(storage.import(&name).unwrap().sector(5).unwrap()[0], 0xAB);
//! ```

pub mod catalog;
pub mod directory;
pub mod error;
pub mod image;
pub mod memory;
pub mod name;
pub mod storage;
pub mod title;

pub use catalog::Catalog;
pub use directory::{BlockKind, Capacity, CardSummary, DirectoryEntry, Region};
pub use error::CardError;
pub use image::{CardImage, Sector};
pub use memory::MemoryStorage;
pub use name::CardName;
pub use storage::{DirectoryStorage, StorageMedium};
pub use title::{TitleIndex, TitleLookup};

/// Bytes per sector
pub const SECTOR_SIZE: usize = 128;

/// Sectors per card image
pub const SECTOR_COUNT: u16 = 1024;

/// Size of a complete card image in bytes
pub const CARD_SIZE: usize = SECTOR_SIZE * SECTOR_COUNT as usize;

/// Sector the host uses to probe writability; never synced to the medium
pub const WRITE_TEST_SECTOR: u16 = 0x3F;

/// Number of save directory frames (sectors 1..=15)
pub const DIRECTORY_SLOTS: usize = 15;

/// Flag byte of a card that has not been written since it was inserted
pub const FLAG_NOT_SEEN: u8 = 0x08;

/// Flag byte once the host has completed a write
pub const FLAG_SEEN: u8 = 0x00;

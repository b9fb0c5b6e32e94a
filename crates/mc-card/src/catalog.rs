//! Catalog walking
//!
//! The catalog is the lexically ordered set of card files on the medium.
//! Walking does not wrap: stepping past either end is `CatalogExhausted`.

use tracing::{debug, info, warn};

use crate::error::CardError;
use crate::name::CardName;
use crate::storage::StorageMedium;

/// Highest number used when allocating `CARDnnn.MCR` names
const MAX_CARD_NUMBER: u16 = 999;

/// Catalog view over a storage medium
pub struct Catalog<'a, S: ?Sized> {
    storage: &'a S,
}

impl<'a, S: StorageMedium + ?Sized> Catalog<'a, S> {
    pub fn new(storage: &'a S) -> Self {
        Self { storage }
    }

    /// First card after `current` in catalog order
    pub fn next(&self, current: &CardName) -> Result<CardName, CardError> {
        self.storage
            .list_cards()?
            .into_iter()
            .find(|name| name > current)
            .ok_or(CardError::CatalogExhausted)
    }

    /// Last card before `current` in catalog order
    pub fn previous(&self, current: &CardName) -> Result<CardName, CardError> {
        self.storage
            .list_cards()?
            .into_iter()
            .rev()
            .find(|name| name < current)
            .ok_or(CardError::CatalogExhausted)
    }

    /// Lowest free `CARDnnn.MCR` name
    pub fn allocate_name(&self) -> Result<CardName, CardError> {
        let taken = self.storage.list_cards()?;
        (1..=MAX_CARD_NUMBER)
            .filter_map(|n| CardName::new(format!("CARD{n:03}.MCR")).ok())
            .find(|name| {
                !taken
                    .iter()
                    .any(|t| t.as_str().eq_ignore_ascii_case(name.as_str()))
            })
            .ok_or(CardError::CatalogFull)
    }

    /// Allocate a name and create a blank card under it
    pub fn create_new(&self) -> Result<CardName, CardError> {
        let name = self.allocate_name()?;
        self.storage.create_blank(&name)?;
        Ok(name)
    }

    /// Card to load at power-on
    ///
    /// The recorded last-used card wins if it still exists; otherwise the
    /// first catalog entry; otherwise a new blank card.
    pub fn startup_card(&self) -> Result<CardName, CardError> {
        let cards = self.storage.list_cards()?;

        if let Some(last) = self.storage.read_last_used()? {
            if cards.contains(&last) {
                debug!("Resuming last used card {}", last);
                return Ok(last);
            }
            warn!("Last used card {} is no longer on the medium", last);
        }

        if let Some(first) = cards.into_iter().next() {
            return Ok(first);
        }

        let name = self.create_new()?;
        info!("Catalog empty, created {}", name);
        self.storage.write_last_used(&name)?;
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorage;

    fn card(name: &str) -> CardName {
        CardName::new(name).unwrap()
    }

    #[test]
    fn test_next_and_previous() {
        let storage = MemoryStorage::with_blank_cards(["A.MCR", "B.MCR", "C.MCR"]).unwrap();
        let catalog = Catalog::new(&storage);

        assert_eq!(catalog.next(&card("A.MCR")).unwrap(), card("B.MCR"));
        assert_eq!(catalog.previous(&card("C.MCR")).unwrap(), card("B.MCR"));
        assert!(matches!(
            catalog.next(&card("C.MCR")),
            Err(CardError::CatalogExhausted)
        ));
        assert!(matches!(
            catalog.previous(&card("A.MCR")),
            Err(CardError::CatalogExhausted)
        ));
    }

    #[test]
    fn test_walk_from_card_outside_catalog() {
        let storage = MemoryStorage::with_blank_cards(["A.MCR", "C.MCR"]).unwrap();
        let catalog = Catalog::new(&storage);
        assert_eq!(catalog.next(&card("B.MCR")).unwrap(), card("C.MCR"));
        assert_eq!(catalog.previous(&card("B.MCR")).unwrap(), card("A.MCR"));
    }

    #[test]
    fn test_allocate_skips_taken_names() {
        let storage = MemoryStorage::with_blank_cards(["CARD001.MCR", "card002.mcr"]).unwrap();
        let catalog = Catalog::new(&storage);
        assert_eq!(catalog.allocate_name().unwrap(), card("CARD003.MCR"));

        let created = catalog.create_new().unwrap();
        assert_eq!(created, card("CARD003.MCR"));
        assert!(storage.import(&created).is_ok());
    }

    #[test]
    fn test_startup_prefers_last_used() {
        let storage = MemoryStorage::with_blank_cards(["A.MCR", "B.MCR"]).unwrap();
        storage.write_last_used(&card("B.MCR")).unwrap();
        assert_eq!(Catalog::new(&storage).startup_card().unwrap(), card("B.MCR"));
    }

    #[test]
    fn test_startup_falls_back_to_first_card() {
        let storage = MemoryStorage::with_blank_cards(["B.MCR", "A.MCR"]).unwrap();
        storage.write_last_used(&card("GONE.MCR")).unwrap();
        assert_eq!(Catalog::new(&storage).startup_card().unwrap(), card("A.MCR"));
    }

    #[test]
    fn test_startup_creates_card_on_empty_medium() {
        let storage = MemoryStorage::new();
        let name = Catalog::new(&storage).startup_card().unwrap();
        assert_eq!(name, card("CARD001.MCR"));
        assert_eq!(storage.read_last_used().unwrap(), Some(name));
    }
}

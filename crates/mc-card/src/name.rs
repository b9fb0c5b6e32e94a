//! Bounded card file names

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CardError;

/// Longest card file name accepted
pub const MAX_NAME_LEN: usize = 32;

/// File extension of card images in the catalog
pub const CARD_EXTENSION: &str = "mcr";

/// Validated card file name
///
/// Names are plain file names on the medium: 1 to [`MAX_NAME_LEN`] printable
/// ASCII characters, no path separators. Ordering is lexical by bytes, which
/// is the catalog order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CardName(String);

impl CardName {
    /// Validate and wrap a card name
    pub fn new(name: impl Into<String>) -> Result<Self, CardError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= MAX_NAME_LEN
            && name != "."
            && name != ".."
            && name
                .bytes()
                .all(|b| b.is_ascii_graphic() && b != b'/' && b != b'\\' && b != b':');
        if valid {
            Ok(Self(name))
        } else {
            Err(CardError::InvalidName(name))
        }
    }

    /// Borrow the name as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the name carries the card image extension
    pub fn is_card_file(&self) -> bool {
        self.0
            .rsplit_once('.')
            .is_some_and(|(stem, ext)| !stem.is_empty() && ext.eq_ignore_ascii_case(CARD_EXTENSION))
    }
}

impl fmt::Display for CardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CardName {
    type Error = CardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CardName> for String {
    fn from(name: CardName) -> Self {
        name.0
    }
}

impl AsRef<str> for CardName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(CardName::new("CARD001.MCR").is_ok());
        assert!(CardName::new("a").is_ok());
        assert!(CardName::new("x".repeat(MAX_NAME_LEN)).is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert!(CardName::new("").is_err());
        assert!(CardName::new("..").is_err());
        assert!(CardName::new("dir/CARD.MCR").is_err());
        assert!(CardName::new("C:CARD.MCR").is_err());
        assert!(CardName::new("MY CARD.MCR").is_err());
        assert!(CardName::new("x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_card_extension() {
        assert!(CardName::new("CARD001.MCR").unwrap().is_card_file());
        assert!(CardName::new("save.mcr").unwrap().is_card_file());
        assert!(!CardName::new(".mcr").unwrap().is_card_file());
        assert!(!CardName::new("last_card.txt").unwrap().is_card_file());
    }

    #[test]
    fn test_lexical_order() {
        let a = CardName::new("CARD001.MCR").unwrap();
        let b = CardName::new("CARD002.MCR").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_serde_rejects_invalid() {
        let ok: Result<CardName, _> = serde_json::from_str("\"CARD001.MCR\"");
        assert!(ok.is_ok());
        let bad: Result<CardName, _> = serde_json::from_str("\"../etc\"");
        assert!(bad.is_err());
    }
}

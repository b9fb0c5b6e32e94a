//! Title name lookup
//!
//! Maps product codes found in the card directory to human-readable titles.
//! Display only; the protocol never consults it.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::error::CardError;

/// Product code to title lookup
pub trait TitleLookup: Send + Sync {
    /// Title for a product code such as `SLUS-00594`
    fn lookup(&self, product_code: &str) -> Option<String>;
}

/// In-memory title index
///
/// Built from a text file with one `<PRODUCT-CODE> <title>` entry per line.
#[derive(Debug, Clone, Default)]
pub struct TitleIndex {
    titles: HashMap<String, String>,
}

impl TitleIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse index text; malformed lines are skipped
    pub fn parse(text: &str) -> Self {
        let titles = text
            .lines()
            .filter_map(|line| {
                let (code, title) = line.trim_end().split_once(' ')?;
                let title = title.trim();
                (!code.is_empty() && !title.is_empty())
                    .then(|| (code.to_ascii_uppercase(), title.to_string()))
            })
            .collect::<HashMap<_, _>>();
        debug!("Loaded {} title names", titles.len());
        Self { titles }
    }

    /// Load the index from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CardError> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    pub fn len(&self) -> usize {
        self.titles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.titles.is_empty()
    }
}

impl TitleLookup for TitleIndex {
    fn lookup(&self, product_code: &str) -> Option<String> {
        self.titles.get(&product_code.to_ascii_uppercase()).cloned()
    }
}

//! Engine configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;

/// Which requests are subject to hot-key debounce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DebouncePolicy {
    /// Only directory walk requests are debounced
    #[default]
    CatalogOnly,
    /// Every request is debounced
    AllRequests,
}

/// What to do when persisting a dirty sector fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PersistFailurePolicy {
    /// Report the failure and leave the sector dirty without re-queueing
    #[default]
    Drop,
    /// Retry on later background iterations, up to `max_attempts` in total
    Retry { max_attempts: u32 },
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long the bus stays silent after a card swap (ms)
    pub reconnect_settle_ms: u64,
    /// Minimum spacing between debounced requests (ms)
    pub debounce_ms: u64,
    /// Requests subject to debounce
    pub debounce: DebouncePolicy,
    /// Background retry period for deferred swaps and failed writes (ms)
    pub swap_retry_ms: u64,
    /// Sector persistence failure handling
    pub persist_failure: PersistFailurePolicy,
    /// Capacity of the status event channel
    pub status_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconnect_settle_ms: 500,
            debounce_ms: 250,
            debounce: DebouncePolicy::CatalogOnly,
            swap_retry_ms: 10,
            persist_failure: PersistFailurePolicy::Drop,
            status_capacity: 64,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file; a missing file yields defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(EngineError::ConfigIo(e)),
        }
    }

    pub fn reconnect_settle(&self) -> Duration {
        Duration::from_millis(self.reconnect_settle_ms)
    }

    pub fn debounce_interval(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn swap_retry(&self) -> Duration {
        Duration::from_millis(self.swap_retry_ms.max(1))
    }
}

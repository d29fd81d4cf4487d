//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for the mapping engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a failed memoized refresh stays cached before a retry can
    /// start a new load.
    pub refresh_failure_grace_ms: u64,
    /// Maximum ids per backend fetch when reifying stubs.
    pub refresh_batch_size: usize,
    /// Default page size of the object mapper.
    pub mapper_page_size: u64,
    /// Debounce window of the object mapper. Zero still coalesces requests
    /// issued before the next scheduler turn.
    pub mapper_debounce_ms: u64,
    /// Current version of persisted display preferences.
    pub display_prefs_version: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_failure_grace_ms: 10,
            refresh_batch_size: 50,
            mapper_page_size: 10,
            mapper_debounce_ms: 0,
            display_prefs_version: 1,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn refresh_failure_grace(&self) -> Duration {
        Duration::from_millis(self.refresh_failure_grace_ms)
    }

    pub fn mapper_debounce(&self) -> Duration {
        Duration::from_millis(self.mapper_debounce_ms)
    }
}

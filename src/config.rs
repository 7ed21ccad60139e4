//! Depot configuration
//!
//! Configuration is optional: `DepotConfig::default()` gives a working depot
//! rooted under the platform cache directory, with one worker per logical
//! CPU. A TOML file can override any field.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LarderError, LarderResult};
use crate::identity::RefreshMode;

const DEFAULT_DEBOUNCE_MS: u64 = 50;

/// Tunable settings for one [`Depot`](crate::hub::Depot)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepotConfig {
    /// Directory holding all cache subdirectories. Defaults to
    /// `<platform cache dir>/larder`.
    pub root: Option<PathBuf>,
    /// Refresh worker threads. Zero means one per logical CPU.
    pub workers: usize,
    /// Refresh mode applied to caches that do not set their own policy
    pub default_mode: RefreshMode,
    /// Quiet period between a change and trigger re-evaluation
    pub trigger_debounce_ms: u64,
}

impl Default for DepotConfig {
    fn default() -> Self {
        Self {
            root: None,
            workers: 0,
            default_mode: RefreshMode::Automatic,
            trigger_debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

impl DepotConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> LarderResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| LarderError::io(format!("reading config {}", path.display()), e))?;
        Ok(toml::from_str(&text)?)
    }

    /// Storage root with the platform default applied
    pub fn effective_root(&self) -> PathBuf {
        match &self.root {
            Some(root) => root.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("larder"),
        }
    }

    /// Worker count with the CPU default applied
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub(crate) fn trigger_debounce(&self) -> Duration {
        Duration::from_millis(self.trigger_debounce_ms)
    }
}

//! Engine configuration, loadable from TOML.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::catalog::DEFAULT_CACHE_SIZE;
use crate::txn::IsolationLevel;
use crate::types::{Result, TidemarkError};

/// When redo frames are forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RedoSync {
    /// fsync after every committed frame.
    #[default]
    Always,
    /// Leave flushing to the operating system.
    Never,
}

/// Tunables for a [`TransactionEngine`](crate::TransactionEngine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Isolation used by [`TransactionEngine::begin`](crate::TransactionEngine::begin).
    pub default_isolation: IsolationLevel,
    /// Redo durability mode.
    pub redo_sync: RedoSync,
    /// Estimated redo bytes after which a map is reported as dirty.
    pub dirty_memory_threshold: u64,
    /// Values reserved per catalog write for sequences created without an
    /// explicit cache size.
    pub sequence_cache_size: i64,
    /// Salt stamped into the redo log header.
    pub redo_salt: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_isolation: IsolationLevel::ReadCommitted,
            redo_sync: RedoSync::Always,
            dirty_memory_threshold: 4 * 1024 * 1024,
            sequence_cache_size: DEFAULT_CACHE_SIZE,
            redo_salt: 0,
        }
    }
}

impl EngineConfig {
    /// Durable preset: fsync per commit, repeatable read by default.
    pub fn durable() -> Self {
        Self {
            default_isolation: IsolationLevel::RepeatableRead,
            redo_sync: RedoSync::Always,
            ..Self::default()
        }
    }

    /// Throughput preset: no fsync, larger sequence caches.
    pub fn fast() -> Self {
        Self {
            redo_sync: RedoSync::Never,
            dirty_memory_threshold: 64 * 1024 * 1024,
            sequence_cache_size: 1024,
            ..Self::default()
        }
    }

    /// Parses a TOML document; missing keys take their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(src).map_err(|err| TidemarkError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            TidemarkError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| TidemarkError::Config(err.to_string()))
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sequence_cache_size < 1 {
            return Err(TidemarkError::Config(format!(
                "sequence_cache_size must be at least 1, got {}",
                self.sequence_cache_size
            )));
        }
        if self.dirty_memory_threshold == 0 {
            return Err(TidemarkError::Config(
                "dirty_memory_threshold must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

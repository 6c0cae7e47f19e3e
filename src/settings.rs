use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{DbError, Result};

/// On-disk format version, printed by the control surface and bumped on
/// incompatible layout changes.
pub const FORMAT_VERSION: u32 = 1;

pub const SETTINGS_FILE_NAME: &str = "settings";

/// Write-path strategy.
///
/// `FastWrite` keeps data in the WAL as long as possible; `Compressed`
/// seals memory chunks to pages aggressively; `Memory` never creates
/// pages; `Cache` turns the memory tier into a write-through read cache
/// over the page tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    #[default]
    FastWrite,
    Compressed,
    Memory,
    Cache,
}

impl FromStr for Strategy {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FAST_WRITE" => Ok(Self::FastWrite),
            "COMPRESSED" => Ok(Self::Compressed),
            "MEMORY" => Ok(Self::Memory),
            "CACHE" => Ok(Self::Cache),
            other => Err(DbError::Settings(format!("unknown strategy: {other}"))),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FastWrite => "FAST_WRITE",
            Self::Compressed => "COMPRESSED",
            Self::Memory => "MEMORY",
            Self::Cache => "CACHE",
        };
        f.write_str(name)
    }
}

/// WAL fsync policy: `per_write`, `per_batch` or `periodic:<ms>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    PerWrite,
    PerBatch,
    Periodic(u64),
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self::PerBatch
    }
}

impl FromStr for SyncPolicy {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "per_write" => Ok(Self::PerWrite),
            "per_batch" => Ok(Self::PerBatch),
            _ => {
                if let Some(ms) = lower.strip_prefix("periodic:") {
                    let ms = ms
                        .parse::<u64>()
                        .map_err(|_| DbError::Settings(format!("bad periodic interval: {s}")))?;
                    Ok(Self::Periodic(ms))
                } else {
                    Err(DbError::Settings(format!("unknown sync policy: {s}")))
                }
            }
        }
    }
}

impl fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerWrite => f.write_str("per_write"),
            Self::PerBatch => f.write_str("per_batch"),
            Self::Periodic(ms) => write!(f, "periodic:{ms}"),
        }
    }
}

impl Serialize for SyncPolicy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SyncPolicy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Engine configuration, persisted as a flat key/value `settings` file in
/// the storage directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub strategy: Strategy,
    /// Bytes per compressed chunk body.
    pub chunk_size: u32,
    /// Index slots per page file.
    pub chunk_per_page: u32,
    /// Byte budget for the memory-tier allocator.
    pub memory_cap: u64,
    /// Samples per WAL segment before rotation.
    pub wal_segment_size: u32,
    /// Max age of an open memory chunk (in source time units) before the
    /// dropper force-seals it. 0 disables age-based sealing.
    pub old_chunk_age: u64,
    pub sync_writes: SyncPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            strategy: Strategy::FastWrite,
            chunk_size: 1024,
            chunk_per_page: 1024,
            memory_cap: 128 * 1024 * 1024,
            wal_segment_size: 32 * 1024,
            old_chunk_age: 0,
            sync_writes: SyncPolicy::PerBatch,
        }
    }
}

impl Settings {
    #[must_use]
    pub fn settings_path(storage_path: &Path) -> PathBuf {
        storage_path.join(SETTINGS_FILE_NAME)
    }

    /// Load the `settings` file from the storage directory, falling back to
    /// defaults when the file does not exist.
    ///
    /// # Errors
    /// Returns `Settings` error if the file exists but cannot be parsed.
    pub fn load(storage_path: &Path) -> Result<Self> {
        let path = Self::settings_path(storage_path);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        toml::from_str(&raw).map_err(|e| DbError::Settings(format!("{}: {e}", path.display())))
    }

    /// Persist to the `settings` file in the storage directory.
    ///
    /// # Errors
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, storage_path: &Path) -> Result<()> {
        let raw = toml::to_string(self).map_err(|e| DbError::Settings(e.to_string()))?;
        std::fs::write(Self::settings_path(storage_path), raw)?;
        Ok(())
    }

    /// Apply one `key = value` change, used by the control surface.
    ///
    /// # Errors
    /// Returns `Settings` error for unknown keys or unparsable values.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        fn num<T: FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .parse::<T>()
                .map_err(|_| DbError::Settings(format!("bad value for {key}: {value}")))
        }
        match key {
            "strategy" => self.strategy = value.parse()?,
            "chunk_size" => self.chunk_size = num(key, value)?,
            "chunk_per_page" => self.chunk_per_page = num(key, value)?,
            "memory_cap" => self.memory_cap = num(key, value)?,
            "wal_segment_size" => self.wal_segment_size = num(key, value)?,
            "old_chunk_age" => self.old_chunk_age = num(key, value)?,
            "sync_writes" => self.sync_writes = value.parse()?,
            other => return Err(DbError::Settings(format!("unknown setting: {other}"))),
        }
        Ok(())
    }

    /// `chunk_per_page * chunk_size` bytes of chunk region per page.
    #[must_use]
    pub fn page_body_bytes(&self) -> u64 {
        u64::from(self.chunk_per_page) * u64::from(self.chunk_size)
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "strategy = {}", self.strategy)?;
        writeln!(f, "chunk_size = {}", self.chunk_size)?;
        writeln!(f, "chunk_per_page = {}", self.chunk_per_page)?;
        writeln!(f, "memory_cap = {}", self.memory_cap)?;
        writeln!(f, "wal_segment_size = {}", self.wal_segment_size)?;
        writeln!(f, "old_chunk_age = {}", self.old_chunk_age)?;
        write!(f, "sync_writes = {}", self.sync_writes)
    }
}

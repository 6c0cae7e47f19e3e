//! Library-level control surface behind the `chronolite` binary: database
//! creation, settings inspection and edits, page compaction, format
//! version.

use std::path::Path;

use crate::engine::Engine;
use crate::errors::{DbError, Result};
use crate::manifest::Manifest;
use crate::settings::{FORMAT_VERSION, Settings};

/// Create an empty database: storage directory, default `settings` file,
/// empty manifest.
///
/// # Errors
/// Fails when the directory already holds a database (a settings file or
/// manifest), or on I/O failure.
pub fn create_db(storage_path: &Path) -> Result<()> {
    std::fs::create_dir_all(storage_path)?;
    if Settings::settings_path(storage_path).exists() {
        return Err(DbError::Settings(format!(
            "database already exists at {}",
            storage_path.display()
        )));
    }
    Settings::default().save(storage_path)?;
    let _ = Manifest::open(storage_path)?;
    log::info!("created empty database at {}", storage_path.display());
    Ok(())
}

/// The `settings` file rendered as flat `key = value` lines.
///
/// # Errors
/// Fails when the settings file is unreadable.
pub fn print_settings(storage_path: &Path) -> Result<String> {
    ensure_db(storage_path)?;
    Ok(Settings::load(storage_path)?.to_string())
}

/// Change one setting and persist the file.
///
/// # Errors
/// Unknown key, unparsable value, or I/O failure.
pub fn set_setting(storage_path: &Path, key: &str, value: &str) -> Result<()> {
    ensure_db(storage_path)?;
    let mut settings = Settings::load(storage_path)?;
    settings.set(key, value)?;
    settings.save(storage_path)
}

/// Compact every page into one. Returns the number of pages removed.
///
/// # Errors
/// Propagates engine open and compaction failures.
pub fn compact_all(storage_path: &Path) -> Result<usize> {
    ensure_db(storage_path)?;
    let engine = Engine::open(storage_path)?;
    let removed = engine.compact_all()?;
    engine.stop()?;
    Ok(removed)
}

/// Compact the pages fully contained in `[from, to)`.
///
/// # Errors
/// Propagates engine open and compaction failures.
pub fn compact_range(storage_path: &Path, from: u64, to: u64) -> Result<usize> {
    ensure_db(storage_path)?;
    let engine = Engine::open(storage_path)?;
    let removed = engine.compact_range(from, to)?;
    engine.stop()?;
    Ok(removed)
}

/// On-disk format version of this build.
#[must_use]
pub const fn format_version() -> u32 {
    FORMAT_VERSION
}

fn ensure_db(storage_path: &Path) -> Result<()> {
    if !Settings::settings_path(storage_path).exists() {
        return Err(DbError::Settings(format!(
            "no database at {}",
            storage_path.display()
        )));
    }
    Ok(())
}

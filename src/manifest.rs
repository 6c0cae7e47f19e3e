use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::errors::{DbError, Result};

pub const MANIFEST_FILE_NAME: &str = "manifest";

/// Record kinds in the manifest file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Page,
    Wal,
}

impl FileKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Page => "PAGE",
            Self::Wal => "WAL",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "PAGE" => Some(Self::Page),
            "WAL" => Some(Self::Wal),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct ManifestInner {
    version: u64,
    pages: Vec<String>,
    wals: Vec<String>,
}

/// Authoritative on-disk list of live storage files.
///
/// Text format, one record per line: `<kind>\t<filename>\t<version>`.
/// Every line carries the version the manifest had when it was last
/// rewritten; on load the version counter resumes from the maximum seen.
/// Mutations rewrite the whole file through a temp file, fsync, rename —
/// the manifest is small and single-writer, so the rewrite stays cheap.
#[derive(Debug)]
pub struct Manifest {
    path: PathBuf,
    inner: Mutex<ManifestInner>,
}

impl Manifest {
    /// Open the manifest in `storage_path`, creating an empty one if the
    /// file does not exist.
    ///
    /// # Errors
    /// `CorruptManifest` if the file exists but cannot be parsed — fatal by
    /// contract, the engine refuses to open on top of it.
    pub fn open(storage_path: &Path) -> Result<Self> {
        let path = storage_path.join(MANIFEST_FILE_NAME);
        let mut inner = ManifestInner::default();
        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            for (lineno, line) in raw.lines().enumerate() {
                if line.is_empty() {
                    continue;
                }
                let mut cols = line.split('\t');
                let (kind, name, version) = (cols.next(), cols.next(), cols.next());
                let parsed = kind.and_then(FileKind::parse).and_then(|k| {
                    let name = name?.to_string();
                    let version = version?.parse::<u64>().ok()?;
                    Some((k, name, version))
                });
                let Some((kind, name, version)) = parsed else {
                    return Err(DbError::CorruptManifest(format!(
                        "{}: bad record at line {}",
                        path.display(),
                        lineno + 1
                    )));
                };
                inner.version = inner.version.max(version);
                match kind {
                    FileKind::Page => inner.pages.push(name),
                    FileKind::Wal => inner.wals.push(name),
                }
            }
        }
        let manifest = Self { path, inner: Mutex::new(inner) };
        if !manifest.path.exists() {
            manifest.persist(&manifest.inner.lock())?;
        }
        Ok(manifest)
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    #[must_use]
    pub fn pages(&self) -> Vec<String> {
        self.inner.lock().pages.clone()
    }

    #[must_use]
    pub fn wals(&self) -> Vec<String> {
        self.inner.lock().wals.clone()
    }

    /// # Errors
    /// Propagates the rewrite failure; the in-memory list is only updated
    /// after the file is durable.
    pub fn add_page(&self, name: &str) -> Result<()> {
        self.mutate(|inner| inner.pages.push(name.to_string()))
    }

    /// # Errors
    /// See [`Manifest::add_page`].
    pub fn remove_page(&self, name: &str) -> Result<()> {
        self.mutate(|inner| inner.pages.retain(|n| n != name))
    }

    /// # Errors
    /// See [`Manifest::add_page`].
    pub fn add_wal(&self, name: &str) -> Result<()> {
        self.mutate(|inner| inner.wals.push(name.to_string()))
    }

    /// # Errors
    /// See [`Manifest::add_page`].
    pub fn remove_wal(&self, name: &str) -> Result<()> {
        self.mutate(|inner| inner.wals.retain(|n| n != name))
    }

    fn mutate(&self, op: impl FnOnce(&mut ManifestInner)) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut staged = ManifestInner {
            version: inner.version + 1,
            pages: inner.pages.clone(),
            wals: inner.wals.clone(),
        };
        op(&mut staged);
        self.persist(&staged)?;
        *inner = staged;
        Ok(())
    }

    fn persist(&self, inner: &ManifestInner) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut f = File::create(&tmp)?;
            for name in &inner.pages {
                writeln!(f, "{}\t{}\t{}", FileKind::Page.as_str(), name, inner.version)?;
            }
            for name in &inner.wals {
                writeln!(f, "{}\t{}\t{}", FileKind::Wal.as_str(), name, inner.version)?;
            }
            f.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Delete page/WAL files in `dir` that the manifest does not list. The
    /// manifest is the source of truth at engine open; anything else is a
    /// leftover from a crash mid-mutation.
    ///
    /// # Errors
    /// Propagates directory-walk failures; individual deletes are logged
    /// and skipped.
    pub fn cleanup_orphans(&self, dir: &Path) -> Result<usize> {
        let live: HashSet<String> = {
            let inner = self.inner.lock();
            inner.pages.iter().chain(inner.wals.iter()).cloned().collect()
        };
        let mut removed = 0usize;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let is_storage_file = name.ends_with(".page") || name.ends_with(".wal");
            let is_index_sidecar = name.ends_with(".pagei");
            if is_storage_file && !live.contains(&name) {
                log::warn!("removing orphan file {name}");
                if let Err(e) = fs::remove_file(entry.path()) {
                    log::error!("failed to remove orphan {name}: {e}");
                } else {
                    removed += 1;
                }
            } else if is_index_sidecar {
                let page_name = name.trim_end_matches('i').to_string();
                if !live.contains(&page_name) {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
        Ok(removed)
    }
}

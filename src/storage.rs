use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::models::ListingKey;

/// Where listing descriptions live. Kept apart from the database so the
/// text can move to another backend without touching ingestion.
pub trait DescriptionStore: Send + Sync {
    fn exists(&self, key: &ListingKey) -> Result<bool>;
    fn write(&self, key: &ListingKey, text: &str) -> Result<()>;
    fn read(&self, key: &ListingKey) -> Result<Option<String>>;
}

/// One `<site>-<id>.txt` file per listing under `<data-dir>/listings`.
/// Descriptions moved into `<data-dir>/data-archive.tar.gz` still count as
/// stored and are read from the archive.
pub struct FileStore {
    dir: PathBuf,
    archive: PathBuf,
    archived: HashSet<String>,
}

impl FileStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("listings");
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create listing directory {}", dir.display()))?;
        let archive = data_dir.join("data-archive.tar.gz");
        let archived = if archive.is_file() {
            archive_names(&archive).unwrap_or_else(|e| {
                warn!(archive = %archive.display(), error = %e, "ignoring unreadable description archive");
                HashSet::new()
            })
        } else {
            HashSet::new()
        };
        Ok(Self { dir, archive, archived })
    }

    fn file_name(key: &ListingKey) -> String {
        // Listing ids come from remote pages; keep them inside the directory
        let id: String = key
            .id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("{}-{}.txt", key.site, id)
    }

    fn path(&self, key: &ListingKey) -> PathBuf {
        self.dir.join(Self::file_name(key))
    }

    fn read_archived(&self, name: &str) -> Result<Option<String>> {
        let mut archive = open_archive(&self.archive)?;
        for entry in archive.entries()? {
            let mut entry = entry?;
            let matches = entry.path()?.file_name() == Some(OsStr::new(name));
            if matches {
                let mut text = String::new();
                entry
                    .read_to_string(&mut text)
                    .with_context(|| format!("Failed to read {} from {}", name, self.archive.display()))?;
                return Ok(Some(text));
            }
        }
        Ok(None)
    }
}

fn open_archive(path: &Path) -> Result<tar::Archive<GzDecoder<File>>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(tar::Archive::new(GzDecoder::new(file)))
}

/// File names of every entry in the archive, wherever it sits in the tree.
fn archive_names(path: &Path) -> Result<HashSet<String>> {
    let mut archive = open_archive(path)?;
    let mut names = HashSet::new();
    for entry in archive.entries()? {
        let entry = entry?;
        if let Some(name) = entry.path()?.file_name().and_then(OsStr::to_str) {
            names.insert(name.to_string());
        }
    }
    Ok(names)
}

impl DescriptionStore for FileStore {
    fn exists(&self, key: &ListingKey) -> Result<bool> {
        Ok(self.path(key).is_file() || self.archived.contains(&Self::file_name(key)))
    }

    fn write(&self, key: &ListingKey, text: &str) -> Result<()> {
        let path = self.path(key);
        fs::write(&path, text)
            .with_context(|| format!("Failed to write description to {}", path.display()))
    }

    fn read(&self, key: &ListingKey) -> Result<Option<String>> {
        let path = self.path(key);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let name = Self::file_name(key);
                if self.archived.contains(&name) {
                    self.read_archived(&name)
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }
}

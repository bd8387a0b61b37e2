//! Staging area management
//!
//! Owns the on-disk roots for uploads, encrypted blobs, decrypted downloads
//! and export scratch files. Every name handed out is unique without any
//! coordination between callers: a millisecond timestamp, a random UUID and
//! the original extension.

mod ephemeral;
mod path;

pub use ephemeral::EphemeralFile;
pub use path::{StagingClass, StagingPath};

use crate::error::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest extension carried over from an original filename
const MAX_EXTENSION_LEN: usize = 16;

/// Age after which a transient staged file is treated as left behind by a dead process
pub const STALE_AFTER: Duration = Duration::from_secs(60 * 60);

/// Root directories, one per staging class
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StagingRoots {
    pub uploads: PathBuf,
    pub encrypted: PathBuf,
    pub decrypted: PathBuf,
    pub export_temp: PathBuf,
}

impl StagingRoots {
    /// Conventional layout below a single base directory
    pub fn under<P: AsRef<Path>>(base: P) -> Self {
        let base = base.as_ref();
        StagingRoots {
            uploads: base.join("uploads"),
            encrypted: base.join("encrypted"),
            decrypted: base.join("decrypted"),
            export_temp: base.join("export-temp"),
        }
    }

    pub fn root(&self, class: StagingClass) -> &Path {
        match class {
            StagingClass::Upload => &self.uploads,
            StagingClass::Encrypted => &self.encrypted,
            StagingClass::Decrypted => &self.decrypted,
            StagingClass::ExportTemp => &self.export_temp,
        }
    }
}

/// Hands out collision-free staging paths under class-specific roots
#[derive(Debug, Clone)]
pub struct StagingArea {
    roots: StagingRoots,
}

impl StagingArea {
    pub fn new(roots: StagingRoots) -> Self {
        StagingArea { roots }
    }

    /// Create every root directory. Idempotent; call once at startup.
    pub fn init(&self) -> Result<()> {
        for class in StagingClass::ALL {
            let root = self.roots.root(class);
            fs::create_dir_all(root).map_err(|e| Error::storage(root, e))?;
        }
        info!("Staging area initialized under {:?}", self.roots);
        Ok(())
    }

    pub fn roots(&self) -> &StagingRoots {
        &self.roots
    }

    /// Reserve a fresh path of the given class
    pub fn reserve(&self, class: StagingClass, filename: &str) -> StagingPath {
        let name = unique_name(class, filename);
        let path = self.roots.root(class).join(name);
        debug!("Reserved {} path {:?}", class, path);
        StagingPath::new(class, path)
    }

    pub fn reserve_upload_path(&self, original_filename: &str) -> StagingPath {
        self.reserve(StagingClass::Upload, original_filename)
    }

    /// Ciphertext names never carry any part of the plaintext filename
    pub fn reserve_encrypted_path(&self, filename: &str) -> StagingPath {
        self.reserve(StagingClass::Encrypted, filename)
    }

    pub fn reserve_decrypted_path(&self, filename: &str) -> StagingPath {
        self.reserve(StagingClass::Decrypted, filename)
    }

    pub fn reserve_export_path(&self, filename: &str) -> StagingPath {
        self.reserve(StagingClass::ExportTemp, filename)
    }

    /// Best-effort removal of a path that is not tracked by a [`StagingPath`]
    pub async fn release(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("Released {:?}", path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to release {:?}: {}", path, e),
        }
    }

    /// Copy an inbound upload stream into a freshly reserved upload path
    pub async fn stage_upload<R>(&self, original_filename: &str, reader: &mut R) -> Result<StagingPath>
    where
        R: AsyncRead + Unpin,
    {
        let staged = self.reserve_upload_path(original_filename);

        let mut file = create_exclusive(staged.path())
            .map(tokio::fs::File::from_std)
            .map_err(|e| Error::storage(staged.path(), e))?;

        let copied = async {
            let n = tokio::io::copy(reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<u64, io::Error>(n)
        }
        .await;

        match copied {
            Ok(n) => {
                debug!("Staged upload {:?} ({} bytes)", staged.path(), n);
                Ok(staged)
            }
            Err(e) => {
                drop(file);
                staged.release().await;
                Err(Error::CipherIo(format!("staging upload failed: {}", e)))
            }
        }
    }

    /// Files currently present in a class root
    pub fn residue(&self, class: StagingClass) -> Result<Vec<PathBuf>> {
        let root = self.roots.root(class);
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::storage(root, e)),
        };

        let mut files: Vec<PathBuf> = entries
            .flatten()
            .filter(|entry| entry.metadata().map(|m| m.is_file()).unwrap_or(false))
            .map(|entry| entry.path())
            .collect();
        files.sort();
        Ok(files)
    }

    /// Remove every file left in a transient class root
    pub fn purge(&self, class: StagingClass) -> Result<usize> {
        if !class.is_transient() {
            return Err(Error::Validation(format!(
                "refusing to purge durable {} root",
                class
            )));
        }

        let mut removed = 0;
        for path in self.residue(class)? {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to purge {:?}: {}", path, e),
            }
        }

        if removed > 0 {
            info!("Purged {} stale {} files", removed, class);
        }
        Ok(removed)
    }

    /// Remove files in a transient class root that are older than `max_age`.
    ///
    /// Age comes from the millisecond stamp in the staged name, falling back
    /// to the modification time for names this crate did not hand out.
    pub fn purge_stale(&self, class: StagingClass, max_age: Duration) -> Result<usize> {
        if !class.is_transient() {
            return Err(Error::Validation(format!(
                "refusing to purge durable {} root",
                class
            )));
        }

        let now = SystemTime::now();
        let mut removed = 0;
        for path in self.residue(class)? {
            let created = staged_at(&path)
                .or_else(|| fs::metadata(&path).and_then(|m| m.modified()).ok());
            let Some(created) = created else { continue };
            if now.duration_since(created).unwrap_or_default() < max_age {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to purge {:?}: {}", path, e),
            }
        }

        if removed > 0 {
            info!("Purged {} stale {} files older than {:?}", removed, class, max_age);
        }
        Ok(removed)
    }

    /// Whether `path` lies inside the root of `class`
    pub fn contains(&self, class: StagingClass, path: &Path) -> bool {
        path.starts_with(self.roots.root(class))
            && !path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
    }
}

/// Create a file that must not exist yet.
///
/// Opened synchronously: an async open runs on the blocking pool and can
/// still create the file after a cancelled caller's guard already ran.
pub(crate) fn create_exclusive(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

/// Creation time encoded in a staged name (`<prefix>-<millis>-<uuid><ext>`)
fn staged_at(path: &Path) -> Option<SystemTime> {
    let name = path.file_name()?.to_str()?;
    let millis: u64 = name.split('-').nth(1)?.parse().ok()?;
    UNIX_EPOCH.checked_add(Duration::from_millis(millis))
}

fn unique_name(class: StagingClass, filename: &str) -> String {
    let extension = match class {
        StagingClass::Encrypted => ".enc".to_string(),
        _ => extension_of(filename),
    };

    format!(
        "{}-{}-{}{}",
        class.prefix(),
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple(),
        extension
    )
}

/// Extension of `filename` including the dot, or empty if it is unusable
fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default()
}

//! Reserved staging locations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// The kind of transient (or durable) file a staging root holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StagingClass {
    /// Plaintext uploads waiting to be encrypted
    Upload,
    /// Ciphertext blobs at rest
    Encrypted,
    /// Plaintext copies produced for a single download
    Decrypted,
    /// Plaintext copies and archives produced for an export
    ExportTemp,
}

impl StagingClass {
    pub const ALL: [StagingClass; 4] = [
        StagingClass::Upload,
        StagingClass::Encrypted,
        StagingClass::Decrypted,
        StagingClass::ExportTemp,
    ];

    /// Filename prefix for paths of this class
    pub fn prefix(self) -> &'static str {
        match self {
            StagingClass::Upload => "file",
            StagingClass::Encrypted => "blob",
            StagingClass::Decrypted => "plain",
            StagingClass::ExportTemp => "export",
        }
    }

    /// Whether files of this class are ephemeral
    pub fn is_transient(self) -> bool {
        !matches!(self, StagingClass::Encrypted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StagingClass::Upload => "upload",
            StagingClass::Encrypted => "encrypted",
            StagingClass::Decrypted => "decrypted",
            StagingClass::ExportTemp => "export-temp",
        }
    }
}

impl fmt::Display for StagingClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A uniquely named location owned by exactly one operation.
///
/// The file at this path is removed when the value is released or dropped,
/// unless ownership was handed off with [`StagingPath::persist`].
#[derive(Debug)]
pub struct StagingPath {
    class: StagingClass,
    path: PathBuf,
    armed: bool,
}

impl StagingPath {
    pub(crate) fn new(class: StagingClass, path: PathBuf) -> Self {
        StagingPath {
            class,
            path,
            armed: true,
        }
    }

    pub fn class(&self) -> StagingClass {
        self.class
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check whether anything has been written at this path yet
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Delete the file now. Failures are logged, never returned.
    pub async fn release(mut self) {
        self.armed = false;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!("Released {} path {:?}", self.class, self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to release {} path {:?}: {}", self.class, self.path, e),
        }
    }

    /// Hand the file over to a durable owner; it will no longer be removed
    pub fn persist(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl AsRef<Path> for StagingPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingPath {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Released {} path {:?} on drop", self.class, self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to release {} path {:?}: {}", self.class, self.path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_drop_removes_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("plain-1");
        std::fs::write(&path, b"secret").unwrap();

        let staged = StagingPath::new(StagingClass::Decrypted, path.clone());
        drop(staged);

        assert!(!path.exists());
    }

    #[test]
    fn test_persist_keeps_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("blob-1.enc");
        std::fs::write(&path, b"ciphertext").unwrap();

        let staged = StagingPath::new(StagingClass::Encrypted, path.clone());
        let kept = staged.persist();

        assert_eq!(kept, path);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_release_missing_is_quiet() {
        let temp = TempDir::new().unwrap();
        let staged = StagingPath::new(StagingClass::Upload, temp.path().join("never-written"));
        assert!(!staged.exists());
        staged.release().await;
    }

    #[test]
    fn test_class_properties() {
        assert!(StagingClass::Upload.is_transient());
        assert!(StagingClass::ExportTemp.is_transient());
        assert!(!StagingClass::Encrypted.is_transient());
        assert_eq!(StagingClass::ExportTemp.to_string(), "export-temp");
    }
}

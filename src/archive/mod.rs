//! Bulk export archives
//!
//! An export decrypts every requested record into its own scratch file,
//! packs the scratch files into one Deflate-compressed ZIP and hands the
//! caller a readable stream over it. Scratch plaintext is owned by an
//! [`ArchiveJob`] and removed exactly once, whether the export succeeds,
//! fails half way or is cancelled. The archive file itself is removed when
//! the stream reaches end-of-file or is dropped.

mod names;

pub use names::EntryNames;

use crate::crypto::StreamCipher;
use crate::error::{Error, Result};
use crate::record::FileRecord;
use crate::staging::{create_exclusive, EphemeralFile, StagingArea, StagingPath};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Default Deflate level for export archives
pub const DEFAULT_COMPRESSION_LEVEL: i64 = 9;

/// Scratch files created for one export
#[derive(Debug, Default)]
pub struct ArchiveJob {
    entries: Vec<(String, StagingPath)>,
}

impl ArchiveJob {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a decrypted copy to be archived as `name`
    pub fn register(&mut self, name: String, copy: StagingPath) {
        self.entries.push((name, copy));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sources(&self) -> Vec<(String, PathBuf)> {
        self.entries
            .iter()
            .map(|(name, copy)| (name.clone(), copy.path().to_path_buf()))
            .collect()
    }

    /// Remove every scratch file now
    pub async fn release(mut self) {
        for (_, copy) in self.entries.drain(..) {
            copy.release().await;
        }
    }
}

/// Builds export archives from stored records
#[derive(Debug, Clone)]
pub struct ExportArchiver {
    staging: Arc<StagingArea>,
    cipher: StreamCipher,
    compression_level: i64,
}

impl ExportArchiver {
    pub fn new(staging: Arc<StagingArea>, cipher: StreamCipher, compression_level: i64) -> Self {
        ExportArchiver {
            staging,
            cipher,
            compression_level,
        }
    }

    /// Decrypt `records` in order and assemble them into one archive.
    ///
    /// Any failure aborts the whole export; no partial archive is returned.
    pub async fn build_export(&self, records: &[FileRecord]) -> Result<ArchiveStream> {
        let mut job = ArchiveJob::new();
        let mut names = EntryNames::new();

        for record in records {
            let material = record.key_material()?;
            let copy = self.staging.reserve_export_path(&record.filename);
            self.cipher
                .decrypt_with(&record.storage_path, copy.path(), &material)
                .await?;
            job.register(names.assign(&record.filename), copy);
        }

        let archive = self.staging.reserve_export_path("export.zip");
        let output =
            create_exclusive(archive.path()).map_err(|e| Error::storage(archive.path(), e))?;

        let sources = job.sources();
        let level = self.compression_level;
        let entries = tokio::task::spawn_blocking(move || write_zip(output, sources, level))
            .await
            .map_err(|e| Error::Internal(format!("archive writer panicked: {}", e)))??;

        job.release().await;

        let size = tokio::fs::metadata(archive.path())
            .await
            .map_err(|e| Error::Archive(format!("failed to stat archive: {}", e)))?
            .len();
        let file = EphemeralFile::open(archive).await?;

        info!("Export archive ready: {} entries, {} bytes", entries.len(), size);
        Ok(ArchiveStream { file, entries, size })
    }
}

/// Write `sources` into a ZIP at `output`, returning entry names in order
fn write_zip(output: std::fs::File, sources: Vec<(String, PathBuf)>, level: i64) -> Result<Vec<String>> {
    let mut zip = ZipWriter::new(BufWriter::new(output));
    let mut entries = Vec::with_capacity(sources.len());

    for (name, path) in sources {
        let mut input = std::fs::File::open(&path)
            .map_err(|e| Error::Archive(format!("failed to open {:?}: {}", path, e)))?;
        let len = input.metadata()?.len();

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(level))
            .large_file(len >= u32::MAX as u64);

        zip.start_file(name.as_str(), options)?;
        io::copy(&mut input, &mut zip)
            .map_err(|e| Error::Archive(format!("failed to add {}: {}", name, e)))?;
        debug!("Archived {} ({} bytes)", name, len);
        entries.push(name);
    }

    let mut out = zip.finish()?;
    out.flush()?;
    out.get_ref().sync_all()?;
    Ok(entries)
}

/// Readable export archive; the backing file is removed at EOF or on drop
#[derive(Debug)]
pub struct ArchiveStream {
    file: EphemeralFile,
    entries: Vec<String>,
    size: u64,
}

impl ArchiveStream {
    /// Entry names in archive order
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Total archive size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl AsyncRead for ArchiveStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}

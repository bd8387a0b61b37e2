//! Vault operations
//!
//! `VaultService` ties the pieces together: it stages and encrypts uploads,
//! persists their records, checks ownership before touching any blob,
//! decrypts downloads into self-deleting files and builds export archives.
//!
//! Upload lifecycle:
//!
//! ```text
//! Staged --encrypt--> Encrypted --record saved--> PlaintextPurged
//!    |                    |
//!    +-- any failure -----+--> staged plaintext and ciphertext removed
//! ```

pub mod activity;

pub use activity::{Action, ActivityEntry, ActivityLog, MemoryActivityLog, TracingActivityLog};

use crate::archive::{ArchiveStream, ExportArchiver};
use crate::config::VaultConfig;
use crate::crypto::{KeyMaterial, StreamCipher};
use crate::error::{Error, Result};
use crate::record::{check_owner_id, FileRecord, FileRecordStore};
use crate::staging::{EphemeralFile, StagingArea, StagingClass, StagingPath};
use chrono::Utc;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, info, warn};

/// Longest accepted original filename, in bytes
const MAX_FILENAME_LEN: usize = 255;

/// Encrypted file vault over a record store and a staging area
pub struct VaultService {
    store: Arc<dyn FileRecordStore>,
    staging: Arc<StagingArea>,
    cipher: StreamCipher,
    archiver: ExportArchiver,
    activity: Arc<dyn ActivityLog>,
}

impl VaultService {
    pub fn new(
        store: Arc<dyn FileRecordStore>,
        staging: Arc<StagingArea>,
        cipher: StreamCipher,
        archiver: ExportArchiver,
    ) -> Self {
        VaultService {
            store,
            staging,
            cipher,
            archiver,
            activity: Arc::new(TracingActivityLog),
        }
    }

    /// Build a service from configuration, creating the staging roots
    pub fn from_config(config: &VaultConfig, store: Arc<dyn FileRecordStore>) -> Result<Self> {
        config.validate()?;

        let staging = Arc::new(StagingArea::new(config.staging_roots()));
        staging.init()?;

        let cipher = StreamCipher::new(config.cipher.chunk_size);
        let archiver = ExportArchiver::new(staging.clone(), cipher, config.archive.compression_level);
        Ok(Self::new(store, staging, cipher, archiver))
    }

    /// Replace the activity sink
    pub fn with_activity(mut self, activity: Arc<dyn ActivityLog>) -> Self {
        self.activity = activity;
        self
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Stage an inbound stream and store it encrypted
    pub async fn upload<R>(&self, owner_id: &str, filename: &str, reader: &mut R) -> Result<FileRecord>
    where
        R: AsyncRead + Unpin,
    {
        check_owner_id(owner_id)?;
        check_filename(filename)?;

        let staged = self.staging.stage_upload(filename, reader).await?;
        self.store_staged(owner_id, filename, staged).await
    }

    /// Encrypt an already staged upload and save its record.
    ///
    /// The staged plaintext is removed on every path. If the record cannot
    /// be saved the freshly written ciphertext is removed before the error
    /// is returned, so no blob is left without its key.
    pub async fn store_staged(&self, owner_id: &str, filename: &str, staged: StagingPath) -> Result<FileRecord> {
        let stored = self.encrypt_and_save(owner_id, filename, &staged).await;
        staged.release().await;

        let record = stored?;
        self.audit(owner_id, Action::Upload, Some(&record.id));
        Ok(record)
    }

    async fn encrypt_and_save(&self, owner_id: &str, filename: &str, staged: &StagingPath) -> Result<FileRecord> {
        check_owner_id(owner_id)?;
        check_filename(filename)?;

        let mut plaintext = match File::open(staged.path()).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("staged upload {:?}", staged.path())));
            }
            Err(e) => {
                return Err(Error::CipherIo(format!(
                    "failed to open staged upload {:?}: {}",
                    staged.path(),
                    e
                )));
            }
        };

        let material = KeyMaterial::generate()?;
        let blob = self.staging.reserve_encrypted_path(filename);
        let size = self.cipher.encrypt(&mut plaintext, blob.path(), &material).await?;
        drop(plaintext);

        let record = FileRecord::new(owner_id, filename, size, blob.path().to_path_buf(), &material);
        match self.store.create(record).await {
            Ok(saved) => {
                blob.persist();
                info!("Stored {} for {} as {} ({} bytes)", saved.filename, owner_id, saved.id, size);
                Ok(saved)
            }
            Err(e) => {
                warn!("Saving record for {:?} failed, discarding ciphertext: {}", blob.path(), e);
                blob.release().await;
                Err(e)
            }
        }
    }

    /// Fetch a record the caller owns
    pub async fn get(&self, caller_id: &str, file_id: &str) -> Result<FileRecord> {
        let record = self.authorized(caller_id, file_id).await?;
        self.audit(caller_id, Action::Get, Some(&record.id));
        Ok(record)
    }

    /// All records of an owner, oldest first
    pub async fn list(&self, owner_id: &str) -> Result<Vec<FileRecord>> {
        check_owner_id(owner_id)?;
        let records = self.store.find_by_owner(owner_id).await?;
        self.audit(owner_id, Action::List, None);
        Ok(records)
    }

    /// Decrypt a file the caller owns into a self-deleting plaintext copy.
    ///
    /// Ownership is checked before any blob is read.
    pub async fn open_download(&self, caller_id: &str, file_id: &str) -> Result<DecryptedFile> {
        let record = self.authorized(caller_id, file_id).await?;
        let material = record.key_material()?;

        let copy = self.staging.reserve_decrypted_path(&record.filename);
        let size = self
            .cipher
            .decrypt_with(&record.storage_path, copy.path(), &material)
            .await?;
        let file = EphemeralFile::open(copy).await?;

        debug!("Decrypted {} for {} ({} bytes)", record.id, caller_id, size);
        self.audit(caller_id, Action::Download, Some(&record.id));
        Ok(DecryptedFile { record, size, file })
    }

    /// Stream a decrypted file into `sink`, returning the byte count.
    ///
    /// The plaintext copy is removed whether or not streaming succeeds.
    pub async fn download_to<W>(&self, caller_id: &str, file_id: &str, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut download = self.open_download(caller_id, file_id).await?;
        let copied = async {
            let n = tokio::io::copy(&mut download, sink).await?;
            sink.flush().await?;
            Ok::<u64, io::Error>(n)
        }
        .await;
        drop(download);

        Ok(copied?)
    }

    /// Delete a file the caller owns, record first, then its blob
    pub async fn delete(&self, caller_id: &str, file_id: &str) -> Result<FileRecord> {
        let record = self.authorized(caller_id, file_id).await?;

        let removed = self
            .store
            .delete_by_id(&record.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("file {}", file_id)))?;
        self.release_blob(&removed).await;

        info!("Deleted {} ({}) of {}", removed.id, removed.filename, caller_id);
        self.audit(caller_id, Action::Delete, Some(&removed.id));
        Ok(removed)
    }

    /// Delete every file of an owner, returning how many were removed
    pub async fn delete_all_for_owner(&self, owner_id: &str) -> Result<usize> {
        check_owner_id(owner_id)?;

        let removed = self.store.delete_all_by_owner(owner_id).await?;
        for record in &removed {
            self.release_blob(record).await;
        }

        info!("Deleted all {} files of {}", removed.len(), owner_id);
        self.audit(owner_id, Action::DeleteAll, None);
        Ok(removed.len())
    }

    /// Archive every file of an owner into one readable ZIP stream
    pub async fn export(&self, owner_id: &str) -> Result<ArchiveStream> {
        check_owner_id(owner_id)?;

        let records = self.store.find_by_owner(owner_id).await?;
        let stream = self.archiver.build_export(&records).await?;

        self.audit(owner_id, Action::Export, None);
        Ok(stream)
    }

    /// Write an owner's export archive into `sink`, returning the byte count
    pub async fn export_to<W>(&self, owner_id: &str, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut stream = self.export(owner_id).await?;
        let n = tokio::io::copy(&mut stream, sink).await?;
        sink.flush().await?;
        Ok(n)
    }

    async fn authorized(&self, caller_id: &str, file_id: &str) -> Result<FileRecord> {
        check_owner_id(caller_id)?;

        let record = self
            .store
            .find_by_id(file_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("file {}", file_id)))?;

        if !record.is_owned_by(caller_id) {
            warn!("{} denied access to file {}", caller_id, file_id);
            return Err(Error::Forbidden(format!("file {} belongs to another owner", file_id)));
        }
        Ok(record)
    }

    /// Remove the blob of a deleted record, never touching anything outside the encrypted root
    async fn release_blob(&self, record: &FileRecord) {
        if !self.staging.contains(StagingClass::Encrypted, &record.storage_path) {
            warn!(
                "Record {} points outside the encrypted root ({:?}), leaving it in place",
                record.id, record.storage_path
            );
            return;
        }
        self.staging.release(&record.storage_path).await;
    }

    fn audit(&self, owner_id: &str, action: Action, file_id: Option<&str>) {
        self.activity.record(ActivityEntry {
            owner_id: owner_id.to_string(),
            action,
            file_id: file_id.map(str::to_string),
            at: Utc::now(),
        });
    }
}

/// Decrypted plaintext of one file, removed at EOF or on drop
#[derive(Debug)]
pub struct DecryptedFile {
    record: FileRecord,
    size: u64,
    file: EphemeralFile,
}

impl DecryptedFile {
    pub fn record(&self) -> &FileRecord {
        &self.record
    }

    /// Original filename to present to the caller
    pub fn filename(&self) -> &str {
        &self.record.filename
    }

    /// Plaintext size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl AsyncRead for DecryptedFile {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}

fn check_filename(filename: &str) -> Result<()> {
    if filename.trim().is_empty() {
        return Err(Error::Validation("filename is empty".to_string()));
    }
    if filename.contains('\0') {
        return Err(Error::Validation("filename contains NUL".to_string()));
    }
    if filename.len() > MAX_FILENAME_LEN {
        return Err(Error::Validation(format!(
            "filename longer than {} bytes",
            MAX_FILENAME_LEN
        )));
    }
    Ok(())
}

//! File records and the store that persists them
//!
//! A record is the only durable reference to the key material of its blob.
//! Record persistence itself belongs to an external collaborator; this module
//! defines the capability the vault needs from it and ships two
//! implementations: an in-memory store and a sled-backed one.

mod memory;
mod sled_store;

pub use memory::MemoryRecordStore;
pub use sled_store::SledRecordStore;

use crate::crypto::KeyMaterial;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Metadata of one encrypted file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    /// Original filename as supplied by the uploader
    pub filename: String,
    pub owner_id: String,
    /// Plaintext size in bytes
    pub size_bytes: u64,
    /// Location of the ciphertext blob
    pub storage_path: PathBuf,
    /// Hex-encoded 256-bit key
    pub encryption_key: String,
    /// Hex-encoded 128-bit IV
    pub iv: String,
    pub uploaded_at: DateTime<Utc>,
}

impl FileRecord {
    /// Build a record for a freshly encrypted blob
    pub fn new(
        owner_id: &str,
        filename: &str,
        size_bytes: u64,
        storage_path: PathBuf,
        material: &KeyMaterial,
    ) -> Self {
        FileRecord {
            id: Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            owner_id: owner_id.to_string(),
            size_bytes,
            storage_path,
            encryption_key: material.key_hex(),
            iv: material.iv_hex(),
            uploaded_at: Utc::now(),
        }
    }

    /// Parse the stored key material
    pub fn key_material(&self) -> Result<KeyMaterial> {
        KeyMaterial::from_hex(&self.encryption_key, &self.iv)
    }

    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner_id == owner_id
    }
}

/// Persistence capability for file records.
///
/// Implementations must be consistent per key: a record returned by
/// `create` is immediately visible to `find_by_id` and `find_by_owner`.
#[async_trait]
pub trait FileRecordStore: Send + Sync {
    /// Persist a new record
    async fn create(&self, record: FileRecord) -> Result<FileRecord>;

    async fn find_by_id(&self, id: &str) -> Result<Option<FileRecord>>;

    /// All records of an owner, oldest first
    async fn find_by_owner(&self, owner_id: &str) -> Result<Vec<FileRecord>>;

    /// Remove a record, returning it if it existed
    async fn delete_by_id(&self, id: &str) -> Result<Option<FileRecord>>;

    /// Remove every record of an owner, returning the removed records
    async fn delete_all_by_owner(&self, owner_id: &str) -> Result<Vec<FileRecord>>;
}

/// Owner ids are used as index prefixes and must be non-empty and NUL-free
pub(crate) fn check_owner_id(owner_id: &str) -> Result<()> {
    if owner_id.is_empty() || owner_id.contains('\0') {
        return Err(Error::Validation(format!("invalid owner id {:?}", owner_id)));
    }
    Ok(())
}

//! Sled-based record store
//!
//! Records are stored as JSON under their id. A second tree indexes records
//! by owner so listings come back in upload order:
//!
//! ```text
//! records: <id>                       -> {"seq": n, "record": {...}}
//! owners:  <owner_id> 0x00 <seq u64be> -> <id>
//! ```
//!
//! Both trees are written in one transaction, so a record is never visible
//! without its index entry or the reverse.

use crate::error::{Error, Result};
use crate::record::{check_owner_id, FileRecord, FileRecordStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionResult};
use sled::{Db, Transactional, Tree};
use std::path::Path;
use tracing::{debug, info};

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    seq: u64,
    record: FileRecord,
}

/// Durable record store using sled
pub struct SledRecordStore {
    db: Db,
    records: Tree,
    owners: Tree,
}

impl SledRecordStore {
    /// Open or create a store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let store = Self::from_db(db)?;
        info!("Record store opened at {:?}, {} records", path.as_ref(), store.records.len());
        Ok(store)
    }

    /// Create a temporary store (for testing)
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        let records = db.open_tree("records")?;
        let owners = db.open_tree("owners")?;
        Ok(SledRecordStore { db, records, owners })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn owner_prefix(owner_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(owner_id.len() + 1);
        key.extend_from_slice(owner_id.as_bytes());
        key.push(0);
        key
    }

    fn owner_key(owner_id: &str, seq: u64) -> Vec<u8> {
        let mut key = Self::owner_prefix(owner_id);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn load(&self, id: &[u8]) -> Result<Option<StoredRecord>> {
        match self.records.get(id)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    fn remove(&self, id: &[u8]) -> Result<Option<FileRecord>> {
        let result = (&self.records, &self.owners).transaction(|(records, owners)| {
            let Some(data) = records.remove(id)? else {
                return Ok(None);
            };
            let stored: StoredRecord = serde_json::from_slice(&data)
                .map_err(|e| ConflictableTransactionError::Abort(Error::from(e)))?;
            owners.remove(Self::owner_key(&stored.record.owner_id, stored.seq))?;
            Ok(Some(stored.record))
        });
        settle(result)
    }
}

fn settle<T>(result: TransactionResult<T, Error>) -> Result<T> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => Error::Database(e),
    })
}

#[async_trait]
impl FileRecordStore for SledRecordStore {
    async fn create(&self, record: FileRecord) -> Result<FileRecord> {
        check_owner_id(&record.owner_id)?;

        let seq = self.db.generate_id()?;
        let stored = StoredRecord {
            seq,
            record: record.clone(),
        };
        let value = serde_json::to_vec(&stored)?;

        let id = record.id.as_bytes();
        let owner_key = Self::owner_key(&record.owner_id, seq);

        let result = (&self.records, &self.owners).transaction(|(records, owners)| {
            if records.get(id)?.is_some() {
                return Err(ConflictableTransactionError::Abort(Error::Store(format!(
                    "duplicate record id {}",
                    record.id
                ))));
            }
            records.insert(id, value.as_slice())?;
            owners.insert(owner_key.as_slice(), id)?;
            Ok(())
        });
        settle(result)?;
        self.db.flush()?;

        debug!("Saved record {} ({})", record.id, record.filename);
        Ok(record)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<FileRecord>> {
        Ok(self.load(id.as_bytes())?.map(|stored| stored.record))
    }

    async fn find_by_owner(&self, owner_id: &str) -> Result<Vec<FileRecord>> {
        let mut found = Vec::new();
        for entry in self.owners.scan_prefix(Self::owner_prefix(owner_id)) {
            let (_, id) = entry?;
            if let Some(stored) = self.load(&id)? {
                found.push(stored.record);
            }
        }
        Ok(found)
    }

    async fn delete_by_id(&self, id: &str) -> Result<Option<FileRecord>> {
        let removed = self.remove(id.as_bytes())?;
        if removed.is_some() {
            self.db.flush()?;
            debug!("Deleted record {}", id);
        }
        Ok(removed)
    }

    async fn delete_all_by_owner(&self, owner_id: &str) -> Result<Vec<FileRecord>> {
        let ids: Vec<sled::IVec> = self
            .owners
            .scan_prefix(Self::owner_prefix(owner_id))
            .values()
            .collect::<std::result::Result<_, _>>()?;

        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.remove(&id)? {
                removed.push(record);
            }
        }
        self.db.flush()?;

        debug!("Deleted {} records of owner {}", removed.len(), owner_id);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyMaterial;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn record(owner: &str, name: &str) -> FileRecord {
        let material = KeyMaterial::generate().unwrap();
        FileRecord::new(owner, name, 7, PathBuf::from(format!("/blobs/{}", name)), &material)
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let store = SledRecordStore::temporary().unwrap();
        let saved = store.create(record("U1", "a.txt")).await.unwrap();

        assert_eq!(store.find_by_id(&saved.id).await.unwrap(), Some(saved));
        assert_eq!(store.find_by_id("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = SledRecordStore::temporary().unwrap();
        let r = record("U1", "a.txt");
        store.create(r.clone()).await.unwrap();

        assert!(matches!(store.create(r).await, Err(Error::Store(_))));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_leaves_no_index_entry() {
        let store = SledRecordStore::temporary().unwrap();
        let original = store.create(record("U1", "a.txt")).await.unwrap();

        let mut clash = record("U2", "b.txt");
        clash.id = original.id.clone();
        assert!(matches!(store.create(clash).await, Err(Error::Store(_))));

        assert!(store.find_by_owner("U2").await.unwrap().is_empty());
        assert_eq!(store.owners.len(), 1);
        assert_eq!(store.find_by_id(&original.id).await.unwrap(), Some(original));
    }

    #[tokio::test]
    async fn test_owner_prefix_does_not_leak() {
        let store = SledRecordStore::temporary().unwrap();
        store.create(record("U1", "a.txt")).await.unwrap();
        store.create(record("U10", "b.txt")).await.unwrap();
        store.create(record("U1", "c.txt")).await.unwrap();

        let names: Vec<String> = store
            .find_by_owner("U1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.filename)
            .collect();
        assert_eq!(names, vec!["a.txt", "c.txt"]);
    }

    #[tokio::test]
    async fn test_delete_maintains_index() {
        let store = SledRecordStore::temporary().unwrap();
        let a = store.create(record("U1", "a.txt")).await.unwrap();
        store.create(record("U1", "b.txt")).await.unwrap();
        store.create(record("U2", "c.txt")).await.unwrap();

        assert_eq!(store.delete_by_id(&a.id).await.unwrap(), Some(a.clone()));
        assert_eq!(store.find_by_owner("U1").await.unwrap().len(), 1);

        let removed = store.delete_all_by_owner("U1").await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(store.find_by_owner("U1").await.unwrap().is_empty());
        assert_eq!(store.find_by_owner("U2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_persists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("records.db");

        let saved = {
            let store = SledRecordStore::open(&path).unwrap();
            store.create(record("U1", "a.txt")).await.unwrap()
        };

        let store = SledRecordStore::open(&path).unwrap();
        assert_eq!(store.find_by_id(&saved.id).await.unwrap(), Some(saved));
    }
}

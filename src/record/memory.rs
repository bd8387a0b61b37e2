//! In-memory record store

use crate::error::{Error, Result};
use crate::record::{check_owner_id, FileRecord, FileRecordStore};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct Inner {
    next_seq: u64,
    /// Insertion order -> record
    records: BTreeMap<u64, FileRecord>,
    /// Record id -> insertion order
    ids: HashMap<String, u64>,
}

/// Record store kept entirely in memory
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: RwLock<Inner>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FileRecordStore for MemoryRecordStore {
    async fn create(&self, record: FileRecord) -> Result<FileRecord> {
        check_owner_id(&record.owner_id)?;
        let mut inner = self.inner.write();

        if inner.ids.contains_key(&record.id) {
            return Err(Error::Store(format!("duplicate record id {}", record.id)));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.ids.insert(record.id.clone(), seq);
        inner.records.insert(seq, record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<FileRecord>> {
        let inner = self.inner.read();
        Ok(inner
            .ids
            .get(id)
            .and_then(|seq| inner.records.get(seq))
            .cloned())
    }

    async fn find_by_owner(&self, owner_id: &str) -> Result<Vec<FileRecord>> {
        let inner = self.inner.read();
        Ok(inner
            .records
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn delete_by_id(&self, id: &str) -> Result<Option<FileRecord>> {
        let mut inner = self.inner.write();
        Ok(match inner.ids.remove(id) {
            Some(seq) => inner.records.remove(&seq),
            None => None,
        })
    }

    async fn delete_all_by_owner(&self, owner_id: &str) -> Result<Vec<FileRecord>> {
        let mut inner = self.inner.write();
        let seqs: Vec<u64> = inner
            .records
            .iter()
            .filter(|(_, r)| r.owner_id == owner_id)
            .map(|(seq, _)| *seq)
            .collect();

        let mut removed = Vec::with_capacity(seqs.len());
        for seq in seqs {
            if let Some(record) = inner.records.remove(&seq) {
                inner.ids.remove(&record.id);
                removed.push(record);
            }
        }
        Ok(removed)
    }
}

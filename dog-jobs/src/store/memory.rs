use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{StoreError, StoreResult};
use crate::store::{FindOptions, JobFilter, JobPatch, JobStore};
use crate::types::{JobId, JobRecord};

struct Document {
    /// Insertion sequence, the final tie-breaker for equal sort keys
    seq: u64,
    record: JobRecord,
}

/// Plain in-memory document collection shared by the memory and file stores.
#[derive(Default)]
pub(crate) struct Collection {
    docs: HashMap<JobId, Document>,
    next_seq: u64,
}

impl Collection {
    pub(crate) fn find(&self, filter: &JobFilter, options: &FindOptions) -> Vec<JobRecord> {
        let mut matched: Vec<&Document> = self
            .docs
            .values()
            .filter(|doc| filter.matches(&doc.record))
            .collect();

        matched.sort_by(|a, b| {
            options
                .compare(&a.record, &b.record)
                .then(a.seq.cmp(&b.seq))
        });

        let limit = options.limit.unwrap_or(usize::MAX);
        matched
            .into_iter()
            .take(limit)
            .map(|doc| doc.record.clone())
            .collect()
    }

    pub(crate) fn find_one(&self, id: &JobId) -> Option<JobRecord> {
        self.docs.get(id).map(|doc| doc.record.clone())
    }

    pub(crate) fn count(&self, filter: &JobFilter) -> u64 {
        self.docs
            .values()
            .filter(|doc| filter.matches(&doc.record))
            .count() as u64
    }

    pub(crate) fn contains(&self, id: &JobId) -> bool {
        self.docs.contains_key(id)
    }

    pub(crate) fn insert(&mut self, record: JobRecord) -> StoreResult<()> {
        if self.contains(&record.id) {
            return Err(StoreError::DuplicateId(record.id));
        }
        self.upsert(record);
        Ok(())
    }

    /// Insert or replace without the duplicate check, keeping the original
    /// sequence number of a replaced document.
    pub(crate) fn upsert(&mut self, record: JobRecord) {
        match self.docs.get_mut(&record.id) {
            Some(doc) => doc.record = record,
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.docs.insert(record.id.clone(), Document { seq, record });
            }
        }
    }

    /// Returns the updated records
    pub(crate) fn update(&mut self, filter: &JobFilter, patch: &JobPatch) -> Vec<JobRecord> {
        let mut updated = Vec::new();
        for doc in self.docs.values_mut() {
            if filter.matches(&doc.record) {
                patch.apply(&mut doc.record);
                updated.push(doc.record.clone());
            }
        }
        updated
    }

    /// Copies of the matching records with `patch` applied. The collection
    /// itself is left untouched.
    pub(crate) fn patched(&self, filter: &JobFilter, patch: &JobPatch) -> Vec<JobRecord> {
        self.docs
            .values()
            .filter(|doc| filter.matches(&doc.record))
            .map(|doc| {
                let mut record = doc.record.clone();
                patch.apply(&mut record);
                record
            })
            .collect()
    }

    pub(crate) fn matching_ids(&self, filter: &JobFilter) -> Vec<JobId> {
        self.docs
            .values()
            .filter(|doc| filter.matches(&doc.record))
            .map(|doc| doc.record.id.clone())
            .collect()
    }

    /// Returns the ids of the removed records
    pub(crate) fn remove(&mut self, filter: &JobFilter) -> Vec<JobId> {
        let ids = self.matching_ids(filter);
        for id in &ids {
            self.docs.remove(id);
        }
        ids
    }

    pub(crate) fn delete(&mut self, id: &JobId) {
        self.docs.remove(id);
    }

    /// All records in insertion order
    pub(crate) fn records(&self) -> Vec<JobRecord> {
        let mut docs: Vec<&Document> = self.docs.values().collect();
        docs.sort_by_key(|doc| doc.seq);
        docs.into_iter().map(|doc| doc.record.clone()).collect()
    }

    pub(crate) fn clear(&mut self) {
        self.docs.clear();
        self.next_seq = 0;
    }
}

/// In-memory store for tests and ephemeral queues
#[derive(Clone, Default)]
pub struct MemoryStore {
    collection: Arc<RwLock<Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.collection.read().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn init(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn find(&self, filter: &JobFilter, options: &FindOptions) -> StoreResult<Vec<JobRecord>> {
        Ok(self.collection.read().find(filter, options))
    }

    async fn find_one(&self, id: &JobId) -> StoreResult<Option<JobRecord>> {
        Ok(self.collection.read().find_one(id))
    }

    async fn count(&self, filter: &JobFilter) -> StoreResult<u64> {
        Ok(self.collection.read().count(filter))
    }

    async fn insert(&self, record: JobRecord) -> StoreResult<JobRecord> {
        self.collection.write().insert(record.clone())?;
        Ok(record)
    }

    async fn update(&self, filter: &JobFilter, patch: &JobPatch) -> StoreResult<u64> {
        Ok(self.collection.write().update(filter, patch).len() as u64)
    }

    async fn remove(&self, filter: &JobFilter) -> StoreResult<u64> {
        Ok(self.collection.write().remove(filter).len() as u64)
    }
}

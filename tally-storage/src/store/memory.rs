//! In-memory backing store and record.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tally_core::{FieldValue, RecordId, StorageError, TallyResult, TypeTag};

use super::{BackingStore, Record};

/// A record held as a field map with dirty tracking.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRecord {
    id: RecordId,
    fields: BTreeMap<String, FieldValue>,
    dirty: BTreeSet<String>,
}

impl MemoryRecord {
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Builder-style field initialisation; does not mark the field dirty.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }
}

impl Record for MemoryRecord {
    fn id(&self) -> RecordId {
        self.id.clone()
    }

    fn get(&self, field: &str) -> TallyResult<FieldValue> {
        self.fields.get(field).cloned().ok_or_else(|| {
            StorageError::FieldAccess {
                record: self.id.to_string(),
                field: field.to_string(),
                reason: "no such field".to_string(),
            }
            .into()
        })
    }

    fn set(&mut self, field: &str, value: FieldValue) {
        if self.fields.get(field) != Some(&value) {
            self.dirty.insert(field.to_string());
        }
        self.fields.insert(field.to_string(), value);
    }

    fn dirty_fields(&self) -> Vec<String> {
        self.dirty.iter().cloned().collect()
    }

    fn field_names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    fn mark_clean(&mut self) {
        self.dirty.clear();
    }
}

/// DashMap-backed [`BackingStore`] with save counting and failure injection.
#[derive(Debug, Default)]
pub struct InMemoryBackingStore {
    records: DashMap<(TypeTag, RecordId), MemoryRecord>,
    save_count: AtomicU64,
    failing_saves: AtomicU64,
}

impl InMemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record directly, bypassing save accounting.
    pub fn insert(&self, type_tag: impl Into<TypeTag>, mut record: MemoryRecord) {
        record.mark_clean();
        self.records
            .insert((type_tag.into(), record.id.clone()), record);
    }

    pub fn remove(&self, type_tag: &TypeTag, id: &RecordId) -> Option<MemoryRecord> {
        self.records
            .remove(&(type_tag.clone(), id.clone()))
            .map(|(_, record)| record)
    }

    /// Current persisted copy of a record.
    pub fn snapshot(&self, type_tag: &TypeTag, id: &RecordId) -> Option<MemoryRecord> {
        self.records
            .get(&(type_tag.clone(), id.clone()))
            .map(|r| r.value().clone())
    }

    /// Current persisted value of one field.
    pub fn value(&self, type_tag: &TypeTag, id: &RecordId, field: &str) -> Option<FieldValue> {
        self.snapshot(type_tag, id)
            .and_then(|r| r.fields.get(field).cloned())
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> u64 {
        self.save_count.load(Ordering::SeqCst)
    }

    /// Make the next `n` saves fail with `SaveFailed`.
    pub fn fail_next_saves(&self, n: u64) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BackingStore for InMemoryBackingStore {
    type Record = MemoryRecord;

    async fn find_by_id(
        &self,
        type_tag: &TypeTag,
        id: &RecordId,
    ) -> TallyResult<Option<MemoryRecord>> {
        Ok(self.snapshot(type_tag, id))
    }

    async fn save(&self, type_tag: &TypeTag, record: &mut MemoryRecord) -> TallyResult<()> {
        if self.take_failure() {
            return Err(StorageError::SaveFailed {
                record: format!("{}:{}", type_tag, record.id),
                reason: "injected failure".to_string(),
            }
            .into());
        }
        record.mark_clean();
        self.records
            .insert((type_tag.clone(), record.id.clone()), record.clone());
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

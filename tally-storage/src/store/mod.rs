//! Backing store abstraction.
//!
//! The backing store is the persistent engine behind the cache (a SQL table,
//! a document collection). Only two operations are needed: look a record up
//! by id and save it. Records expose their fields by name and track which
//! ones changed since they were loaded.

pub mod memory;

pub use memory::{InMemoryBackingStore, MemoryRecord};

use async_trait::async_trait;
use tally_core::{FieldValue, RecordId, TallyResult, TypeTag};

/// A persisted record with named fields and dirty tracking.
pub trait Record: Clone + Send + Sync + 'static {
    /// Identity of the record within its type.
    fn id(&self) -> RecordId;

    /// Read a field. Unknown fields are a `FieldAccess` error; a stored null
    /// comes back as [`FieldValue::Null`].
    fn get(&self, field: &str) -> TallyResult<FieldValue>;

    /// Stage a new value. Marks the field dirty when the value changes.
    fn set(&mut self, field: &str, value: FieldValue);

    fn is_dirty(&self) -> bool {
        !self.dirty_fields().is_empty()
    }

    fn dirty_fields(&self) -> Vec<String>;

    fn field_names(&self) -> Vec<String>;

    /// Forget staged changes after a successful save.
    fn mark_clean(&mut self);
}

/// Persistent store of records.
///
/// Not-found is `Ok(None)`; only I/O failures are errors.
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    type Record: Record;

    async fn find_by_id(
        &self,
        type_tag: &TypeTag,
        id: &RecordId,
    ) -> TallyResult<Option<Self::Record>>;

    /// Persist the record's dirty fields. The record is marked clean on success.
    async fn save(&self, type_tag: &TypeTag, record: &mut Self::Record) -> TallyResult<()>;
}

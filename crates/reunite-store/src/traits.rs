use reunite_core::{Descriptor, MissingChildRecord, RecordId, RegistryEntry};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record {0} already has a registered descriptor")]
    DuplicateEntry(RecordId),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("descriptor encryption: {0}")]
    Crypto(String),
    #[error("unreadable registry entry for {record_id}: {reason}")]
    Corrupt { record_id: RecordId, reason: String },
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::DuplicateEntry(_))
    }
}

/// Keyed table of face descriptors, at most one per missing-child record.
///
/// Implementations are shared between threads. `put` must resolve the
/// duplicate check atomically; `all` returns a snapshot taken at call time.
pub trait DescriptorStore: Send + Sync {
    /// Insert a descriptor, failing with [`StoreError::DuplicateEntry`] if the
    /// record already has one. The existing entry is left untouched.
    fn put(&self, record_id: &RecordId, descriptor: &Descriptor) -> Result<RegistryEntry, StoreError>;

    fn get(&self, record_id: &RecordId) -> Result<Option<RegistryEntry>, StoreError>;

    /// Snapshot of every entry, in no particular order.
    fn all(&self) -> Result<Vec<RegistryEntry>, StoreError>;

    /// Remove the record's entry. Returns whether one existed; never fails on absence.
    fn remove(&self, record_id: &RecordId) -> Result<bool, StoreError>;

    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

/// Read view of the missing-child records owned by the CRUD layer.
pub trait RecordDirectory: Send + Sync {
    fn lookup(&self, id: &RecordId) -> Result<Option<MissingChildRecord>, StoreError>;

    /// Case-insensitive exact match on the full name.
    fn find_by_name(&self, full_name: &str) -> Result<Vec<MissingChildRecord>, StoreError>;
}

impl<T: DescriptorStore + ?Sized> DescriptorStore for Arc<T> {
    fn put(&self, record_id: &RecordId, descriptor: &Descriptor) -> Result<RegistryEntry, StoreError> {
        (**self).put(record_id, descriptor)
    }

    fn get(&self, record_id: &RecordId) -> Result<Option<RegistryEntry>, StoreError> {
        (**self).get(record_id)
    }

    fn all(&self) -> Result<Vec<RegistryEntry>, StoreError> {
        (**self).all()
    }

    fn remove(&self, record_id: &RecordId) -> Result<bool, StoreError> {
        (**self).remove(record_id)
    }

    fn len(&self) -> Result<usize, StoreError> {
        (**self).len()
    }
}

impl<T: RecordDirectory + ?Sized> RecordDirectory for Arc<T> {
    fn lookup(&self, id: &RecordId) -> Result<Option<MissingChildRecord>, StoreError> {
        (**self).lookup(id)
    }

    fn find_by_name(&self, full_name: &str) -> Result<Vec<MissingChildRecord>, StoreError> {
        (**self).find_by_name(full_name)
    }
}

/// Name key used for case-insensitive exact matching.
pub(crate) fn name_key(full_name: &str) -> String {
    full_name.trim().to_lowercase()
}

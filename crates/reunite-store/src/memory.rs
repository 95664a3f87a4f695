//! In-process implementations, used by tests and single-process deployments.

use crate::traits::{name_key, DescriptorStore, RecordDirectory, StoreError};
use reunite_core::{Descriptor, MissingChildRecord, RecordId, RegistryEntry};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::warn!("registry lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::warn!("registry lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Descriptor store backed by a `HashMap` behind a single `RwLock`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<RecordId, RegistryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DescriptorStore for MemoryStore {
    fn put(&self, record_id: &RecordId, descriptor: &Descriptor) -> Result<RegistryEntry, StoreError> {
        match write(&self.entries).entry(record_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateEntry(record_id.clone())),
            Entry::Vacant(slot) => {
                let entry = RegistryEntry::new(record_id.clone(), descriptor.clone());
                slot.insert(entry.clone());
                Ok(entry)
            }
        }
    }

    fn get(&self, record_id: &RecordId) -> Result<Option<RegistryEntry>, StoreError> {
        Ok(read(&self.entries).get(record_id).cloned())
    }

    fn all(&self) -> Result<Vec<RegistryEntry>, StoreError> {
        Ok(read(&self.entries).values().cloned().collect())
    }

    fn remove(&self, record_id: &RecordId) -> Result<bool, StoreError> {
        Ok(write(&self.entries).remove(record_id).is_some())
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(read(&self.entries).len())
    }
}

/// Record directory held in memory.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    records: RwLock<HashMap<RecordId, MissingChildRecord>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, record: &MissingChildRecord) -> Result<(), StoreError> {
        write(&self.records).insert(record.id.clone(), record.clone());
        Ok(())
    }

    pub fn delete(&self, id: &RecordId) -> Result<bool, StoreError> {
        Ok(write(&self.records).remove(id).is_some())
    }
}

impl RecordDirectory for MemoryDirectory {
    fn lookup(&self, id: &RecordId) -> Result<Option<MissingChildRecord>, StoreError> {
        Ok(read(&self.records).get(id).cloned())
    }

    fn find_by_name(&self, full_name: &str) -> Result<Vec<MissingChildRecord>, StoreError> {
        let key = name_key(full_name);
        let mut found: Vec<MissingChildRecord> = read(&self.records)
            .values()
            .filter(|r| name_key(&r.full_name) == key)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::contract;

    #[test]
    fn test_duplicate_put_keeps_first() {
        contract::duplicate_put_keeps_first(&MemoryStore::new());
    }

    #[test]
    fn test_remove_is_idempotent() {
        contract::remove_is_idempotent(&MemoryStore::new());
    }

    #[test]
    fn test_all_is_a_restartable_snapshot() {
        contract::all_is_a_restartable_snapshot(&MemoryStore::new());
    }

    #[test]
    fn test_concurrent_same_key_puts_admit_one() {
        contract::concurrent_same_key_puts_admit_one(&MemoryStore::new());
    }

    #[test]
    fn test_concurrent_distinct_keys_all_land() {
        contract::concurrent_distinct_keys_all_land(&MemoryStore::new());
    }

    #[test]
    fn test_directory_name_lookup_ignores_case() {
        let dir = MemoryDirectory::new();
        dir.upsert(&MissingChildRecord {
            id: RecordId::new("child-1"),
            full_name: "Asha Verma".into(),
            guardian_contact: Some("+91 98765 43210".into()),
        })
        .unwrap();
        dir.upsert(&MissingChildRecord {
            id: RecordId::new("child-2"),
            full_name: "Ravi Kumar".into(),
            guardian_contact: None,
        })
        .unwrap();

        let found = dir.find_by_name("  asha VERMA ").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.as_str(), "child-1");
        assert!(dir.find_by_name("Asha").unwrap().is_empty());

        assert!(dir.delete(&RecordId::new("child-1")).unwrap());
        assert!(!dir.delete(&RecordId::new("child-1")).unwrap());
        assert!(dir.lookup(&RecordId::new("child-1")).unwrap().is_none());
    }
}

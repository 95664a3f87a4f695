//! SQLite-backed descriptor store and record directory.
//!
//! One row per registry entry. The `UNIQUE` constraint on `record_id` makes
//! the duplicate check atomic; the connection is shared behind a mutex.

use crate::cipher::DescriptorCipher;
use crate::traits::{name_key, DescriptorStore, RecordDirectory, StoreError};
use chrono::{DateTime, Utc};
use reunite_core::{Descriptor, MissingChildRecord, RecordId, RegistryEntry};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const REGISTRY_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS registry_entries (
    entry_id      TEXT PRIMARY KEY,
    record_id     TEXT NOT NULL UNIQUE,
    model_version TEXT NOT NULL,
    dimension     INTEGER NOT NULL,
    descriptor    BLOB NOT NULL,
    sealed        INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL
);";

const DIRECTORY_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS missing_children (
    record_id        TEXT PRIMARY KEY,
    full_name        TEXT NOT NULL,
    name_key         TEXT NOT NULL,
    guardian_contact TEXT
);
CREATE INDEX IF NOT EXISTS missing_children_name_key ON missing_children (name_key);";

const ENTRY_COLUMNS: &str =
    "entry_id, record_id, model_version, dimension, descriptor, sealed, created_at";

/// Acquire the connection, recovering from a poisoned mutex.
fn acquire_lock(mutex: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("SQLite mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// WAL for concurrent readers, NORMAL sync, 5 s busy timeout.
fn configure_connection(conn: &Connection) -> Result<(), StoreError> {
    // journal_mode returns a row, so it goes through pragma_update rather than execute_batch.
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    Ok(())
}

fn open_file(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    configure_connection(&conn)?;
    Ok(conn)
}

/// Raw column values of one `registry_entries` row.
struct EntryRow {
    entry_id: String,
    record_id: String,
    model_version: String,
    dimension: i64,
    descriptor: Vec<u8>,
    sealed: bool,
    created_at: String,
}

impl EntryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entry_id: row.get(0)?,
            record_id: row.get(1)?,
            model_version: row.get(2)?,
            dimension: row.get(3)?,
            descriptor: row.get(4)?,
            sealed: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    cipher: Option<DescriptorCipher>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let store = Self::from_connection(open_file(path)?)?;
        tracing::info!(path = %path.display(), "descriptor store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(REGISTRY_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            cipher: None,
        })
    }

    /// Seal descriptor blobs written from now on. Existing plain rows stay readable.
    pub fn with_cipher(mut self, cipher: DescriptorCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    fn decode(&self, row: EntryRow) -> Result<RegistryEntry, String> {
        let bytes = match (row.sealed, &self.cipher) {
            (false, _) => row.descriptor,
            (true, Some(cipher)) => cipher.open(&row.descriptor).map_err(|e| e.to_string())?,
            (true, None) => return Err("row is sealed but no encryption key is configured".into()),
        };
        let dimension = usize::try_from(row.dimension).map_err(|_| "negative dimension".to_string())?;
        let descriptor = Descriptor::from_le_bytes(&bytes, dimension, row.model_version)
            .map_err(|e| e.to_string())?;
        let entry_id = Uuid::parse_str(&row.entry_id).map_err(|e| format!("entry_id: {e}"))?;
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| format!("created_at: {e}"))?
            .with_timezone(&Utc);

        Ok(RegistryEntry {
            entry_id,
            record_id: RecordId::new(row.record_id),
            descriptor,
            created_at,
        })
    }
}

impl DescriptorStore for SqliteStore {
    fn put(&self, record_id: &RecordId, descriptor: &Descriptor) -> Result<RegistryEntry, StoreError> {
        let entry = RegistryEntry::new(record_id.clone(), descriptor.clone());
        let plain = descriptor.to_le_bytes();
        let (blob, sealed) = match &self.cipher {
            Some(cipher) => (cipher.seal(&plain)?, true),
            None => (plain, false),
        };

        let conn = acquire_lock(&self.conn);
        let inserted = conn.execute(
            &format!("INSERT INTO registry_entries ({ENTRY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                entry.entry_id.to_string(),
                record_id.as_str(),
                descriptor.model_version(),
                descriptor.dimension() as i64,
                blob,
                sealed,
                entry.created_at.to_rfc3339(),
            ],
        );

        match inserted {
            Ok(_) => Ok(entry),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::DuplicateEntry(record_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, record_id: &RecordId) -> Result<Option<RegistryEntry>, StoreError> {
        let row = {
            let conn = acquire_lock(&self.conn);
            conn.query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM registry_entries WHERE record_id = ?1"),
                params![record_id.as_str()],
                EntryRow::from_row,
            )
            .optional()?
        };

        match row {
            None => Ok(None),
            Some(row) => self
                .decode(row)
                .map(Some)
                .map_err(|reason| StoreError::Corrupt {
                    record_id: record_id.clone(),
                    reason,
                }),
        }
    }

    fn all(&self) -> Result<Vec<RegistryEntry>, StoreError> {
        let rows = {
            let conn = acquire_lock(&self.conn);
            let mut stmt = conn.prepare(&format!("SELECT {ENTRY_COLUMNS} FROM registry_entries"))?;
            let rows = stmt
                .query_map([], EntryRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        // A single unreadable row must not take the whole registry down.
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let record_id = row.record_id.clone();
            match self.decode(row) {
                Ok(entry) => entries.push(entry),
                Err(reason) => {
                    tracing::error!(record_id = %record_id, reason = %reason, "skipping unreadable registry row");
                }
            }
        }
        Ok(entries)
    }

    fn remove(&self, record_id: &RecordId) -> Result<bool, StoreError> {
        let conn = acquire_lock(&self.conn);
        let removed = conn.execute(
            "DELETE FROM registry_entries WHERE record_id = ?1",
            params![record_id.as_str()],
        )?;
        Ok(removed > 0)
    }

    fn len(&self) -> Result<usize, StoreError> {
        let conn = acquire_lock(&self.conn);
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM registry_entries", [], |r| r.get(0))?;
        Ok(count as usize)
    }
}

/// Missing-child records kept next to the registry, for stand-alone use.
pub struct SqliteDirectory {
    conn: Mutex<Connection>,
}

impl SqliteDirectory {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::from_connection(open_file(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(DIRECTORY_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn upsert(&self, record: &MissingChildRecord) -> Result<(), StoreError> {
        let conn = acquire_lock(&self.conn);
        conn.execute(
            "INSERT INTO missing_children (record_id, full_name, name_key, guardian_contact)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(record_id) DO UPDATE SET
                full_name = excluded.full_name,
                name_key = excluded.name_key,
                guardian_contact = excluded.guardian_contact",
            params![
                record.id.as_str(),
                record.full_name,
                name_key(&record.full_name),
                record.guardian_contact,
            ],
        )?;
        Ok(())
    }

    pub fn delete(&self, id: &RecordId) -> Result<bool, StoreError> {
        let conn = acquire_lock(&self.conn);
        let removed = conn.execute(
            "DELETE FROM missing_children WHERE record_id = ?1",
            params![id.as_str()],
        )?;
        Ok(removed > 0)
    }

    fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MissingChildRecord> {
        Ok(MissingChildRecord {
            id: RecordId::new(row.get::<_, String>(0)?),
            full_name: row.get(1)?,
            guardian_contact: row.get(2)?,
        })
    }
}

impl RecordDirectory for SqliteDirectory {
    fn lookup(&self, id: &RecordId) -> Result<Option<MissingChildRecord>, StoreError> {
        let conn = acquire_lock(&self.conn);
        let record = conn
            .query_row(
                "SELECT record_id, full_name, guardian_contact FROM missing_children WHERE record_id = ?1",
                params![id.as_str()],
                Self::record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn find_by_name(&self, full_name: &str) -> Result<Vec<MissingChildRecord>, StoreError> {
        let conn = acquire_lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT record_id, full_name, guardian_contact FROM missing_children
             WHERE name_key = ?1 ORDER BY record_id",
        )?;
        let records = stmt
            .query_map(params![name_key(full_name)], Self::record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::contract;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_duplicate_put_keeps_first() {
        contract::duplicate_put_keeps_first(&store());
    }

    #[test]
    fn test_remove_is_idempotent() {
        contract::remove_is_idempotent(&store());
    }

    #[test]
    fn test_all_is_a_restartable_snapshot() {
        contract::all_is_a_restartable_snapshot(&store());
    }

    #[test]
    fn test_concurrent_same_key_puts_admit_one() {
        contract::concurrent_same_key_puts_admit_one(&store());
    }

    #[test]
    fn test_concurrent_distinct_keys_all_land() {
        contract::concurrent_distinct_keys_all_land(&store());
    }

    #[test]
    fn test_sealed_rows_roundtrip_and_are_not_plaintext() {
        let store = store().with_cipher(DescriptorCipher::from_secret(b"secret"));
        let id = RecordId::new("child-1");
        let descriptor = contract::descriptor(&[0.5, -0.25]);
        store.put(&id, &descriptor).unwrap();

        let raw: Vec<u8> = acquire_lock(&store.conn)
            .query_row("SELECT descriptor FROM registry_entries", [], |r| r.get(0))
            .unwrap();
        assert_ne!(raw, descriptor.to_le_bytes());

        let entry = store.get(&id).unwrap().unwrap();
        assert_eq!(entry.descriptor, descriptor);
    }

    #[test]
    fn test_unreadable_rows_are_skipped_by_all() {
        let store = store();
        store.put(&RecordId::new("good"), &contract::descriptor(&[1.0, 1.0])).unwrap();
        acquire_lock(&store.conn)
            .execute(
                "INSERT INTO registry_entries (entry_id, record_id, model_version, dimension, descriptor, sealed, created_at)
                 VALUES ('x', 'bad', 'm1', 2, X'0000', 0, '2024-01-01T00:00:00Z')",
                [],
            )
            .unwrap();

        let all = store.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].record_id.as_str(), "good");
    }

    #[test]
    fn test_huge_declared_dimension_is_skipped_by_all() {
        let store = store();
        store.put(&RecordId::new("good"), &contract::descriptor(&[1.0, 1.0])).unwrap();
        acquire_lock(&store.conn)
            .execute(
                "INSERT INTO registry_entries (entry_id, record_id, model_version, dimension, descriptor, sealed, created_at)
                 VALUES ('y', 'huge', 'm1', 9223372036854775807, X'00000000', 0, '2024-01-01T00:00:00Z')",
                [],
            )
            .unwrap();

        let all = store.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].record_id.as_str(), "good");
        assert!(matches!(
            store.get(&RecordId::new("huge")),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_sealed_row_without_key_is_skipped() {
        let sealed_store = store().with_cipher(DescriptorCipher::from_secret(b"secret"));
        sealed_store.put(&RecordId::new("c"), &contract::descriptor(&[1.0, 0.0])).unwrap();
        let SqliteStore { conn, .. } = sealed_store;
        let plain_store = SqliteStore { conn, cipher: None };
        assert!(plain_store.all().unwrap().is_empty());
        assert!(plain_store.get(&RecordId::new("c")).is_err());
    }

    #[test]
    fn test_store_persists_across_reopen() {
        let dir = std::env::temp_dir().join(format!("reunite-store-{}", std::process::id()));
        let path = dir.join("registry.db");
        let _ = std::fs::remove_dir_all(&dir);
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put(&RecordId::new("child-9"), &contract::descriptor(&[0.1, 0.2])).unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        let entry = reopened.get(&RecordId::new("child-9")).unwrap().unwrap();
        assert_eq!(entry.descriptor.values(), &[0.1, 0.2]);
        drop(reopened);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_directory_upsert_and_name_search() {
        let dir = SqliteDirectory::open_in_memory().unwrap();
        let mut record = MissingChildRecord {
            id: RecordId::new("child-1"),
            full_name: "Asha Verma".into(),
            guardian_contact: None,
        };
        dir.upsert(&record).unwrap();
        record.guardian_contact = Some("parent@example.org".into());
        dir.upsert(&record).unwrap();

        let found = dir.find_by_name("ASHA verma").unwrap();
        assert_eq!(found, vec![record.clone()]);
        assert_eq!(dir.lookup(&record.id).unwrap(), Some(record.clone()));

        assert!(dir.delete(&record.id).unwrap());
        assert!(!dir.delete(&record.id).unwrap());
        assert!(dir.lookup(&record.id).unwrap().is_none());
    }
}

use std::io::Write;
use std::path::Path;

use rusqlite::{Connection, DatabaseName, OpenFlags};
use tracing::{debug, info};

use crate::db::Database;
use crate::error::{StorageError, StorageResult};

const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// Whether the file at `path` is a readable SQLite database holding heft tables.
/// Opened read-only, so probing never modifies the candidate.
pub(crate) fn is_store(path: &Path) -> StorageResult<bool> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|source| StorageError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let found: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'weight_entries')",
        [],
        |row| row.get(0),
    )?;
    Ok(found)
}

impl Database {
    /// Serialize the whole store to the bytes of a standalone database file.
    pub fn export_snapshot(&self) -> StorageResult<Vec<u8>> {
        let tmp = tempfile::NamedTempFile::new()?;
        self.conn.backup(DatabaseName::Main, tmp.path(), None)?;
        let bytes = std::fs::read(tmp.path())?;
        debug!(bytes = bytes.len(), "exported snapshot");
        Ok(bytes)
    }

    /// Write a snapshot straight to `path`, replacing anything there.
    pub fn export_snapshot_to(&self, path: &Path) -> StorageResult<()> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        self.conn.backup(DatabaseName::Main, path, None)?;
        Ok(())
    }

    /// Replace the entire store with `bytes`, then bring the result up to the
    /// current schema. Invalid input leaves the store untouched.
    pub fn import_snapshot(&mut self, bytes: &[u8]) -> StorageResult<()> {
        if bytes.len() < 100 || !bytes.starts_with(SQLITE_HEADER) {
            return Err(StorageError::InvalidSnapshot(
                "data is not a SQLite database".to_string(),
            ));
        }

        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(bytes)?;
        tmp.flush()?;

        match is_store(tmp.path()) {
            Ok(true) => {}
            Ok(false) => {
                return Err(StorageError::InvalidSnapshot(
                    "database has no weight entries table".to_string(),
                ));
            }
            Err(err) => return Err(StorageError::InvalidSnapshot(err.to_string())),
        }

        self.conn.restore(
            DatabaseName::Main,
            tmp.path(),
            None::<fn(rusqlite::backup::Progress)>,
        )?;
        self.migrate()?;
        info!(bytes = bytes.len(), "restored snapshot");
        Ok(())
    }

    pub fn import_snapshot_from(&mut self, path: &Path) -> StorageResult<()> {
        let bytes = std::fs::read(path)?;
        self.import_snapshot(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntrySource, Note, WeightEntry, WeightUnit};
    use chrono::Utc;

    fn seeded() -> (Database, WeightEntry) {
        let db = Database::open_in_memory().unwrap();
        let note = db.insert_or_replace(&Note::new("Fasted morning", Utc::now())).unwrap();
        let mut entry =
            WeightEntry::new(182.4, WeightUnit::Pounds, EntrySource::Manual, Utc::now());
        entry.note_id = Some(note.id);
        let entry = db.insert_or_replace(&entry).unwrap();
        (db, entry)
    }

    #[test]
    fn test_export_starts_with_sqlite_header() {
        let (db, _) = seeded();
        let bytes = db.export_snapshot().unwrap();
        assert!(bytes.starts_with(SQLITE_HEADER));
    }

    #[test]
    fn test_snapshot_restores_into_fresh_store() {
        let (source, entry) = seeded();
        let bytes = source.export_snapshot().unwrap();

        let mut target = Database::open_in_memory().unwrap();
        target
            .insert_or_replace(&WeightEntry::new(
                70.0,
                WeightUnit::Kilograms,
                EntrySource::Manual,
                Utc::now(),
            ))
            .unwrap();
        target.import_snapshot(&bytes).unwrap();

        let entries = target.fetch_active::<WeightEntry>().unwrap();
        assert_eq!(entries, vec![entry]);
        assert_eq!(target.count_active::<Note>().unwrap(), 1);
    }

    #[test]
    fn test_import_garbage_leaves_store_unchanged() {
        let (mut db, entry) = seeded();
        let err = db.import_snapshot(b"definitely not a database").unwrap_err();
        assert!(matches!(err, StorageError::InvalidSnapshot(_)));

        let mut fake = SQLITE_HEADER.to_vec();
        fake.extend(std::iter::repeat_n(0xAB, 4096));
        assert!(db.import_snapshot(&fake).is_err());

        assert_eq!(db.fetch_active::<WeightEntry>().unwrap(), vec![entry]);
    }

    #[test]
    fn test_import_foreign_database_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE recipes (id INTEGER PRIMARY KEY);")
            .unwrap();
        drop(conn);

        let (mut db, _) = seeded();
        let err = db.import_snapshot_from(&path).unwrap_err();
        assert!(matches!(err, StorageError::InvalidSnapshot(_)));
        assert_eq!(db.count_active::<WeightEntry>().unwrap(), 1);
    }

    #[test]
    fn test_export_to_file_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copy.sqlite");
        let (db, entry) = seeded();
        db.export_snapshot_to(&path).unwrap();
        db.export_snapshot_to(&path).unwrap();

        let reopened = Database::open(&path).unwrap();
        assert_eq!(reopened.fetch_active::<WeightEntry>().unwrap(), vec![entry]);
    }
}

use std::path::Path;

use tracing::{info, warn};

use crate::db::{Database, Record, column_list};
use crate::error::{StorageError, StorageResult};
use crate::models::{MergeSummary, Note, Profile, Settings, WeightEntry};
use crate::snapshot::is_store;

const ALIAS: &str = "incoming";

/// Per-table copy plan. `select` lists the projected source columns in the
/// order of the table's column list.
struct MergeStep {
    table: &'static str,
    columns: String,
    select: String,
}

fn plain_select<R: Record>() -> String {
    column_list::<R>()
        .split(", ")
        .map(|col| match col {
            "sync_state" => "'pending'".to_string(),
            other => format!("src.{other}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn steps() -> Vec<MergeStep> {
    // Entries may only keep a note reference that resolves after notes are in.
    let entry_select = plain_select::<WeightEntry>().replace(
        "src.note_id",
        "CASE WHEN src.note_id IN (SELECT id FROM main.notes WHERE is_deleted = 0)
              THEN src.note_id ELSE NULL END",
    );
    vec![
        MergeStep {
            table: Note::TABLE,
            columns: column_list::<Note>(),
            select: plain_select::<Note>(),
        },
        MergeStep {
            table: WeightEntry::TABLE,
            columns: column_list::<WeightEntry>(),
            select: entry_select,
        },
        MergeStep {
            table: Settings::TABLE,
            columns: column_list::<Settings>(),
            select: plain_select::<Settings>(),
        },
        MergeStep {
            table: Profile::TABLE,
            columns: column_list::<Profile>(),
            select: plain_select::<Profile>(),
        },
    ]
}

impl Database {
    /// Copy rows from another store file that this store does not have yet.
    ///
    /// Existing identities are never touched and soft-deleted source rows are
    /// skipped. The source file is only read; it is migrated in a scratch copy
    /// first so older stores merge as well.
    pub fn merge_import(&self, source: &Path) -> StorageResult<MergeSummary> {
        if !is_store(source)? {
            return Err(StorageError::NotAStore {
                path: source.to_path_buf(),
            });
        }

        let scratch = tempfile::NamedTempFile::new()?;
        std::fs::copy(source, scratch.path())?;
        drop(Database::open(scratch.path())?);

        let scratch_path = scratch.path().to_string_lossy().to_string();
        self.conn
            .execute(&format!("ATTACH DATABASE ?1 AS {ALIAS}"), [scratch_path.as_str()])?;

        let result = self.merge_attached();
        let detach = self.conn.execute_batch(&format!("DETACH DATABASE {ALIAS}"));

        match (result, detach) {
            (Ok(summary), Ok(())) => {
                info!(
                    notes = summary.notes,
                    weight_entries = summary.weight_entries,
                    "merge import complete"
                );
                Ok(summary)
            }
            (Err(err), detach) => {
                if let Err(detach_err) = detach {
                    warn!(error = %detach_err, "failed to detach merge source");
                }
                Err(err)
            }
            (Ok(_), Err(err)) => Err(StorageError::from(err)),
        }
    }

    fn merge_attached(&self) -> StorageResult<MergeSummary> {
        let tx = self.conn.unchecked_transaction()?;
        let mut copied = Vec::with_capacity(4);
        for step in steps() {
            let sql = format!(
                "INSERT INTO main.{table} ({columns})
                 SELECT {select} FROM {ALIAS}.{table} src
                 WHERE src.is_deleted = 0
                   AND NOT EXISTS (SELECT 1 FROM main.{table} dst WHERE dst.id = src.id)",
                table = step.table,
                columns = step.columns,
                select = step.select,
            );
            copied.push(tx.execute(&sql, [])?);
        }
        tx.commit()?;

        Ok(MergeSummary {
            notes: copied[0],
            weight_entries: copied[1],
            settings: copied[2],
            profile: copied[3],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntrySource, SyncState, WeightUnit};
    use chrono::Utc;

    fn entry(value: f64) -> WeightEntry {
        WeightEntry::new(value, WeightUnit::Kilograms, EntrySource::Manual, Utc::now())
    }

    #[test]
    fn test_merge_copies_only_new_rows() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("other.db");
        let shared = entry(80.0);
        let only_there = entry(81.0);
        let deleted_there = entry(82.0);
        let note = Note::new("from other device", Utc::now());
        {
            let source = Database::open(&source_path).unwrap();
            let mut shared_there = shared.clone();
            shared_there.value = 99.0;
            source.insert_or_replace(&shared_there).unwrap();
            let note = source.insert_or_replace(&note).unwrap();
            let mut linked = only_there.clone();
            linked.note_id = Some(note.id);
            source.insert_or_replace(&linked).unwrap();
            source.insert_or_replace(&deleted_there).unwrap();
            source.soft_delete::<WeightEntry>(&deleted_there.id).unwrap();
        }

        let db = Database::open_in_memory().unwrap();
        db.insert_or_replace(&shared).unwrap();
        let summary = db.merge_import(&source_path).unwrap();

        assert_eq!(summary.weight_entries, 1);
        assert_eq!(summary.notes, 1);
        assert_eq!(summary.settings, 0);
        assert_eq!(summary.profile, 0);

        let local_shared = db.get::<WeightEntry>(&shared.id).unwrap().unwrap();
        assert!((local_shared.value - 80.0).abs() < f64::EPSILON);

        let merged = db.get::<WeightEntry>(&only_there.id).unwrap().unwrap();
        assert_eq!(merged.note_id.as_deref(), Some(note.id.as_str()));
        assert_eq!(merged.meta.sync_state, SyncState::Pending);
        assert!(db.get::<WeightEntry>(&deleted_there.id).unwrap().is_none());
    }

    #[test]
    fn test_merge_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("other.db");
        {
            let source = Database::open(&source_path).unwrap();
            source.insert_or_replace(&entry(70.0)).unwrap();
        }
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.merge_import(&source_path).unwrap().weight_entries, 1);
        assert_eq!(db.merge_import(&source_path).unwrap().total(), 0);
        assert_eq!(db.count_active::<WeightEntry>().unwrap(), 1);
    }

    #[test]
    fn test_merge_drops_reference_to_note_deleted_locally() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("other.db");
        let note = Note::new("shared note", Utc::now());
        let mut linked = entry(75.0);
        linked.note_id = Some(note.id.clone());
        {
            let source = Database::open(&source_path).unwrap();
            source.insert_or_replace(&note).unwrap();
            source.insert_or_replace(&linked).unwrap();
        }

        let db = Database::open_in_memory().unwrap();
        db.insert_or_replace(&note).unwrap();
        db.soft_delete::<Note>(&note.id).unwrap();
        db.merge_import(&source_path).unwrap();

        let merged = db.get::<WeightEntry>(&linked.id).unwrap().unwrap();
        assert!(merged.note_id.is_none());
    }

    #[test]
    fn test_merge_rejects_foreign_file_and_leaves_source_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello").unwrap();
        let db = Database::open_in_memory().unwrap();
        assert!(db.merge_import(&path).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");

        let empty = dir.path().join("empty.db");
        rusqlite::Connection::open(&empty)
            .unwrap()
            .execute_batch("CREATE TABLE t (x INTEGER);")
            .unwrap();
        let err = db.merge_import(&empty).unwrap_err();
        assert!(matches!(err, StorageError::NotAStore { .. }));
    }

    #[test]
    fn test_merge_leaves_store_usable_after_failure() {
        let db = Database::open_in_memory().unwrap();
        let missing = std::path::PathBuf::from("/definitely/not/here.db");
        assert!(db.merge_import(&missing).is_err());
        db.insert_or_replace(&entry(60.0)).unwrap();
        assert_eq!(db.count_active::<WeightEntry>().unwrap(), 1);
    }
}

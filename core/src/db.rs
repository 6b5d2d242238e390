use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::models::{
    EntrySource, Gender, Note, PROFILE_ID, Profile, RowMeta, SETTINGS_ID, Settings, SyncState,
    WeightEntry, WeightUnit, format_ts, parse_ts,
};

const SCHEMA_VERSION: i64 = 2;

/// Stamp given to freshly seeded singletons, so any real remote edit wins over them.
const SEED_UPDATED_AT: &str = "1970-01-01T00:00:00.000000Z";

/// Bookkeeping columns every table ends with, in this order.
const META_COLUMNS: [&str; 4] = ["created_at", "updated_at", "is_deleted", "sync_state"];

/// A row kind the store knows how to persist.
///
/// Rows are laid out as `id`, then [`Record::FIELDS`], then the bookkeeping
/// columns. Implementations only describe their own fields; stamping,
/// soft-delete, and conflict resolution live in [`Database`].
pub trait Record: Sized + Clone + Send + 'static {
    const TABLE: &'static str;
    const KIND: &'static str;
    const FIELDS: &'static [&'static str];
    /// `ORDER BY` clause for [`Database::fetch_active`].
    const ACTIVE_ORDER: &'static str;
    /// Whether a remote row with an equal `updated_at` replaces the local one.
    const REMOTE_WINS_TIES: bool;

    fn id(&self) -> &str;
    fn meta(&self) -> &RowMeta;
    fn meta_mut(&mut self) -> &mut RowMeta;
    fn field_values(&self) -> Vec<Value>;
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    /// Drop references that would break store invariants before writing.
    fn sanitize(&mut self, _conn: &Connection) -> rusqlite::Result<()> {
        Ok(())
    }

    /// Fold local-only state into an incoming remote row.
    fn merge_remote(&mut self, _local: Option<&Self>) {}

    /// Follow-up writes when a row is deleted by the user.
    fn cascade_local_delete(_conn: &Connection, _id: &str) -> rusqlite::Result<()> {
        Ok(())
    }

    /// Follow-up writes when a deletion arrives from the remote replica.
    fn cascade_remote_delete(_conn: &Connection, _id: &str) -> rusqlite::Result<()> {
        Ok(())
    }
}

pub(crate) fn column_list<R: Record>() -> String {
    std::iter::once("id")
        .chain(R::FIELDS.iter().copied())
        .chain(META_COLUMNS)
        .collect::<Vec<_>>()
        .join(", ")
}

fn select_sql<R: Record>() -> String {
    format!("SELECT {} FROM {}", column_list::<R>(), R::TABLE)
}

// --- Row decoding helpers ---

fn conversion_error(idx: usize, err: StorageError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| conversion_error(idx, e))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn enum_col<T>(
    row: &Row<'_>,
    idx: usize,
    column: &'static str,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, StorageError::Malformed { column, value: raw }))
}

fn meta_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<RowMeta> {
    Ok(RowMeta {
        created_at: ts_col(row, offset)?,
        updated_at: ts_col(row, offset + 1)?,
        is_deleted: row.get(offset + 2)?,
        sync_state: enum_col(row, offset + 3, "sync_state", SyncState::parse)?,
    })
}

fn opt_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |s| Value::Text(s.to_string()))
}

// --- Record implementations ---

impl Record for WeightEntry {
    const TABLE: &'static str = "weight_entries";
    const KIND: &'static str = "weight entry";
    const FIELDS: &'static [&'static str] = &["value", "unit", "source", "note_id", "recorded_at"];
    const ACTIVE_ORDER: &'static str = "recorded_at DESC, id";
    const REMOTE_WINS_TIES: bool = false;

    fn id(&self) -> &str {
        &self.id
    }

    fn meta(&self) -> &RowMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RowMeta {
        &mut self.meta
    }

    fn field_values(&self) -> Vec<Value> {
        vec![
            Value::Real(self.value),
            Value::Text(self.unit.as_str().to_string()),
            Value::Text(self.source.as_str().to_string()),
            opt_text(self.note_id.as_deref()),
            Value::Text(format_ts(&self.recorded_at)),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(WeightEntry {
            id: row.get(0)?,
            value: row.get(1)?,
            unit: enum_col(row, 2, "unit", WeightUnit::parse)?,
            source: enum_col(row, 3, "source", EntrySource::parse)?,
            note_id: row.get(4)?,
            recorded_at: ts_col(row, 5)?,
            meta: meta_from_row(row, 6)?,
        })
    }

    fn sanitize(&mut self, conn: &Connection) -> rusqlite::Result<()> {
        let Some(note_id) = self.note_id.as_deref() else {
            return Ok(());
        };
        let live: bool = conn
            .query_row(
                "SELECT 1 FROM notes WHERE id = ?1 AND is_deleted = 0",
                params![note_id],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !live {
            debug!(entry = %self.id, note = note_id, "dropping reference to missing note");
            self.note_id = None;
        }
        Ok(())
    }

    fn cascade_local_delete(conn: &Connection, id: &str) -> rusqlite::Result<()> {
        let note_id: Option<String> = conn.query_row(
            "SELECT note_id FROM weight_entries WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        let Some(note_id) = note_id else {
            return Ok(());
        };
        restamp_where(conn, "notes", "is_deleted = 1", "id = ?1 AND is_deleted = 0", &note_id)?;
        conn.execute(
            "UPDATE weight_entries SET note_id = NULL WHERE id = ?1",
            params![id],
        )?;
        Note::cascade_local_delete(conn, &note_id)
    }
}

impl Record for Note {
    const TABLE: &'static str = "notes";
    const KIND: &'static str = "note";
    const FIELDS: &'static [&'static str] = &["body", "recorded_at"];
    const ACTIVE_ORDER: &'static str = "recorded_at DESC, id";
    const REMOTE_WINS_TIES: bool = false;

    fn id(&self) -> &str {
        &self.id
    }

    fn meta(&self) -> &RowMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RowMeta {
        &mut self.meta
    }

    fn field_values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.body.clone()),
            Value::Text(format_ts(&self.recorded_at)),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Note {
            id: row.get(0)?,
            body: row.get(1)?,
            recorded_at: ts_col(row, 2)?,
            meta: meta_from_row(row, 3)?,
        })
    }

    fn cascade_local_delete(conn: &Connection, id: &str) -> rusqlite::Result<()> {
        restamp_where(conn, "weight_entries", "note_id = NULL", "note_id = ?1", id)?;
        Ok(())
    }

    fn cascade_remote_delete(conn: &Connection, id: &str) -> rusqlite::Result<()> {
        conn.execute(
            "UPDATE weight_entries SET note_id = NULL WHERE note_id = ?1",
            params![id],
        )?;
        Ok(())
    }
}

impl Record for Settings {
    const TABLE: &'static str = "settings";
    const KIND: &'static str = "settings";
    const FIELDS: &'static [&'static str] = &[
        "preferred_unit",
        "reminder_enabled",
        "reminder_hour",
        "reminder_minute",
        "onboarding_complete",
        "sync_enabled",
        "last_sync_at",
        "last_sync_error",
    ];
    const ACTIVE_ORDER: &'static str = "updated_at DESC";
    const REMOTE_WINS_TIES: bool = true;

    fn id(&self) -> &str {
        &self.id
    }

    fn meta(&self) -> &RowMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RowMeta {
        &mut self.meta
    }

    fn field_values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.preferred_unit.as_str().to_string()),
            Value::Integer(i64::from(self.reminder_enabled)),
            Value::Integer(i64::from(self.reminder_hour)),
            Value::Integer(i64::from(self.reminder_minute)),
            Value::Integer(i64::from(self.onboarding_complete)),
            Value::Integer(i64::from(self.sync_enabled)),
            opt_text(self.last_sync_at.as_ref().map(format_ts).as_deref()),
            opt_text(self.last_sync_error.as_deref()),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Settings {
            id: row.get(0)?,
            preferred_unit: enum_col(row, 1, "preferred_unit", WeightUnit::parse)?,
            reminder_enabled: row.get(2)?,
            reminder_hour: row.get(3)?,
            reminder_minute: row.get(4)?,
            onboarding_complete: row.get(5)?,
            sync_enabled: row.get(6)?,
            last_sync_at: opt_ts_col(row, 7)?,
            last_sync_error: row.get(8)?,
            meta: meta_from_row(row, 9)?,
        })
    }

    fn sanitize(&mut self, _conn: &Connection) -> rusqlite::Result<()> {
        SETTINGS_ID.clone_into(&mut self.id);
        Ok(())
    }

    /// Sync switch and sync status describe this device, not the account.
    fn merge_remote(&mut self, local: Option<&Self>) {
        if let Some(local) = local {
            self.sync_enabled = local.sync_enabled;
            self.last_sync_at = local.last_sync_at;
            self.last_sync_error.clone_from(&local.last_sync_error);
        }
    }
}

impl Record for Profile {
    const TABLE: &'static str = "profile";
    const KIND: &'static str = "profile";
    const FIELDS: &'static [&'static str] = &["birthday", "gender", "height_cm", "avatar_path"];
    const ACTIVE_ORDER: &'static str = "updated_at DESC";
    const REMOTE_WINS_TIES: bool = true;

    fn id(&self) -> &str {
        &self.id
    }

    fn meta(&self) -> &RowMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RowMeta {
        &mut self.meta
    }

    fn field_values(&self) -> Vec<Value> {
        vec![
            opt_text(
                self.birthday
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .as_deref(),
            ),
            Value::Text(self.gender.as_str().to_string()),
            self.height_cm.map_or(Value::Null, Value::Real),
            opt_text(self.avatar_path.as_deref()),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let birthday: Option<String> = row.get(1)?;
        let birthday = birthday
            .map(|s| {
                NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|_| {
                    conversion_error(
                        1,
                        StorageError::Malformed {
                            column: "birthday",
                            value: s.clone(),
                        },
                    )
                })
            })
            .transpose()?;
        Ok(Profile {
            id: row.get(0)?,
            birthday,
            gender: enum_col(row, 2, "gender", Gender::parse)?,
            height_cm: row.get(3)?,
            avatar_path: row.get(4)?,
            meta: meta_from_row(row, 5)?,
        })
    }

    fn sanitize(&mut self, _conn: &Connection) -> rusqlite::Result<()> {
        PROFILE_ID.clone_into(&mut self.id);
        Ok(())
    }
}

// --- Schema ---

/// Every column each table must have, with the declaration used when an older
/// database lacks it.
const COLUMN_AUDIT: &[(&str, &[(&str, &str)])] = &[
    (
        "notes",
        &[
            ("body", "TEXT NOT NULL DEFAULT ''"),
            ("recorded_at", "TEXT"),
            ("created_at", "TEXT"),
            ("updated_at", "TEXT"),
            ("is_deleted", "INTEGER NOT NULL DEFAULT 0"),
            ("sync_state", "TEXT NOT NULL DEFAULT 'pending'"),
        ],
    ),
    (
        "weight_entries",
        &[
            ("value", "REAL NOT NULL DEFAULT 0"),
            ("unit", "TEXT NOT NULL DEFAULT 'kg'"),
            ("source", "TEXT NOT NULL DEFAULT 'manual'"),
            ("note_id", "TEXT"),
            ("recorded_at", "TEXT"),
            ("created_at", "TEXT"),
            ("updated_at", "TEXT"),
            ("is_deleted", "INTEGER NOT NULL DEFAULT 0"),
            ("sync_state", "TEXT NOT NULL DEFAULT 'pending'"),
        ],
    ),
    (
        "settings",
        &[
            ("preferred_unit", "TEXT NOT NULL DEFAULT 'kg'"),
            ("reminder_enabled", "INTEGER NOT NULL DEFAULT 0"),
            ("reminder_hour", "INTEGER NOT NULL DEFAULT 8"),
            ("reminder_minute", "INTEGER NOT NULL DEFAULT 0"),
            ("onboarding_complete", "INTEGER NOT NULL DEFAULT 0"),
            ("sync_enabled", "INTEGER NOT NULL DEFAULT 0"),
            ("last_sync_at", "TEXT"),
            ("last_sync_error", "TEXT"),
            ("created_at", "TEXT"),
            ("updated_at", "TEXT"),
            ("is_deleted", "INTEGER NOT NULL DEFAULT 0"),
            ("sync_state", "TEXT NOT NULL DEFAULT 'pending'"),
        ],
    ),
    (
        "profile",
        &[
            ("birthday", "TEXT"),
            ("gender", "TEXT NOT NULL DEFAULT 'unspecified'"),
            ("height_cm", "REAL"),
            ("avatar_path", "TEXT"),
            ("created_at", "TEXT"),
            ("updated_at", "TEXT"),
            ("is_deleted", "INTEGER NOT NULL DEFAULT 0"),
            ("sync_state", "TEXT NOT NULL DEFAULT 'pending'"),
        ],
    ),
];

pub struct Database {
    pub(crate) conn: Connection,
}

/// The store as shared between the facade and the background engines.
pub type SharedDatabase = Arc<Mutex<Database>>;

pub(crate) fn lock_db(db: &Mutex<Database>) -> MutexGuard<'_, Database> {
    db.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Database {
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path).map_err(|source| StorageError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub(crate) fn migrate(&self) -> StorageResult<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        let tx = self.conn.unchecked_transaction()?;

        if version < 1 {
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS notes (
                    id TEXT PRIMARY KEY NOT NULL,
                    body TEXT NOT NULL,
                    recorded_at TEXT NOT NULL,
                    created_at TEXT,
                    updated_at TEXT,
                    is_deleted INTEGER NOT NULL DEFAULT 0,
                    sync_state TEXT NOT NULL DEFAULT 'pending'
                );

                CREATE TABLE IF NOT EXISTS weight_entries (
                    id TEXT PRIMARY KEY NOT NULL,
                    value REAL NOT NULL,
                    unit TEXT NOT NULL DEFAULT 'kg',
                    source TEXT NOT NULL DEFAULT 'manual',
                    note_id TEXT REFERENCES notes(id) ON DELETE SET NULL,
                    recorded_at TEXT NOT NULL,
                    created_at TEXT,
                    updated_at TEXT,
                    is_deleted INTEGER NOT NULL DEFAULT 0,
                    sync_state TEXT NOT NULL DEFAULT 'pending'
                );",
            )?;
        }

        if version < 2 {
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS settings (
                    id TEXT PRIMARY KEY NOT NULL
                );

                CREATE TABLE IF NOT EXISTS profile (
                    id TEXT PRIMARY KEY NOT NULL
                );",
            )?;
        }

        // Databases written by older builds may predate any of these columns,
        // whatever their user_version says.
        let added = Self::audit_columns(&tx)?;
        if added > 0 {
            info!(added, "added missing columns to existing tables");
        }
        Self::backfill_timestamps(&tx)?;

        tx.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_weight_entries_recorded ON weight_entries(recorded_at);
             CREATE INDEX IF NOT EXISTS idx_weight_entries_sync ON weight_entries(sync_state, updated_at);
             CREATE INDEX IF NOT EXISTS idx_weight_entries_note ON weight_entries(note_id);
             CREATE INDEX IF NOT EXISTS idx_notes_sync ON notes(sync_state, updated_at);",
        )?;

        let now = format_ts(&Utc::now());
        tx.execute(
            "INSERT OR IGNORE INTO settings (id, created_at, updated_at) VALUES (?1, ?2, ?3)",
            params![SETTINGS_ID, now, SEED_UPDATED_AT],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO profile (id, created_at, updated_at) VALUES (?1, ?2, ?3)",
            params![PROFILE_ID, now, SEED_UPDATED_AT],
        )?;

        if version < SCHEMA_VERSION {
            tx.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
            debug!(from = version, to = SCHEMA_VERSION, "schema migrated");
        }
        tx.commit()?;
        Ok(())
    }

    fn table_columns(
        conn: &Connection,
        schema: &str,
        table: &str,
    ) -> rusqlite::Result<Vec<String>> {
        let mut stmt = conn.prepare(&format!("PRAGMA {schema}.table_info({table})"))?;
        stmt.query_map([], |row| row.get::<_, String>(1))?
            .collect()
    }

    fn audit_columns(conn: &Connection) -> rusqlite::Result<usize> {
        let mut added = 0;
        for (table, columns) in COLUMN_AUDIT {
            let existing = Self::table_columns(conn, "main", table)?;
            for (column, decl) in *columns {
                if existing.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                    continue;
                }
                conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl};"))?;
                added += 1;
            }
        }
        Ok(added)
    }

    fn backfill_timestamps(conn: &Connection) -> rusqlite::Result<()> {
        let now = format_ts(&Utc::now());
        for table in ["notes", "weight_entries"] {
            conn.execute(
                &format!(
                    "UPDATE {table} SET recorded_at = COALESCE(created_at, updated_at, ?1)
                     WHERE recorded_at IS NULL"
                ),
                params![now],
            )?;
            conn.execute(
                &format!(
                    "UPDATE {table} SET created_at = COALESCE(created_at, recorded_at),
                                        updated_at = COALESCE(updated_at, created_at, recorded_at)
                     WHERE created_at IS NULL OR updated_at IS NULL"
                ),
                [],
            )?;
        }
        for table in ["settings", "profile"] {
            conn.execute(
                &format!(
                    "UPDATE {table} SET created_at = COALESCE(created_at, ?1),
                                        updated_at = COALESCE(updated_at, created_at, ?1)
                     WHERE created_at IS NULL OR updated_at IS NULL"
                ),
                params![now],
            )?;
        }
        Ok(())
    }

    // --- Generic record operations ---

    fn stored_state<R: Record>(
        conn: &Connection,
        id: &str,
    ) -> rusqlite::Result<Option<(DateTime<Utc>, bool)>> {
        conn.query_row(
            &format!("SELECT updated_at, is_deleted FROM {} WHERE id = ?1", R::TABLE),
            params![id],
            |row| Ok((ts_col(row, 0)?, row.get(1)?)),
        )
        .optional()
    }

    pub(crate) fn get_in<R: Record>(conn: &Connection, id: &str) -> rusqlite::Result<Option<R>> {
        conn.query_row(
            &format!("{} WHERE id = ?1", select_sql::<R>()),
            params![id],
            R::from_row,
        )
        .optional()
    }

    /// Write every column of `record` as given, creating or overwriting the row.
    /// `created_at` of an existing row is kept.
    fn write_row<R: Record>(conn: &Connection, record: &R) -> rusqlite::Result<()> {
        let mut values = vec![Value::Text(record.id().to_string())];
        values.extend(record.field_values());
        let meta = record.meta();
        values.push(Value::Text(format_ts(&meta.created_at)));
        values.push(Value::Text(format_ts(&meta.updated_at)));
        values.push(Value::Integer(i64::from(meta.is_deleted)));
        values.push(Value::Text(meta.sync_state.as_str().to_string()));

        let placeholders = (1..=values.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let assignments = R::FIELDS
            .iter()
            .copied()
            .chain(["updated_at", "is_deleted", "sync_state"])
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute(
            &format!(
                "INSERT INTO {table} ({columns}) VALUES ({placeholders})
                 ON CONFLICT(id) DO UPDATE SET {assignments}",
                table = R::TABLE,
                columns = column_list::<R>(),
            ),
            params_from_iter(values.iter()),
        )?;
        Ok(())
    }

    /// Run `f` inside one transaction. An error from `f` rolls back every
    /// write it made.
    pub fn transaction<T, E>(&self, f: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(StorageError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(StorageError::from)?;
        Ok(value)
    }

    pub fn get<R: Record>(&self, id: &str) -> StorageResult<Option<R>> {
        Ok(Self::get_in(&self.conn, id)?)
    }

    /// Idempotent upsert keyed by identity. The stored row comes back stamped
    /// pending and not deleted.
    pub fn insert_or_replace<R: Record>(&self, record: &R) -> StorageResult<R> {
        self.transaction(|conn| Self::insert_or_replace_in(conn, record))
    }

    pub(crate) fn insert_or_replace_in<R: Record>(
        conn: &Connection,
        record: &R,
    ) -> StorageResult<R> {
        let stored = Self::stored_state::<R>(conn, record.id())?;

        let mut row = record.clone();
        row.sanitize(conn)?;
        let meta = row.meta_mut();
        meta.updated_at = next_stamp(stored.map(|(ts, _)| ts));
        meta.is_deleted = false;
        meta.sync_state = SyncState::Pending;
        Self::write_row(conn, &row)?;

        Self::get_in::<R>(conn, record.id())?.ok_or_else(|| StorageError::NotFound {
            kind: R::KIND,
            id: record.id().to_string(),
        })
    }

    /// In-place update of an existing row. Returns `None` without writing
    /// when the identity is unknown.
    pub fn update<R: Record>(&self, record: &R) -> StorageResult<Option<R>> {
        self.transaction(|conn| Self::update_in(conn, record))
    }

    pub(crate) fn update_in<R: Record>(conn: &Connection, record: &R) -> StorageResult<Option<R>> {
        let Some((stored_at, _)) = Self::stored_state::<R>(conn, record.id())? else {
            return Ok(None);
        };

        let mut row = record.clone();
        row.sanitize(conn)?;
        let mut values = vec![Value::Text(row.id().to_string())];
        values.extend(row.field_values());
        values.push(Value::Text(format_ts(&next_stamp(Some(stored_at)))));

        let assignments = R::FIELDS
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{c} = ?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute(
            &format!(
                "UPDATE {table} SET {assignments}, updated_at = ?{stamp}, sync_state = 'pending'
                 WHERE id = ?1",
                table = R::TABLE,
                stamp = R::FIELDS.len() + 2,
            ),
            params_from_iter(values.iter()),
        )?;

        Ok(Self::get_in::<R>(conn, record.id())?)
    }

    /// Mark a row deleted. Returns `false` if it is unknown or already deleted.
    pub fn soft_delete<R: Record>(&self, id: &str) -> StorageResult<bool> {
        self.transaction(|conn| Self::soft_delete_in::<R>(conn, id))
    }

    pub(crate) fn soft_delete_in<R: Record>(conn: &Connection, id: &str) -> StorageResult<bool> {
        let Some((_, is_deleted)) = Self::stored_state::<R>(conn, id)? else {
            return Ok(false);
        };
        if is_deleted {
            return Ok(false);
        }

        restamp_where(conn, R::TABLE, "is_deleted = 1", "id = ?1", id)?;
        R::cascade_local_delete(conn, id)?;
        Ok(true)
    }

    /// Non-deleted rows, newest logical timestamp first.
    pub fn fetch_active<R: Record>(&self) -> StorageResult<Vec<R>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE is_deleted = 0 ORDER BY {}",
            select_sql::<R>(),
            R::ACTIVE_ORDER
        ))?;
        let rows = stmt
            .query_map([], R::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Rows waiting to be pushed, oldest change first. Includes tombstones
    /// and rows whose last push was rejected.
    pub fn fetch_pending<R: Record>(&self) -> StorageResult<Vec<R>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE sync_state <> 'synced' ORDER BY updated_at ASC, id",
            select_sql::<R>()
        ))?;
        let rows = stmt
            .query_map([], R::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_active<R: Record>(&self) -> StorageResult<usize> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE is_deleted = 0", R::TABLE),
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Flag rows as round-tripped. Each receipt names a row and the
    /// `updated_at` it was pushed with; a row edited since then stays pending.
    /// `updated_at` is untouched.
    pub fn mark_synced<R: Record>(&self, pushed: &[PushReceipt]) -> StorageResult<usize> {
        self.transaction(|conn| Self::set_push_state_in::<R>(conn, pushed, SyncState::Synced))
    }

    /// Flag rows whose push the replica refused. They are retried by the next
    /// cycle unless edited first.
    pub fn mark_sync_error<R: Record>(&self, pushed: &[PushReceipt]) -> StorageResult<usize> {
        self.transaction(|conn| Self::set_push_state_in::<R>(conn, pushed, SyncState::Error))
    }

    pub(crate) fn set_push_state_in<R: Record>(
        conn: &Connection,
        pushed: &[PushReceipt],
        state: SyncState,
    ) -> StorageResult<usize> {
        let mut stmt = conn.prepare(&format!(
            "UPDATE {} SET sync_state = ?3
             WHERE id = ?1 AND updated_at = ?2 AND sync_state <> 'synced'",
            R::TABLE
        ))?;
        let mut marked = 0;
        for receipt in pushed {
            marked += stmt.execute(params![
                receipt.id,
                format_ts(&receipt.updated_at),
                state.as_str()
            ])?;
        }
        Ok(marked)
    }

    /// Conditionally write a row received from the remote replica.
    ///
    /// The write happens only when the row is absent locally or the incoming
    /// `updated_at` is newer (or equal, for kinds whose remote wins ties).
    /// Returns whether the row was written.
    pub fn apply_remote<R: Record>(&self, incoming: &R) -> StorageResult<bool> {
        self.transaction(|conn| Self::apply_remote_in(conn, incoming))
    }

    pub(crate) fn apply_remote_in<R: Record>(
        conn: &Connection,
        incoming: &R,
    ) -> StorageResult<bool> {
        let local = Self::get_in::<R>(conn, incoming.id())?;
        if let Some(local) = &local {
            let theirs = incoming.meta().updated_at;
            let ours = local.meta().updated_at;
            let wins = if R::REMOTE_WINS_TIES {
                theirs >= ours
            } else {
                theirs > ours
            };
            if !wins {
                return Ok(false);
            }
        }

        let mut row = incoming.clone();
        row.merge_remote(local.as_ref());
        row.sanitize(conn)?;
        row.meta_mut().sync_state = SyncState::Synced;
        Self::write_row(conn, &row)?;
        if row.meta().is_deleted {
            R::cascade_remote_delete(conn, row.id())?;
        }
        Ok(true)
    }

    // --- Singletons ---

    pub fn settings(&self) -> StorageResult<Settings> {
        Self::settings_in(&self.conn)
    }

    pub(crate) fn settings_in(conn: &Connection) -> StorageResult<Settings> {
        Self::get_in::<Settings>(conn, SETTINGS_ID)?.ok_or_else(|| StorageError::NotFound {
            kind: Settings::KIND,
            id: SETTINGS_ID.to_string(),
        })
    }

    pub fn profile(&self) -> StorageResult<Profile> {
        Self::profile_in(&self.conn)
    }

    pub(crate) fn profile_in(conn: &Connection) -> StorageResult<Profile> {
        Self::get_in::<Profile>(conn, PROFILE_ID)?.ok_or_else(|| StorageError::NotFound {
            kind: Profile::KIND,
            id: PROFILE_ID.to_string(),
        })
    }

    /// Record a successful cycle. Sync status is device bookkeeping, so the
    /// settings row is neither restamped nor marked pending.
    pub fn record_sync_success(&self, synced_at: DateTime<Utc>) -> StorageResult<()> {
        Self::record_sync_success_in(&self.conn, synced_at)
    }

    pub(crate) fn record_sync_success_in(
        conn: &Connection,
        synced_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        conn.execute(
            "UPDATE settings SET last_sync_at = ?2, last_sync_error = NULL WHERE id = ?1",
            params![SETTINGS_ID, format_ts(&synced_at)],
        )?;
        Ok(())
    }

    pub fn record_sync_failure(&self, message: &str) -> StorageResult<()> {
        Self::record_sync_failure_in(&self.conn, message)
    }

    pub(crate) fn record_sync_failure_in(conn: &Connection, message: &str) -> StorageResult<()> {
        conn.execute(
            "UPDATE settings SET last_sync_error = ?2 WHERE id = ?1",
            params![SETTINGS_ID, message],
        )?;
        Ok(())
    }

    pub fn set_sync_enabled(&self, enabled: bool) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE settings SET sync_enabled = ?2 WHERE id = ?1",
            params![SETTINGS_ID, enabled],
        )?;
        Ok(())
    }
}

/// A row as it was sent to the replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReceipt {
    pub id: String,
    pub updated_at: DateTime<Utc>,
}

impl PushReceipt {
    pub fn of<R: Record>(row: &R) -> Self {
        Self {
            id: row.id().to_string(),
            updated_at: row.meta().updated_at,
        }
    }
}

/// Next `updated_at` for a row: now, and always strictly after what is
/// stored, so every local edit is distinguishable from the one before it.
fn next_stamp(stored: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    stored.map_or(now, |s| now.max(s + Duration::microseconds(1)))
}

/// Apply `set` to every row of `table` matching `filter` (bound to `arg`),
/// giving each its own next stamp and marking it pending.
fn restamp_where(
    conn: &Connection,
    table: &str,
    set: &str,
    filter: &str,
    arg: &str,
) -> rusqlite::Result<usize> {
    let rows: Vec<(String, DateTime<Utc>)> = {
        let mut stmt = conn.prepare(&format!("SELECT id, updated_at FROM {table} WHERE {filter}"))?;
        let rows = stmt
            .query_map(params![arg], |row| Ok((row.get(0)?, ts_col(row, 1)?)))?
            .collect::<Result<_, _>>()?;
        rows
    };
    let mut stmt = conn.prepare(&format!(
        "UPDATE {table} SET {set}, updated_at = ?2, sync_state = 'pending' WHERE id = ?1"
    ))?;
    for (id, stored) in &rows {
        stmt.execute(params![id, format_ts(&next_stamp(Some(*stored)))])?;
    }
    Ok(rows.len())
}

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local, Utc};
use rusqlite::Connection;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backup::{BackupOutcome, BackupScheduler, BackupState, FolderAccess};
use crate::csv_import::{self, CsvImportSummary};
use crate::db::{Database, SharedDatabase, lock_db};
use crate::error::{BackupError, ImportError, StorageError, StorageResult};
use crate::exchange;
use crate::models::{
    EntryView, ImportSummary, MergeSummary, NewWeightEntry, Note, Profile, Settings,
    UpdateWeightEntry, WeightEntry, validate_weight,
};
use crate::state::{AppState, StateHub};
use crate::sync::{RemoteReplica, SyncCoordinator, SyncOutcome};

/// Where the service keeps its files.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub db_path: PathBuf,
    /// Kept outside the database so restoring a snapshot never rewrites it.
    pub backup_state_path: PathBuf,
    pub backup_file_stem: String,
}

impl ServiceConfig {
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            db_path: dir.join("heft.db"),
            backup_state_path: dir.join("backup-state.json"),
            backup_file_stem: "heft".to_string(),
        }
    }
}

pub struct HeftService {
    db: SharedDatabase,
    hub: Arc<StateHub>,
    sync: Arc<SyncCoordinator>,
    backup: BackupScheduler,
    sync_tasks: Mutex<Vec<JoinHandle<SyncOutcome>>>,
}

fn note_text(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|t| !t.is_empty())
}

fn view_of(conn: &Connection, entry: WeightEntry) -> StorageResult<EntryView> {
    let note = match entry.note_id.as_deref() {
        Some(id) => Database::get_in::<Note>(conn, id)?
            .filter(|n| !n.meta.is_deleted)
            .map(|n| n.body),
        None => None,
    };
    Ok(EntryView { entry, note })
}

impl HeftService {
    pub fn open(
        config: &ServiceConfig,
        remote: Arc<dyn RemoteReplica>,
        folders: Arc<dyn FolderAccess>,
    ) -> StorageResult<Self> {
        let db = Database::open(&config.db_path)?;
        Self::with_database(db, config, remote, folders)
    }

    pub fn with_database(
        db: Database,
        config: &ServiceConfig,
        remote: Arc<dyn RemoteReplica>,
        folders: Arc<dyn FolderAccess>,
    ) -> StorageResult<Self> {
        let hub = Arc::new(StateHub::new());
        hub.reload(&db)?;
        let db = Arc::new(Mutex::new(db));
        let sync = Arc::new(SyncCoordinator::new(
            Arc::clone(&db),
            remote,
            Arc::clone(&hub),
        ));
        let backup = BackupScheduler::new(
            Arc::clone(&db),
            folders,
            Arc::clone(&hub),
            config.backup_state_path.clone(),
            config.backup_file_stem.clone(),
        );
        if let Err(e) = backup.publish() {
            warn!(error = %e, "could not read backup state");
        }
        Ok(Self {
            db,
            hub,
            sync,
            backup,
            sync_tasks: Mutex::new(Vec::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        lock_db(&self.db)
    }

    fn refresh_state(&self, db: &Database) -> StorageResult<()> {
        self.hub.reload(db)
    }

    // --- Weight entries ---

    /// Record a weight, with an optional note attached to it. Entry and note
    /// are written together or not at all.
    pub fn log_weight(&self, input: &NewWeightEntry) -> StorageResult<EntryView> {
        validate_weight(input.value)?;
        let view = self.lock().transaction(|conn| {
            let mut entry =
                WeightEntry::new(input.value, input.unit, input.source, input.recorded_at);
            if let Some(text) = note_text(input.note.as_deref()) {
                let note = Note::new(text, input.recorded_at);
                let note = Database::insert_or_replace_in(conn, &note)?;
                entry.note_id = Some(note.id);
            }
            let entry = Database::insert_or_replace_in(conn, &entry)?;
            view_of(conn, entry)
        })?;
        self.kick_sync();
        Ok(view)
    }

    /// Apply a partial edit. Returns `None` when there is no live entry with `id`.
    ///
    /// A note of `Some("")` removes the linked note; any other text replaces or
    /// creates it.
    pub fn update_weight(
        &self,
        id: &str,
        edit: &UpdateWeightEntry,
    ) -> StorageResult<Option<EntryView>> {
        if let Some(value) = edit.value {
            validate_weight(value)?;
        }
        let view = self.lock().transaction(|conn| -> StorageResult<Option<EntryView>> {
            let live = Database::get_in::<WeightEntry>(conn, id)?.filter(|e| !e.meta.is_deleted);
            let Some(mut entry) = live else {
                return Ok(None);
            };
            if let Some(value) = edit.value {
                entry.value = value;
            }
            if let Some(unit) = edit.unit {
                entry.unit = unit;
            }
            if let Some(recorded_at) = edit.recorded_at {
                entry.recorded_at = recorded_at;
            }

            if let Some(raw) = edit.note.as_deref() {
                let existing = match entry.note_id.as_deref() {
                    Some(note_id) => {
                        Database::get_in::<Note>(conn, note_id)?.filter(|n| !n.meta.is_deleted)
                    }
                    None => None,
                };
                match (note_text(Some(raw)), existing) {
                    (None, Some(note)) => {
                        Database::soft_delete_in::<Note>(conn, &note.id)?;
                        entry.note_id = None;
                    }
                    (None, None) => entry.note_id = None,
                    (Some(text), Some(mut note)) => {
                        if note.body != text {
                            text.clone_into(&mut note.body);
                            Database::update_in(conn, &note)?;
                        }
                    }
                    (Some(text), None) => {
                        let note = Note::new(text, entry.recorded_at);
                        let note = Database::insert_or_replace_in(conn, &note)?;
                        entry.note_id = Some(note.id);
                    }
                }
            }

            match Database::update_in(conn, &entry)? {
                Some(updated) => Ok(Some(view_of(conn, updated)?)),
                None => Ok(None),
            }
        })?;
        if view.is_some() {
            self.kick_sync();
        }
        Ok(view)
    }

    /// Soft-delete an entry together with its note.
    pub fn delete_weight(&self, id: &str) -> StorageResult<bool> {
        let deleted = self.lock().soft_delete::<WeightEntry>(id)?;
        if deleted {
            self.kick_sync();
        }
        Ok(deleted)
    }

    pub fn get_weight(&self, id: &str) -> StorageResult<Option<EntryView>> {
        let db = self.lock();
        match db.get::<WeightEntry>(id)?.filter(|e| !e.meta.is_deleted) {
            Some(entry) => Ok(Some(view_of(&db.conn, entry)?)),
            None => Ok(None),
        }
    }

    /// Live entries, newest first, with notes resolved.
    pub fn list_weights(&self) -> StorageResult<Vec<EntryView>> {
        let db = self.lock();
        let notes: HashMap<String, String> = db
            .fetch_active::<Note>()?
            .into_iter()
            .map(|n| (n.id, n.body))
            .collect();
        Ok(db
            .fetch_active::<WeightEntry>()?
            .into_iter()
            .map(|entry| {
                let note = entry.note_id.as_ref().and_then(|id| notes.get(id)).cloned();
                EntryView { entry, note }
            })
            .collect())
    }

    // --- Notes ---

    pub fn add_note(&self, body: &str, recorded_at: DateTime<Utc>) -> StorageResult<Note> {
        let Some(body) = note_text(Some(body)) else {
            return Err(StorageError::Invalid("note text is empty".to_string()));
        };
        let note = self.lock().insert_or_replace(&Note::new(body, recorded_at))?;
        self.kick_sync();
        Ok(note)
    }

    pub fn list_notes(&self) -> StorageResult<Vec<Note>> {
        self.lock().fetch_active::<Note>()
    }

    pub fn delete_note(&self, id: &str) -> StorageResult<bool> {
        let deleted = self.lock().soft_delete::<Note>(id)?;
        if deleted {
            self.kick_sync();
        }
        Ok(deleted)
    }

    // --- Settings and profile ---

    pub fn settings(&self) -> StorageResult<Settings> {
        self.lock().settings()
    }

    pub fn update_settings(&self, edit: impl FnOnce(&mut Settings)) -> StorageResult<Settings> {
        let settings = {
            let db = self.lock();
            let mut settings = db.settings()?;
            edit(&mut settings);
            let updated = db.update(&settings)?.ok_or_else(|| StorageError::NotFound {
                kind: "settings",
                id: settings.id.clone(),
            })?;
            self.refresh_state(&db)?;
            updated
        };
        self.kick_sync();
        Ok(settings)
    }

    pub fn profile(&self) -> StorageResult<Profile> {
        self.lock().profile()
    }

    pub fn update_profile(&self, edit: impl FnOnce(&mut Profile)) -> StorageResult<Profile> {
        let profile = {
            let db = self.lock();
            let mut profile = db.profile()?;
            edit(&mut profile);
            let updated = db.update(&profile)?.ok_or_else(|| StorageError::NotFound {
                kind: "profile",
                id: profile.id.clone(),
            })?;
            self.refresh_state(&db)?;
            updated
        };
        self.kick_sync();
        Ok(profile)
    }

    // --- Sync ---

    /// Turning sync on queues a cycle right away. Turning it off lets an
    /// in-flight cycle finish.
    pub fn set_sync_enabled(&self, enabled: bool) -> StorageResult<()> {
        {
            let db = self.lock();
            db.set_sync_enabled(enabled)?;
            self.refresh_state(&db)?;
        }
        if enabled {
            self.kick_sync();
        }
        Ok(())
    }

    pub async fn request_sync(&self, force: bool) -> SyncOutcome {
        self.sync.request_sync(force).await
    }

    /// Queue a background sync after a local change, if sync is on and a
    /// runtime is available.
    fn kick_sync(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let enabled = self.lock().settings().is_ok_and(|s| s.sync_enabled);
        if !enabled {
            return;
        }
        let sync = Arc::clone(&self.sync);
        let task = runtime.spawn(async move { sync.request_sync(false).await });
        debug!("background sync queued");
        let mut tasks = self.lock_tasks();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<SyncOutcome>>> {
        self.sync_tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for every queued background sync to finish.
    pub async fn settle(&self) -> Vec<SyncOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let tasks = std::mem::take(&mut *self.lock_tasks());
            if tasks.is_empty() {
                return outcomes;
            }
            for task in tasks {
                match task.await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => warn!(error = %e, "background sync task failed"),
                }
            }
        }
    }

    // --- Observable state ---

    #[must_use]
    pub fn state(&self) -> AppState {
        self.hub.snapshot()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AppState> {
        self.hub.subscribe()
    }

    // --- Snapshots and merge ---

    pub fn export_snapshot(&self) -> StorageResult<Vec<u8>> {
        self.lock().export_snapshot()
    }

    pub fn export_snapshot_to(&self, path: &Path) -> StorageResult<()> {
        self.lock().export_snapshot_to(path)
    }

    /// Replace the whole store with a snapshot.
    pub fn restore_snapshot(&self, bytes: &[u8]) -> StorageResult<()> {
        let mut db = self.lock();
        db.import_snapshot(bytes)?;
        self.refresh_state(&db)
    }

    pub fn merge_import(&self, path: &Path) -> StorageResult<MergeSummary> {
        let summary = {
            let db = self.lock();
            let summary = db.merge_import(path)?;
            self.refresh_state(&db)?;
            summary
        };
        if summary.total() > 0 {
            self.kick_sync();
        }
        Ok(summary)
    }

    // --- JSON and CSV ---

    pub fn export_json<W: Write>(&self, writer: W) -> Result<(), ImportError> {
        exchange::export_json(&self.lock(), writer)
    }

    pub fn import_json<R: Read>(&self, reader: R) -> Result<ImportSummary, ImportError> {
        let summary = {
            let db = self.lock();
            let summary = exchange::import_json(&db, reader)?;
            self.refresh_state(&db)?;
            summary
        };
        self.kick_sync();
        Ok(summary)
    }

    pub fn export_csv<W: Write>(&self, writer: W) -> Result<usize, ImportError> {
        csv_import::export_weight_csv(&self.lock(), writer)
    }

    pub fn import_csv<R: Read>(
        &self,
        reader: R,
        dry_run: bool,
    ) -> Result<CsvImportSummary, ImportError> {
        let rows = csv_import::parse_weight_csv(reader)?;
        let summary = csv_import::import_weight_rows(&self.lock(), &rows, dry_run)?;
        if !dry_run {
            self.kick_sync();
        }
        Ok(summary)
    }

    // --- Backups ---

    pub fn backup_state(&self) -> Result<BackupState, BackupError> {
        self.backup.state()
    }

    pub fn set_backup_folder(&self, folder: &Path) -> Result<BackupState, BackupError> {
        self.backup.set_folder(folder)
    }

    pub fn set_backup_enabled(&self, enabled: bool) -> Result<BackupState, BackupError> {
        self.backup.set_enabled(enabled)
    }

    pub async fn backup_now(&self) -> Result<BackupOutcome, BackupError> {
        self.backup.trigger_now().await
    }

    pub async fn backup_if_due(&self) -> Result<BackupOutcome, BackupError> {
        self.backup.trigger_if_due(Local::now()).await
    }
}

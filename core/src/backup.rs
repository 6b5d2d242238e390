//! Daily snapshot backups into a user-chosen folder.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::{SharedDatabase, lock_db};
use crate::error::{BackupError, StorageError};
use crate::state::{BackupStatus, StateHub};

const BACKUP_EXTENSION: &str = "sqlite";

/// Opaque, persistable reference to a backup folder. Only the
/// [`FolderAccess`] that issued it knows how to turn it back into a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderHandle {
    pub token: String,
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupState {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub folder: Option<FolderHandle>,
    #[serde(default)]
    pub last_backup_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_backup_error: Option<String>,
}

impl BackupState {
    /// Missing file means backups were never configured.
    pub fn load(path: &Path) -> Result<Self, BackupError> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                BackupError::Io(std::io::Error::new(ErrorKind::InvalidData, e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), BackupError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| BackupError::Io(std::io::Error::new(ErrorKind::InvalidData, e)))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Due when no backup exists yet or the last one was on an earlier local day.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Local>) -> bool {
        self.last_backup_at
            .is_none_or(|last| last.with_timezone(&Local).date_naive() < now.date_naive())
    }
}

// --- Folder access ---

/// Access to the backup folder, held for the duration of one backup.
/// Dropping it releases whatever the platform granted.
pub struct ScopedFolder {
    path: PathBuf,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ScopedFolder {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path, release: None }
    }

    #[must_use]
    pub fn with_release(path: PathBuf, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            path,
            release: Some(Box::new(release)),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedFolder {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

pub trait FolderAccess: Send + Sync {
    /// Turn a folder the user picked into a handle that can be persisted.
    fn grant(&self, path: &Path) -> Result<FolderHandle, BackupError>;

    /// Reacquire access to a previously granted folder.
    fn resolve(&self, handle: &FolderHandle) -> Result<ScopedFolder, BackupError>;
}

/// Handles are plain paths; resolving checks the folder is still there.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathFolderAccess;

impl FolderAccess for PathFolderAccess {
    fn grant(&self, path: &Path) -> Result<FolderHandle, BackupError> {
        let path = std::fs::canonicalize(path).map_err(|_| BackupError::StaleFolder {
            path: path.to_path_buf(),
        })?;
        let handle = FolderHandle {
            token: path.to_string_lossy().into_owned(),
            label: path.display().to_string(),
        };
        self.resolve(&handle)?;
        Ok(handle)
    }

    fn resolve(&self, handle: &FolderHandle) -> Result<ScopedFolder, BackupError> {
        let path = PathBuf::from(&handle.token);
        if !path.is_dir() {
            return Err(BackupError::StaleFolder { path });
        }
        Ok(ScopedFolder::new(path))
    }
}

// --- Scheduler ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    NoFolder,
    NotDue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum BackupOutcome {
    Completed { path: PathBuf },
    Skipped(SkipReason),
    AlreadyRunning,
}

struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct BackupScheduler {
    db: SharedDatabase,
    access: Arc<dyn FolderAccess>,
    hub: Arc<StateHub>,
    state_path: PathBuf,
    file_stem: String,
    in_progress: AtomicBool,
}

fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf, BackupError> {
    let target = dir.join(name);
    let tmp = dir.join(format!(".{name}.tmp"));
    let denied = |e: std::io::Error| {
        if e.kind() == ErrorKind::PermissionDenied {
            BackupError::AccessDenied {
                path: dir.to_path_buf(),
            }
        } else {
            BackupError::Io(e)
        }
    };
    std::fs::write(&tmp, bytes).map_err(denied)?;
    std::fs::rename(&tmp, &target).map_err(denied)?;
    Ok(target)
}

impl BackupScheduler {
    pub fn new(
        db: SharedDatabase,
        access: Arc<dyn FolderAccess>,
        hub: Arc<StateHub>,
        state_path: PathBuf,
        file_stem: impl Into<String>,
    ) -> Self {
        Self {
            db,
            access,
            hub,
            state_path,
            file_stem: file_stem.into(),
            in_progress: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> Result<BackupState, BackupError> {
        BackupState::load(&self.state_path)
    }

    #[must_use]
    pub fn dated_file_name(&self, now: DateTime<Local>) -> String {
        format!(
            "{}-backup-{}.{BACKUP_EXTENSION}",
            self.file_stem,
            now.format("%Y-%m-%d")
        )
    }

    #[must_use]
    pub fn latest_file_name(&self) -> String {
        format!("{}-backup-latest.{BACKUP_EXTENSION}", self.file_stem)
    }

    /// Push the persisted state to observers.
    pub fn publish(&self) -> Result<BackupState, BackupError> {
        let state = self.state()?;
        self.publish_state(&state);
        Ok(state)
    }

    fn publish_state(&self, state: &BackupState) {
        self.hub.set_backup_status(BackupStatus {
            enabled: state.enabled,
            folder: state.folder.as_ref().map(|f| f.label.clone()),
            in_progress: self.is_running(),
            last_backup_at: state.last_backup_at,
            last_error: state.last_backup_error.clone(),
        });
    }

    fn update_state(&self, f: impl FnOnce(&mut BackupState)) -> Result<BackupState, BackupError> {
        let mut state = self.state()?;
        f(&mut state);
        state.save(&self.state_path)?;
        self.publish_state(&state);
        Ok(state)
    }

    /// Choose the backup folder. The folder must exist and be accessible now.
    pub fn set_folder(&self, path: &Path) -> Result<BackupState, BackupError> {
        let handle = self.access.grant(path)?;
        info!(folder = %handle.label, "backup folder set");
        self.update_state(|state| {
            state.folder = Some(handle);
            state.last_backup_error = None;
        })
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<BackupState, BackupError> {
        self.update_state(|state| state.enabled = enabled)
    }

    /// Back up once per local calendar day.
    pub async fn trigger_if_due(&self, now: DateTime<Local>) -> Result<BackupOutcome, BackupError> {
        let state = self.state()?;
        if !state.enabled {
            return Ok(BackupOutcome::Skipped(SkipReason::Disabled));
        }
        if state.folder.is_none() {
            return Ok(BackupOutcome::Skipped(SkipReason::NoFolder));
        }
        if self.is_running() {
            return Ok(BackupOutcome::AlreadyRunning);
        }
        if !state.is_due(now) {
            debug!("backup not due yet");
            return Ok(BackupOutcome::Skipped(SkipReason::NotDue));
        }
        self.run(now).await
    }

    /// Back up immediately, regardless of when the last backup ran.
    pub async fn trigger_now(&self) -> Result<BackupOutcome, BackupError> {
        let state = self.state()?;
        if !state.enabled {
            return Err(BackupError::Disabled);
        }
        if state.folder.is_none() {
            return Err(BackupError::NoFolder);
        }
        self.run(Local::now()).await
    }

    async fn run(&self, now: DateTime<Local>) -> Result<BackupOutcome, BackupError> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(BackupOutcome::AlreadyRunning);
        }
        let running = InProgress(&self.in_progress);

        let state = self.state()?;
        self.publish_state(&state);
        let Some(handle) = state.folder.clone() else {
            return Err(BackupError::NoFolder);
        };

        let db = Arc::clone(&self.db);
        let access = Arc::clone(&self.access);
        let dated = self.dated_file_name(now);
        let latest = self.latest_file_name();
        let result = tokio::task::spawn_blocking(move || -> Result<PathBuf, BackupError> {
            let folder = access.resolve(&handle)?;
            let bytes = lock_db(&db).export_snapshot()?;
            let written = write_atomic(folder.path(), &dated, &bytes)?;
            write_atomic(folder.path(), &latest, &bytes)?;
            Ok(written)
        })
        .await
        .map_err(|e| BackupError::Storage(StorageError::from(e)))
        .and_then(|r| r);

        let finished_at = now.with_timezone(&Utc);
        match result {
            Ok(path) => {
                info!(path = %path.display(), "backup written");
                let mut state = state;
                state.last_backup_at = Some(finished_at);
                state.last_backup_error = None;
                state.save(&self.state_path)?;
                drop(running);
                self.publish_state(&state);
                Ok(BackupOutcome::Completed { path })
            }
            Err(err) => {
                warn!(error = %err, "backup failed");
                let mut state = state;
                state.last_backup_error = Some(err.to_string());
                if let Err(save_err) = state.save(&self.state_path) {
                    warn!(error = %save_err, "failed to persist backup error");
                }
                drop(running);
                self.publish_state(&state);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{EntrySource, WeightEntry, WeightUnit};
    use chrono::{Duration, TimeZone};
    use std::sync::Mutex;
    use std::sync::mpsc;

    struct Fixture {
        _dir: tempfile::TempDir,
        folder: PathBuf,
        scheduler: BackupScheduler,
        hub: Arc<StateHub>,
    }

    fn fixture_with(access: Arc<dyn FolderAccess>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("backups");
        std::fs::create_dir(&folder).unwrap();
        let db = Database::open_in_memory().unwrap();
        db.insert_or_replace(&WeightEntry::new(
            80.0,
            WeightUnit::Kilograms,
            EntrySource::Manual,
            Utc::now(),
        ))
        .unwrap();
        let hub = Arc::new(StateHub::new());
        let scheduler = BackupScheduler::new(
            Arc::new(Mutex::new(db)),
            access,
            Arc::clone(&hub),
            dir.path().join("backup-state.json"),
            "heft",
        );
        Fixture {
            _dir: dir,
            folder,
            scheduler,
            hub,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(PathFolderAccess))
    }

    fn noon(day: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, day, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_trigger_now_requires_configuration() {
        let f = fixture();
        assert!(matches!(
            f.scheduler.trigger_now().await,
            Err(BackupError::Disabled)
        ));
        f.scheduler.set_enabled(true).unwrap();
        assert!(matches!(
            f.scheduler.trigger_now().await,
            Err(BackupError::NoFolder)
        ));
        assert_eq!(
            f.scheduler.trigger_if_due(noon(1)).await.unwrap(),
            BackupOutcome::Skipped(SkipReason::NoFolder)
        );
    }

    #[tokio::test]
    async fn test_backup_writes_dated_and_latest_files() {
        let f = fixture();
        f.scheduler.set_folder(&f.folder).unwrap();
        f.scheduler.set_enabled(true).unwrap();

        let outcome = f.scheduler.trigger_if_due(noon(15)).await.unwrap();
        let dated = std::fs::canonicalize(&f.folder)
            .unwrap()
            .join("heft-backup-2024-06-15.sqlite");
        assert_eq!(outcome, BackupOutcome::Completed { path: dated.clone() });

        let latest = f.folder.join("heft-backup-latest.sqlite");
        assert_eq!(std::fs::read(&dated).unwrap(), std::fs::read(&latest).unwrap());
        let restored = Database::open(&latest).unwrap();
        assert_eq!(restored.count_active::<WeightEntry>().unwrap(), 1);

        let state = f.scheduler.state().unwrap();
        assert_eq!(state.last_backup_at, Some(noon(15).with_timezone(&Utc)));
        assert!(state.last_backup_error.is_none());
        assert_eq!(f.hub.snapshot().backup.last_backup_at, state.last_backup_at);
        assert!(!f.hub.snapshot().backup.in_progress);
    }

    #[tokio::test]
    async fn test_trigger_if_due_runs_once_per_day() {
        let f = fixture();
        f.scheduler.set_folder(&f.folder).unwrap();
        f.scheduler.set_enabled(true).unwrap();

        assert!(matches!(
            f.scheduler.trigger_if_due(noon(15)).await.unwrap(),
            BackupOutcome::Completed { .. }
        ));
        let later_same_day = noon(15) + Duration::hours(6);
        assert_eq!(
            f.scheduler.trigger_if_due(later_same_day).await.unwrap(),
            BackupOutcome::Skipped(SkipReason::NotDue)
        );
        assert!(matches!(
            f.scheduler.trigger_if_due(noon(16)).await.unwrap(),
            BackupOutcome::Completed { .. }
        ));
        assert!(f.folder.join("heft-backup-2024-06-16.sqlite").exists());
    }

    #[tokio::test]
    async fn test_disabled_schedule_is_skipped() {
        let f = fixture();
        f.scheduler.set_folder(&f.folder).unwrap();
        assert_eq!(
            f.scheduler.trigger_if_due(noon(1)).await.unwrap(),
            BackupOutcome::Skipped(SkipReason::Disabled)
        );
    }

    #[tokio::test]
    async fn test_stale_folder_is_reported_and_persisted() {
        let f = fixture();
        f.scheduler.set_folder(&f.folder).unwrap();
        f.scheduler.set_enabled(true).unwrap();
        std::fs::remove_dir(&f.folder).unwrap();

        let err = f.scheduler.trigger_now().await.unwrap_err();
        assert!(matches!(err, BackupError::StaleFolder { .. }));
        let state = f.scheduler.state().unwrap();
        assert!(state.last_backup_error.unwrap().contains("no longer available"));
        assert!(state.last_backup_at.is_none());
        assert!(!f.scheduler.is_running());
    }

    #[test]
    fn test_set_folder_rejects_missing_directory() {
        let f = fixture();
        let err = f.scheduler.set_folder(&f.folder.join("nope")).unwrap_err();
        assert!(matches!(err, BackupError::StaleFolder { .. }));
        assert!(f.scheduler.state().unwrap().folder.is_none());
    }

    #[test]
    fn test_scoped_folder_releases_on_drop() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let scope = ScopedFolder::with_release(PathBuf::from("/tmp"), move || {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(!released.load(Ordering::SeqCst));
        drop(scope);
        assert!(released.load(Ordering::SeqCst));
    }

    /// Folder access that blocks inside `resolve` until the test lets it go.
    struct GatedAccess {
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl FolderAccess for GatedAccess {
        fn grant(&self, path: &Path) -> Result<FolderHandle, BackupError> {
            PathFolderAccess.grant(path)
        }

        fn resolve(&self, handle: &FolderHandle) -> Result<ScopedFolder, BackupError> {
            let _ = self.release.lock().unwrap().recv();
            PathFolderAccess.resolve(handle)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_trigger_reports_already_running() {
        let (tx, rx) = mpsc::channel();
        let f = fixture_with(Arc::new(GatedAccess {
            release: Mutex::new(rx),
        }));
        f.scheduler.set_folder(&f.folder).unwrap();
        f.scheduler.set_enabled(true).unwrap();
        let scheduler = Arc::new(f.scheduler);

        let first = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.trigger_now().await }
        });
        while !scheduler.is_running() {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        assert_eq!(
            scheduler.trigger_now().await.unwrap(),
            BackupOutcome::AlreadyRunning
        );
        tx.send(()).unwrap();
        assert!(matches!(
            first.await.unwrap().unwrap(),
            BackupOutcome::Completed { .. }
        ));
        assert!(!scheduler.is_running());
    }
}

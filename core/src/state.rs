//! Observable application state.
//!
//! Settings and profile live in the store, sync and backup progress live in
//! their engines. `StateHub` folds them into one value that observers can
//! watch, refreshed after every write that affects them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::db::Database;
use crate::error::StorageResult;
use crate::models::{Profile, Settings};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStatus {
    pub enabled: bool,
    pub in_progress: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackupStatus {
    pub enabled: bool,
    pub folder: Option<String>,
    pub in_progress: bool,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AppState {
    pub settings: Settings,
    pub profile: Profile,
    pub sync: SyncStatus,
    pub backup: BackupStatus,
}

pub struct StateHub {
    tx: watch::Sender<AppState>,
}

impl Default for StateHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StateHub {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(AppState::default());
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AppState> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> AppState {
        self.tx.borrow().clone()
    }

    /// Re-read settings and profile from the store.
    pub fn reload(&self, db: &Database) -> StorageResult<()> {
        let settings = db.settings()?;
        let profile = db.profile()?;
        self.tx.send_modify(|state| {
            state.sync.enabled = settings.sync_enabled;
            state.sync.last_sync_at = settings.last_sync_at;
            state.sync.last_error.clone_from(&settings.last_sync_error);
            state.settings = settings;
            state.profile = profile;
        });
        Ok(())
    }

    pub fn set_sync_in_progress(&self, in_progress: bool) {
        self.tx.send_if_modified(|state| {
            let changed = state.sync.in_progress != in_progress;
            state.sync.in_progress = in_progress;
            changed
        });
    }

    pub fn set_backup_status(&self, status: BackupStatus) {
        self.tx.send_if_modified(|state| {
            let changed = state.backup != status;
            state.backup = status;
            changed
        });
    }
}

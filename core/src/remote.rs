//! Replica implementations the coordinator can sync against.
//!
//! Both share [`ReplicaState`], which applies the replica side of the
//! protocol: keep the newest copy of every row and hand back what changed
//! since the client last synced.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::Record;
use crate::error::SyncError;
use crate::models::{
    Note, Profile, RemoteChanges, Settings, SyncResponse, SyncSnapshot, WeightEntry,
};
use crate::sync::RemoteReplica;

const REPLICA_FILE: &str = "replica.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRow<T> {
    row: T,
    received_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ReplicaState {
    #[serde(default)]
    notes: BTreeMap<String, StoredRow<Note>>,
    #[serde(default)]
    weight_entries: BTreeMap<String, StoredRow<WeightEntry>>,
    #[serde(default)]
    profile: Option<StoredRow<Profile>>,
    #[serde(default)]
    settings: Option<StoredRow<Settings>>,
    #[serde(default)]
    clock: Option<DateTime<Utc>>,
}

/// Store `row` unless the replica holds a strictly newer copy.
fn store_if_newer<R: Record>(slot: &mut Option<StoredRow<R>>, row: R, at: DateTime<Utc>) -> bool {
    if let Some(existing) = slot {
        if existing.row.meta().updated_at > row.meta().updated_at {
            return false;
        }
    }
    *slot = Some(StoredRow { row, received_at: at });
    true
}

fn merge_rows<R: Record>(
    rows: &mut BTreeMap<String, StoredRow<R>>,
    pushed: Vec<R>,
    at: DateTime<Utc>,
    accepted: &mut Vec<String>,
    stored: &mut HashSet<String>,
    refused: &mut HashSet<String>,
) {
    for row in pushed {
        let id = row.id().to_string();
        let mut slot = rows.remove(&id);
        if store_if_newer(&mut slot, row, at) {
            stored.insert(id.clone());
        } else {
            refused.insert(id.clone());
        }
        if let Some(slot) = slot {
            rows.insert(id.clone(), slot);
        }
        accepted.push(id);
    }
}

fn changed_rows<R: Record>(
    rows: &BTreeMap<String, StoredRow<R>>,
    since: Option<DateTime<Utc>>,
    stored: &HashSet<String>,
    refused: &HashSet<String>,
) -> Vec<R> {
    rows.values()
        .filter(|s| {
            let id = s.row.id();
            refused.contains(id)
                || (!stored.contains(id) && since.is_none_or(|since| s.received_at > since))
        })
        .map(|s| s.row.clone())
        .collect()
}

fn changed_singleton<R: Record>(
    slot: Option<&StoredRow<R>>,
    since: Option<DateTime<Utc>>,
    stored: bool,
) -> Option<R> {
    let slot = slot?;
    if stored || since.is_some_and(|since| slot.received_at <= since) {
        return None;
    }
    Some(slot.row.clone())
}

impl ReplicaState {
    /// Next `synced_at`, strictly after every value handed out before.
    fn tick(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let at = match self.clock {
            Some(last) if last >= now => last + Duration::microseconds(1),
            _ => now,
        };
        self.clock = Some(at);
        at
    }

    pub fn apply(&mut self, snapshot: SyncSnapshot, now: DateTime<Utc>) -> SyncResponse {
        let synced_at = self.tick(now);
        let since = snapshot.last_sync_at;
        let mut accepted = Vec::new();
        let mut stored = HashSet::new();
        let mut refused = HashSet::new();

        merge_rows(
            &mut self.notes,
            snapshot.pending_notes,
            synced_at,
            &mut accepted,
            &mut stored,
            &mut refused,
        );
        merge_rows(
            &mut self.weight_entries,
            snapshot.pending_weight_entries,
            synced_at,
            &mut accepted,
            &mut stored,
            &mut refused,
        );

        accepted.push(snapshot.profile.id.clone());
        let profile_stored = store_if_newer(&mut self.profile, snapshot.profile, synced_at);
        accepted.push(snapshot.settings.id.clone());
        let settings_stored = store_if_newer(&mut self.settings, snapshot.settings, synced_at);

        let remote_changes = RemoteChanges {
            notes: changed_rows(&self.notes, since, &stored, &refused),
            weight_entries: changed_rows(&self.weight_entries, since, &stored, &refused),
            profile: changed_singleton(self.profile.as_ref(), since, profile_stored),
            settings: changed_singleton(self.settings.as_ref(), since, settings_stored),
        };
        debug!(
            accepted = accepted.len(),
            stored = stored.len(),
            changes = remote_changes.len(),
            "replica applied push"
        );

        SyncResponse {
            accepted_ids: accepted,
            remote_changes,
            synced_at,
        }
    }

    #[must_use]
    pub fn weight_entry_count(&self) -> usize {
        self.weight_entries
            .values()
            .filter(|s| !s.row.meta.is_deleted)
            .count()
    }

    #[must_use]
    pub fn weight_entry(&self, id: &str) -> Option<&WeightEntry> {
        self.weight_entries.get(id).map(|s| &s.row)
    }

    #[must_use]
    pub fn note_count(&self) -> usize {
        self.notes.values().filter(|s| !s.row.meta.is_deleted).count()
    }
}

// --- In-memory replica ---

/// Replica held in process memory. Shared between stores through an `Arc`
/// to model several devices on one account.
#[derive(Debug)]
pub struct InMemoryReplica {
    state: Mutex<ReplicaState>,
    available: AtomicBool,
    calls: AtomicUsize,
}

impl Default for InMemoryReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryReplica {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ReplicaState::default()),
            available: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    /// Simulate losing or regaining the connection.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inspect<T>(&self, f: impl FnOnce(&ReplicaState) -> T) -> T {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&state)
    }
}

#[async_trait]
impl RemoteReplica for InMemoryReplica {
    async fn sync(&self, snapshot: SyncSnapshot) -> Result<SyncResponse, SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(SyncError::RemoteUnavailable("replica is offline".to_string()));
        }
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(state.apply(snapshot, Utc::now()))
    }
}

// --- Directory replica ---

/// Replica persisted as a JSON document inside a directory.
///
/// The directory itself must already exist (it is typically a folder synced
/// by some other tool); a missing directory means the remote is unreachable.
#[derive(Debug, Clone)]
pub struct LocalDirReplica {
    root: PathBuf,
}

impl LocalDirReplica {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sync_blocking(root: &Path, snapshot: SyncSnapshot) -> Result<SyncResponse, SyncError> {
        if !root.is_dir() {
            return Err(SyncError::RemoteUnavailable(format!(
                "replica directory {} does not exist",
                root.display()
            )));
        }
        let unavailable = |e: std::io::Error| SyncError::RemoteUnavailable(e.to_string());
        let path = root.join(REPLICA_FILE);

        let mut state = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<ReplicaState>(&bytes).map_err(|e| {
                SyncError::Rejected(format!("replica file {} is corrupt: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ReplicaState::default(),
            Err(e) => return Err(unavailable(e)),
        };

        let response = state.apply(snapshot, Utc::now());

        let json = serde_json::to_vec_pretty(&state)
            .map_err(|e| SyncError::Rejected(e.to_string()))?;
        let tmp = root.join(format!("{REPLICA_FILE}.tmp"));
        std::fs::write(&tmp, json).map_err(unavailable)?;
        std::fs::rename(&tmp, &path).map_err(unavailable)?;
        Ok(response)
    }
}

#[async_trait]
impl RemoteReplica for LocalDirReplica {
    async fn sync(&self, snapshot: SyncSnapshot) -> Result<SyncResponse, SyncError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || Self::sync_blocking(&root, snapshot))
            .await
            .map_err(|e| SyncError::RemoteUnavailable(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntrySource, WeightUnit};

    fn snapshot(entries: Vec<WeightEntry>, since: Option<DateTime<Utc>>) -> SyncSnapshot {
        SyncSnapshot {
            pending_notes: Vec::new(),
            pending_weight_entries: entries,
            profile: Profile::default(),
            settings: Settings::default(),
            last_sync_at: since,
        }
    }

    fn entry(value: f64) -> WeightEntry {
        WeightEntry::new(value, WeightUnit::Kilograms, EntrySource::Manual, Utc::now())
    }

    #[test]
    fn test_pushed_rows_are_accepted_and_not_echoed() {
        let mut state = ReplicaState::default();
        let e = entry(80.0);
        let response = state.apply(snapshot(vec![e.clone()], None), Utc::now());

        assert!(response.accepted_ids.contains(&e.id));
        assert!(response.remote_changes.weight_entries.is_empty());
        assert_eq!(state.weight_entry_count(), 1);
    }

    #[test]
    fn test_changes_since_last_sync_are_returned() {
        let mut state = ReplicaState::default();
        let first = state.apply(snapshot(vec![], None), Utc::now());

        let other_device = entry(81.0);
        state.apply(snapshot(vec![other_device.clone()], None), Utc::now());

        let response = state.apply(snapshot(vec![], Some(first.synced_at)), Utc::now());
        assert_eq!(response.remote_changes.weight_entries, vec![other_device]);
    }

    #[test]
    fn test_stale_push_is_accepted_but_newer_copy_returned() {
        let mut state = ReplicaState::default();
        let mut newer = entry(80.0);
        newer.meta.updated_at = Utc::now() + Duration::minutes(10);
        let seeded = state.apply(snapshot(vec![newer.clone()], None), Utc::now());

        let mut stale = newer.clone();
        stale.value = 70.0;
        stale.meta.updated_at = Utc::now();
        let response = state.apply(snapshot(vec![stale], Some(seeded.synced_at)), Utc::now());

        assert!(response.accepted_ids.contains(&newer.id));
        assert_eq!(response.remote_changes.weight_entries, vec![newer]);
    }

    #[test]
    fn test_synced_at_is_strictly_increasing() {
        let mut state = ReplicaState::default();
        let now = Utc::now();
        let a = state.apply(snapshot(vec![], None), now).synced_at;
        let b = state.apply(snapshot(vec![], None), now).synced_at;
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_in_memory_replica_offline() {
        let replica = InMemoryReplica::new();
        replica.set_available(false);
        let err = replica.sync(snapshot(vec![], None)).await.unwrap_err();
        assert!(matches!(err, SyncError::RemoteUnavailable(_)));
        assert_eq!(replica.calls(), 1);
    }

    #[tokio::test]
    async fn test_local_dir_replica_persists_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let e = entry(79.0);
        LocalDirReplica::new(dir.path().to_path_buf())
            .sync(snapshot(vec![e.clone()], None))
            .await
            .unwrap();

        let response = LocalDirReplica::new(dir.path().to_path_buf())
            .sync(snapshot(vec![], None))
            .await
            .unwrap();
        assert_eq!(response.remote_changes.weight_entries, vec![e]);
        assert!(dir.path().join(REPLICA_FILE).exists());
    }

    #[tokio::test]
    async fn test_local_dir_replica_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let replica = LocalDirReplica::new(dir.path().join("unmounted"));
        let err = replica.sync(snapshot(vec![], None)).await.unwrap_err();
        assert!(matches!(err, SyncError::RemoteUnavailable(_)));
    }
}

//! Reconciliation between the local store and a remote replica.
//!
//! At most one cycle runs per coordinator. Requests that arrive while a cycle
//! is in flight are latched and coalesced into a single follow-up cycle.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::{Database, PushReceipt, Record, SharedDatabase, lock_db};
use crate::error::{StorageError, StorageResult, SyncError};
use crate::models::{
    Note, Profile, Settings, SyncResponse, SyncSnapshot, SyncState, WeightEntry,
};
use crate::state::StateHub;

/// The server side of sync: takes everything pending on this device and
/// answers with what it accepted and what changed elsewhere.
#[async_trait]
pub trait RemoteReplica: Send + Sync {
    async fn sync(&self, snapshot: SyncSnapshot) -> Result<SyncResponse, SyncError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Another request owns the cycle; this one was folded into it.
    Coalesced,
    Disabled,
    UpToDate,
    Completed {
        cycles: usize,
        pushed: usize,
        pulled: usize,
    },
    Failed {
        message: String,
    },
}

#[derive(Debug, Default)]
struct CycleState {
    running: bool,
    rerun_requested: bool,
    force_rerun: bool,
}

enum CycleResult {
    UpToDate,
    Synced { pushed: usize, pulled: usize },
}

/// Returns the coordinator to idle if a cycle is abandoned (the request
/// future dropped mid-await, or a panic).
struct RunningGuard<'a> {
    cycle: &'a Mutex<CycleState>,
    hub: &'a StateHub,
    armed: bool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.cycle.lock().unwrap_or_else(PoisonError::into_inner);
            *state = CycleState::default();
            drop(state);
            self.hub.set_sync_in_progress(false);
        }
    }
}

pub struct SyncCoordinator {
    db: SharedDatabase,
    remote: Arc<dyn RemoteReplica>,
    hub: Arc<StateHub>,
    cycle: Mutex<CycleState>,
}

impl SyncCoordinator {
    pub fn new(db: SharedDatabase, remote: Arc<dyn RemoteReplica>, hub: Arc<StateHub>) -> Self {
        Self {
            db,
            remote,
            hub,
            cycle: Mutex::new(CycleState::default()),
        }
    }

    fn lock_cycle(&self) -> MutexGuard<'_, CycleState> {
        self.cycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock_cycle().running
    }

    /// Run sync cycles until no further request is pending.
    ///
    /// `force` contacts the remote even when nothing is pending locally.
    pub async fn request_sync(&self, force: bool) -> SyncOutcome {
        {
            let mut state = self.lock_cycle();
            if state.running {
                state.rerun_requested = true;
                state.force_rerun |= force;
                debug!(force, "sync already running, request coalesced");
                return SyncOutcome::Coalesced;
            }
            state.running = true;
        }
        let mut guard = RunningGuard {
            cycle: &self.cycle,
            hub: &self.hub,
            armed: true,
        };
        self.hub.set_sync_in_progress(true);

        let mut force = force;
        let mut cycles = 0;
        let mut pushed = 0;
        let mut pulled = 0;

        let outcome = loop {
            let finished = match self.run_cycle(force).await {
                Ok(CycleResult::Synced {
                    pushed: p,
                    pulled: q,
                }) => {
                    cycles += 1;
                    pushed += p;
                    pulled += q;
                    None
                }
                Ok(CycleResult::UpToDate) => Some(SyncOutcome::UpToDate),
                Err(SyncError::Disabled) => Some(SyncOutcome::Disabled),
                Err(err) => Some(SyncOutcome::Failed {
                    message: err.to_string(),
                }),
            };

            let mut state = self.lock_cycle();
            let may_rerun = !matches!(
                finished,
                Some(SyncOutcome::Disabled | SyncOutcome::Failed { .. })
            );
            if may_rerun && state.rerun_requested {
                state.rerun_requested = false;
                force = std::mem::take(&mut state.force_rerun);
                continue;
            }
            *state = CycleState::default();
            guard.armed = false;
            drop(state);

            break match finished {
                Some(failed @ SyncOutcome::Failed { .. }) => failed,
                Some(other) if cycles == 0 => other,
                _ => SyncOutcome::Completed {
                    cycles,
                    pushed,
                    pulled,
                },
            };
        };

        self.hub.set_sync_in_progress(false);
        info!(?outcome, "sync request finished");
        outcome
    }

    async fn run_cycle(&self, force: bool) -> Result<CycleResult, SyncError> {
        let db = Arc::clone(&self.db);
        let prepared = tokio::task::spawn_blocking(move || prepare_snapshot(&lock_db(&db), force))
            .await
            .map_err(StorageError::from)??;

        let (snapshot, sent) = match prepared {
            Prepared::Disabled => return Err(SyncError::Disabled),
            Prepared::UpToDate => return Ok(CycleResult::UpToDate),
            Prepared::Push { snapshot, sent } => (snapshot, sent),
        };
        let pushed = snapshot.pending_notes.len() + snapshot.pending_weight_entries.len();
        debug!(pushed, force, "sync cycle started");

        let response = match self.remote.sync(snapshot).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "sync cycle failed");
                let refused = matches!(err, SyncError::Rejected(_)).then_some(sent);
                self.record_failure(&err, refused).await;
                return Err(err);
            }
        };

        let db = Arc::clone(&self.db);
        let hub = Arc::clone(&self.hub);
        let applied = tokio::task::spawn_blocking(move || {
            let db = lock_db(&db);
            let pulled = apply_response(&db, &response, &sent)?;
            hub.reload(&db)?;
            Ok::<_, StorageError>(pulled)
        })
        .await
        .map_err(StorageError::from)
        .and_then(|r| r);

        match applied {
            Ok(pulled) => {
                debug!(pushed, pulled, "sync cycle complete");
                Ok(CycleResult::Synced { pushed, pulled })
            }
            Err(err) => {
                let err = SyncError::from(err);
                warn!(error = %err, "failed to apply sync response");
                self.record_failure(&err, None).await;
                Err(err)
            }
        }
    }

    /// Persist the error text. Rows the replica refused are flagged so they
    /// show as failed until the next cycle pushes them again.
    async fn record_failure(&self, err: &SyncError, refused: Option<SentRows>) {
        let db = Arc::clone(&self.db);
        let hub = Arc::clone(&self.hub);
        let message = err.to_string();
        let recorded = tokio::task::spawn_blocking(move || {
            let db = lock_db(&db);
            db.transaction(|conn| {
                if let Some(sent) = &refused {
                    sent.mark_in(conn, SyncState::Error)?;
                }
                Database::record_sync_failure_in(conn, &message)
            })?;
            hub.reload(&db)
        })
        .await;
        match recorded {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to persist sync error"),
            Err(e) => warn!(error = %e, "sync error bookkeeping task panicked"),
        }
    }
}

/// Receipts for every row a cycle sent, per kind.
#[derive(Debug)]
struct SentRows {
    notes: Vec<PushReceipt>,
    weight_entries: Vec<PushReceipt>,
    profile: Vec<PushReceipt>,
    settings: Vec<PushReceipt>,
}

impl SentRows {
    fn of(snapshot: &SyncSnapshot) -> Self {
        Self {
            notes: snapshot.pending_notes.iter().map(PushReceipt::of).collect(),
            weight_entries: snapshot
                .pending_weight_entries
                .iter()
                .map(PushReceipt::of)
                .collect(),
            profile: vec![PushReceipt::of(&snapshot.profile)],
            settings: vec![PushReceipt::of(&snapshot.settings)],
        }
    }

    fn accepted(&self, ids: &[String]) -> Self {
        let ids: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let keep = |rows: &[PushReceipt]| {
            rows.iter()
                .filter(|r| ids.contains(r.id.as_str()))
                .cloned()
                .collect::<Vec<_>>()
        };
        Self {
            notes: keep(&self.notes),
            weight_entries: keep(&self.weight_entries),
            profile: keep(&self.profile),
            settings: keep(&self.settings),
        }
    }

    fn mark_in(&self, conn: &Connection, state: SyncState) -> StorageResult<()> {
        Database::set_push_state_in::<Note>(conn, &self.notes, state)?;
        Database::set_push_state_in::<WeightEntry>(conn, &self.weight_entries, state)?;
        Database::set_push_state_in::<Profile>(conn, &self.profile, state)?;
        Database::set_push_state_in::<Settings>(conn, &self.settings, state)?;
        Ok(())
    }
}

enum Prepared {
    Disabled,
    UpToDate,
    Push {
        snapshot: SyncSnapshot,
        sent: SentRows,
    },
}

fn prepare_snapshot(db: &Database, force: bool) -> StorageResult<Prepared> {
    let settings = db.settings()?;
    if !settings.sync_enabled {
        return Ok(Prepared::Disabled);
    }
    let snapshot = SyncSnapshot {
        pending_notes: db.fetch_pending::<Note>()?,
        pending_weight_entries: db.fetch_pending::<WeightEntry>()?,
        profile: db.profile()?,
        last_sync_at: settings.last_sync_at,
        settings,
    };
    if !force && !snapshot.has_pending_rows() && snapshot.last_sync_at.is_some() {
        return Ok(Prepared::UpToDate);
    }
    let sent = SentRows::of(&snapshot);
    Ok(Prepared::Push { snapshot, sent })
}

/// Apply a replica answer in one transaction: clear accepted rows that are
/// unchanged since they were sent, pull remote changes, record the sync time.
fn apply_response(
    db: &Database,
    response: &SyncResponse,
    sent: &SentRows,
) -> StorageResult<usize> {
    db.transaction(|conn| {
        sent.accepted(&response.accepted_ids).mark_in(conn, SyncState::Synced)?;

        let changes = &response.remote_changes;
        let mut pulled = 0;
        pulled += apply_all(conn, &changes.notes)?;
        pulled += apply_all(conn, &changes.weight_entries)?;
        pulled += apply_all(conn, changes.profile.as_slice())?;
        pulled += apply_all(conn, changes.settings.as_slice())?;

        Database::record_sync_success_in(conn, response.synced_at)?;
        Ok(pulled)
    })
}

fn apply_all<R: Record>(conn: &Connection, rows: &[R]) -> StorageResult<usize> {
    let mut applied = 0;
    for row in rows {
        if Database::apply_remote_in(conn, row)? {
            applied += 1;
        }
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntrySource, RemoteChanges, WeightUnit};
    use chrono::Utc;
    use crate::remote::InMemoryReplica;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn device(replica: Arc<dyn RemoteReplica>) -> (SharedDatabase, SyncCoordinator) {
        let db = Database::open_in_memory().unwrap();
        db.set_sync_enabled(true).unwrap();
        let db = Arc::new(Mutex::new(db));
        let coordinator = SyncCoordinator::new(Arc::clone(&db), replica, Arc::new(StateHub::new()));
        (db, coordinator)
    }

    fn log(db: &SharedDatabase, value: f64) -> WeightEntry {
        lock_db(db)
            .insert_or_replace(&WeightEntry::new(
                value,
                WeightUnit::Kilograms,
                EntrySource::Manual,
                Utc::now(),
            ))
            .unwrap()
    }

    /// Replica that parks every call until released.
    struct GatedReplica {
        inner: InMemoryReplica,
        entered: Notify,
        release: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteReplica for GatedReplica {
        async fn sync(&self, snapshot: SyncSnapshot) -> Result<SyncResponse, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.sync(snapshot).await
        }
    }

    #[tokio::test]
    async fn test_push_marks_rows_synced() {
        let replica = Arc::new(InMemoryReplica::new());
        let (db, coordinator) = device(replica.clone());
        let entry = log(&db, 80.0);

        let outcome = coordinator.request_sync(false).await;
        assert_eq!(
            outcome,
            SyncOutcome::Completed {
                cycles: 1,
                pushed: 1,
                pulled: 0
            }
        );

        let db = lock_db(&db);
        let stored = db.get::<WeightEntry>(&entry.id).unwrap().unwrap();
        assert_eq!(stored.meta.sync_state, SyncState::Synced);
        assert!(db.settings().unwrap().last_sync_at.is_some());
        assert_eq!(replica.inspect(|s| s.weight_entry_count()), 1);
    }

    #[tokio::test]
    async fn test_disabled_sync_does_nothing() {
        let replica = Arc::new(InMemoryReplica::new());
        let (db, coordinator) = device(replica.clone());
        lock_db(&db).set_sync_enabled(false).unwrap();
        log(&db, 80.0);

        assert_eq!(coordinator.request_sync(true).await, SyncOutcome::Disabled);
        assert_eq!(replica.calls(), 0);
    }

    #[tokio::test]
    async fn test_up_to_date_skips_remote_unless_forced() {
        let replica = Arc::new(InMemoryReplica::new());
        let (_db, coordinator) = device(replica.clone());

        assert!(matches!(
            coordinator.request_sync(false).await,
            SyncOutcome::Completed { cycles: 1, .. }
        ));
        assert_eq!(coordinator.request_sync(false).await, SyncOutcome::UpToDate);
        assert_eq!(replica.calls(), 1);

        assert!(matches!(
            coordinator.request_sync(true).await,
            SyncOutcome::Completed { .. }
        ));
        assert_eq!(replica.calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_retried_next_time() {
        let replica = Arc::new(InMemoryReplica::new());
        let (db, coordinator) = device(replica.clone());
        let entry = log(&db, 80.0);

        replica.set_available(false);
        let outcome = coordinator.request_sync(false).await;
        assert!(matches!(outcome, SyncOutcome::Failed { .. }));
        {
            let db = lock_db(&db);
            let settings = db.settings().unwrap();
            assert!(settings.last_sync_error.unwrap().contains("offline"));
            assert!(settings.last_sync_at.is_none());
            let stored = db.get::<WeightEntry>(&entry.id).unwrap().unwrap();
            assert_eq!(stored.meta.sync_state, SyncState::Pending);
        }
        assert!(!coordinator.is_running());

        replica.set_available(true);
        assert!(matches!(
            coordinator.request_sync(false).await,
            SyncOutcome::Completed { pushed: 1, .. }
        ));
        assert!(lock_db(&db).settings().unwrap().last_sync_error.is_none());
    }

    #[tokio::test]
    async fn test_two_devices_converge() {
        let replica: Arc<dyn RemoteReplica> = Arc::new(InMemoryReplica::new());
        let (phone, phone_sync) = device(Arc::clone(&replica));
        let (tablet, tablet_sync) = device(Arc::clone(&replica));

        let entry = log(&phone, 82.0);
        phone_sync.request_sync(false).await;
        let outcome = tablet_sync.request_sync(true).await;
        assert!(matches!(outcome, SyncOutcome::Completed { pulled, .. } if pulled >= 1));

        let pulled = lock_db(&tablet).get::<WeightEntry>(&entry.id).unwrap().unwrap();
        assert!((pulled.value - 82.0).abs() < f64::EPSILON);
        assert_eq!(pulled.meta.sync_state, SyncState::Synced);

        // Deletion on the tablet travels back to the phone.
        lock_db(&tablet).soft_delete::<WeightEntry>(&entry.id).unwrap();
        tablet_sync.request_sync(false).await;
        phone_sync.request_sync(true).await;
        assert_eq!(lock_db(&phone).count_active::<WeightEntry>().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_settings_edits_propagate_but_sync_switch_stays_local() {
        let replica: Arc<dyn RemoteReplica> = Arc::new(InMemoryReplica::new());
        let (phone, phone_sync) = device(Arc::clone(&replica));
        let (tablet, tablet_sync) = device(Arc::clone(&replica));
        tablet_sync.request_sync(true).await;

        {
            let db = lock_db(&phone);
            let mut settings = db.settings().unwrap();
            settings.preferred_unit = WeightUnit::Pounds;
            db.update(&settings).unwrap();
        }
        phone_sync.request_sync(true).await;
        tablet_sync.request_sync(true).await;

        let settings = lock_db(&tablet).settings().unwrap();
        assert_eq!(settings.preferred_unit, WeightUnit::Pounds);
        assert!(settings.sync_enabled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_requests_during_cycle_coalesce_into_one_rerun() {
        let gated = Arc::new(GatedReplica {
            inner: InMemoryReplica::new(),
            entered: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let (db, coordinator) = device(gated.clone());
        let coordinator = Arc::new(coordinator);
        log(&db, 80.0);

        let first = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.request_sync(false).await }
        });
        gated.entered.notified().await;

        // Edit while the push is in flight, then ask twice more.
        let late = log(&db, 79.5);
        assert_eq!(coordinator.request_sync(false).await, SyncOutcome::Coalesced);
        assert_eq!(coordinator.request_sync(false).await, SyncOutcome::Coalesced);

        gated.release.notify_one();
        gated.entered.notified().await;
        gated.release.notify_one();

        let outcome = first.await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Completed {
                cycles: 2,
                pushed: 2,
                pulled: 0
            }
        );
        assert_eq!(gated.calls.load(Ordering::SeqCst), 2);
        assert!(!coordinator.is_running());

        let db = lock_db(&db);
        let stored = db.get::<WeightEntry>(&late.id).unwrap().unwrap();
        assert_eq!(stored.meta.sync_state, SyncState::Synced);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_edit_to_row_in_flight_is_pushed_by_rerun() {
        let gated = Arc::new(GatedReplica {
            inner: InMemoryReplica::new(),
            entered: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let (db, coordinator) = device(gated.clone());
        let coordinator = Arc::new(coordinator);
        let mut entry = log(&db, 80.0);

        let first = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.request_sync(false).await }
        });
        gated.entered.notified().await;

        // The replica is about to accept 80.0 for this very row.
        entry.value = 78.0;
        lock_db(&db).update(&entry).unwrap();
        assert_eq!(coordinator.request_sync(false).await, SyncOutcome::Coalesced);

        gated.release.notify_one();
        gated.entered.notified().await;
        gated.release.notify_one();

        assert!(matches!(
            first.await.unwrap(),
            SyncOutcome::Completed { cycles: 2, pushed: 2, .. }
        ));
        let remote_value = gated
            .inner
            .inspect(|s| s.weight_entry(&entry.id).map(|e| e.value));
        assert_eq!(remote_value, Some(78.0));

        let stored = lock_db(&db).get::<WeightEntry>(&entry.id).unwrap().unwrap();
        assert_eq!(stored.meta.sync_state, SyncState::Synced);
        assert!((stored.value - 78.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_accepted_row_edited_after_snapshot_stays_pending() {
        let db = Database::open_in_memory().unwrap();
        db.set_sync_enabled(true).unwrap();

        // A row pulled from a device whose clock runs an hour ahead.
        let mut remote = WeightEntry::new(
            81.0,
            WeightUnit::Kilograms,
            EntrySource::Manual,
            Utc::now(),
        );
        remote.meta.updated_at = Utc::now() + chrono::Duration::hours(1);
        remote.meta.sync_state = SyncState::Synced;
        db.apply_remote(&remote).unwrap();

        let mut entry = remote.clone();
        entry.value = 79.0;
        let entry = db.update(&entry).unwrap().unwrap();

        let Prepared::Push { snapshot, sent } = prepare_snapshot(&db, false).unwrap() else {
            panic!("expected a push");
        };
        assert_eq!(snapshot.pending_weight_entries.len(), 1);

        let mut later = entry.clone();
        later.value = 78.0;
        db.update(&later).unwrap();

        let response = SyncResponse {
            accepted_ids: vec![entry.id.clone()],
            remote_changes: RemoteChanges::default(),
            synced_at: Utc::now(),
        };
        apply_response(&db, &response, &sent).unwrap();

        let stored = db.get::<WeightEntry>(&entry.id).unwrap().unwrap();
        assert_eq!(stored.meta.sync_state, SyncState::Pending);
        assert!((stored.value - 78.0).abs() < f64::EPSILON);

        let pending = db.fetch_pending::<WeightEntry>().unwrap();
        assert_eq!(pending.len(), 1);
        assert!((pending[0].value - 78.0).abs() < f64::EPSILON);
    }

    /// Replica that refuses every push while `refusing` is set.
    struct RefusingReplica {
        inner: InMemoryReplica,
        refusing: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl RemoteReplica for RefusingReplica {
        async fn sync(&self, snapshot: SyncSnapshot) -> Result<SyncResponse, SyncError> {
            if self.refusing.load(Ordering::SeqCst) {
                return Err(SyncError::Rejected("quota exceeded".to_string()));
            }
            self.inner.sync(snapshot).await
        }
    }

    #[tokio::test]
    async fn test_rejected_push_flags_rows_and_retries_them() {
        let replica = Arc::new(RefusingReplica {
            inner: InMemoryReplica::new(),
            refusing: std::sync::atomic::AtomicBool::new(true),
        });
        let (db, coordinator) = device(replica.clone());
        let entry = log(&db, 80.0);

        let outcome = coordinator.request_sync(false).await;
        assert!(matches!(outcome, SyncOutcome::Failed { message } if message.contains("quota")));
        {
            let db = lock_db(&db);
            let stored = db.get::<WeightEntry>(&entry.id).unwrap().unwrap();
            assert_eq!(stored.meta.sync_state, SyncState::Error);
            assert_eq!(db.fetch_pending::<WeightEntry>().unwrap().len(), 1);
        }

        replica.refusing.store(false, Ordering::SeqCst);
        assert!(matches!(
            coordinator.request_sync(false).await,
            SyncOutcome::Completed { pushed: 1, .. }
        ));
        let stored = lock_db(&db).get::<WeightEntry>(&entry.id).unwrap().unwrap();
        assert_eq!(stored.meta.sync_state, SyncState::Synced);
    }

    #[tokio::test]
    async fn test_dropped_request_returns_to_idle() {
        let gated = Arc::new(GatedReplica {
            inner: InMemoryReplica::new(),
            entered: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let (_db, coordinator) = device(gated.clone());

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            coordinator.request_sync(true),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(!coordinator.is_running());
    }
}

//! Reconciliation engine.
//!
//! Drains locally flagged records into the remote in a fixed order:
//! deletions, creations, updates, then routine activation and nested slots.
//! Failures are collected per record and never abort a pass.

mod workspace;

pub use workspace::*;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::{RecordFailure, SyncError};
use crate::freshness::CacheFreshness;
use crate::models::{
    is_temp_id, ActivationSync, Course, Entity, EntityKind, IdMap, LocalRecord, Patch, Routine,
    SlotSync, StudyMaterial, Task, Teacher,
};
use crate::remote::{RemoteApi, RemoteError, RoutineRemote};
use crate::repository::confirm_activation;
use crate::store::LocalStore;

const UNSYNCED_REFERENCE: &str = "references a record that has not synced yet";

/// Outcome of one reconciliation pass for one entity kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub store: String,
    pub deleted: usize,
    pub created: usize,
    pub updated: usize,
    pub activations: usize,
    pub slots: usize,
    pub failures: Vec<RecordFailure>,
    /// Another pass for the same kind was already running
    pub skipped: bool,
}

impl SyncSummary {
    fn new(kind: EntityKind) -> Self {
        Self {
            store: kind.store_name().to_string(),
            ..Default::default()
        }
    }

    fn skipped(kind: EntityKind) -> Self {
        Self {
            skipped: true,
            ..Self::new(kind)
        }
    }

    pub fn succeeded(&self) -> usize {
        self.deleted + self.created + self.updated + self.activations + self.slots
    }

    pub fn changed(&self) -> bool {
        self.succeeded() > 0
    }

    /// The per-record failures as an error value, if there were any.
    pub fn partial_failure(&self) -> Option<SyncError> {
        if self.failures.is_empty() {
            None
        } else {
            Some(SyncError::ReconciliationPartialFailure {
                failures: self.failures.clone(),
            })
        }
    }

    fn fail(&mut self, record_id: &str, phase: &str, err: impl std::fmt::Display) {
        tracing::warn!(store = %self.store, record_id, phase, "Replay failed: {}", err);
        self.failures.push(RecordFailure {
            store: self.store.clone(),
            record_id: record_id.to_string(),
            phase: phase.to_string(),
            message: err.to_string(),
        });
    }
}

/// Summaries of every kind reconciled by one sync trigger.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summaries: Vec<SyncSummary>,
}

impl SyncReport {
    pub fn failure_count(&self) -> usize {
        self.summaries.iter().map(|s| s.failures.len()).sum()
    }

    pub fn partial_failure(&self) -> Option<SyncError> {
        let failures: Vec<_> = self
            .summaries
            .iter()
            .flat_map(|s| s.failures.iter().cloned())
            .collect();
        if failures.is_empty() {
            None
        } else {
            Some(SyncError::ReconciliationPartialFailure { failures })
        }
    }

    pub fn summary(&self, kind: EntityKind) -> Option<&SyncSummary> {
        self.summaries.iter().find(|s| s.store == kind.store_name())
    }
}

/// Releases the per-kind guard when a pass ends, however it ends.
struct PassGuard<'a> {
    running: &'a Mutex<HashSet<EntityKind>>,
    kind: EntityKind,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.kind);
        }
    }
}

pub struct SyncEngine {
    store: LocalStore,
    freshness: CacheFreshness,
    record_timeout: Duration,
    running: Mutex<HashSet<EntityKind>>,
}

impl SyncEngine {
    pub fn new(store: LocalStore, freshness: CacheFreshness, record_timeout: Duration) -> Self {
        Self {
            store,
            freshness,
            record_timeout,
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_running(&self, kind: EntityKind) -> bool {
        self.running
            .lock()
            .map(|running| running.contains(&kind))
            .unwrap_or(false)
    }

    fn try_begin(&self, kind: EntityKind) -> Option<PassGuard<'_>> {
        let mut running = self.running.lock().ok()?;
        if !running.insert(kind) {
            return None;
        }
        Some(PassGuard {
            running: &self.running,
            kind,
        })
    }

    /// Reconcile one entity kind. A pass already running for the kind makes
    /// this call a no-op that reports `skipped`.
    pub async fn reconcile<E, R>(&self, remote: &R) -> SyncSummary
    where
        E: Entity,
        R: RemoteApi<E> + ?Sized,
    {
        let Some(_guard) = self.try_begin(E::KIND) else {
            tracing::debug!("{} reconciliation already running", E::KIND);
            return SyncSummary::skipped(E::KIND);
        };

        let mut summary = SyncSummary::new(E::KIND);
        self.replay_records::<E, R>(remote, &mut summary).await;
        self.finish(E::KIND, summary).await
    }

    /// Reconcile routines, including activation intents and nested slots.
    pub async fn reconcile_routines(&self, remote: &dyn RoutineRemote) -> SyncSummary {
        let Some(_guard) = self.try_begin(EntityKind::Routine) else {
            tracing::debug!("routines reconciliation already running");
            return SyncSummary::skipped(EntityKind::Routine);
        };

        let mut summary = SyncSummary::new(EntityKind::Routine);
        self.replay_records::<Routine, dyn RoutineRemote>(remote, &mut summary)
            .await;
        self.replay_activation(remote, &mut summary).await;
        self.replay_slots(remote, &mut summary).await;
        self.finish(EntityKind::Routine, summary).await
    }

    async fn finish(&self, kind: EntityKind, summary: SyncSummary) -> SyncSummary {
        if summary.changed() {
            self.freshness.refresh_kind(kind).await;
        }
        if summary.changed() || !summary.failures.is_empty() {
            tracing::info!(
                store = %summary.store,
                deleted = summary.deleted,
                created = summary.created,
                updated = summary.updated,
                activations = summary.activations,
                slots = summary.slots,
                failed = summary.failures.len(),
                "Reconciliation pass finished"
            );
        }
        summary
    }

    /// Bound one remote call by the per-record timeout.
    async fn within<T>(
        &self,
        call: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        match tokio::time::timeout(self.record_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Network(format!(
                "timed out after {}ms",
                self.record_timeout.as_millis()
            ))),
        }
    }

    /// Phases 1 to 3: deletions, creations, updates.
    async fn replay_records<E, R>(&self, remote: &R, summary: &mut SyncSummary)
    where
        E: Entity,
        R: RemoteApi<E> + ?Sized,
    {
        let dirty = match self.store.get_dirty::<E>().await {
            Ok(dirty) => dirty,
            Err(e) => {
                summary.fail("*", "load", e);
                return;
            }
        };

        let mut deletions = Vec::new();
        let mut creations = Vec::new();
        let mut updates = Vec::new();
        for record in dirty {
            match record {
                LocalRecord::PendingDelete(entity) => deletions.push(entity),
                LocalRecord::PendingCreate(entity) => creations.push(entity),
                LocalRecord::PendingUpdate { entity, diff } => updates.push((entity, diff)),
                // Only nested state is pending
                LocalRecord::Synced(_) => {}
            }
        }

        for entity in deletions {
            let id = entity.id();
            match self.within(remote.delete(id)).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => match self.store.delete::<E>(id).await {
                    Ok(()) => summary.deleted += 1,
                    Err(e) => summary.fail(id, "delete", e),
                },
                Err(e) => summary.fail(id, "delete", e),
            }
        }

        let mut issued = IdMap::new();
        for local in creations {
            let temp = local.id();
            if local.references_unsynced() {
                summary.fail(temp, "create", UNSYNCED_REFERENCE);
                continue;
            }
            tracing::debug!(store = %summary.store, temp_id = temp, "Replaying creation");
            match self.within(remote.create(&local.to_new())).await {
                Ok(mut created) => {
                    created.adopt_local_state(&local);
                    let server_id = created.id().to_string();
                    match self.store.replace(temp, &LocalRecord::Synced(created)).await {
                        Ok(()) => {
                            summary.created += 1;
                            issued.insert(temp.to_string(), server_id);
                        }
                        Err(e) => summary.fail(temp, "create", e),
                    }
                }
                Err(e) => summary.fail(temp, "create", e),
            }
        }
        if !issued.is_empty() {
            self.remap_references(&issued, summary).await;
        }

        for (local, diff) in updates {
            let id = local.id();
            if diff.references_unsynced() {
                summary.fail(id, "update", UNSYNCED_REFERENCE);
                continue;
            }
            let result = if diff.is_empty() {
                Ok(None)
            } else {
                self.within(remote.update(id, &diff)).await
            };
            match result {
                Ok(returned) => {
                    let synced = match returned {
                        Some(mut server) => {
                            server.adopt_local_state(&local);
                            server
                        }
                        None => local.clone(),
                    };
                    match self.store.put(&LocalRecord::Synced(synced)).await {
                        Ok(()) => summary.updated += 1,
                        Err(e) => summary.fail(id, "update", e),
                    }
                }
                Err(RemoteError::NotFound(msg)) => {
                    // Gone server-side; retrying would never succeed
                    tracing::warn!(store = %summary.store, id, "Dropping update for missing record: {}", msg);
                    if let Err(e) = self.store.delete::<E>(id).await {
                        summary.fail(id, "update", e);
                    }
                }
                Err(e) => summary.fail(id, "update", e),
            }
        }
    }

    /// Phase 4: activation intents.
    async fn replay_activation(&self, remote: &dyn RoutineRemote, summary: &mut SyncSummary) {
        let pending = match self.pending_routines().await {
            Some(pending) => pending,
            None => return,
        };

        for record in pending {
            let routine = record.entity();
            let id = routine.id.as_str();
            match routine.pending_activation {
                Some(ActivationSync::Activate) => {
                    let result = match self.within(remote.deactivate_others(id)).await {
                        Ok(()) => self.within(remote.set_active(id, true)).await,
                        Err(e) => Err(e),
                    };
                    match result {
                        Ok(()) => match confirm_activation(&self.store, id).await {
                            Ok(_) => summary.activations += 1,
                            Err(e) => summary.fail(id, "activation", e),
                        },
                        Err(e) => summary.fail(id, "activation", e),
                    }
                }
                Some(ActivationSync::Deactivate) => {
                    match self.within(remote.set_active(id, false)).await {
                        Ok(()) => {
                            let mut record = record.clone();
                            record.entity_mut().pending_activation = None;
                            match self.store.put(&record).await {
                                Ok(()) => summary.activations += 1,
                                Err(e) => summary.fail(id, "activation", e),
                            }
                        }
                        Err(e) => summary.fail(id, "activation", e),
                    }
                }
                None => {}
            }
        }
    }

    /// Phase 5: nested slots, against the routine's current identifier.
    async fn replay_slots(&self, remote: &dyn RoutineRemote, summary: &mut SyncSummary) {
        let pending = match self.pending_routines().await {
            Some(pending) => pending,
            None => return,
        };

        for mut record in pending {
            let routine_id = record.id().to_string();
            let before = summary.slots;
            let routine = record.entity_mut();

            let deleting: Vec<_> = routine
                .slots
                .iter()
                .filter(|s| s.sync == SlotSync::PendingDelete)
                .map(|s| s.id.clone())
                .collect();
            for slot_id in deleting {
                match self.within(remote.delete_slot(&routine_id, &slot_id)).await {
                    Ok(()) | Err(RemoteError::NotFound(_)) => {
                        routine.remove_slot(&slot_id);
                        summary.slots += 1;
                    }
                    Err(e) => summary.fail(&slot_id, "slot", e),
                }
            }

            let creating: Vec<_> = routine
                .slots
                .iter()
                .filter(|s| s.sync == SlotSync::PendingCreate)
                .cloned()
                .collect();
            for local in creating {
                if local.references_unsynced() {
                    summary.fail(&local.id, "slot", UNSYNCED_REFERENCE);
                    continue;
                }
                match self.within(remote.add_slot(&routine_id, &local.to_new())).await {
                    Ok(server) => {
                        routine.remove_slot(&local.id);
                        routine.upsert_slot(server);
                        summary.slots += 1;
                    }
                    Err(e) => summary.fail(&local.id, "slot", e),
                }
            }

            let updating: Vec<_> = routine
                .slots
                .iter()
                .filter_map(|s| match &s.sync {
                    SlotSync::PendingUpdate { diff } => Some((s.id.clone(), diff.clone())),
                    _ => None,
                })
                .collect();
            for (slot_id, diff) in updating {
                if diff.references_unsynced() {
                    summary.fail(&slot_id, "slot", UNSYNCED_REFERENCE);
                    continue;
                }
                match self.within(remote.update_slot(&routine_id, &slot_id, &diff)).await {
                    Ok(returned) => {
                        if let Some(slot) = routine.slot_mut(&slot_id) {
                            slot.sync = SlotSync::Synced;
                        }
                        if let Some(server) = returned {
                            routine.upsert_slot(server);
                        }
                        summary.slots += 1;
                    }
                    Err(RemoteError::NotFound(_)) => {
                        routine.remove_slot(&slot_id);
                        summary.slots += 1;
                    }
                    Err(e) => summary.fail(&slot_id, "slot", e),
                }
            }

            if summary.slots > before {
                if let Err(e) = self.store.put(&record).await {
                    summary.fail(&routine_id, "slot", e);
                }
            }
        }
    }

    /// Point every stored reference to a freshly created record at its
    /// server id, so dependants replay with identifiers the server issued.
    async fn remap_references(&self, issued: &IdMap, summary: &mut SyncSummary) {
        let results = [
            self.remap_kind::<Course>(issued).await,
            self.remap_kind::<Teacher>(issued).await,
            self.remap_kind::<StudyMaterial>(issued).await,
            self.remap_kind::<Routine>(issued).await,
            self.remap_kind::<Task>(issued).await,
        ];
        for err in results.into_iter().filter_map(Result::err) {
            summary.fail("*", "remap", err);
        }
    }

    async fn remap_kind<T: Entity>(&self, issued: &IdMap) -> Result<(), SyncError> {
        let mut changed = Vec::new();
        for mut record in self.store.get_all::<T>(None).await? {
            if record.remap_ids(issued) {
                changed.push(record);
            }
        }
        if !changed.is_empty() {
            tracing::debug!("Rewrote references in {} {} record(s)", changed.len(), T::KIND);
            self.store.put_all(&changed).await?;
        }
        Ok(())
    }

    /// Routines that the server knows and that still carry nested changes.
    async fn pending_routines(&self) -> Option<Vec<LocalRecord<Routine>>> {
        match self.store.get_dirty::<Routine>().await {
            Ok(dirty) => Some(
                dirty
                    .into_iter()
                    .filter(|r| r.is_visible() && !is_temp_id(r.id()))
                    .collect(),
            ),
            Err(e) => {
                tracing::warn!("Could not read pending routines: {}", e);
                None
            }
        }
    }
}

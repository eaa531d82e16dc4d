//! Routine repository: activation and nested slot operations.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::{degrade, EntityRepository, RepositoryContext};
use crate::errors::SyncError;
use crate::models::{
    is_temp_id, temp_id, ActivationSync, CreateRoutineRequest, CreateSlotRequest, LocalRecord,
    Patch, Routine, RoutineSlot, SlotSync, UpdateSlotRequest,
};
use crate::remote::{RemoteError, RoutineRemote};
use crate::store::LocalStore;

/// Routine repository. Plain CRUD is reached through `Deref`.
pub struct RoutineRepository {
    base: EntityRepository<Routine, dyn RoutineRemote>,
}

impl Deref for RoutineRepository {
    type Target = EntityRepository<Routine, dyn RoutineRemote>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl RoutineRepository {
    pub fn new(context: &RepositoryContext, remote: Arc<dyn RoutineRemote>, max_age: Duration) -> Self {
        Self {
            base: EntityRepository::new(context, remote, max_age),
        }
    }

    /// Create a routine. An active input is created inactive and then goes
    /// through `activate`, so it never shares the active flag.
    pub async fn create(&self, mut input: CreateRoutineRequest) -> Result<Routine, SyncError> {
        let make_active = std::mem::take(&mut input.is_active);
        let created = self.base.create(input).await?;
        if !make_active {
            return Ok(created);
        }
        self.activate(&created.id).await
    }

    /// Bulk variant of `create`. When several inputs ask to be active, the
    /// last one wins.
    pub async fn import(
        &self,
        mut inputs: Vec<CreateRoutineRequest>,
    ) -> Result<Vec<Routine>, SyncError> {
        let active = inputs.iter().rposition(|i| i.is_active);
        for input in &mut inputs {
            input.is_active = false;
        }
        let mut created = self.base.import(inputs).await?;

        if let Some(index) = active.filter(|&i| i < created.len()) {
            let id = created[index].id.clone();
            let activated = self.activate(&id).await?;
            for routine in &mut created {
                routine.is_active = routine.id == id;
            }
            created[index] = activated;
        }
        Ok(created)
    }

    /// Make `id` the single active routine.
    ///
    /// Online, every other routine is deactivated before the target is
    /// activated, so the server never shows two active routines.
    pub async fn activate(&self, id: &str) -> Result<Routine, SyncError> {
        if self.acts_locally(id) {
            let target = self.require_local(id).await?;
            let records = self.store().get_all::<Routine>(None).await?;
            let changed = stage_activation(records, target.id());
            self.store().put_all(&changed).await?;
            tracing::debug!(id, "Activation of routine recorded for replay");
            return self.publish(changed, id).await;
        }

        let remote = self.remote();
        remote.deactivate_others(id).await?;
        remote.set_active(id, true).await?;
        tracing::info!(id, "Activated routine");

        degrade(
            confirm_activation(self.store(), id).await,
            "mirror routine activation",
        );
        self.update_view(|view| {
            for routine in view.iter_mut() {
                routine.is_active = routine.id == id;
                routine.pending_activation = None;
            }
        })
        .await;

        let mut routine = match self.cached(id).await {
            Some(record) => record.into_entity(),
            None => self.server_copy(id).await?,
        };
        routine.is_active = true;
        routine.pending_activation = None;
        self.upsert_view(&routine).await;
        Ok(routine)
    }

    pub async fn deactivate(&self, id: &str) -> Result<Routine, SyncError> {
        if self.acts_locally(id) {
            let mut record = self.require_local(id).await?;
            let routine = record.entity_mut();
            routine.is_active = false;
            routine.pending_activation = if is_temp_id(id) {
                None
            } else {
                Some(ActivationSync::Deactivate)
            };
            self.store().put(&record).await?;
            let routine = record.into_entity();
            self.upsert_view(&routine).await;
            return Ok(routine);
        }

        self.remote().set_active(id, false).await?;
        tracing::info!(id, "Deactivated routine");

        let mut routine = match self.cached(id).await {
            Some(mut record) => {
                let routine = record.entity_mut();
                routine.is_active = false;
                routine.pending_activation = None;
                self.mirror(&record, "mirror routine deactivation").await;
                record.into_entity()
            }
            None => self.server_copy(id).await?,
        };
        routine.is_active = false;
        self.upsert_view(&routine).await;
        Ok(routine)
    }

    pub async fn add_slot(
        &self,
        routine_id: &str,
        input: CreateSlotRequest,
    ) -> Result<RoutineSlot, SyncError> {
        RoutineSlot::validate_new(&input)?;

        let mut slot = RoutineSlot::from_new(temp_id(), routine_id, &input, Utc::now());
        if self.acts_locally(routine_id) || slot.references_unsynced() {
            let mut record = self.require_local(routine_id).await?;
            slot.sync = SlotSync::PendingCreate;
            record.entity_mut().upsert_slot(slot.clone());
            self.save(&record).await?;
            return Ok(slot);
        }

        let slot = self.remote().add_slot(routine_id, &input).await?;
        if let Some(mut record) = self.cached(routine_id).await {
            record.entity_mut().upsert_slot(slot.clone());
            self.mirror(&record, "mirror added slot").await;
            self.upsert_view(record.entity()).await;
        }
        Ok(slot)
    }

    pub async fn update_slot(
        &self,
        routine_id: &str,
        slot_id: &str,
        patch: UpdateSlotRequest,
    ) -> Result<RoutineSlot, SyncError> {
        if self.acts_locally(routine_id) || is_temp_id(slot_id) || patch.references_unsynced() {
            let mut record = self.require_local(routine_id).await?;
            let slot = record
                .entity_mut()
                .slot_mut(slot_id)
                .ok_or_else(|| slot_not_found(slot_id))?;
            slot.offline_update(&patch)?;
            let slot = slot.clone();
            record.entity_mut().sort_slots();
            self.save(&record).await?;
            return Ok(slot);
        }

        let mut cached = self.cached(routine_id).await;
        let local_slot = cached
            .as_ref()
            .and_then(|r| r.entity().slot(slot_id))
            .cloned();
        if local_slot
            .as_ref()
            .is_some_and(|s| s.sync == SlotSync::PendingDelete)
        {
            return Err(slot_not_found(slot_id));
        }

        let returned = self.remote().update_slot(routine_id, slot_id, &patch).await?;
        let mut updated = match (returned, &local_slot) {
            (Some(server), _) => server,
            (None, Some(local)) => {
                let mut slot = local.clone();
                patch.apply_to(&mut slot);
                slot
            }
            (None, None) => self
                .server_copy(routine_id)
                .await?
                .slot(slot_id)
                .cloned()
                .ok_or_else(|| slot_not_found(slot_id))?,
        };

        // Fields of an older offline edit that this write did not cover stay pending
        let sync = match local_slot.map(|s| s.sync) {
            Some(SlotSync::PendingUpdate { mut diff }) => {
                diff.forget(&patch);
                if diff.is_empty() {
                    SlotSync::Synced
                } else {
                    diff.apply_to(&mut updated);
                    SlotSync::PendingUpdate { diff }
                }
            }
            _ => SlotSync::Synced,
        };
        updated.sync = sync;

        if let Some(record) = cached.as_mut() {
            record.entity_mut().upsert_slot(updated.clone());
            self.mirror(record, "mirror updated slot").await;
            self.upsert_view(record.entity()).await;
        }
        Ok(updated)
    }

    pub async fn delete_slot(&self, routine_id: &str, slot_id: &str) -> Result<(), SyncError> {
        if self.acts_locally(routine_id) || is_temp_id(slot_id) {
            let mut record = self.require_local(routine_id).await?;
            let routine = record.entity_mut();
            let slot = routine.slot_mut(slot_id).ok_or_else(|| slot_not_found(slot_id))?;
            let never_synced = match &slot.sync {
                SlotSync::PendingCreate => true,
                SlotSync::PendingDelete => return Err(slot_not_found(slot_id)),
                SlotSync::Synced | SlotSync::PendingUpdate { .. } => false,
            };
            if never_synced {
                routine.remove_slot(slot_id);
            } else {
                // Deletion supersedes any pending slot diff
                slot.sync = SlotSync::PendingDelete;
            }
            return self.save(&record).await;
        }

        let cached = self.cached(routine_id).await;
        match self.remote().delete_slot(routine_id, slot_id).await {
            Ok(()) => {}
            Err(RemoteError::NotFound(msg)) => {
                let known = cached
                    .as_ref()
                    .is_some_and(|r| r.entity().slot(slot_id).is_some());
                if !known {
                    return Err(SyncError::NotFound(msg));
                }
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(mut record) = cached {
            record.entity_mut().remove_slot(slot_id);
            self.mirror(&record, "mirror deleted slot").await;
            self.upsert_view(record.entity()).await;
        }
        Ok(())
    }

    async fn save(&self, record: &LocalRecord<Routine>) -> Result<(), SyncError> {
        self.store().put(record).await?;
        self.upsert_view(record.entity()).await;
        Ok(())
    }

    /// Push changed routines into the view and return the target.
    async fn publish(
        &self,
        changed: Vec<LocalRecord<Routine>>,
        id: &str,
    ) -> Result<Routine, SyncError> {
        let mut target = None;
        for record in changed {
            if record.is_visible() {
                self.upsert_view(record.entity()).await;
            }
            if record.id() == id {
                target = Some(record.into_entity());
            }
        }
        target.ok_or_else(|| SyncError::NotFound(format!("routines {} not found", id)))
    }
}

fn slot_not_found(slot_id: &str) -> SyncError {
    SyncError::NotFound(format!("Routine slot {} not found", slot_id))
}

/// Record an offline activation: the target becomes the only active routine
/// locally and carries the intent. Returns the records that changed.
fn stage_activation(records: Vec<LocalRecord<Routine>>, target_id: &str) -> Vec<LocalRecord<Routine>> {
    let mut changed = Vec::new();
    for mut record in records {
        let routine = record.entity_mut();
        if routine.id == target_id {
            routine.is_active = true;
            routine.pending_activation = Some(ActivationSync::Activate);
        } else if routine.is_active || routine.needs_activation_sync() {
            // The target's replay deactivates the others server-side
            routine.is_active = false;
            if routine.needs_activation_sync() {
                routine.pending_activation = None;
            }
        } else {
            continue;
        }
        changed.push(record);
    }
    changed
}

/// Mirror a confirmed server-side activation into the store. The target
/// becomes the only active routine and activation intents are cleared.
pub(crate) async fn confirm_activation(
    store: &LocalStore,
    target_id: &str,
) -> Result<Vec<LocalRecord<Routine>>, SyncError> {
    let mut changed = Vec::new();
    for mut record in store.get_all::<Routine>(None).await? {
        let routine = record.entity_mut();
        let active = routine.id == target_id;
        if routine.is_active == active && routine.pending_activation.is_none() {
            continue;
        }
        routine.is_active = active;
        routine.pending_activation = None;
        changed.push(record);
    }
    store.put_all(&changed).await?;
    Ok(changed)
}

//! Routine and routine slot models.
//!
//! A routine owns an ordered collection of weekly slots. Each slot carries
//! its own sync state, independent of the parent routine's provenance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    is_temp_id, overlay, remap_opt, require, superseded, temp_id, Entity, EntityKind, IdMap,
    Patch,
};
use crate::errors::SyncError;

const WEEKDAYS: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

/// Pending change to the routine's active flag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ActivationSync {
    Activate,
    Deactivate,
}

/// Sync state of a nested slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SlotSync {
    #[default]
    Synced,
    PendingCreate,
    PendingUpdate {
        diff: UpdateSlotRequest,
    },
    PendingDelete,
}

impl SlotSync {
    pub fn is_synced(&self) -> bool {
        matches!(self, SlotSync::Synced)
    }
}

/// One weekly class slot within a routine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoutineSlot {
    pub id: String,
    pub routine_id: String,
    pub day_of_week: String,
    pub start_time: String,
    pub end_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teacher_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teacher_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Local-only; the server never sees or returns it
    #[serde(default, skip_serializing_if = "SlotSync::is_synced")]
    pub sync: SlotSync,
}

/// Request body for adding a slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSlotRequest {
    pub day_of_week: String,
    pub start_time: String,
    pub end_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teacher_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teacher_name: Option<String>,
}

/// Request body for updating a slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSlotRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teacher_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teacher_name: Option<String>,
}

impl RoutineSlot {
    pub fn validate_new(input: &CreateSlotRequest) -> Result<(), SyncError> {
        require(&input.day_of_week, "dayOfWeek", "Routine slot")?;
        require(&input.start_time, "startTime", "Routine slot")?;
        require(&input.end_time, "endTime", "Routine slot")
    }

    pub fn from_new(
        id: String,
        routine_id: &str,
        input: &CreateSlotRequest,
        now: DateTime<Utc>,
    ) -> Self {
        RoutineSlot {
            id,
            routine_id: routine_id.to_string(),
            day_of_week: input.day_of_week.clone(),
            start_time: input.start_time.clone(),
            end_time: input.end_time.clone(),
            room_number: input.room_number.clone(),
            section: input.section.clone(),
            course_id: input.course_id.clone(),
            course_name: input.course_name.clone(),
            teacher_id: input.teacher_id.clone(),
            teacher_name: input.teacher_name.clone(),
            created_at: Some(now.to_rfc3339()),
            sync: SlotSync::Synced,
        }
    }

    pub fn to_new(&self) -> CreateSlotRequest {
        CreateSlotRequest {
            day_of_week: self.day_of_week.clone(),
            start_time: self.start_time.clone(),
            end_time: self.end_time.clone(),
            room_number: self.room_number.clone(),
            section: self.section.clone(),
            course_id: self.course_id.clone(),
            course_name: self.course_name.clone(),
            teacher_id: self.teacher_id.clone(),
            teacher_name: self.teacher_name.clone(),
        }
    }

    /// Apply an offline edit to this slot, tracking the pending diff.
    pub fn offline_update(&mut self, patch: &UpdateSlotRequest) -> Result<(), SyncError> {
        let sync = match std::mem::take(&mut self.sync) {
            SlotSync::Synced => SlotSync::PendingUpdate {
                diff: patch.clone(),
            },
            SlotSync::PendingUpdate { mut diff } => {
                diff.merge(patch.clone());
                SlotSync::PendingUpdate { diff }
            }
            SlotSync::PendingCreate => SlotSync::PendingCreate,
            SlotSync::PendingDelete => {
                self.sync = SlotSync::PendingDelete;
                return Err(SyncError::NotFound(format!(
                    "Routine slot {} is pending deletion",
                    self.id
                )));
            }
        };
        patch.apply_to(self);
        self.sync = sync;
        Ok(())
    }

    /// Whether the slot points at a course or teacher the server has not seen.
    pub fn references_unsynced(&self) -> bool {
        self.course_id.as_deref().is_some_and(is_temp_id)
            || self.teacher_id.as_deref().is_some_and(is_temp_id)
    }

    fn remap_ids(&mut self, ids: &IdMap) -> bool {
        let course = remap_opt(&mut self.course_id, ids);
        let teacher = remap_opt(&mut self.teacher_id, ids);
        let diff = match &mut self.sync {
            SlotSync::PendingUpdate { diff } => diff.remap_ids(ids),
            _ => false,
        };
        course || teacher || diff
    }

    fn day_index(&self) -> usize {
        WEEKDAYS
            .iter()
            .position(|d| d.eq_ignore_ascii_case(self.day_of_week.trim()))
            .unwrap_or(WEEKDAYS.len())
    }
}

impl Patch<RoutineSlot> for UpdateSlotRequest {
    fn apply_to(&self, slot: &mut RoutineSlot) {
        if let Some(day) = &self.day_of_week {
            slot.day_of_week = day.clone();
        }
        if let Some(start) = &self.start_time {
            slot.start_time = start.clone();
        }
        if let Some(end) = &self.end_time {
            slot.end_time = end.clone();
        }
        overlay(&mut slot.room_number, self.room_number.clone());
        overlay(&mut slot.section, self.section.clone());
        overlay(&mut slot.course_id, self.course_id.clone());
        overlay(&mut slot.course_name, self.course_name.clone());
        overlay(&mut slot.teacher_id, self.teacher_id.clone());
        overlay(&mut slot.teacher_name, self.teacher_name.clone());
    }

    fn merge(&mut self, later: Self) {
        overlay(&mut self.day_of_week, later.day_of_week);
        overlay(&mut self.start_time, later.start_time);
        overlay(&mut self.end_time, later.end_time);
        overlay(&mut self.room_number, later.room_number);
        overlay(&mut self.section, later.section);
        overlay(&mut self.course_id, later.course_id);
        overlay(&mut self.course_name, later.course_name);
        overlay(&mut self.teacher_id, later.teacher_id);
        overlay(&mut self.teacher_name, later.teacher_name);
    }

    fn forget(&mut self, newer: &Self) {
        superseded(&mut self.day_of_week, &newer.day_of_week);
        superseded(&mut self.start_time, &newer.start_time);
        superseded(&mut self.end_time, &newer.end_time);
        superseded(&mut self.room_number, &newer.room_number);
        superseded(&mut self.section, &newer.section);
        superseded(&mut self.course_id, &newer.course_id);
        superseded(&mut self.course_name, &newer.course_name);
        superseded(&mut self.teacher_id, &newer.teacher_id);
        superseded(&mut self.teacher_name, &newer.teacher_name);
    }

    fn is_empty(&self) -> bool {
        *self == UpdateSlotRequest::default()
    }

    fn remap_ids(&mut self, ids: &IdMap) -> bool {
        let course = remap_opt(&mut self.course_id, ids);
        remap_opt(&mut self.teacher_id, ids) || course
    }

    fn references_unsynced(&self) -> bool {
        self.course_id.as_deref().is_some_and(is_temp_id)
            || self.teacher_id.as_deref().is_some_and(is_temp_id)
    }
}

/// A weekly class routine for one semester.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Routine {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub semester: String,
    #[serde(default)]
    pub is_active: bool,
    pub created_at: String,
    #[serde(default)]
    pub slots: Vec<RoutineSlot>,
    /// Local-only activation intent awaiting replay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_activation: Option<ActivationSync>,
}

/// Request body for creating a routine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoutineRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub semester: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slots: Vec<CreateSlotRequest>,
}

/// Request body for updating a routine's own fields.
///
/// Slots and the active flag are never part of a patch; they change through
/// the dedicated slot and activation operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRoutineRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semester: Option<String>,
}

impl Routine {
    pub fn needs_activation_sync(&self) -> bool {
        self.pending_activation == Some(ActivationSync::Activate)
    }

    pub fn needs_deactivation_sync(&self) -> bool {
        self.pending_activation == Some(ActivationSync::Deactivate)
    }

    pub fn slot(&self, slot_id: &str) -> Option<&RoutineSlot> {
        self.slots.iter().find(|s| s.id == slot_id)
    }

    pub fn slot_mut(&mut self, slot_id: &str) -> Option<&mut RoutineSlot> {
        self.slots.iter_mut().find(|s| s.id == slot_id)
    }

    /// Insert or replace a slot by id, keeping weekly order.
    pub fn upsert_slot(&mut self, slot: RoutineSlot) {
        match self.slot_mut(&slot.id) {
            Some(existing) => *existing = slot,
            None => self.slots.push(slot),
        }
        self.sort_slots();
    }

    pub fn remove_slot(&mut self, slot_id: &str) -> Option<RoutineSlot> {
        let index = self.slots.iter().position(|s| s.id == slot_id)?;
        Some(self.slots.remove(index))
    }

    /// Order slots by weekday, then start time.
    pub fn sort_slots(&mut self) {
        self.slots.sort_by(|a, b| {
            a.day_index()
                .cmp(&b.day_index())
                .then_with(|| a.start_time.cmp(&b.start_time))
        });
    }
}

impl Entity for Routine {
    type New = CreateRoutineRequest;
    type Patch = UpdateRoutineRequest;

    const KIND: EntityKind = EntityKind::Routine;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate_new(input: &CreateRoutineRequest) -> Result<(), SyncError> {
        require(&input.name, "name", "Routine")?;
        require(&input.semester, "semester", "Routine")?;
        input.slots.iter().try_for_each(RoutineSlot::validate_new)
    }

    fn from_new(id: String, input: &CreateRoutineRequest, now: DateTime<Utc>) -> Self {
        let slots = input
            .slots
            .iter()
            .map(|slot| RoutineSlot::from_new(uuid::Uuid::new_v4().to_string(), &id, slot, now))
            .collect();
        let mut routine = Routine {
            id,
            name: input.name.clone(),
            description: input.description.clone(),
            semester: input.semester.clone(),
            is_active: input.is_active,
            created_at: now.to_rfc3339(),
            slots,
            pending_activation: None,
        };
        routine.sort_slots();
        routine
    }

    /// Replays create the routine bare and inactive; slots and activation
    /// follow once the server id is known.
    fn to_new(&self) -> CreateRoutineRequest {
        CreateRoutineRequest {
            name: self.name.clone(),
            description: self.description.clone(),
            semester: self.semester.clone(),
            is_active: false,
            slots: Vec::new(),
        }
    }

    fn stamp_offline(&mut self) {
        if self.is_active {
            self.pending_activation = Some(ActivationSync::Activate);
        }
        for slot in &mut self.slots {
            slot.id = temp_id();
            slot.routine_id = self.id.clone();
            slot.sync = SlotSync::PendingCreate;
        }
    }

    fn has_pending_children(&self) -> bool {
        self.pending_activation.is_some() || self.slots.iter().any(|s| !s.sync.is_synced())
    }

    fn adopt_local_state(&mut self, local: &Routine) {
        if local.pending_activation.is_some() {
            self.pending_activation = local.pending_activation;
            self.is_active = local.is_active;
        }
        for slot in local.slots.iter().filter(|s| !s.sync.is_synced()) {
            let mut slot = slot.clone();
            slot.routine_id = self.id.clone();
            self.upsert_slot(slot);
        }
    }

    fn prune_for_view(&mut self) {
        self.slots.retain(|s| s.sync != SlotSync::PendingDelete);
    }

    fn remap_ids(&mut self, ids: &IdMap) -> bool {
        self.slots
            .iter_mut()
            .fold(false, |changed, slot| slot.remap_ids(ids) || changed)
    }
}

impl Patch<Routine> for UpdateRoutineRequest {
    fn apply_to(&self, routine: &mut Routine) {
        if let Some(name) = &self.name {
            routine.name = name.clone();
        }
        overlay(&mut routine.description, self.description.clone());
        if let Some(semester) = &self.semester {
            routine.semester = semester.clone();
        }
    }

    fn merge(&mut self, later: Self) {
        overlay(&mut self.name, later.name);
        overlay(&mut self.description, later.description);
        overlay(&mut self.semester, later.semester);
    }

    fn forget(&mut self, newer: &Self) {
        superseded(&mut self.name, &newer.name);
        superseded(&mut self.description, &newer.description);
        superseded(&mut self.semester, &newer.semester);
    }

    fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.semester.is_none()
    }
}

//! Data models for the NestTask sync core.
//!
//! Field names serialize in camelCase to match the remote API and the
//! web client's record shapes.

mod course;
mod material;
mod record;
mod routine;
mod task;
mod teacher;

pub use course::*;
pub use material::*;
pub use record::*;
pub use routine::*;
pub use task::*;
pub use teacher::*;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::SyncError;

/// Prefix carried by every locally generated identifier.
pub const TEMP_ID_PREFIX: &str = "offline_";

/// Generate a temporary identifier: prefix, millisecond timestamp, random suffix.
pub fn temp_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}{}_{}",
        TEMP_ID_PREFIX,
        Utc::now().timestamp_millis(),
        &suffix[..9]
    )
}

/// Whether an identifier was generated locally and never issued by the server.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Temporary identifier to server-issued identifier, filled as creations replay.
pub type IdMap = HashMap<String, String>;

/// Point `id` at its server identifier if it was replaced.
pub(crate) fn remap_id(id: &mut String, ids: &IdMap) -> bool {
    match ids.get(id.as_str()) {
        Some(server) => {
            *id = server.clone();
            true
        }
        None => false,
    }
}

pub(crate) fn remap_opt(id: &mut Option<String>, ids: &IdMap) -> bool {
    id.as_mut().is_some_and(|id| remap_id(id, ids))
}

pub(crate) fn remap_all(list: &mut [String], ids: &IdMap) -> bool {
    list.iter_mut().fold(false, |changed, id| remap_id(id, ids) || changed)
}

/// The entity types that have their own logical table in the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Task,
    Routine,
    Course,
    Teacher,
    Material,
}

impl EntityKind {
    /// Name of the local store table.
    pub fn store_name(&self) -> &'static str {
        match self {
            EntityKind::Task => "tasks",
            EntityKind::Routine => "routines",
            EntityKind::Course => "courses",
            EntityKind::Teacher => "teachers",
            EntityKind::Material => "materials",
        }
    }

    /// Path segment of the remote collection.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Material => "study-materials",
            other => other.store_name(),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.store_name())
    }
}

/// A domain record the sync core can cache, mutate offline and replay.
pub trait Entity: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Input accepted by `create`.
    type New: Clone + fmt::Debug + Serialize + Send + Sync;
    /// Partial update accepted by `update`.
    type Patch: Patch<Self>;

    const KIND: EntityKind;

    fn id(&self) -> &str;

    /// Logical owner for user-scoped entities.
    fn owner(&self) -> Option<&str> {
        None
    }

    /// Fill the owner of a create input from the repository scope, if the
    /// entity is user-scoped and the input does not name one.
    fn assign_owner(_input: &mut Self::New, _owner: &str) {}

    /// Reject inputs missing required fields.
    fn validate_new(input: &Self::New) -> Result<(), SyncError>;

    /// Build a record from create input, the way the server would.
    fn from_new(id: String, input: &Self::New, now: DateTime<Utc>) -> Self;

    /// Payload used to replay an offline creation. Never carries the id.
    fn to_new(&self) -> Self::New;

    /// Stamp nested collections when the record is created offline.
    fn stamp_offline(&mut self) {}

    /// Whether nested state has changes not yet pushed.
    fn has_pending_children(&self) -> bool {
        false
    }

    /// Carry local-only state over onto a record returned by the server.
    fn adopt_local_state(&mut self, _local: &Self) {}

    /// Drop nested items that are pending deletion before the record is shown.
    fn prune_for_view(&mut self) {}

    /// Rewrite references to records that have since been created on the
    /// server. Returns whether anything changed.
    fn remap_ids(&mut self, _ids: &IdMap) -> bool {
        false
    }

    /// Whether the replayed payload still points at a record that only
    /// exists locally.
    fn references_unsynced(&self) -> bool {
        false
    }
}

/// Explicit partial update for an entity. `None` fields leave the value untouched.
pub trait Patch<E>:
    Clone + fmt::Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Write every present field onto `entity`.
    fn apply_to(&self, entity: &mut E);

    /// Fold a later patch into this one; later values win.
    fn merge(&mut self, later: Self);

    /// Clear every field `newer` sets. Used when a newer write reached the
    /// server ahead of this one.
    fn forget(&mut self, newer: &Self);

    fn is_empty(&self) -> bool;

    fn remap_ids(&mut self, _ids: &IdMap) -> bool {
        false
    }

    fn references_unsynced(&self) -> bool {
        false
    }
}

/// Reject an empty or whitespace-only required field.
pub(crate) fn require(value: &str, field: &str, entity: &str) -> Result<(), SyncError> {
    if value.trim().is_empty() {
        return Err(SyncError::Validation(format!(
            "{} {} is required",
            entity, field
        )));
    }
    Ok(())
}

/// Clear `field` when `newer` carries a value for it.
pub(crate) fn superseded<T, U>(field: &mut Option<T>, newer: &Option<U>) {
    if newer.is_some() {
        *field = None;
    }
}

/// `later` wins when present.
pub(crate) fn overlay<T>(slot: &mut Option<T>, later: Option<T>) {
    if later.is_some() {
        *slot = later;
    }
}

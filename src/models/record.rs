//! Provenance wrapper for records held in the local store.

use serde::Serialize;

use super::{is_temp_id, Entity, IdMap, Patch};
use crate::errors::SyncError;

/// Synchronization state of a cached record, as persisted in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Synced,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::PendingCreate => "pending_create",
            SyncState::PendingUpdate => "pending_update",
            SyncState::PendingDelete => "pending_delete",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "synced" => Some(SyncState::Synced),
            "pending_create" => Some(SyncState::PendingCreate),
            "pending_update" => Some(SyncState::PendingUpdate),
            "pending_delete" => Some(SyncState::PendingDelete),
            _ => None,
        }
    }
}

/// Flag view of a record's provenance, in the web client's vocabulary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceFlags {
    pub is_offline: bool,
    pub is_offline_updated: bool,
    pub is_offline_deleted: bool,
}

/// A cached record together with its synchronization status.
///
/// Exactly one state applies at a time, so a record can never be both
/// pending creation and pending deletion.
#[derive(Debug, Clone)]
pub enum LocalRecord<E: Entity> {
    /// Matches the last known server state.
    Synced(E),
    /// Created while offline; the entity id is a temporary identifier.
    PendingCreate(E),
    /// Server-persisted record with local changes. `diff` holds only the
    /// fields changed since the last sync.
    PendingUpdate { entity: E, diff: E::Patch },
    /// Server-persisted record marked for deletion.
    PendingDelete(E),
}

impl<E: Entity> LocalRecord<E> {
    pub fn state(&self) -> SyncState {
        match self {
            LocalRecord::Synced(_) => SyncState::Synced,
            LocalRecord::PendingCreate(_) => SyncState::PendingCreate,
            LocalRecord::PendingUpdate { .. } => SyncState::PendingUpdate,
            LocalRecord::PendingDelete(_) => SyncState::PendingDelete,
        }
    }

    pub fn entity(&self) -> &E {
        match self {
            LocalRecord::Synced(e)
            | LocalRecord::PendingCreate(e)
            | LocalRecord::PendingDelete(e) => e,
            LocalRecord::PendingUpdate { entity, .. } => entity,
        }
    }

    pub fn entity_mut(&mut self) -> &mut E {
        match self {
            LocalRecord::Synced(e)
            | LocalRecord::PendingCreate(e)
            | LocalRecord::PendingDelete(e) => e,
            LocalRecord::PendingUpdate { entity, .. } => entity,
        }
    }

    pub fn into_entity(self) -> E {
        match self {
            LocalRecord::Synced(e)
            | LocalRecord::PendingCreate(e)
            | LocalRecord::PendingDelete(e) => e,
            LocalRecord::PendingUpdate { entity, .. } => entity,
        }
    }

    pub fn id(&self) -> &str {
        self.entity().id()
    }

    /// The temporary identifier of a record created offline.
    pub fn temp_id(&self) -> Option<&str> {
        match self {
            LocalRecord::PendingCreate(e) if is_temp_id(e.id()) => Some(e.id()),
            _ => None,
        }
    }

    pub fn diff(&self) -> Option<&E::Patch> {
        match self {
            LocalRecord::PendingUpdate { diff, .. } => Some(diff),
            _ => None,
        }
    }

    /// Whether anything about this record still has to reach the server.
    pub fn is_dirty(&self) -> bool {
        self.state() != SyncState::Synced || self.entity().has_pending_children()
    }

    /// Pending deletions are hidden from the in-memory view.
    pub fn is_visible(&self) -> bool {
        self.state() != SyncState::PendingDelete
    }

    pub fn flags(&self) -> ProvenanceFlags {
        ProvenanceFlags {
            is_offline: self.state() == SyncState::PendingCreate,
            is_offline_updated: self.state() == SyncState::PendingUpdate,
            is_offline_deleted: self.state() == SyncState::PendingDelete,
        }
    }

    /// Apply an offline edit. A record that was never synced stays a pending
    /// creation; a synced record accumulates the change into its diff.
    pub fn offline_update(self, patch: &E::Patch) -> Result<Self, SyncError> {
        match self {
            LocalRecord::Synced(mut entity) => {
                patch.apply_to(&mut entity);
                Ok(LocalRecord::PendingUpdate {
                    entity,
                    diff: patch.clone(),
                })
            }
            LocalRecord::PendingUpdate {
                mut entity,
                mut diff,
            } => {
                patch.apply_to(&mut entity);
                diff.merge(patch.clone());
                Ok(LocalRecord::PendingUpdate { entity, diff })
            }
            LocalRecord::PendingCreate(mut entity) => {
                patch.apply_to(&mut entity);
                Ok(LocalRecord::PendingCreate(entity))
            }
            LocalRecord::PendingDelete(entity) => Err(SyncError::NotFound(format!(
                "{} {} is pending deletion",
                E::KIND,
                entity.id()
            ))),
        }
    }

    /// Apply an offline deletion. Returns `None` when the record should be
    /// evicted outright because the server never saw it. Any pending diff on
    /// a synced record is dropped; the deletion supersedes it.
    pub fn offline_delete(self) -> Option<Self> {
        match self {
            LocalRecord::PendingCreate(_) => None,
            LocalRecord::Synced(entity)
            | LocalRecord::PendingUpdate { entity, .. }
            | LocalRecord::PendingDelete(entity) => Some(LocalRecord::PendingDelete(entity)),
        }
    }

    /// Rebuild the record around `server`, the result of an online write of
    /// `applied`. A diff left over from an offline session keeps only the
    /// fields the online write did not cover.
    pub fn after_online_update(self, mut server: E, applied: &E::Patch) -> Self {
        match self {
            LocalRecord::PendingUpdate { mut diff, .. } => {
                diff.forget(applied);
                if diff.is_empty() {
                    LocalRecord::Synced(server)
                } else {
                    diff.apply_to(&mut server);
                    LocalRecord::PendingUpdate {
                        entity: server,
                        diff,
                    }
                }
            }
            _ => LocalRecord::Synced(server),
        }
    }

    /// Rewrite references to records the server has since created, in the
    /// entity and in any pending diff.
    pub fn remap_ids(&mut self, ids: &IdMap) -> bool {
        let entity = self.entity_mut().remap_ids(ids);
        let diff = match self {
            LocalRecord::PendingUpdate { diff, .. } => diff.remap_ids(ids),
            _ => false,
        };
        entity || diff
    }

    /// Whether replaying this record would send a temporary id to the remote.
    pub fn references_unsynced(&self) -> bool {
        match self {
            LocalRecord::PendingCreate(entity) => entity.references_unsynced(),
            LocalRecord::PendingUpdate { diff, .. } => diff.references_unsynced(),
            LocalRecord::Synced(_) | LocalRecord::PendingDelete(_) => false,
        }
    }
}

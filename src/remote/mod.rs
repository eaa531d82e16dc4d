//! Remote API collaborators.
//!
//! The sync core only sees these traits; `HttpRemote` is the production
//! implementation and tests substitute in-memory doubles.

mod http;
mod retry;

pub use http::*;
pub use retry::*;

use std::fmt;

use async_trait::async_trait;

use crate::errors::SyncError;
use crate::models::{CreateSlotRequest, Entity, Routine, RoutineSlot, UpdateSlotRequest};

/// Failure reported by a remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Transport failure or server-side error; worth retrying
    Network(String),
    /// The server refused the payload
    Rejected(String),
    /// The addressed record does not exist server-side
    NotFound(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Network(_))
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Network(msg) => write!(f, "network error: {}", msg),
            RemoteError::Rejected(msg) => write!(f, "rejected: {}", msg),
            RemoteError::NotFound(msg) => write!(f, "not found: {}", msg),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Network(msg) => SyncError::RemoteUnavailable(msg),
            RemoteError::Rejected(msg) => SyncError::Validation(msg),
            RemoteError::NotFound(msg) => SyncError::NotFound(msg),
        }
    }
}

/// CRUD surface of one remote collection.
#[async_trait]
pub trait RemoteApi<E: Entity>: Send + Sync {
    /// Full listing, limited to one owner when `scope` is set.
    async fn fetch_all(&self, scope: Option<&str>) -> Result<Vec<E>, RemoteError>;

    async fn create(&self, input: &E::New) -> Result<E, RemoteError>;

    /// Apply a partial update. Servers that answer without a body yield `None`.
    async fn update(&self, id: &str, patch: &E::Patch) -> Result<Option<E>, RemoteError>;

    async fn delete(&self, id: &str) -> Result<(), RemoteError>;

    /// Create many records. Falls back to one create per input.
    async fn bulk_create(&self, inputs: &[E::New]) -> Result<Vec<E>, RemoteError> {
        let mut created = Vec::with_capacity(inputs.len());
        for input in inputs {
            created.push(self.create(input).await?);
        }
        Ok(created)
    }
}

/// Routine-specific remote calls on top of plain CRUD.
#[async_trait]
pub trait RoutineRemote: RemoteApi<Routine> {
    /// Clear the active flag on every routine except `id`.
    async fn deactivate_others(&self, id: &str) -> Result<(), RemoteError>;

    async fn set_active(&self, id: &str, active: bool) -> Result<(), RemoteError>;

    async fn add_slot(
        &self,
        routine_id: &str,
        slot: &CreateSlotRequest,
    ) -> Result<RoutineSlot, RemoteError>;

    async fn update_slot(
        &self,
        routine_id: &str,
        slot_id: &str,
        patch: &UpdateSlotRequest,
    ) -> Result<Option<RoutineSlot>, RemoteError>;

    async fn delete_slot(&self, routine_id: &str, slot_id: &str) -> Result<(), RemoteError>;
}

//! Entity repositories.
//!
//! Every operation branches on the connectivity signal: online operations go
//! to the remote and mirror the result locally, offline operations mutate
//! the local store and record what has to be replayed later.

mod routine;

pub use routine::*;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::connectivity::ConnectivitySignal;
use crate::errors::SyncError;
use crate::freshness::{CacheFreshness, CacheKey};
use crate::models::{is_temp_id, temp_id, Entity, LocalRecord, Patch};
use crate::remote::{RemoteApi, RemoteError};
use crate::store::LocalStore;

/// Result of a `load`. Reads never fail outright: when the remote is
/// unreachable the cached records are returned together with the error.
#[derive(Debug, Clone)]
pub struct Loaded<E> {
    pub records: Vec<E>,
    pub error: Option<SyncError>,
    /// Whether `records` came from the local store rather than a fresh fetch
    pub from_cache: bool,
}

/// Shared handles every repository needs.
#[derive(Clone)]
pub struct RepositoryContext {
    pub store: LocalStore,
    pub connectivity: ConnectivitySignal,
    pub freshness: CacheFreshness,
}

/// Load/create/update/delete for one entity type.
pub struct EntityRepository<E: Entity, R: RemoteApi<E> + ?Sized = dyn RemoteApi<E>> {
    store: LocalStore,
    remote: Arc<R>,
    connectivity: ConnectivitySignal,
    freshness: CacheFreshness,
    max_age: Duration,
    scope: Option<String>,
    view: RwLock<Vec<E>>,
}

impl<E: Entity, R: RemoteApi<E> + ?Sized> EntityRepository<E, R> {
    pub fn new(context: &RepositoryContext, remote: Arc<R>, max_age: Duration) -> Self {
        Self {
            store: context.store.clone(),
            remote,
            connectivity: context.connectivity.clone(),
            freshness: context.freshness.clone(),
            max_age,
            scope: None,
            view: RwLock::new(Vec::new()),
        }
    }

    /// Limit loads to one owner and stamp that owner on new records.
    pub fn with_scope(mut self, owner: Option<String>) -> Self {
        self.scope = owner;
        self
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub(crate) fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(E::KIND, self.scope())
    }

    /// Whether an operation on `id` must stay local: the device is offline,
    /// or the record only exists locally.
    pub(crate) fn acts_locally(&self, id: &str) -> bool {
        !self.connectivity.is_online() || is_temp_id(id)
    }

    /// Current in-memory view, without pending deletions.
    pub async fn snapshot(&self) -> Vec<E> {
        self.view.read().await.clone()
    }

    /// Every cached record with its sync state, pending deletions included.
    pub async fn local_records(&self) -> Vec<LocalRecord<E>> {
        degrade(self.store.get_all(self.scope()).await, "read local records")
    }

    pub async fn load(&self, force_refresh: bool) -> Loaded<E> {
        if !self.connectivity.is_online() {
            return self.from_cache(None).await;
        }

        let key = self.cache_key();
        if !force_refresh && self.freshness.is_fresh(&key, self.max_age).await {
            tracing::debug!("Serving {} from cache", key.as_string());
            return self.from_cache(None).await;
        }

        match self.remote.fetch_all(self.scope()).await {
            Ok(fresh) => {
                tracing::debug!("Fetched {} {} record(s)", fresh.len(), E::KIND);
                let records = match self.store.replace_synced(self.scope(), &fresh).await {
                    Ok(()) => {
                        self.freshness.mark_fetched(&key).await;
                        self.visible_local().await
                    }
                    Err(e) => {
                        tracing::warn!("Could not mirror {} locally: {}", E::KIND, e);
                        fresh
                    }
                };
                self.set_view(records.clone()).await;
                Loaded {
                    records,
                    error: None,
                    from_cache: false,
                }
            }
            Err(e) => {
                tracing::warn!("Fetching {} failed, using cached copy: {}", E::KIND, e);
                self.from_cache(Some(e.into())).await
            }
        }
    }

    pub async fn create(&self, mut input: E::New) -> Result<E, SyncError> {
        if let Some(owner) = self.scope() {
            E::assign_owner(&mut input, owner);
        }
        E::validate_new(&input)?;

        // A reference to an unsynced record cannot be sent until it has a server id
        let staged = self.stage_offline(&input);
        if !self.connectivity.is_online() || staged.references_unsynced() {
            self.store
                .put(&LocalRecord::PendingCreate(staged.clone()))
                .await?;
            tracing::debug!(id = staged.id(), "Created {} locally", E::KIND);
            self.upsert_view(&staged).await;
            return Ok(staged);
        }

        let created = self.remote.create(&input).await?;
        self.mirror(&LocalRecord::Synced(created.clone()), "mirror created record")
            .await;
        self.upsert_view(&created).await;
        Ok(created)
    }

    /// Create many records at once. One invalid input rejects the batch.
    pub async fn import(&self, mut inputs: Vec<E::New>) -> Result<Vec<E>, SyncError> {
        for input in &mut inputs {
            if let Some(owner) = self.scope() {
                E::assign_owner(input, owner);
            }
            E::validate_new(input)?;
        }
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let staged: Vec<E> = inputs.iter().map(|i| self.stage_offline(i)).collect();
        let send = self.connectivity.is_online() && !staged.iter().any(E::references_unsynced);

        let (created, records) = if send {
            let created = self.remote.bulk_create(&inputs).await?;
            let records: Vec<_> = created.iter().cloned().map(LocalRecord::Synced).collect();
            if let Err(e) = self.store.put_all(&records).await {
                tracing::warn!("Could not mirror imported {}: {}", E::KIND, e);
            }
            (created, records)
        } else {
            let created = staged;
            let records: Vec<_> = created
                .iter()
                .cloned()
                .map(LocalRecord::PendingCreate)
                .collect();
            self.store.put_all(&records).await?;
            (created, records)
        };

        tracing::info!("Imported {} {} record(s)", records.len(), E::KIND);
        for entity in &created {
            self.upsert_view(entity).await;
        }
        Ok(created)
    }

    pub async fn update(&self, id: &str, patch: E::Patch) -> Result<E, SyncError> {
        if self.acts_locally(id) || patch.references_unsynced() {
            let record = self.require_local(id).await?.offline_update(&patch)?;
            self.store.put(&record).await?;
            tracing::debug!(id, state = record.state().as_str(), "Updated {} locally", E::KIND);
            let entity = record.into_entity();
            self.upsert_view(&entity).await;
            return Ok(entity);
        }

        let local = self.cached(id).await;
        if local.as_ref().is_some_and(|r| !r.is_visible()) {
            return Err(SyncError::NotFound(format!("{} {} is pending deletion", E::KIND, id)));
        }
        let returned = self.remote.update(id, &patch).await?;

        let updated = match (returned, &local) {
            (Some(mut server), Some(local)) => {
                server.adopt_local_state(local.entity());
                server
            }
            (Some(server), None) => server,
            (None, Some(local)) => {
                let mut entity = local.entity().clone();
                patch.apply_to(&mut entity);
                entity
            }
            (None, None) => self.server_copy(id).await?,
        };

        let record = match local {
            Some(local) => local.after_online_update(updated, &patch),
            None => LocalRecord::Synced(updated),
        };
        self.mirror(&record, "mirror updated record").await;
        let updated = record.into_entity();
        self.upsert_view(&updated).await;
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> Result<(), SyncError> {
        if self.acts_locally(id) {
            let record = self.require_local(id).await?;
            match record.offline_delete() {
                None => self.store.delete::<E>(id).await?,
                Some(marked) => self.store.put(&marked).await?,
            }
            tracing::debug!(id, "Deleted {} locally", E::KIND);
            self.remove_from_view(id).await;
            return Ok(());
        }

        match self.remote.delete(id).await {
            Ok(()) => {}
            Err(RemoteError::NotFound(msg)) => {
                if self.cached(id).await.is_none() {
                    return Err(SyncError::NotFound(msg));
                }
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.store.delete::<E>(id).await {
            tracing::warn!("Could not evict {} {} locally: {}", E::KIND, id, e);
        }
        self.remove_from_view(id).await;
        Ok(())
    }

    /// Rebuild the in-memory view from the local store.
    pub async fn refresh_view(&self) -> Vec<E> {
        let records = self.visible_local().await;
        self.set_view(records.clone()).await;
        records
    }

    /// Fetch a record that callers may still operate on.
    pub(crate) async fn require_local(&self, id: &str) -> Result<LocalRecord<E>, SyncError> {
        match self.store.get_by_id::<E>(id).await? {
            Some(record) if record.is_visible() => Ok(record),
            _ => Err(SyncError::NotFound(format!("{} {} not found", E::KIND, id))),
        }
    }

    /// Cached copy of a record, or `None` when absent or the store is down.
    pub(crate) async fn cached(&self, id: &str) -> Option<LocalRecord<E>> {
        degrade(self.store.get_by_id::<E>(id).await, "read local record")
    }

    /// Read one record back from the remote, for when an online write
    /// succeeded but nothing local describes the result.
    pub(crate) async fn server_copy(&self, id: &str) -> Result<E, SyncError> {
        self.remote
            .fetch_all(self.scope())
            .await?
            .into_iter()
            .find(|e| e.id() == id)
            .ok_or_else(|| SyncError::NotFound(format!("{} {} not found", E::KIND, id)))
    }

    pub(crate) async fn mirror(&self, record: &LocalRecord<E>, what: &str) {
        if let Err(e) = self.store.put(record).await {
            tracing::warn!("Failed to {} for {} {}: {}", what, E::KIND, record.id(), e);
        }
    }

    pub(crate) async fn upsert_view(&self, entity: &E) {
        let mut shown = entity.clone();
        shown.prune_for_view();
        let mut view = self.view.write().await;
        match view.iter_mut().find(|e| e.id() == shown.id()) {
            Some(existing) => *existing = shown,
            None => view.push(shown),
        }
    }

    pub(crate) async fn update_view(&self, change: impl FnOnce(&mut Vec<E>)) {
        change(&mut *self.view.write().await);
    }

    pub(crate) async fn remove_from_view(&self, id: &str) {
        self.view.write().await.retain(|e| e.id() != id);
    }

    async fn set_view(&self, records: Vec<E>) {
        *self.view.write().await = records;
    }

    async fn visible_local(&self) -> Vec<E> {
        self.local_records()
            .await
            .into_iter()
            .filter(LocalRecord::is_visible)
            .map(|record| {
                let mut entity = record.into_entity();
                entity.prune_for_view();
                entity
            })
            .collect()
    }

    async fn from_cache(&self, error: Option<SyncError>) -> Loaded<E> {
        let records = self.visible_local().await;
        self.set_view(records.clone()).await;
        Loaded {
            records,
            error,
            from_cache: true,
        }
    }

    fn stage_offline(&self, input: &E::New) -> E {
        let mut entity = E::from_new(temp_id(), input, Utc::now());
        entity.stamp_offline();
        entity
    }
}

/// Treat a failed local store call as empty so online operation continues.
pub(crate) fn degrade<T: Default>(result: Result<T, SyncError>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Failed to {}, continuing without local data: {}", what, e);
            T::default()
        }
    }
}

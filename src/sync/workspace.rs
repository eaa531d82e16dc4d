//! Process-wide coordinator wiring repositories to the reconciliation engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{SyncEngine, SyncReport, SyncSummary};
use crate::config::Config;
use crate::connectivity::ConnectivitySignal;
use crate::freshness::CacheFreshness;
use crate::models::{Course, EntityKind, StudyMaterial, Task, Teacher};
use crate::remote::{HttpRemote, RemoteApi, RoutineRemote};
use crate::repository::{EntityRepository, RepositoryContext, RoutineRepository};
use crate::store::{LocalStore, PendingCount};

/// Remote collaborators, one per entity kind.
#[derive(Clone)]
pub struct Remotes {
    pub tasks: Arc<dyn RemoteApi<Task>>,
    pub routines: Arc<dyn RoutineRemote>,
    pub courses: Arc<dyn RemoteApi<Course>>,
    pub teachers: Arc<dyn RemoteApi<Teacher>>,
    pub materials: Arc<dyn RemoteApi<StudyMaterial>>,
}

impl Remotes {
    /// Route every kind through one HTTP client.
    pub fn http(remote: Arc<HttpRemote>) -> Self {
        Self {
            tasks: remote.clone(),
            routines: remote.clone(),
            courses: remote.clone(),
            teachers: remote.clone(),
            materials: remote,
        }
    }
}

/// Shared store, signal, freshness policy, engine and the five repositories.
/// Constructed once per process.
pub struct Workspace {
    pub store: LocalStore,
    pub connectivity: ConnectivitySignal,
    pub freshness: CacheFreshness,
    pub engine: SyncEngine,
    pub tasks: EntityRepository<Task>,
    pub routines: RoutineRepository,
    pub courses: EntityRepository<Course>,
    pub teachers: EntityRepository<Teacher>,
    pub materials: EntityRepository<StudyMaterial>,
    in_progress: AtomicUsize,
    last_report: Mutex<Option<SyncReport>>,
}

impl Workspace {
    pub fn new(
        config: &Config,
        store: LocalStore,
        connectivity: ConnectivitySignal,
        remotes: Remotes,
    ) -> Self {
        let freshness = CacheFreshness::new(store.clone());
        let context = RepositoryContext {
            store: store.clone(),
            connectivity: connectivity.clone(),
            freshness: freshness.clone(),
        };

        Self {
            engine: SyncEngine::new(store.clone(), freshness.clone(), config.record_timeout),
            tasks: EntityRepository::new(&context, remotes.tasks, config.cache_ttl(EntityKind::Task))
                .with_scope(config.user_id.clone()),
            routines: RoutineRepository::new(
                &context,
                remotes.routines,
                config.cache_ttl(EntityKind::Routine),
            ),
            courses: EntityRepository::new(
                &context,
                remotes.courses,
                config.cache_ttl(EntityKind::Course),
            ),
            teachers: EntityRepository::new(
                &context,
                remotes.teachers,
                config.cache_ttl(EntityKind::Teacher),
            ),
            materials: EntityRepository::new(
                &context,
                remotes.materials,
                config.cache_ttl(EntityKind::Material),
            ),
            store,
            connectivity,
            freshness,
            in_progress: AtomicUsize::new(0),
            last_report: Mutex::new(None),
        }
    }

    pub fn sync_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst) > 0
    }

    pub async fn last_report(&self) -> Option<SyncReport> {
        self.last_report.lock().await.clone()
    }

    /// Records waiting to reach the server, per store.
    pub async fn pending_counts(&self) -> Vec<PendingCount> {
        match self.store.pending_counts().await {
            Ok(counts) => counts,
            Err(e) => {
                tracing::warn!("Could not count pending records: {}", e);
                Vec::new()
            }
        }
    }

    /// Reconcile every kind. Referenced kinds go first so dependants replay
    /// with server ids: courses, then the teachers and materials that point
    /// at courses, then routine slots that point at both.
    pub async fn sync_now(&self) -> SyncReport {
        let started_at = Utc::now();
        if !self.connectivity.is_online() {
            tracing::info!("Offline, skipping reconciliation");
            return SyncReport {
                started_at,
                finished_at: Utc::now(),
                summaries: Vec::new(),
            };
        }

        let _running = Running::enter(&self.in_progress);
        let summaries: Vec<SyncSummary> = vec![
            self.engine
                .reconcile::<Course, _>(self.courses.remote().as_ref())
                .await,
            self.engine
                .reconcile::<Teacher, _>(self.teachers.remote().as_ref())
                .await,
            self.engine
                .reconcile::<StudyMaterial, _>(self.materials.remote().as_ref())
                .await,
            self.engine
                .reconcile_routines(self.routines.remote().as_ref())
                .await,
            self.engine
                .reconcile::<Task, _>(self.tasks.remote().as_ref())
                .await,
        ];

        self.teachers.refresh_view().await;
        self.courses.refresh_view().await;
        self.materials.refresh_view().await;
        self.routines.refresh_view().await;
        self.tasks.refresh_view().await;

        let report = SyncReport {
            started_at,
            finished_at: Utc::now(),
            summaries,
        };
        if let Some(err) = report.partial_failure() {
            tracing::warn!("Sync finished with failures: {}", err);
        }
        *self.last_report.lock().await = Some(report.clone());
        report
    }

    /// Load every kind, honouring the freshness windows.
    pub async fn load_all(&self, force_refresh: bool) {
        let errors = [
            self.courses.load(force_refresh).await.error,
            self.teachers.load(force_refresh).await.error,
            self.materials.load(force_refresh).await.error,
            self.routines.load(force_refresh).await.error,
            self.tasks.load(force_refresh).await.error,
        ];
        for err in errors.into_iter().flatten() {
            tracing::warn!("Load served from cache: {}", err);
        }
    }

    /// Reconcile on every offline to online transition of the signal.
    pub fn spawn_reconnect_sync(self: &Arc<Self>) -> JoinHandle<()> {
        let workspace = Arc::clone(self);
        let mut rx = self.connectivity.subscribe();
        let mut was_online = *rx.borrow_and_update();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                if online && !was_online {
                    tracing::info!("Connectivity restored, reconciling");
                    let report = workspace.sync_now().await;
                    tracing::info!(failed = report.failure_count(), "Reconnect sync finished");
                }
                was_online = online;
            }
        })
    }
}

/// Counts overlapping `sync_now` calls for as long as one is alive.
struct Running<'a>(&'a AtomicUsize);

impl<'a> Running<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Running(count)
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

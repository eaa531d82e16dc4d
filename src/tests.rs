//! Scenario tests for the sync core against an in-memory remote.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tempfile::TempDir;

use crate::config::Config;
use crate::connectivity::ConnectivitySignal;
use crate::errors::SyncError;
use crate::freshness::CacheFreshness;
use crate::models::*;
use crate::remote::{RemoteApi, RemoteError, RoutineRemote};
use crate::store::{init_database, LocalStore, PendingCount};
use crate::sync::{Remotes, SyncEngine, Workspace};

/// A remote call as observed by the mock.
#[derive(Debug, Clone, PartialEq)]
enum Call {
    FetchAll,
    Create(Value),
    Update(String, Value),
    Delete(String),
    DeactivateOthers(String),
    SetActive(String, bool),
    AddSlot(String),
    UpdateSlot(String, String, Value),
    DeleteSlot(String, String),
}

/// In-memory stand-in for one remote collection.
struct MockRemote<E: Entity> {
    records: Mutex<Vec<E>>,
    calls: Mutex<Vec<Call>>,
    failing: AtomicBool,
    bodyless_updates: AtomicBool,
    latency: Mutex<Duration>,
    next_id: AtomicU32,
}

impl<E: Entity> MockRemote<E> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            bodyless_updates: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            next_id: AtomicU32::new(1),
        })
    }

    fn seed(&self, records: Vec<E>) {
        self.records.lock().unwrap().extend(records);
    }

    fn records(&self) -> Vec<E> {
        self.records.lock().unwrap().clone()
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Answer updates with an empty body, like a `204 No Content` server.
    fn set_bodyless_updates(&self, bodyless: bool) {
        self.bodyless_updates.store(bodyless, Ordering::SeqCst);
    }

    fn created_bodies(&self) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Create(body) => Some(body),
                _ => None,
            })
            .collect()
    }

    fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Ids are prefixed per collection so references across kinds stay distinct.
    fn server_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn enter(&self, call: Call) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(call);
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("simulated outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<E: Entity> RemoteApi<E> for MockRemote<E> {
    async fn fetch_all(&self, scope: Option<&str>) -> Result<Vec<E>, RemoteError> {
        self.enter(Call::FetchAll).await?;
        Ok(self
            .records()
            .into_iter()
            .filter(|e| scope.map_or(true, |owner| e.owner() == Some(owner)))
            .collect())
    }

    async fn create(&self, input: &E::New) -> Result<E, RemoteError> {
        self.enter(Call::Create(serde_json::to_value(input).unwrap()))
            .await?;
        let created = E::from_new(self.server_id(E::KIND.store_name()), input, Utc::now());
        self.records.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn update(&self, id: &str, patch: &E::Patch) -> Result<Option<E>, RemoteError> {
        self.enter(Call::Update(id.to_string(), serde_json::to_value(patch).unwrap()))
            .await?;
        let mut records = self.records.lock().unwrap();
        let record = records
            .iter_mut()
            .find(|e| e.id() == id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        patch.apply_to(record);
        if self.bodyless_updates.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(record.clone()))
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        self.enter(Call::Delete(id.to_string())).await?;
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|e| e.id() != id);
        if records.len() == before {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RoutineRemote for MockRemote<Routine> {
    async fn deactivate_others(&self, id: &str) -> Result<(), RemoteError> {
        self.enter(Call::DeactivateOthers(id.to_string())).await?;
        for routine in self.records.lock().unwrap().iter_mut() {
            if routine.id != id {
                routine.is_active = false;
            }
        }
        Ok(())
    }

    async fn set_active(&self, id: &str, active: bool) -> Result<(), RemoteError> {
        self.enter(Call::SetActive(id.to_string(), active)).await?;
        let mut records = self.records.lock().unwrap();
        let routine = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        routine.is_active = active;
        Ok(())
    }

    async fn add_slot(
        &self,
        routine_id: &str,
        slot: &CreateSlotRequest,
    ) -> Result<RoutineSlot, RemoteError> {
        self.enter(Call::AddSlot(routine_id.to_string())).await?;
        let created = RoutineSlot::from_new(self.server_id("slot"), routine_id, slot, Utc::now());
        let mut records = self.records.lock().unwrap();
        let routine = records
            .iter_mut()
            .find(|r| r.id == routine_id)
            .ok_or_else(|| RemoteError::NotFound(routine_id.to_string()))?;
        routine.upsert_slot(created.clone());
        Ok(created)
    }

    async fn update_slot(
        &self,
        routine_id: &str,
        slot_id: &str,
        patch: &UpdateSlotRequest,
    ) -> Result<Option<RoutineSlot>, RemoteError> {
        self.enter(Call::UpdateSlot(
            routine_id.to_string(),
            slot_id.to_string(),
            serde_json::to_value(patch).unwrap(),
        ))
        .await?;
        let mut records = self.records.lock().unwrap();
        let slot = records
            .iter_mut()
            .find(|r| r.id == routine_id)
            .and_then(|r| r.slot_mut(slot_id))
            .ok_or_else(|| RemoteError::NotFound(slot_id.to_string()))?;
        patch.apply_to(slot);
        Ok(Some(slot.clone()))
    }

    async fn delete_slot(&self, routine_id: &str, slot_id: &str) -> Result<(), RemoteError> {
        self.enter(Call::DeleteSlot(routine_id.to_string(), slot_id.to_string()))
            .await?;
        let mut records = self.records.lock().unwrap();
        records
            .iter_mut()
            .find(|r| r.id == routine_id)
            .and_then(|r| r.remove_slot(slot_id))
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(slot_id.to_string()))
    }
}

/// Test fixture wiring a workspace to mock remotes and a temporary store.
struct TestFixture {
    ws: Arc<Workspace>,
    tasks: Arc<MockRemote<Task>>,
    routines: Arc<MockRemote<Routine>>,
    courses: Arc<MockRemote<Course>>,
    teachers: Arc<MockRemote<Teacher>>,
    materials: Arc<MockRemote<StudyMaterial>>,
    _temp_dir: TempDir,
}

impl TestFixture {
    async fn new(online: bool) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let pool = init_database(&temp_dir.path().join("offline.sqlite"))
            .await
            .expect("Failed to init DB");
        Self::with_store(online, LocalStore::new(pool), temp_dir)
    }

    fn with_store(online: bool, store: LocalStore, temp_dir: TempDir) -> Self {
        let tasks = MockRemote::<Task>::new();
        let routines = MockRemote::<Routine>::new();
        let courses = MockRemote::<Course>::new();
        let teachers = MockRemote::<Teacher>::new();
        let materials = MockRemote::<StudyMaterial>::new();

        let config = Config {
            user_id: Some("u1".to_string()),
            record_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let remotes = Remotes {
            tasks: tasks.clone(),
            routines: routines.clone(),
            courses: courses.clone(),
            teachers: teachers.clone(),
            materials: materials.clone(),
        };
        let connectivity = ConnectivitySignal::new(online, Duration::ZERO);
        let ws = Arc::new(Workspace::new(&config, store, connectivity, remotes));

        TestFixture {
            ws,
            tasks,
            routines,
            courses,
            teachers,
            materials,
            _temp_dir: temp_dir,
        }
    }

    fn go_offline(&self) {
        self.ws.connectivity.report(false);
    }

    fn go_online(&self) {
        self.ws.connectivity.report(true);
    }

    async fn local_task(&self, id: &str) -> Option<LocalRecord<Task>> {
        self.ws.store.get_by_id::<Task>(id).await.unwrap()
    }

    async fn local_tasks(&self) -> Vec<LocalRecord<Task>> {
        self.ws.store.get_all::<Task>(Some("u1")).await.unwrap()
    }

    async fn local_routines(&self) -> Vec<LocalRecord<Routine>> {
        self.ws.store.get_all::<Routine>(None).await.unwrap()
    }
}

fn essay() -> CreateTaskRequest {
    CreateTaskRequest {
        name: "Essay".to_string(),
        due_date: "2024-05-01".to_string(),
        ..Default::default()
    }
}

fn server_task(id: &str, name: &str) -> Task {
    let input = CreateTaskRequest {
        name: name.to_string(),
        due_date: "2024-05-01".to_string(),
        user_id: Some("u1".to_string()),
        ..Default::default()
    };
    Task::from_new(id.to_string(), &input, Utc::now())
}

fn slot(day: &str, start: &str) -> CreateSlotRequest {
    CreateSlotRequest {
        day_of_week: day.to_string(),
        start_time: start.to_string(),
        end_time: "12:00".to_string(),
        course_name: Some("Data Structures".to_string()),
        ..Default::default()
    }
}

fn server_routine(id: &str, active: bool, slots: Vec<CreateSlotRequest>) -> Routine {
    let input = CreateRoutineRequest {
        name: format!("Routine {}", id),
        semester: "Spring 2024".to_string(),
        is_active: active,
        slots,
        ..Default::default()
    };
    Routine::from_new(id.to_string(), &input, Utc::now())
}

// ==================== CREATION ====================

#[tokio::test]
async fn test_offline_create_is_replaced_by_server_record() {
    let fx = TestFixture::new(false).await;

    let created = fx.ws.tasks.create(essay()).await.unwrap();
    assert!(is_temp_id(&created.id));
    assert!(created.id.starts_with("offline_"));
    assert_eq!(created.user_id.as_deref(), Some("u1"));

    let local = fx.local_tasks().await;
    assert_eq!(local.len(), 1);
    assert!(local[0].flags().is_offline);
    assert!(fx.tasks.calls().is_empty());

    fx.go_online();
    let report = fx.ws.sync_now().await;
    assert_eq!(report.summary(EntityKind::Task).unwrap().created, 1);
    assert!(report.partial_failure().is_none());

    assert_eq!(fx.tasks.records().len(), 1);
    let local = fx.local_tasks().await;
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].state(), SyncState::Synced);
    assert!(!is_temp_id(local[0].id()));
    assert!(!local[0].flags().is_offline);
    assert_eq!(local[0].id(), fx.tasks.records()[0].id);

    let view = fx.ws.tasks.snapshot().await;
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].id, local[0].id());
}

#[tokio::test]
async fn test_create_then_delete_offline_never_reaches_remote() {
    let fx = TestFixture::new(false).await;

    let created = fx.ws.tasks.create(essay()).await.unwrap();
    fx.ws.tasks.delete(&created.id).await.unwrap();
    assert!(fx.local_tasks().await.is_empty());
    assert!(fx.ws.tasks.snapshot().await.is_empty());

    fx.go_online();
    fx.ws.sync_now().await;
    assert!(fx.tasks.calls().is_empty());
    assert!(fx.local_tasks().await.is_empty());
}

#[tokio::test]
async fn test_create_validates_required_fields() {
    let fx = TestFixture::new(true).await;

    let err = fx
        .ws
        .tasks
        .create(CreateTaskRequest {
            name: "Essay".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));

    let err = fx
        .ws
        .routines
        .add_slot(
            "r1",
            CreateSlotRequest {
                day_of_week: "Monday".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_caller_error());
    assert!(fx.tasks.calls().is_empty());
    assert!(fx.routines.calls().is_empty());
}

#[tokio::test]
async fn test_import_offline_then_sync() {
    let fx = TestFixture::new(false).await;

    let inputs = vec![
        CreateCourseRequest {
            name: "Algorithms".to_string(),
            code: "CSE-221".to_string(),
            ..Default::default()
        },
        CreateCourseRequest {
            name: "Databases".to_string(),
            code: "CSE-311".to_string(),
            ..Default::default()
        },
    ];
    let imported = fx.ws.courses.import(inputs.clone()).await.unwrap();
    assert_eq!(imported.len(), 2);
    assert!(imported.iter().all(|c| is_temp_id(&c.id)));

    let mut bad = inputs.clone();
    bad[1].code.clear();
    assert!(fx.ws.courses.import(bad).await.is_err());
    assert_eq!(fx.ws.courses.snapshot().await.len(), 2);

    fx.go_online();
    let report = fx.ws.sync_now().await;
    assert_eq!(report.summary(EntityKind::Course).unwrap().created, 2);
    assert_eq!(fx.courses.records().len(), 2);
}

// ==================== UPDATES ====================

#[tokio::test]
async fn test_online_update_failure_leaves_store_untouched() {
    let fx = TestFixture::new(true).await;
    fx.tasks.seed(vec![server_task("t1", "Essay")]);
    fx.ws.tasks.load(true).await;

    fx.tasks.set_failing(true);
    let err = fx
        .ws
        .tasks
        .update(
            "t1",
            UpdateTaskRequest {
                status: Some(TaskStatus::Completed),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::RemoteUnavailable(_)));

    let local = fx.local_task("t1").await.unwrap();
    assert_eq!(local.state(), SyncState::Synced);
    assert_eq!(local.entity().status, TaskStatus::MyTasks);
    assert!(fx.ws.store.pending_counts().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_offline_update_replays_only_changed_fields() {
    let fx = TestFixture::new(true).await;
    fx.tasks.seed(vec![server_task("t1", "Essay")]);
    fx.ws.tasks.load(true).await;

    fx.go_offline();
    let updated = fx
        .ws
        .tasks
        .update(
            "t1",
            UpdateTaskRequest {
                name: Some("Revised".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.name, "Revised");

    let local = fx.local_task("t1").await.unwrap();
    assert_eq!(local.entity().name, "Revised");
    assert!(local.flags().is_offline_updated);

    fx.go_online();
    fx.ws.sync_now().await;

    let updates: Vec<_> = fx
        .tasks
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Update(..)))
        .collect();
    assert_eq!(
        updates,
        vec![Call::Update("t1".to_string(), json!({ "name": "Revised" }))]
    );
    let local = fx.local_task("t1").await.unwrap();
    assert_eq!(local.state(), SyncState::Synced);
    assert!(!local.flags().is_offline_updated);
    assert_eq!(fx.tasks.records()[0].name, "Revised");
}

#[tokio::test]
async fn test_update_of_missing_record_is_not_found() {
    let fx = TestFixture::new(false).await;
    let err = fx
        .ws
        .tasks
        .update("nope", UpdateTaskRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
}

#[tokio::test]
async fn test_online_update_of_temporary_record_stays_local() {
    let fx = TestFixture::new(false).await;
    let created = fx.ws.tasks.create(essay()).await.unwrap();

    fx.go_online();
    let renamed = fx
        .ws
        .tasks
        .update(
            &created.id,
            UpdateTaskRequest {
                name: Some("Essay draft".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(renamed.name, "Essay draft");
    assert!(fx.tasks.calls().is_empty());

    let local = fx.local_task(&created.id).await.unwrap();
    assert_eq!(local.state(), SyncState::PendingCreate);

    fx.ws.sync_now().await;
    assert_eq!(fx.tasks.records()[0].name, "Essay draft");
}

// ==================== DELETIONS ====================

#[tokio::test]
async fn test_delete_wins_over_pending_update() {
    let fx = TestFixture::new(true).await;
    fx.tasks.seed(vec![server_task("t1", "Essay")]);
    fx.ws.tasks.load(true).await;

    fx.go_offline();
    fx.ws
        .tasks
        .update(
            "t1",
            UpdateTaskRequest {
                name: Some("Revised".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    fx.ws.tasks.delete("t1").await.unwrap();

    fx.go_online();
    let report = fx.ws.sync_now().await;
    assert_eq!(report.summary(EntityKind::Task).unwrap().deleted, 1);
    assert_eq!(fx.tasks.count(|c| matches!(c, Call::Update(..))), 0);
    assert_eq!(fx.tasks.count(|c| *c == Call::Delete("t1".to_string())), 1);
    assert!(fx.local_task("t1").await.is_none());
    assert!(fx.tasks.records().is_empty());
}

#[tokio::test]
async fn test_offline_routine_delete_is_replayed() {
    let fx = TestFixture::new(true).await;
    fx.routines.seed(vec![server_routine(
        "r1",
        true,
        vec![slot("Sunday", "08:30"), slot("Tuesday", "10:00")],
    )]);
    fx.ws.routines.load(true).await;
    assert_eq!(fx.ws.routines.snapshot().await.len(), 1);

    fx.go_offline();
    fx.ws.routines.delete("r1").await.unwrap();
    assert!(fx.ws.routines.snapshot().await.is_empty());

    let kept = fx.ws.store.get_by_id::<Routine>("r1").await.unwrap().unwrap();
    assert!(kept.flags().is_offline_deleted);
    assert_eq!(kept.entity().slots.len(), 2);

    fx.go_online();
    fx.ws.sync_now().await;
    assert_eq!(fx.routines.count(|c| *c == Call::Delete("r1".to_string())), 1);
    assert!(fx.ws.store.get_by_id::<Routine>("r1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_remote_not_found_on_replayed_delete_counts_as_done() {
    let fx = TestFixture::new(true).await;
    fx.tasks.seed(vec![server_task("t1", "Essay")]);
    fx.ws.tasks.load(true).await;

    fx.go_offline();
    fx.ws.tasks.delete("t1").await.unwrap();
    fx.tasks.records.lock().unwrap().clear();

    fx.go_online();
    let report = fx.ws.sync_now().await;
    assert!(report.partial_failure().is_none());
    assert!(fx.local_task("t1").await.is_none());
}

// ==================== RECONCILIATION ====================

#[tokio::test]
async fn test_second_pass_makes_no_remote_calls() {
    let fx = TestFixture::new(true).await;
    fx.tasks.seed(vec![server_task("t1", "Essay")]);
    fx.ws.tasks.load(true).await;

    fx.go_offline();
    fx.ws.tasks.create(essay()).await.unwrap();
    fx.ws
        .tasks
        .update(
            "t1",
            UpdateTaskRequest {
                status: Some(TaskStatus::InProgress),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    fx.go_online();
    let first = fx.ws.sync_now().await;
    assert_eq!(first.summary(EntityKind::Task).unwrap().succeeded(), 2);
    let calls = fx.tasks.calls().len();

    let second = fx.ws.sync_now().await;
    assert_eq!(fx.tasks.calls().len(), calls);
    assert!(second.summaries.iter().all(|s| s.succeeded() == 0));
    assert!(fx.ws.store.pending_counts().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_records_stay_flagged_for_next_pass() {
    let fx = TestFixture::new(false).await;
    fx.ws.tasks.create(essay()).await.unwrap();
    fx.ws.tasks.create(essay()).await.unwrap();

    fx.go_online();
    fx.tasks.set_failing(true);
    let report = fx.ws.sync_now().await;
    let err = report.partial_failure().unwrap();
    assert_eq!(err.error_code(), "RECONCILIATION_PARTIAL_FAILURE");
    assert_eq!(err.message(), "2 item(s) failed to sync");
    assert_eq!(
        fx.ws.pending_counts().await,
        vec![PendingCount {
            store: "tasks".to_string(),
            pending: 2
        }]
    );
    assert_eq!(fx.ws.last_report().await.unwrap().failure_count(), 2);

    fx.tasks.set_failing(false);
    let report = fx.ws.sync_now().await;
    assert_eq!(report.summary(EntityKind::Task).unwrap().created, 2);
    assert!(fx.ws.pending_counts().await.is_empty());
    assert!(!fx.ws.sync_in_progress());
}

#[tokio::test]
async fn test_concurrent_pass_for_same_kind_is_a_no_op() {
    let fx = TestFixture::new(false).await;
    fx.ws.tasks.create(essay()).await.unwrap();
    fx.go_online();
    fx.tasks.set_latency(Duration::from_millis(100));

    let remote = fx.tasks.as_ref();
    let (a, b) = tokio::join!(
        fx.ws.engine.reconcile::<Task, _>(remote),
        fx.ws.engine.reconcile::<Task, _>(remote)
    );

    assert!(a.skipped != b.skipped);
    assert_eq!(a.created + b.created, 1);
    assert_eq!(fx.tasks.records().len(), 1);
    assert!(!fx.ws.engine.is_running(EntityKind::Task));
}

#[tokio::test]
async fn test_stalled_record_times_out() {
    let fx = TestFixture::new(false).await;
    fx.ws.tasks.create(essay()).await.unwrap();
    fx.go_online();
    fx.tasks.set_latency(Duration::from_millis(300));

    let engine = SyncEngine::new(
        fx.ws.store.clone(),
        CacheFreshness::new(fx.ws.store.clone()),
        Duration::from_millis(50),
    );
    let summary = engine.reconcile::<Task, _>(fx.tasks.as_ref()).await;

    assert_eq!(summary.created, 0);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].phase, "create");
    assert!(summary.failures[0].message.contains("timed out"));
    assert_eq!(fx.local_tasks().await[0].state(), SyncState::PendingCreate);
}

#[tokio::test]
async fn test_reconnect_triggers_sync() {
    let fx = TestFixture::new(false).await;
    let listener = fx.ws.spawn_reconnect_sync();
    fx.ws.tasks.create(essay()).await.unwrap();

    fx.go_online();
    for _ in 0..50 {
        if fx.ws.last_report().await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    listener.abort();

    assert_eq!(fx.tasks.records().len(), 1);
    assert!(fx.local_tasks().await.iter().all(|r| !is_temp_id(r.id())));
}

// ==================== LOADING ====================

#[tokio::test]
async fn test_load_respects_freshness_window() {
    let fx = TestFixture::new(true).await;
    fx.tasks.seed(vec![server_task("t1", "Essay")]);

    let first = fx.ws.tasks.load(false).await;
    assert!(!first.from_cache);
    let second = fx.ws.tasks.load(false).await;
    assert!(second.from_cache);
    assert_eq!(second.records.len(), 1);
    assert_eq!(fx.tasks.count(|c| *c == Call::FetchAll), 1);

    fx.ws.tasks.load(true).await;
    assert_eq!(fx.tasks.count(|c| *c == Call::FetchAll), 2);
}

#[tokio::test]
async fn test_load_falls_back_to_cache_with_error() {
    let fx = TestFixture::new(true).await;
    fx.tasks.seed(vec![server_task("t1", "Essay")]);
    fx.ws.tasks.load(true).await;

    fx.tasks.set_failing(true);
    let loaded = fx.ws.tasks.load(true).await;
    assert!(loaded.from_cache);
    assert_eq!(loaded.records.len(), 1);
    assert!(matches!(loaded.error, Some(SyncError::RemoteUnavailable(_))));
}

#[tokio::test]
async fn test_offline_load_reads_owner_records_without_remote() {
    let fx = TestFixture::new(false).await;
    let mut other = server_task("t9", "Someone else's");
    other.user_id = Some("u2".to_string());
    fx.ws.store.put(&LocalRecord::Synced(other)).await.unwrap();
    fx.ws
        .store
        .put(&LocalRecord::Synced(server_task("t1", "Essay")))
        .await
        .unwrap();

    let loaded = fx.ws.tasks.load(false).await;
    assert_eq!(loaded.records.len(), 1);
    assert_eq!(loaded.records[0].id, "t1");
    assert!(loaded.error.is_none());
    assert!(fx.tasks.calls().is_empty());
}

#[tokio::test]
async fn test_refetch_keeps_pending_local_changes() {
    let fx = TestFixture::new(true).await;
    fx.tasks
        .seed(vec![server_task("t1", "Essay"), server_task("t2", "Lab report")]);
    fx.ws.tasks.load(true).await;

    fx.go_offline();
    fx.ws
        .tasks
        .update(
            "t1",
            UpdateTaskRequest {
                name: Some("Local edit".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    fx.go_online();
    let loaded = fx.ws.tasks.load(true).await;
    let t1 = loaded.records.iter().find(|t| t.id == "t1").unwrap();
    assert_eq!(t1.name, "Local edit");
    assert_eq!(loaded.records.len(), 2);
    assert!(fx.local_task("t1").await.unwrap().flags().is_offline_updated);
}

#[tokio::test]
async fn test_unavailable_store_degrades_to_online_only() {
    let temp_dir = TempDir::new().unwrap();
    let fx = TestFixture::with_store(true, LocalStore::unavailable(), temp_dir);
    fx.tasks.seed(vec![server_task("t1", "Essay")]);

    let loaded = fx.ws.tasks.load(false).await;
    assert_eq!(loaded.records.len(), 1);
    assert!(loaded.error.is_none());

    let created = fx.ws.tasks.create(essay()).await.unwrap();
    assert!(!is_temp_id(&created.id));
    assert!(fx.ws.pending_counts().await.is_empty());

    fx.go_offline();
    let err = fx.ws.tasks.create(essay()).await.unwrap_err();
    assert!(matches!(err, SyncError::StorageUnavailable(_)));
}

// ==================== ROUTINES ====================

#[tokio::test]
async fn test_online_activation_leaves_exactly_one_active() {
    let fx = TestFixture::new(true).await;
    fx.routines.seed(vec![
        server_routine("r1", true, vec![]),
        server_routine("r2", false, vec![]),
        server_routine("r3", false, vec![]),
    ]);
    fx.ws.routines.load(true).await;

    let active = fx.ws.routines.activate("r2").await.unwrap();
    assert!(active.is_active);

    let calls = fx.routines.calls();
    let deactivate = calls
        .iter()
        .position(|c| *c == Call::DeactivateOthers("r2".to_string()))
        .unwrap();
    let activate = calls
        .iter()
        .position(|c| *c == Call::SetActive("r2".to_string(), true))
        .unwrap();
    assert!(deactivate < activate);

    let local_active: Vec<_> = fx
        .local_routines()
        .await
        .into_iter()
        .filter(|r| r.entity().is_active)
        .collect();
    assert_eq!(local_active.len(), 1);
    assert_eq!(local_active[0].id(), "r2");
    assert_eq!(fx.routines.records().iter().filter(|r| r.is_active).count(), 1);
}

#[tokio::test]
async fn test_offline_activation_is_replayed() {
    let fx = TestFixture::new(true).await;
    fx.routines.seed(vec![
        server_routine("r1", true, vec![]),
        server_routine("r2", false, vec![]),
    ]);
    fx.ws.routines.load(true).await;

    fx.go_offline();
    fx.ws.routines.activate("r2").await.unwrap();
    let local = fx.local_routines().await;
    assert_eq!(local.iter().filter(|r| r.entity().is_active).count(), 1);
    assert!(local
        .iter()
        .find(|r| r.id() == "r2")
        .unwrap()
        .entity()
        .needs_activation_sync());

    fx.go_online();
    let report = fx.ws.sync_now().await;
    assert_eq!(report.summary(EntityKind::Routine).unwrap().activations, 1);

    let server = fx.routines.records();
    assert!(server.iter().find(|r| r.id == "r2").unwrap().is_active);
    assert_eq!(server.iter().filter(|r| r.is_active).count(), 1);

    let local = fx.local_routines().await;
    assert_eq!(local.iter().filter(|r| r.entity().is_active).count(), 1);
    assert!(local.iter().all(|r| r.entity().pending_activation.is_none()));
}

#[tokio::test]
async fn test_offline_deactivation_is_replayed() {
    let fx = TestFixture::new(true).await;
    fx.routines.seed(vec![server_routine("r1", true, vec![])]);
    fx.ws.routines.load(true).await;

    fx.go_offline();
    let routine = fx.ws.routines.deactivate("r1").await.unwrap();
    assert!(!routine.is_active);
    assert!(routine.needs_deactivation_sync());

    fx.go_online();
    fx.ws.sync_now().await;
    assert_eq!(
        fx.routines.count(|c| *c == Call::SetActive("r1".to_string(), false)),
        1
    );
    assert!(!fx.routines.records()[0].is_active);
}

#[tokio::test]
async fn test_offline_routine_with_slots_replays_against_server_id() {
    let fx = TestFixture::new(true).await;
    fx.routines.seed(vec![server_routine("r0", true, vec![])]);
    fx.ws.routines.load(true).await;

    fx.go_offline();
    let routine = fx
        .ws
        .routines
        .create(CreateRoutineRequest {
            name: "Fall".to_string(),
            semester: "Fall 2024".to_string(),
            is_active: true,
            slots: vec![slot("Monday", "09:00")],
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(is_temp_id(&routine.id));
    fx.ws.routines.activate(&routine.id).await.unwrap();
    fx.ws
        .routines
        .add_slot(&routine.id, slot("Wednesday", "11:00"))
        .await
        .unwrap();

    fx.go_online();
    let report = fx.ws.sync_now().await;
    let summary = report.summary(EntityKind::Routine).unwrap();
    assert!(summary.failures.is_empty(), "{:?}", summary.failures);
    assert_eq!(summary.created, 1);
    assert_eq!(summary.activations, 1);
    assert_eq!(summary.slots, 2);

    let create = fx.routines.created_bodies().remove(0);
    assert_eq!(create["isActive"], json!(false));
    assert!(create.get("slots").is_none());

    let server = fx.routines.records();
    let fall = server.iter().find(|r| r.name == "Fall").unwrap();
    assert!(fall.is_active);
    assert_eq!(fall.slots.len(), 2);
    assert_eq!(server.iter().filter(|r| r.is_active).count(), 1);

    let local = fx.ws.store.get_by_id::<Routine>(&fall.id).await.unwrap().unwrap();
    assert!(!local.is_dirty());
    assert_eq!(local.entity().slots.len(), 2);
    assert!(local
        .entity()
        .slots
        .iter()
        .all(|s| s.sync.is_synced() && !is_temp_id(&s.id) && s.routine_id == fall.id));
    assert!(fx.ws.store.get_by_id::<Routine>(&routine.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_offline_slot_edits_are_replayed() {
    let fx = TestFixture::new(true).await;
    fx.routines.seed(vec![server_routine(
        "r1",
        false,
        vec![slot("Sunday", "08:30"), slot("Tuesday", "10:00")],
    )]);
    fx.ws.routines.load(true).await;
    let slots = fx.routines.records()[0].slots.clone();
    let (sunday, tuesday) = (slots[0].id.clone(), slots[1].id.clone());

    fx.go_offline();
    fx.ws
        .routines
        .update_slot(
            "r1",
            &sunday,
            UpdateSlotRequest {
                room_number: Some("B-204".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    fx.ws.routines.delete_slot("r1", &tuesday).await.unwrap();
    fx.ws
        .routines
        .add_slot("r1", slot("Thursday", "14:00"))
        .await
        .unwrap();

    let view = fx.ws.routines.snapshot().await;
    let days: Vec<_> = view[0].slots.iter().map(|s| s.day_of_week.as_str()).collect();
    assert_eq!(days, vec!["Sunday", "Thursday"]);

    fx.go_online();
    fx.ws.sync_now().await;

    assert_eq!(
        fx.routines.count(|c| *c == Call::DeleteSlot("r1".to_string(), tuesday.clone())),
        1
    );
    assert_eq!(
        fx.routines.count(|c| *c
            == Call::UpdateSlot(
                "r1".to_string(),
                sunday.clone(),
                json!({ "roomNumber": "B-204" })
            )),
        1
    );
    assert_eq!(fx.routines.count(|c| *c == Call::AddSlot("r1".to_string())), 1);

    let server = &fx.routines.records()[0];
    assert_eq!(server.slots.len(), 2);
    assert_eq!(server.slot(&sunday).unwrap().room_number.as_deref(), Some("B-204"));

    let local = fx.ws.store.get_by_id::<Routine>("r1").await.unwrap().unwrap();
    assert_eq!(local.state(), SyncState::Synced);
    assert!(!local.is_dirty());
    assert!(local.entity().slots.iter().all(|s| s.sync.is_synced()));
}

#[tokio::test]
async fn test_online_slot_operations_mirror_locally() {
    let fx = TestFixture::new(true).await;
    fx.routines.seed(vec![server_routine("r1", false, vec![])]);
    fx.ws.routines.load(true).await;

    let added = fx
        .ws
        .routines
        .add_slot("r1", slot("Monday", "09:00"))
        .await
        .unwrap();
    assert!(!is_temp_id(&added.id));

    fx.ws
        .routines
        .update_slot(
            "r1",
            &added.id,
            UpdateSlotRequest {
                teacher_name: Some("Dr. Rahman".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let local = fx.ws.store.get_by_id::<Routine>("r1").await.unwrap().unwrap();
    assert_eq!(
        local.entity().slot(&added.id).unwrap().teacher_name.as_deref(),
        Some("Dr. Rahman")
    );
    assert!(!local.is_dirty());

    fx.ws.routines.delete_slot("r1", &added.id).await.unwrap();
    let local = fx.ws.store.get_by_id::<Routine>("r1").await.unwrap().unwrap();
    assert!(local.entity().slots.is_empty());
    assert!(fx.routines.records()[0].slots.is_empty());
}

#[tokio::test]
async fn test_online_active_routine_creation_deactivates_the_rest() {
    let fx = TestFixture::new(true).await;
    fx.routines.seed(vec![server_routine("r1", true, vec![])]);
    fx.ws.routines.load(true).await;

    let created = fx
        .ws
        .routines
        .create(CreateRoutineRequest {
            name: "Fall".to_string(),
            semester: "Fall 2024".to_string(),
            is_active: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(created.is_active);
    assert!(!is_temp_id(&created.id));

    let calls = fx.routines.calls();
    assert_eq!(fx.routines.created_bodies()[0]["isActive"], json!(false));
    let deactivate = calls
        .iter()
        .position(|c| *c == Call::DeactivateOthers(created.id.clone()))
        .unwrap();
    let activate = calls
        .iter()
        .position(|c| *c == Call::SetActive(created.id.clone(), true))
        .unwrap();
    assert!(deactivate < activate);

    let server_active: Vec<_> = fx
        .routines
        .records()
        .into_iter()
        .filter(|r| r.is_active)
        .map(|r| r.id)
        .collect();
    assert_eq!(server_active, vec![created.id.clone()]);

    let local_active: Vec<_> = fx
        .local_routines()
        .await
        .into_iter()
        .filter(|r| r.entity().is_active)
        .collect();
    assert_eq!(local_active.len(), 1);
    assert_eq!(local_active[0].id(), created.id);

    let view = fx.ws.routines.snapshot().await;
    assert_eq!(view.iter().filter(|r| r.is_active).count(), 1);
}

#[tokio::test]
async fn test_offline_active_routine_creation_deactivates_the_rest() {
    let fx = TestFixture::new(true).await;
    fx.routines.seed(vec![server_routine("r1", true, vec![])]);
    fx.ws.routines.load(true).await;

    fx.go_offline();
    let created = fx
        .ws
        .routines
        .create(CreateRoutineRequest {
            name: "Fall".to_string(),
            semester: "Fall 2024".to_string(),
            is_active: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(created.is_active);

    let local = fx.local_routines().await;
    let active: Vec<_> = local.iter().filter(|r| r.entity().is_active).collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id(), created.id);
    assert!(!local.iter().find(|r| r.id() == "r1").unwrap().entity().is_active);

    fx.go_online();
    fx.ws.sync_now().await;
    let server = fx.routines.records();
    assert_eq!(server.iter().filter(|r| r.is_active).count(), 1);
    assert!(server.iter().find(|r| r.name == "Fall").unwrap().is_active);
}

#[tokio::test]
async fn test_routine_toggles_succeed_without_local_store() {
    let temp_dir = TempDir::new().unwrap();
    let fx = TestFixture::with_store(true, LocalStore::unavailable(), temp_dir);
    fx.routines.seed(vec![
        server_routine("r1", true, vec![slot("Sunday", "08:30")]),
        server_routine("r2", false, vec![]),
    ]);

    let routine = fx.ws.routines.deactivate("r1").await.unwrap();
    assert_eq!(routine.id, "r1");
    assert!(!routine.is_active);
    assert_eq!(routine.slots.len(), 1);

    let routine = fx.ws.routines.activate("r2").await.unwrap();
    assert_eq!(routine.id, "r2");
    assert!(routine.is_active);

    let server = fx.routines.records();
    assert_eq!(
        server.iter().filter(|r| r.is_active).map(|r| r.id.as_str()).collect::<Vec<_>>(),
        vec!["r2"]
    );
}

#[tokio::test]
async fn test_bodyless_update_without_local_store_returns_server_copy() {
    let temp_dir = TempDir::new().unwrap();
    let fx = TestFixture::with_store(true, LocalStore::unavailable(), temp_dir);
    fx.tasks.seed(vec![server_task("t1", "Essay")]);
    fx.tasks.set_bodyless_updates(true);

    let updated = fx
        .ws
        .tasks
        .update(
            "t1",
            UpdateTaskRequest {
                name: Some("Essay v2".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.id, "t1");
    assert_eq!(updated.name, "Essay v2");
    assert_eq!(fx.ws.tasks.snapshot().await[0].name, "Essay v2");
}

// ==================== REFERENCES ====================

fn algorithms() -> CreateCourseRequest {
    CreateCourseRequest {
        name: "Algorithms".to_string(),
        code: "CSE-221".to_string(),
        ..Default::default()
    }
}

fn lecture_notes(course_id: &str) -> CreateMaterialRequest {
    CreateMaterialRequest {
        title: "Lecture 1".to_string(),
        course_id: course_id.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_offline_references_replay_with_server_ids() {
    let fx = TestFixture::new(false).await;

    let course = fx.ws.courses.create(algorithms()).await.unwrap();
    let teacher = fx
        .ws
        .teachers
        .create(CreateTeacherRequest {
            name: "Dr. Rahman".to_string(),
            phone: "01700000000".to_string(),
            course_ids: vec![course.id.clone()],
            ..Default::default()
        })
        .await
        .unwrap();
    let material = fx
        .ws
        .materials
        .create(lecture_notes(&course.id))
        .await
        .unwrap();
    fx.ws
        .routines
        .create(CreateRoutineRequest {
            name: "Fall".to_string(),
            semester: "Fall 2024".to_string(),
            slots: vec![CreateSlotRequest {
                course_id: Some(course.id.clone()),
                teacher_id: Some(teacher.id.clone()),
                ..slot("Monday", "09:00")
            }],
            ..Default::default()
        })
        .await
        .unwrap();

    fx.go_online();
    let report = fx.ws.sync_now().await;
    assert!(report.partial_failure().is_none(), "{:?}", report);

    let course_id = fx.courses.records()[0].id.clone();
    let teacher_id = fx.teachers.records()[0].id.clone();
    assert!(!is_temp_id(&course_id));
    assert_ne!(course_id, teacher_id);

    assert_eq!(fx.teachers.created_bodies()[0]["courseIds"], json!([course_id]));
    assert_eq!(fx.materials.created_bodies()[0]["courseId"], json!(course_id));
    assert_eq!(fx.materials.records()[0].course_id, course_id);

    let server_slot = fx.routines.records()[0].slots[0].clone();
    assert_eq!(server_slot.course_id.as_deref(), Some(course_id.as_str()));
    assert_eq!(server_slot.teacher_id.as_deref(), Some(teacher_id.as_str()));

    let local_materials = fx.ws.store.get_all::<StudyMaterial>(None).await.unwrap();
    assert_eq!(local_materials.len(), 1);
    assert_ne!(local_materials[0].id(), material.id);
    assert_eq!(local_materials[0].entity().course_id, course_id);

    let local_teachers = fx.ws.store.get_all::<Teacher>(None).await.unwrap();
    assert_eq!(local_teachers[0].entity().course_ids, vec![course_id.clone()]);

    let sent = [
        fx.teachers.created_bodies(),
        fx.materials.created_bodies(),
        fx.routines.created_bodies(),
    ]
    .concat();
    assert!(sent.iter().all(|body| !body.to_string().contains("offline_")));
}

#[tokio::test]
async fn test_failed_course_holds_back_its_materials() {
    let fx = TestFixture::new(false).await;
    let course = fx.ws.courses.create(algorithms()).await.unwrap();
    let material = fx
        .ws
        .materials
        .create(lecture_notes(&course.id))
        .await
        .unwrap();

    fx.go_online();
    fx.courses.set_failing(true);
    let report = fx.ws.sync_now().await;
    let materials = report.summary(EntityKind::Material).unwrap();
    assert_eq!(materials.created, 0);
    assert_eq!(materials.failures.len(), 1);
    assert_eq!(materials.failures[0].phase, "create");
    assert!(materials.failures[0].message.contains("not synced yet"));
    assert!(fx.materials.calls().is_empty());

    let held = fx.ws.store.get_by_id::<StudyMaterial>(&material.id).await.unwrap().unwrap();
    assert_eq!(held.state(), SyncState::PendingCreate);

    fx.courses.set_failing(false);
    let report = fx.ws.sync_now().await;
    assert!(report.partial_failure().is_none(), "{:?}", report);
    assert_eq!(
        fx.materials.records()[0].course_id,
        fx.courses.records()[0].id
    );
}

#[tokio::test]
async fn test_online_create_referencing_unsynced_course_stays_local() {
    let fx = TestFixture::new(false).await;
    let course = fx.ws.courses.create(algorithms()).await.unwrap();

    fx.go_online();
    let material = fx
        .ws
        .materials
        .create(lecture_notes(&course.id))
        .await
        .unwrap();
    assert!(is_temp_id(&material.id));
    assert!(fx.materials.calls().is_empty());

    fx.ws.sync_now().await;
    assert_eq!(fx.materials.created_bodies().len(), 1);
    assert_eq!(
        fx.materials.records()[0].course_id,
        fx.courses.records()[0].id
    );
}

// ==================== SUPERSEDED EDITS ====================

fn rename(name: &str) -> UpdateTaskRequest {
    UpdateTaskRequest {
        name: Some(name.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_online_edit_supersedes_offline_diff_field() {
    let fx = TestFixture::new(true).await;
    fx.tasks.seed(vec![server_task("t1", "Essay")]);
    fx.ws.tasks.load(true).await;

    fx.go_offline();
    fx.ws
        .tasks
        .update(
            "t1",
            UpdateTaskRequest {
                name: Some("Offline".to_string()),
                description: Some("Notes".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    fx.go_online();
    let updated = fx.ws.tasks.update("t1", rename("Latest")).await.unwrap();
    assert_eq!(updated.name, "Latest");
    assert_eq!(updated.description, "Notes");

    fx.ws.sync_now().await;
    let updates: Vec<_> = fx
        .tasks
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Update(..)))
        .collect();
    assert_eq!(
        updates,
        vec![
            Call::Update("t1".to_string(), json!({ "name": "Latest" })),
            Call::Update("t1".to_string(), json!({ "description": "Notes" })),
        ]
    );

    let server = &fx.tasks.records()[0];
    assert_eq!(server.name, "Latest");
    assert_eq!(server.description, "Notes");
    assert_eq!(fx.local_task("t1").await.unwrap().entity().name, "Latest");
}

#[tokio::test]
async fn test_fully_covered_offline_diff_is_dropped() {
    let fx = TestFixture::new(true).await;
    fx.tasks.seed(vec![server_task("t1", "Essay")]);
    fx.ws.tasks.load(true).await;

    fx.go_offline();
    fx.ws.tasks.update("t1", rename("Offline")).await.unwrap();

    fx.go_online();
    fx.ws.tasks.update("t1", rename("Latest")).await.unwrap();
    let local = fx.local_task("t1").await.unwrap();
    assert_eq!(local.state(), SyncState::Synced);
    assert!(!local.flags().is_offline_updated);

    fx.ws.sync_now().await;
    assert_eq!(fx.tasks.count(|c| matches!(c, Call::Update(..))), 1);
    assert_eq!(fx.tasks.records()[0].name, "Latest");
    assert_eq!(fx.local_task("t1").await.unwrap().entity().name, "Latest");
}

// ==================== OVERLAPPING SYNCS ====================

#[tokio::test]
async fn test_sync_stays_in_progress_until_last_caller_finishes() {
    let fx = TestFixture::new(false).await;
    fx.ws.tasks.create(essay()).await.unwrap();
    fx.go_online();
    fx.tasks.set_latency(Duration::from_millis(300));

    let ws = Arc::clone(&fx.ws);
    let first = tokio::spawn(async move { ws.sync_now().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(fx.ws.sync_in_progress());

    let second = fx.ws.sync_now().await;
    assert!(second.summary(EntityKind::Task).unwrap().skipped);
    assert!(fx.ws.sync_in_progress());

    let first = first.await.unwrap();
    assert_eq!(first.summary(EntityKind::Task).unwrap().created, 1);
    assert!(!fx.ws.sync_in_progress());
}

//! Keyed record store for CRUD operations on cached entities.
//!
//! Every operation is a single statement or a single transaction, so each
//! call is atomic on its own. Nothing spans calls.

use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool};

use crate::errors::SyncError;
use crate::models::{Entity, LocalRecord, SyncState};

const UPSERT_SQL: &str = r#"
    INSERT INTO records (store, id, owner, sync_state, payload, diff, dirty, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(store, id) DO UPDATE SET
        owner = excluded.owner,
        sync_state = excluded.sync_state,
        payload = excluded.payload,
        diff = excluded.diff,
        dirty = excluded.dirty,
        updated_at = excluded.updated_at
"#;

/// Same as `UPSERT_SQL` but leaves rows with unpushed local changes alone.
const UPSERT_CLEAN_SQL: &str = r#"
    INSERT INTO records (store, id, owner, sync_state, payload, diff, dirty, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(store, id) DO UPDATE SET
        owner = excluded.owner,
        sync_state = excluded.sync_state,
        payload = excluded.payload,
        diff = excluded.diff,
        dirty = excluded.dirty,
        updated_at = excluded.updated_at
    WHERE records.dirty = 0
"#;

/// Number of records in one store still waiting to reach the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCount {
    pub store: String,
    pub pending: i64,
}

/// A record serialized into its column values.
struct EncodedRecord {
    id: String,
    owner: Option<String>,
    state: &'static str,
    payload: String,
    diff: Option<String>,
    dirty: bool,
    updated_at: String,
}

/// Local store shared by all repositories and the reconciliation engine.
///
/// An unavailable store fails every call with `StorageUnavailable`; callers
/// degrade to online-only operation.
#[derive(Clone)]
pub struct LocalStore {
    pool: Option<SqlitePool>,
}

impl LocalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool: Some(pool) }
    }

    /// A store with no backing storage, used when the database cannot be opened.
    pub fn unavailable() -> Self {
        Self { pool: None }
    }

    pub fn is_available(&self) -> bool {
        self.pool.as_ref().is_some_and(|p| !p.is_closed())
    }

    fn pool(&self) -> Result<&SqlitePool, SyncError> {
        self.pool
            .as_ref()
            .ok_or_else(|| SyncError::StorageUnavailable("Local store is not available".to_string()))
    }

    // ==================== RECORD OPERATIONS ====================

    /// Insert or replace one record.
    pub async fn put<E: Entity>(&self, record: &LocalRecord<E>) -> Result<(), SyncError> {
        let pool = self.pool()?;
        let row = encode(record)?;
        write_row(pool, UPSERT_SQL, E::KIND.store_name(), &row).await?;
        Ok(())
    }

    /// Insert or replace many records in one transaction.
    pub async fn put_all<E: Entity>(&self, records: &[LocalRecord<E>]) -> Result<(), SyncError> {
        let pool = self.pool()?;
        let rows = records.iter().map(encode).collect::<Result<Vec<_>, _>>()?;

        let mut tx = pool.begin().await?;
        for row in &rows {
            write_row(&mut *tx, UPSERT_SQL, E::KIND.store_name(), row).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// All records of a store in insertion order, optionally limited to one owner.
    pub async fn get_all<E: Entity>(
        &self,
        owner: Option<&str>,
    ) -> Result<Vec<LocalRecord<E>>, SyncError> {
        let pool = self.pool()?;
        let rows = sqlx::query(
            "SELECT sync_state, payload, diff FROM records WHERE store = ? AND (? IS NULL OR owner = ?) ORDER BY rowid",
        )
        .bind(E::KIND.store_name())
        .bind(owner)
        .bind(owner)
        .fetch_all(pool)
        .await?;

        Ok(decode_rows(&rows))
    }

    /// Records with anything left to push, in insertion order.
    pub async fn get_dirty<E: Entity>(&self) -> Result<Vec<LocalRecord<E>>, SyncError> {
        let pool = self.pool()?;
        let rows = sqlx::query(
            "SELECT sync_state, payload, diff FROM records WHERE store = ? AND dirty = 1 ORDER BY rowid",
        )
        .bind(E::KIND.store_name())
        .fetch_all(pool)
        .await?;

        Ok(decode_rows(&rows))
    }

    /// Get a record by id.
    pub async fn get_by_id<E: Entity>(&self, id: &str) -> Result<Option<LocalRecord<E>>, SyncError> {
        let pool = self.pool()?;
        let row = sqlx::query("SELECT sync_state, payload, diff FROM records WHERE store = ? AND id = ?")
            .bind(E::KIND.store_name())
            .bind(id)
            .fetch_optional(pool)
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// Remove a record. Missing ids are not an error.
    pub async fn delete<E: Entity>(&self, id: &str) -> Result<(), SyncError> {
        let pool = self.pool()?;
        sqlx::query("DELETE FROM records WHERE store = ? AND id = ?")
            .bind(E::KIND.store_name())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Swap a record for one with a different id in a single transaction.
    /// Used when a temporary record is replaced by the server-issued one.
    pub async fn replace<E: Entity>(
        &self,
        old_id: &str,
        record: &LocalRecord<E>,
    ) -> Result<(), SyncError> {
        let pool = self.pool()?;
        let row = encode(record)?;

        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM records WHERE store = ? AND id = ?")
            .bind(E::KIND.store_name())
            .bind(old_id)
            .execute(&mut *tx)
            .await?;
        write_row(&mut *tx, UPSERT_SQL, E::KIND.store_name(), &row).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Remove every record of a store.
    pub async fn clear<E: Entity>(&self) -> Result<(), SyncError> {
        let pool = self.pool()?;
        sqlx::query("DELETE FROM records WHERE store = ?")
            .bind(E::KIND.store_name())
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Overwrite the clean part of a store with a fresh server listing.
    ///
    /// Clean rows missing from `fresh` are removed; dirty rows are kept as-is
    /// even when the server returned a newer copy.
    pub async fn replace_synced<E: Entity>(
        &self,
        owner: Option<&str>,
        fresh: &[E],
    ) -> Result<(), SyncError> {
        let pool = self.pool()?;
        let rows = fresh
            .iter()
            .map(|e| encode(&LocalRecord::Synced(e.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM records WHERE store = ? AND dirty = 0 AND (? IS NULL OR owner = ?)")
            .bind(E::KIND.store_name())
            .bind(owner)
            .bind(owner)
            .execute(&mut *tx)
            .await?;
        for row in &rows {
            write_row(&mut *tx, UPSERT_CLEAN_SQL, E::KIND.store_name(), row).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Count records waiting to sync, per store.
    pub async fn pending_counts(&self) -> Result<Vec<PendingCount>, SyncError> {
        let pool = self.pool()?;
        let rows = sqlx::query(
            "SELECT store, COUNT(*) AS pending FROM records WHERE dirty = 1 GROUP BY store ORDER BY store",
        )
        .fetch_all(pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| PendingCount {
                store: row.get("store"),
                pending: row.get("pending"),
            })
            .collect())
    }

    // ==================== FETCH LOG ====================

    /// When a cache key was last filled from the server, in epoch milliseconds.
    pub async fn fetched_at(&self, cache_key: &str) -> Result<Option<i64>, SyncError> {
        let pool = self.pool()?;
        let row = sqlx::query("SELECT fetched_at FROM fetch_log WHERE cache_key = ?")
            .bind(cache_key)
            .fetch_optional(pool)
            .await?;
        Ok(row.map(|r| r.get("fetched_at")))
    }

    pub async fn mark_fetched(&self, cache_key: &str, at_millis: i64) -> Result<(), SyncError> {
        let pool = self.pool()?;
        sqlx::query(
            "INSERT INTO fetch_log (cache_key, fetched_at) VALUES (?, ?) ON CONFLICT(cache_key) DO UPDATE SET fetched_at = excluded.fetched_at",
        )
        .bind(cache_key)
        .bind(at_millis)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Re-stamp every existing key that starts with `prefix`.
    pub async fn touch_fetched(&self, prefix: &str, at_millis: i64) -> Result<u64, SyncError> {
        let pool = self.pool()?;
        let result = sqlx::query("UPDATE fetch_log SET fetched_at = ? WHERE substr(cache_key, 1, length(?)) = ?")
            .bind(at_millis)
            .bind(prefix)
            .bind(prefix)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn forget_fetched(&self, cache_key: &str) -> Result<(), SyncError> {
        let pool = self.pool()?;
        sqlx::query("DELETE FROM fetch_log WHERE cache_key = ?")
            .bind(cache_key)
            .execute(pool)
            .await?;
        Ok(())
    }
}

// Helper functions for row conversion

async fn write_row<'a, X>(
    executor: X,
    sql: &'a str,
    store: &'a str,
    row: &'a EncodedRecord,
) -> Result<(), sqlx::Error>
where
    X: sqlx::Executor<'a, Database = Sqlite>,
{
    sqlx::query(sql)
        .bind(store)
        .bind(&row.id)
        .bind(&row.owner)
        .bind(row.state)
        .bind(&row.payload)
        .bind(&row.diff)
        .bind(row.dirty as i32)
        .bind(&row.updated_at)
        .execute(executor)
        .await?;
    Ok(())
}

fn encode<E: Entity>(record: &LocalRecord<E>) -> Result<EncodedRecord, SyncError> {
    let entity = record.entity();
    let diff = record.diff().map(serde_json::to_string).transpose()?;
    Ok(EncodedRecord {
        id: entity.id().to_string(),
        owner: entity.owner().map(str::to_string),
        state: record.state().as_str(),
        payload: serde_json::to_string(entity)?,
        diff,
        dirty: record.is_dirty(),
        updated_at: Utc::now().to_rfc3339(),
    })
}

fn decode_rows<E: Entity>(rows: &[SqliteRow]) -> Vec<LocalRecord<E>> {
    rows.iter()
        .filter_map(|row| match record_from_row(row) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(store = E::KIND.store_name(), "Skipping unreadable record: {}", e);
                None
            }
        })
        .collect()
}

fn record_from_row<E: Entity>(row: &SqliteRow) -> Result<LocalRecord<E>, SyncError> {
    let state_str: String = row.get("sync_state");
    let payload: String = row.get("payload");
    let diff_str: Option<String> = row.get("diff");

    let state = SyncState::from_str(&state_str).ok_or_else(|| {
        SyncError::StorageUnavailable(format!("Unknown sync state '{}'", state_str))
    })?;
    let entity: E = serde_json::from_str(&payload)?;

    Ok(match state {
        SyncState::Synced => LocalRecord::Synced(entity),
        SyncState::PendingCreate => LocalRecord::PendingCreate(entity),
        SyncState::PendingUpdate => {
            let diff = diff_str
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?
                .unwrap_or_default();
            LocalRecord::PendingUpdate { entity, diff }
        }
        SyncState::PendingDelete => LocalRecord::PendingDelete(entity),
    })
}

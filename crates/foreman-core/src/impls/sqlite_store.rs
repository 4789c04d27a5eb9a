//! SqliteTaskStore - SQLite を正本にした TaskStore
//!
//! # 実装詳細
//! - `Arc<Mutex<Connection>>` を共有し、各操作は spawn_blocking 上で実行
//! - 状態を変える操作は 1 トランザクション（IMMEDIATE）で完結させる
//! - lease を伴う書き込みは `locked_by` / `lock_expires_at_ms` を WHERE 句に含めた条件付き UPDATE
//! - 時刻は epoch millis（INTEGER）で保存

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params, params_from_iter};

use crate::domain::{
    QueueError, RetryDecision, StatusCounts, TaskId, TaskRecord, TaskStatus, WorkerId,
};
use crate::ports::{TaskOrder, TaskQuery, TaskStore};

const SCHEMA_VERSION: i64 = 2;

const TASK_COLUMNS: &str = "id, job_id, payload_json, status, attempts, max_attempts, locked_by, \
     lock_expires_at_ms, last_error, next_eligible_at_ms, created_at_ms, started_at_ms, \
     completed_at_ms, updated_at_ms";

/// Claimed states, as stored.
const CLAIMED_STATUSES: &str = "('dispatched', 'processing')";

#[derive(Clone)]
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    pub fn open(db_path: &str) -> Result<Self, QueueError> {
        let conn = Connection::open(db_path)
            .map_err(|e| QueueError::Store(format!("open sqlite task store: {e}")))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| QueueError::Store(format!("open in-memory sqlite: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, QueueError> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(map_rusqlite_err)?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, QueueError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| QueueError::Store("sqlite task store lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| QueueError::Store(format!("sqlite blocking task: {e}")))?
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<TaskRecord, QueueError> {
        self.with_conn(move |conn| {
            let payload = serde_json::to_string(&record.payload)
                .map_err(|e| QueueError::InvalidArgument(format!("payload: {e}")))?;
            conn.execute(
                "INSERT INTO tasks
                 (id, job_id, payload_json, status, attempts, max_attempts, locked_by,
                  lock_expires_at_ms, last_error, next_eligible_at_ms, created_at_ms,
                  started_at_ms, completed_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    record.id.to_string(),
                    record.job_id.map(|j| j.to_string()),
                    payload,
                    record.status.as_str(),
                    record.attempts,
                    record.max_attempts,
                    record.locked_by.map(|w| w.to_string()),
                    record.lock_expires_at.map(dt_to_ms),
                    record.last_error,
                    record.next_eligible_at.map(dt_to_ms),
                    dt_to_ms(record.created_at),
                    record.started_at.map(dt_to_ms),
                    record.completed_at.map(dt_to_ms),
                    dt_to_ms(record.updated_at),
                ],
            )
            .map_err(|e| QueueError::Store(format!("insert task {}: {e}", record.id)))?;
            Ok(record)
        })
        .await
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, QueueError> {
        self.with_conn(move |conn| fetch(conn, id)).await
    }

    async fn claim_batch(
        &self,
        worker: WorkerId,
        max: usize,
        now: DateTime<Utc>,
        lock_expires_at: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, QueueError> {
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| QueueError::Store(format!("begin claim tx: {e}")))?;
            let now_ms = dt_to_ms(now);

            let ids: Vec<String> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT id FROM tasks
                         WHERE status = 'queued'
                           AND attempts < max_attempts
                           AND (next_eligible_at_ms IS NULL OR next_eligible_at_ms <= ?1)
                         ORDER BY updated_at_ms ASC, id ASC
                         LIMIT ?2",
                    )
                    .map_err(map_rusqlite_err)?;
                let rows = stmt
                    .query_map(params![now_ms, max as i64], |r| r.get::<_, String>(0))
                    .map_err(map_rusqlite_err)?;
                rows.collect::<Result<_, _>>().map_err(map_rusqlite_err)?
            };

            let mut claimed = Vec::with_capacity(ids.len());
            {
                let sql = format!(
                    "UPDATE tasks
                     SET status = 'dispatched', locked_by = ?2, lock_expires_at_ms = ?3,
                         attempts = attempts + 1, started_at_ms = ?4, updated_at_ms = ?4
                     WHERE id = ?1 AND status = 'queued' AND attempts < max_attempts
                     RETURNING {TASK_COLUMNS}"
                );
                let mut stmt = tx.prepare(&sql).map_err(map_rusqlite_err)?;
                let worker = worker.to_string();
                for id in &ids {
                    let rec = stmt
                        .query_row(
                            params![id, worker, dt_to_ms(lock_expires_at), now_ms],
                            row_to_record,
                        )
                        .optional()
                        .map_err(map_rusqlite_err)?;
                    claimed.extend(rec);
                }
            }

            tx.commit()
                .map_err(|e| QueueError::Store(format!("commit claim tx: {e}")))?;
            Ok(claimed)
        })
        .await
    }

    async fn begin_processing(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, QueueError> {
        self.with_conn(move |conn| {
            lease_keyed_update(
                conn,
                id,
                worker,
                now,
                "status = 'processing', updated_at_ms = ?3",
                &[],
            )
        })
        .await
    }

    async fn renew_lease(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
        lock_expires_at: DateTime<Utc>,
    ) -> Result<TaskRecord, QueueError> {
        self.with_conn(move |conn| {
            lease_keyed_update(
                conn,
                id,
                worker,
                now,
                "lock_expires_at_ms = ?4, updated_at_ms = ?3",
                &[Value::Integer(dt_to_ms(lock_expires_at))],
            )
        })
        .await
    }

    async fn complete(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, QueueError> {
        self.with_conn(move |conn| {
            lease_keyed_update(
                conn,
                id,
                worker,
                now,
                "status = 'succeeded', locked_by = NULL, lock_expires_at_ms = NULL,
                 last_error = NULL, next_eligible_at_ms = NULL,
                 completed_at_ms = ?3, updated_at_ms = ?3",
                &[],
            )
        })
        .await
    }

    async fn fail(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
        error: &str,
        decision: RetryDecision,
    ) -> Result<TaskRecord, QueueError> {
        let error = error.to_string();
        self.with_conn(move |conn| match decision {
            RetryDecision::Requeue { next_eligible_at } => lease_keyed_update(
                conn,
                id,
                worker,
                now,
                "status = 'queued', locked_by = NULL, lock_expires_at_ms = NULL,
                 last_error = ?4, next_eligible_at_ms = ?5, updated_at_ms = ?3",
                &[
                    Value::Text(error),
                    next_eligible_at.map_or(Value::Null, |t| Value::Integer(dt_to_ms(t))),
                ],
            ),
            RetryDecision::FailTerminal => lease_keyed_update(
                conn,
                id,
                worker,
                now,
                "status = 'failed', locked_by = NULL, lock_expires_at_ms = NULL,
                 last_error = ?4, next_eligible_at_ms = NULL,
                 completed_at_ms = ?3, updated_at_ms = ?3",
                &[Value::Text(error)],
            ),
        })
        .await
    }

    async fn release_expired_locks(
        &self,
        ids: &[TaskId],
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, QueueError> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            update_each(
                conn,
                &ids,
                "UPDATE tasks SET locked_by = NULL, lock_expires_at_ms = NULL, updated_at_ms = ?2
                 WHERE id = ?1 AND locked_by IS NOT NULL
                   AND (lock_expires_at_ms IS NULL OR lock_expires_at_ms < ?2)",
                dt_to_ms(now),
            )
        })
        .await
    }

    async fn requeue_orphans(
        &self,
        ids: &[TaskId],
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, QueueError> {
        let ids = ids.to_vec();
        let sql = format!(
            "UPDATE tasks SET status = 'queued', updated_at_ms = ?2
             WHERE id = ?1 AND status IN {CLAIMED_STATUSES} AND locked_by IS NULL"
        );
        self.with_conn(move |conn| update_each(conn, &ids, &sql, dt_to_ms(now)))
            .await
    }

    async fn reset_attempts(
        &self,
        ids: &[TaskId],
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, QueueError> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            update_each(
                conn,
                &ids,
                "UPDATE tasks SET attempts = 0, updated_at_ms = ?2
                 WHERE id = ?1 AND status = 'queued' AND attempts >= max_attempts",
                dt_to_ms(now),
            )
        })
        .await
    }

    async fn find(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>, QueueError> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let (sql, args) = build_find_sql(&query);
            let mut stmt = conn.prepare(&sql).map_err(map_rusqlite_err)?;
            let rows = stmt
                .query_map(params_from_iter(args), row_to_record)
                .map_err(map_rusqlite_err)?;
            rows.collect::<Result<_, _>>().map_err(map_rusqlite_err)
        })
        .await
    }

    async fn count_by_status(&self) -> Result<StatusCounts, QueueError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .map_err(map_rusqlite_err)?;
            let rows = stmt
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
                .map_err(map_rusqlite_err)?;
            let mut counts = StatusCounts::default();
            for row in rows {
                let (status, n) = row.map_err(map_rusqlite_err)?;
                let status: TaskStatus = status.parse().map_err(QueueError::store)?;
                counts.add(status, n.max(0) as u64);
            }
            Ok(counts)
        })
        .await
    }
}

/// Conditional UPDATE keyed on the live lease holder.
///
/// Fixed params: ?1 id, ?2 worker, ?3 now; `extra` binds from ?4 on.
fn lease_keyed_update(
    conn: &mut Connection,
    id: TaskId,
    worker: WorkerId,
    now: DateTime<Utc>,
    set_clause: &str,
    extra: &[Value],
) -> Result<TaskRecord, QueueError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| QueueError::Store(format!("begin lease tx: {e}")))?;

    let sql = format!(
        "UPDATE tasks SET {set_clause}
         WHERE id = ?1 AND locked_by = ?2 AND lock_expires_at_ms >= ?3
           AND status IN {CLAIMED_STATUSES}
         RETURNING {TASK_COLUMNS}"
    );
    let mut args = vec![
        Value::Text(id.to_string()),
        Value::Text(worker.to_string()),
        Value::Integer(dt_to_ms(now)),
    ];
    args.extend_from_slice(extra);

    let updated = tx
        .query_row(&sql, params_from_iter(args), row_to_record)
        .optional()
        .map_err(map_rusqlite_err)?;

    let result = match updated {
        Some(rec) => Ok(rec),
        None => {
            let exists: Option<i64> = tx
                .query_row("SELECT 1 FROM tasks WHERE id = ?1", params![id.to_string()], |r| {
                    r.get(0)
                })
                .optional()
                .map_err(map_rusqlite_err)?;
            if exists.is_some() {
                Err(QueueError::LeaseLost { task_id: id, worker })
            } else {
                Err(QueueError::TaskNotFound(id))
            }
        }
    };

    tx.commit()
        .map_err(|e| QueueError::Store(format!("commit lease tx: {e}")))?;
    result
}

/// Run a per-id conditional UPDATE (`?1` id, `?2` now) in one transaction;
/// returns the ids whose row actually changed.
fn update_each(
    conn: &mut Connection,
    ids: &[TaskId],
    sql: &str,
    now_ms: i64,
) -> Result<Vec<TaskId>, QueueError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| QueueError::Store(format!("begin bulk tx: {e}")))?;
    let mut changed = Vec::new();
    {
        let mut stmt = tx.prepare(sql).map_err(map_rusqlite_err)?;
        for id in ids {
            let n = stmt
                .execute(params![id.to_string(), now_ms])
                .map_err(map_rusqlite_err)?;
            if n > 0 {
                changed.push(*id);
            }
        }
    }
    tx.commit()
        .map_err(|e| QueueError::Store(format!("commit bulk tx: {e}")))?;
    Ok(changed)
}

fn fetch(conn: &Connection, id: TaskId) -> Result<Option<TaskRecord>, QueueError> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        params![id.to_string()],
        row_to_record,
    )
    .optional()
    .map_err(map_rusqlite_err)
}

fn build_find_sql(query: &TaskQuery) -> (String, Vec<Value>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<Value> = Vec::new();

    if !query.statuses.is_empty() {
        let mut marks = Vec::with_capacity(query.statuses.len());
        for status in &query.statuses {
            args.push(Value::Text(status.as_str().to_string()));
            marks.push(format!("?{}", args.len()));
        }
        clauses.push(format!("status IN ({})", marks.join(", ")));
    }
    if let Some(job_id) = query.job_id {
        args.push(Value::Text(job_id.to_string()));
        clauses.push(format!("job_id = ?{}", args.len()));
    }
    match query.locked {
        Some(true) => clauses.push("locked_by IS NOT NULL".to_string()),
        Some(false) => clauses.push("locked_by IS NULL".to_string()),
        None => {}
    }
    if let Some(t) = query.lock_expired_before {
        args.push(Value::Integer(dt_to_ms(t)));
        clauses.push(format!("lock_expires_at_ms < ?{}", args.len()));
    }
    if let Some(t) = query.updated_since {
        args.push(Value::Integer(dt_to_ms(t)));
        clauses.push(format!("updated_at_ms >= ?{}", args.len()));
    }
    match query.exhausted {
        Some(true) => clauses.push("attempts >= max_attempts".to_string()),
        Some(false) => clauses.push("attempts < max_attempts".to_string()),
        None => {}
    }

    let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(match query.order {
        TaskOrder::OldestFirst => " ORDER BY updated_at_ms ASC, id ASC",
        TaskOrder::NewestFirst => " ORDER BY updated_at_ms DESC, id DESC",
    });
    if let Some(limit) = query.limit {
        args.push(Value::Integer(limit.min(i64::MAX as usize) as i64));
        sql.push_str(&format!(" LIMIT ?{}", args.len()));
    }
    (sql, args)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let payload: String = row.get(2)?;
    Ok(TaskRecord {
        id: parse_col(row, 0)?,
        job_id: parse_opt_col(row, 1)?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?,
        status: parse_col(row, 3)?,
        attempts: row.get(4)?,
        max_attempts: row.get(5)?,
        locked_by: parse_opt_col(row, 6)?,
        lock_expires_at: opt_ms_col(row, 7)?,
        last_error: row.get(8)?,
        next_eligible_at: opt_ms_col(row, 9)?,
        created_at: ms_col(row, 10)?,
        started_at: opt_ms_col(row, 11)?,
        completed_at: opt_ms_col(row, 12)?,
        updated_at: ms_col(row, 13)?,
    })
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        s.parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn ms_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    ms_to_dt(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn opt_ms_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.get(idx)?;
    ms.map(|ms| ms_to_dt(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms)))
        .transpose()
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

fn map_rusqlite_err(err: rusqlite::Error) -> QueueError {
    QueueError::Store(format!("sqlite task store: {err}"))
}

fn ensure_schema(conn: &Connection) -> Result<(), QueueError> {
    ensure_migration_table(conn)?;
    let current = current_schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(QueueError::Store(format!(
            "sqlite schema version {current} is newer than supported {SCHEMA_VERSION}"
        )));
    }
    if current < 1 {
        apply_migration_v1(conn)?;
        record_migration(conn, 1, "baseline_tasks_table")?;
    }
    if current < 2 {
        apply_migration_v2(conn)?;
        record_migration(conn, 2, "dispatch_and_reclaim_indexes")?;
    }
    Ok(())
}

fn ensure_migration_table(conn: &Connection) -> Result<(), QueueError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
          version INTEGER PRIMARY KEY,
          name TEXT NOT NULL,
          applied_at_ms INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| QueueError::Store(format!("init migration table: {e}")))
}

fn current_schema_version(conn: &Connection) -> Result<i64, QueueError> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |r| r.get(0),
    )
    .map_err(|e| QueueError::Store(format!("read schema version: {e}")))
}

fn record_migration(conn: &Connection, version: i64, name: &str) -> Result<(), QueueError> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, name, applied_at_ms)
         VALUES (?1, ?2, ?3)",
        params![version, name, dt_to_ms(Utc::now())],
    )
    .map_err(|e| QueueError::Store(format!("record migration {version}: {e}")))?;
    Ok(())
}

fn apply_migration_v1(conn: &Connection) -> Result<(), QueueError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
          id TEXT PRIMARY KEY,
          job_id TEXT NULL,
          payload_json TEXT NOT NULL,
          status TEXT NOT NULL,
          attempts INTEGER NOT NULL DEFAULT 0,
          max_attempts INTEGER NOT NULL,
          locked_by TEXT NULL,
          lock_expires_at_ms INTEGER NULL,
          last_error TEXT NULL,
          next_eligible_at_ms INTEGER NULL,
          created_at_ms INTEGER NOT NULL,
          started_at_ms INTEGER NULL,
          completed_at_ms INTEGER NULL,
          updated_at_ms INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| QueueError::Store(format!("apply migration v1: {e}")))
}

fn apply_migration_v2(conn: &Connection) -> Result<(), QueueError> {
    conn.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_tasks_dispatch ON tasks(status, updated_at_ms, id);
        CREATE INDEX IF NOT EXISTS idx_tasks_lock ON tasks(locked_by, lock_expires_at_ms);
        CREATE INDEX IF NOT EXISTS idx_tasks_job ON tasks(job_id);
        "#,
    )
    .map_err(|e| QueueError::Store(format!("apply migration v2: {e}")))
}

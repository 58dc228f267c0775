use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::DataError;
use crate::task::{TaskId, TaskRecord, TaskState, TaskStatus};

/// Where task lifecycle state lives. Writers are the dispatcher (pending)
/// and the worker (everything after); readers go through the tracker.
#[async_trait]
pub trait ResultStore: Send + Sync {
  async fn record_pending(&self, id: TaskId, kind: &str) -> Result<(), DataError>;

  /// Returns false when the task may not be started, e.g. a redelivered
  /// copy of a task that already finished.
  async fn record_started(&self, id: TaskId, kind: &str, attempt: u32) -> Result<bool, DataError>;

  async fn record_success(&self, id: TaskId, result: Value) -> Result<(), DataError>;

  async fn record_retry(&self, id: TaskId, error: &str) -> Result<(), DataError>;

  async fn record_failure(&self, id: TaskId, error: &str) -> Result<(), DataError>;

  async fn fetch(&self, id: TaskId) -> Result<Option<TaskRecord>, DataError>;
}

#[derive(Default)]
pub struct InMemoryResultStore {
  records: Mutex<HashMap<TaskId, (TaskRecord, Vec<TaskState>)>>,
}

impl InMemoryResultStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn records(&self) -> Vec<TaskRecord> {
    self
      .records
      .lock()
      .await
      .values()
      .map(|(record, _)| record.clone())
      .collect()
  }

  /// Every state the task has been in, oldest first.
  pub async fn history(&self, id: TaskId) -> Vec<TaskState> {
    self
      .records
      .lock()
      .await
      .get(&id)
      .map(|(_, history)| history.clone())
      .unwrap_or_default()
  }

  async fn transition(
    &self,
    id: TaskId,
    next: TaskState,
    apply: impl FnOnce(&mut TaskRecord) + Send,
  ) -> Result<bool, DataError> {
    let mut records = self.records.lock().await;
    let Some((record, history)) = records.get_mut(&id) else {
      return Err(DataError::UnknownTask(id));
    };
    if !record.state.can_transition_to(next) {
      return Ok(false);
    }
    record.state = next;
    record.updated_at = Utc::now();
    apply(record);
    history.push(next);
    Ok(true)
  }
}

fn blank_record(id: TaskId, kind: &str, state: TaskState) -> TaskRecord {
  let now = Utc::now();
  TaskRecord {
    id,
    kind: kind.to_string(),
    state,
    attempts: 0,
    result: None,
    error: None,
    created_at: now,
    updated_at: now,
  }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
  async fn record_pending(&self, id: TaskId, kind: &str) -> Result<(), DataError> {
    self
      .records
      .lock()
      .await
      .entry(id)
      .or_insert_with(|| (blank_record(id, kind, TaskState::Pending), vec![TaskState::Pending]));
    Ok(())
  }

  async fn record_started(&self, id: TaskId, kind: &str, attempt: u32) -> Result<bool, DataError> {
    {
      // a delivery can outrun the pending record when another producer enqueued it
      let mut records = self.records.lock().await;
      records
        .entry(id)
        .or_insert_with(|| (blank_record(id, kind, TaskState::Pending), vec![TaskState::Pending]));
    }
    self
      .transition(id, TaskState::Started, |record| record.attempts = attempt)
      .await
  }

  async fn record_success(&self, id: TaskId, result: Value) -> Result<(), DataError> {
    self
      .transition(id, TaskState::Success, |record| {
        record.result = Some(result);
        record.error = None;
      })
      .await
      .map(drop)
  }

  async fn record_retry(&self, id: TaskId, error: &str) -> Result<(), DataError> {
    let error = error.to_string();
    self
      .transition(id, TaskState::Retry, |record| record.error = Some(error))
      .await
      .map(drop)
  }

  async fn record_failure(&self, id: TaskId, error: &str) -> Result<(), DataError> {
    let error = error.to_string();
    let mut records = self.records.lock().await;
    let Some((record, history)) = records.get_mut(&id) else {
      return Err(DataError::UnknownTask(id));
    };
    // dispatch failures fail a task that never started
    if record.state.can_transition_to(TaskState::Failure) || record.state == TaskState::Pending {
      record.state = TaskState::Failure;
      record.error = Some(error);
      record.updated_at = Utc::now();
      history.push(TaskState::Failure);
    }
    Ok(())
  }

  async fn fetch(&self, id: TaskId) -> Result<Option<TaskRecord>, DataError> {
    Ok(self.records.lock().await.get(&id).map(|(record, _)| record.clone()))
  }
}

/// Result store backed by the `tasks` table.
#[derive(Clone)]
pub struct PgResultStore {
  pool: PgPool,
}

fn state_names(states: &[TaskState]) -> Vec<String> {
  states.iter().map(|s| s.as_str().to_string()).collect()
}

impl PgResultStore {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }

  async fn finish(
    &self,
    id: TaskId,
    next: TaskState,
    result: Option<Value>,
    error: Option<&str>,
    allowed_from: &[TaskState],
  ) -> Result<(), DataError> {
    let updated = sqlx::query(
      "UPDATE tasks SET state = $2, result = $3, error = $4, updated_at = NOW()
       WHERE id = $1 AND state = ANY($5)",
    )
    .bind(id)
    .bind(next.as_str())
    .bind(result)
    .bind(error)
    .bind(state_names(allowed_from))
    .execute(&self.pool)
    .await
    .map_err(store_error)?;
    if updated.rows_affected() == 0 {
      warn!(task_id = %id, state = %next, "Task state not updated");
    }
    Ok(())
  }
}

fn store_error(e: sqlx::Error) -> DataError {
  DataError::ResultStore(e.to_string())
}

#[async_trait]
impl ResultStore for PgResultStore {
  async fn record_pending(&self, id: TaskId, kind: &str) -> Result<(), DataError> {
    sqlx::query(
      "INSERT INTO tasks (id, kind, state, attempts, created_at, updated_at)
       VALUES ($1, $2, 'PENDING', 0, NOW(), NOW())
       ON CONFLICT (id) DO NOTHING",
    )
    .bind(id)
    .bind(kind)
    .execute(&self.pool)
    .await
    .map_err(store_error)?;
    Ok(())
  }

  async fn record_started(&self, id: TaskId, kind: &str, attempt: u32) -> Result<bool, DataError> {
    let row = sqlx::query(
      "INSERT INTO tasks (id, kind, state, attempts, created_at, updated_at)
       VALUES ($1, $2, 'STARTED', $3, NOW(), NOW())
       ON CONFLICT (id) DO UPDATE SET state = 'STARTED', attempts = $3, updated_at = NOW()
       WHERE tasks.state = ANY($4)
       RETURNING id",
    )
    .bind(id)
    .bind(kind)
    .bind(attempt as i32)
    .bind(state_names(TaskState::Started.predecessors()))
    .fetch_optional(&self.pool)
    .await
    .map_err(store_error)?;
    Ok(row.is_some())
  }

  async fn record_success(&self, id: TaskId, result: Value) -> Result<(), DataError> {
    self
      .finish(id, TaskState::Success, Some(result), None, TaskState::Success.predecessors())
      .await
  }

  async fn record_retry(&self, id: TaskId, error: &str) -> Result<(), DataError> {
    self
      .finish(id, TaskState::Retry, None, Some(error), TaskState::Retry.predecessors())
      .await
  }

  async fn record_failure(&self, id: TaskId, error: &str) -> Result<(), DataError> {
    self
      .finish(id, TaskState::Failure, None, Some(error), &[TaskState::Pending, TaskState::Started])
      .await
  }

  async fn fetch(&self, id: TaskId) -> Result<Option<TaskRecord>, DataError> {
    let row = sqlx::query(
      "SELECT id, kind, state, attempts, result, error, created_at, updated_at FROM tasks WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&self.pool)
    .await
    .map_err(store_error)?;

    let Some(row) = row else {
      return Ok(None);
    };
    let state: String = row.try_get("state").map_err(store_error)?;
    let attempts: i32 = row.try_get("attempts").map_err(store_error)?;
    Ok(Some(TaskRecord {
      id: row.try_get("id").map_err(store_error)?,
      kind: row.try_get("kind").map_err(store_error)?,
      state: state.parse().map_err(DataError::ResultStore)?,
      attempts: attempts.max(0) as u32,
      result: row.try_get::<Option<Value>, _>("result").map_err(store_error)?,
      error: row.try_get("error").map_err(store_error)?,
      created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(store_error)?,
      updated_at: row.try_get::<DateTime<Utc>, _>("updated_at").map_err(store_error)?,
    }))
  }
}

/// Read-only view over the result store.
#[derive(Clone)]
pub struct TaskStatusTracker {
  store: std::sync::Arc<dyn ResultStore>,
}

impl TaskStatusTracker {
  pub fn new(store: std::sync::Arc<dyn ResultStore>) -> Self {
    Self { store }
  }

  pub async fn status(&self, id: TaskId) -> Result<TaskStatus, DataError> {
    self
      .store
      .fetch(id)
      .await?
      .map(TaskStatus::from)
      .ok_or(DataError::UnknownTask(id))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::Arc;
  use uuid::Uuid;

  #[tokio::test]
  async fn tracker_reports_unknown_ids() {
    let tracker = TaskStatusTracker::new(Arc::new(InMemoryResultStore::new()));
    let id = Uuid::new_v4();
    assert!(matches!(tracker.status(id).await, Err(DataError::UnknownTask(unknown)) if unknown == id));
  }

  #[tokio::test]
  async fn lifecycle_is_recorded_in_order() {
    let store = Arc::new(InMemoryResultStore::new());
    let id = Uuid::new_v4();
    store.record_pending(id, "k").await.unwrap();
    assert!(store.record_started(id, "k", 1).await.unwrap());
    store.record_retry(id, "boom").await.unwrap();
    assert!(store.record_started(id, "k", 2).await.unwrap());
    store.record_success(id, json!({"ok": true})).await.unwrap();

    let status = TaskStatusTracker::new(store.clone()).status(id).await.unwrap();
    assert_eq!(status.state, TaskState::Success);
    assert_eq!(status.attempts, 2);
    assert_eq!(status.result, Some(json!({"ok": true})));
    assert_eq!(status.error, None);
    assert_eq!(
      store.history(id).await,
      vec![TaskState::Pending, TaskState::Started, TaskState::Retry, TaskState::Started, TaskState::Success]
    );
  }

  #[tokio::test]
  async fn finished_tasks_refuse_to_restart() {
    let store = InMemoryResultStore::new();
    let id = Uuid::new_v4();
    store.record_pending(id, "k").await.unwrap();
    store.record_started(id, "k", 1).await.unwrap();
    store.record_success(id, json!(1)).await.unwrap();
    assert!(!store.record_started(id, "k", 2).await.unwrap());
    assert_eq!(store.fetch(id).await.unwrap().unwrap().attempts, 1);
  }

  #[tokio::test]
  async fn pending_task_can_fail_when_dispatch_breaks() {
    let store = InMemoryResultStore::new();
    let id = Uuid::new_v4();
    store.record_pending(id, "k").await.unwrap();
    store.record_failure(id, "broker down").await.unwrap();
    let record = store.fetch(id).await.unwrap().unwrap();
    assert_eq!(record.state, TaskState::Failure);
    assert_eq!(record.error.as_deref(), Some("broker down"));
  }
}

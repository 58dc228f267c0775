#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;

use rwsplit::audit::{AuditStats, RequestAuditLogger};
use rwsplit::config::TaskLimits;
use rwsplit::database::{Executor, Query, QueryOutput, Row, SqlValue};
use rwsplit::dispatcher::TaskDispatcher;
use rwsplit::error::DataError;
use rwsplit::handlers::HandlerRegistry;
use rwsplit::messaging::InMemoryBroker;
use rwsplit::results::{InMemoryResultStore, TaskStatusTracker};
use rwsplit::router::Role;
use rwsplit::service::AppService;
use rwsplit::task::TaskMessage;
use rwsplit::task_worker::TaskWorker;

pub const PRIMARY: &str = "primary@db-primary:5432";
pub const REPLICA: &str = "replica@db-replica-1:5432";

#[derive(Default)]
struct Tables {
  users: Vec<Row>,
  products: Vec<Row>,
  requests: Vec<Row>,
}

/// Statement-matching stand-in for PostgreSQL. Replica reads see the same
/// tables as the primary.
#[derive(Default)]
pub struct FakeDatabase {
  tables: Mutex<Tables>,
  pub calls: Mutex<Vec<(Role, String)>>,
  pub primary_down: AtomicBool,
  pub audit_down: AtomicBool,
}

fn text(value: &SqlValue) -> Value {
  match value {
    SqlValue::Null => Value::Null,
    SqlValue::Bool(v) => json!(v),
    SqlValue::Int(v) => json!(v),
    SqlValue::Float(v) => json!(v),
    SqlValue::Text(v) => json!(v),
    SqlValue::Timestamp(v) => json!(v.to_rfc3339()),
  }
}

fn connection_refused(endpoint: &str) -> DataError {
  DataError::Connection {
    endpoint: endpoint.to_string(),
    source: sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused")),
  }
}

fn limit(query: &Query, default: usize) -> usize {
  match query.params.last() {
    Some(SqlValue::Int(n)) => *n as usize,
    _ => default,
  }
}

fn newest_first(rows: &[Row], n: usize) -> Vec<Row> {
  rows.iter().rev().take(n).cloned().collect()
}

impl FakeDatabase {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub async fn user_count(&self) -> usize {
    self.tables.lock().await.users.len()
  }

  pub async fn products(&self) -> Vec<Row> {
    self.tables.lock().await.products.clone()
  }

  pub async fn requests(&self) -> Vec<Row> {
    self.tables.lock().await.requests.clone()
  }

  pub async fn roles_for(&self, prefix: &str) -> Vec<Role> {
    self
      .calls
      .lock()
      .await
      .iter()
      .filter(|(_, sql)| sql.trim_start().starts_with(prefix))
      .map(|(role, _)| *role)
      .collect()
  }
}

#[async_trait]
impl Executor for FakeDatabase {
  async fn execute(&self, role: Role, query: Query) -> Result<QueryOutput, DataError> {
    self.calls.lock().await.push((role, query.statement.clone()));
    if query.is_write() && role != Role::Primary {
      return Err(DataError::WriteOnReplica);
    }
    let endpoint = match role {
      Role::Primary => PRIMARY,
      Role::Replica => REPLICA,
    };
    if role == Role::Primary && self.primary_down.load(Ordering::SeqCst) {
      return Err(connection_refused(endpoint));
    }

    let sql = query.statement.trim_start();
    let p = &query.params;
    let mut tables = self.tables.lock().await;
    let rows = |rows: Vec<Row>| -> Result<QueryOutput, DataError> {
      Ok(QueryOutput::Rows {
        rows,
        endpoint: endpoint.to_string(),
      })
    };

    if sql.starts_with("INSERT INTO users") {
      let email = text(&p[1]);
      if tables.users.iter().any(|u| u["email"] == email) {
        // unique violation; the transaction rolls back so nothing is kept
        return Err(DataError::Query(sqlx::Error::Protocol("duplicate key value violates unique constraint".into())));
      }
      let id = tables.users.len() as i64 + 1;
      let row = json!({ "id": id, "name": text(&p[0]), "email": email, "created_at": Utc::now().to_rfc3339() });
      tables.users.push(row.as_object().cloned().unwrap_or_default());
      return Ok(QueryOutput::Inserted { id, endpoint: endpoint.to_string() });
    }
    if sql.starts_with("SELECT id, name FROM users WHERE id") {
      let id = text(&p[0]);
      return rows(tables.users.iter().filter(|u| u["id"] == id).cloned().collect());
    }
    if sql.starts_with("SELECT id, name, email, created_at FROM users") {
      return rows(newest_first(&tables.users, limit(&query, 20)));
    }
    if sql.starts_with("INSERT INTO products") {
      let id = tables.products.len() as i64 + 1;
      let row = json!({
        "id": id,
        "name": text(&p[0]),
        "description": text(&p[1]),
        "price": text(&p[2]),
        "stock_quantity": text(&p[3]),
        "category": text(&p[4]),
        "created_at": Utc::now().to_rfc3339(),
      });
      tables.products.push(row.as_object().cloned().unwrap_or_default());
      return Ok(QueryOutput::Inserted { id, endpoint: endpoint.to_string() });
    }
    if sql.starts_with("SELECT id, name, description") {
      return rows(newest_first(&tables.products, limit(&query, 20)));
    }
    if sql.starts_with("INSERT INTO requests") {
      if self.audit_down.load(Ordering::SeqCst) {
        return Err(connection_refused(endpoint));
      }
      let id = tables.requests.len() as i64 + 1;
      let row = json!({
        "id": id,
        "server_id": text(&p[0]),
        "endpoint": text(&p[1]),
        "method": text(&p[2]),
        "client_ip": text(&p[3]),
        "user_agent": text(&p[4]),
        "response_time_ms": text(&p[5]),
        "timestamp": text(&p[6]),
      });
      tables.requests.push(row.as_object().cloned().unwrap_or_default());
      return Ok(QueryOutput::Affected { count: 1, endpoint: endpoint.to_string() });
    }
    if sql.starts_with("SELECT id, server_id") {
      return rows(newest_first(&tables.requests, limit(&query, 50)));
    }
    Err(DataError::Query(sqlx::Error::Protocol(format!("unexpected statement: {}", sql))))
  }
}

pub struct Harness {
  pub db: Arc<FakeDatabase>,
  pub store: Arc<InMemoryResultStore>,
  pub queue: UnboundedReceiver<TaskMessage>,
  pub service: AppService,
  pub worker: TaskWorker,
  pub dispatcher: TaskDispatcher,
  pub audit: Arc<AuditStats>,
}

pub fn fast_limits() -> TaskLimits {
  TaskLimits {
    max_attempts: 3,
    retry_delay: Duration::from_secs(60),
    soft_time_limit: Duration::from_secs(5),
    hard_time_limit: Duration::from_secs(10),
  }
}

impl Harness {
  pub fn new() -> Self {
    Self::with_registry(HandlerRegistry::with_defaults(), fast_limits())
  }

  pub fn with_registry(registry: HandlerRegistry, limits: TaskLimits) -> Self {
    let db = FakeDatabase::new();
    let executor: Arc<dyn Executor> = db.clone();
    let store = Arc::new(InMemoryResultStore::new());
    let (broker, queue) = InMemoryBroker::new();
    let broker = Arc::new(broker);
    let audit = RequestAuditLogger::spawn(executor.clone(), 64);
    let stats = audit.stats();

    let dispatcher = TaskDispatcher::new(broker.clone(), store.clone());
    let service = AppService::new(
      "api-1",
      executor.clone(),
      dispatcher.clone(),
      TaskStatusTracker::new(store.clone()),
      audit.clone(),
    );
    let worker = TaskWorker::new("worker-1", registry, executor, broker, store.clone(), audit, limits);
    Self {
      db,
      store,
      queue,
      service,
      worker,
      dispatcher,
      audit: stats,
    }
  }

  pub async fn dispatch(&self, kind: &str) -> uuid::Uuid {
    self.dispatcher.enqueue(kind, json!({})).await.unwrap()
  }

  /// Delivers queued messages to the worker until the queue goes quiet.
  pub async fn drain(&mut self) {
    while let Ok(message) = self.queue.try_recv() {
      let _ = self.worker.process(message).await;
    }
  }
}

/// Polls until the audit writer has handled `n` entries one way or another.
pub async fn audit_settled(stats: &AuditStats, n: u64) {
  for _ in 0..200 {
    if stats.written() + stats.failed() >= n {
      return;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  panic!(
    "audit writer did not settle: written={} failed={}",
    stats.written(),
    stats.failed()
  );
}

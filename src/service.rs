use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use tracing::{error, info};

use crate::audit::RequestAuditLogger;
use crate::database::{Executor, Query};
use crate::dispatcher::TaskDispatcher;
use crate::error::DataError;
use crate::handlers::args_for_product_creation;
use crate::models::{Product, RequestLogRow, User, from_rows};
use crate::results::TaskStatusTracker;
use crate::router::Role;
use crate::task::{CREATE_PRODUCT_FROM_USER, TEST_WORKER_CONNECTION, TaskId, TaskStatus};

pub const USER_LIST_LIMIT: i64 = 20;
pub const PRODUCT_LIST_LIMIT: i64 = 20;
pub const REQUEST_LOG_LIMIT: i64 = 50;

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email pattern")
});

/// Rows plus the endpoint that served them.
#[derive(Debug, Clone, Serialize)]
pub struct Served<T> {
  pub data: Vec<T>,
  pub database: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedUser {
  pub id: i64,
  pub name: String,
  pub email: String,
  pub task_id: Option<TaskId>,
  pub database: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnqueuedTask {
  pub task_id: TaskId,
  pub user_id: Option<i64>,
  pub user_name: Option<String>,
}

/// The operations the HTTP tier exposes.
#[derive(Clone)]
pub struct AppService {
  pub server_id: String,
  executor: Arc<dyn Executor>,
  dispatcher: TaskDispatcher,
  tracker: TaskStatusTracker,
  audit: RequestAuditLogger,
}

impl AppService {
  pub fn new(
    server_id: impl Into<String>,
    executor: Arc<dyn Executor>,
    dispatcher: TaskDispatcher,
    tracker: TaskStatusTracker,
    audit: RequestAuditLogger,
  ) -> Self {
    Self {
      server_id: server_id.into(),
      executor,
      dispatcher,
      tracker,
      audit,
    }
  }

  pub fn audit(&self) -> &RequestAuditLogger {
    &self.audit
  }

  async fn read<T: serde::de::DeserializeOwned>(&self, role: Role, query: Query) -> Result<Served<T>, DataError> {
    let output = self.executor.execute(role, query).await?;
    let database = output.endpoint().to_string();
    Ok(Served {
      data: from_rows(output.into_rows())?,
      database,
    })
  }

  pub async fn list_users(&self) -> Result<Served<User>, DataError> {
    let query = Query::read("SELECT id, name, email, created_at FROM users ORDER BY created_at DESC, id DESC LIMIT $1")
      .bind(USER_LIST_LIMIT);
    self.read(Role::Replica, query).await
  }

  pub async fn list_products(&self) -> Result<Served<Product>, DataError> {
    let query = Query::read(
      "SELECT id, name, description, price::float8 AS price, stock_quantity, category, created_at
       FROM products ORDER BY created_at DESC, id DESC LIMIT $1",
    )
    .bind(PRODUCT_LIST_LIMIT);
    self.read(Role::Replica, query).await
  }

  pub async fn list_request_log(&self) -> Result<Served<RequestLogRow>, DataError> {
    let query = Query::read(
      "SELECT id, server_id, endpoint, method, client_ip, user_agent, response_time_ms, timestamp
       FROM requests ORDER BY timestamp DESC, id DESC LIMIT $1",
    )
    .bind(REQUEST_LOG_LIMIT);
    self.read(Role::Replica, query).await
  }

  pub async fn create_user(&self, name: &str, email: &str) -> Result<CreatedUser, DataError> {
    let name = name.trim();
    let email = email.trim();
    if name.is_empty() || email.is_empty() {
      return Err(DataError::Validation("Name and email are required".into()));
    }
    if !EMAIL.is_match(email) {
      return Err(DataError::Validation(format!("Invalid email address '{}'", email)));
    }

    let output = self
      .executor
      .execute(
        Role::Primary,
        Query::insert("INSERT INTO users (name, email) VALUES ($1, $2) RETURNING id")
          .bind(name)
          .bind(email),
      )
      .await?;
    let id = output
      .inserted_id()
      .ok_or(DataError::Query(sqlx::Error::RowNotFound))?;
    info!(user_id = id, "User created on {}", output.endpoint());

    // the user row is committed; a failed enqueue is reported, not rolled back
    let task_id = match self
      .dispatcher
      .enqueue(CREATE_PRODUCT_FROM_USER, args_for_product_creation(id, name))
      .await
    {
      Ok(task_id) => Some(task_id),
      Err(e) => {
        error!(user_id = id, "Failed to enqueue product creation: {}", e);
        None
      }
    };

    Ok(CreatedUser {
      id,
      name: name.to_string(),
      email: email.to_string(),
      task_id,
      database: output.endpoint().to_string(),
    })
  }

  pub async fn enqueue_product_creation(&self, user_id: i64) -> Result<EnqueuedTask, DataError> {
    let output = self
      .executor
      .execute(Role::Primary, Query::read("SELECT id, name FROM users WHERE id = $1").bind(user_id))
      .await?;
    let user_name = output
      .into_rows()
      .into_iter()
      .next()
      .and_then(|row| row.get("name").and_then(|v| v.as_str()).map(str::to_string))
      .ok_or(DataError::UserNotFound(user_id))?;

    let task_id = self
      .dispatcher
      .enqueue(CREATE_PRODUCT_FROM_USER, args_for_product_creation(user_id, &user_name))
      .await?;
    Ok(EnqueuedTask {
      task_id,
      user_id: Some(user_id),
      user_name: Some(user_name),
    })
  }

  pub async fn enqueue_self_test(&self) -> Result<EnqueuedTask, DataError> {
    let task_id = self.dispatcher.enqueue(TEST_WORKER_CONNECTION, serde_json::json!({})).await?;
    Ok(EnqueuedTask {
      task_id,
      user_id: None,
      user_name: None,
    })
  }

  pub async fn task_status(&self, task_id: TaskId) -> Result<TaskStatus, DataError> {
    self.tracker.status(task_id).await
  }
}

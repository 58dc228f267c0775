use thiserror::Error;
use uuid::Uuid;

use crate::router::Role;

#[derive(Debug, Error)]
pub enum DataError {
  #[error("no endpoint configured for role {0}")]
  NoEndpointConfigured(Role),

  #[error("could not connect to {endpoint}: {source}")]
  Connection {
    endpoint: String,
    #[source]
    source: sqlx::Error,
  },

  #[error("query failed: {0}")]
  Query(#[from] sqlx::Error),

  #[error("column {column} has unsupported type {type_name}")]
  UnsupportedColumn { column: String, type_name: String },

  #[error("write statements must target the primary")]
  WriteOnReplica,

  #[error("task failed after {attempts} attempts: {error}")]
  TaskRetryExhausted { attempts: u32, error: String },

  #[error("unknown task {0}")]
  UnknownTask(Uuid),

  #[error("validation failed: {0}")]
  Validation(String),

  #[error("user {0} not found")]
  UserNotFound(i64),

  #[error("messaging error: {0}")]
  Messaging(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("result store error: {0}")]
  ResultStore(String),

  #[error("handler not found for task kind {0}")]
  HandlerNotFound(String),

  #[error("duplicate handler for task kind {0}")]
  DuplicateHandler(String),
}

impl DataError {
  /// Failures that map to a service-unavailable class response.
  pub fn is_unavailable(&self) -> bool {
    matches!(
      self,
      DataError::NoEndpointConfigured(_) | DataError::Connection { .. } | DataError::Messaging(_)
    )
  }
}

impl From<lapin::Error> for DataError {
  fn from(err: lapin::Error) -> Self {
    DataError::Messaging(err.to_string())
  }
}

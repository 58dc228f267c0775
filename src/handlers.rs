use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::database::Executor;
use crate::error::DataError;
use crate::models::NewProduct;
use crate::router::Role;
use crate::task::{CREATE_PRODUCT_FROM_USER, HandlerOutcome, TEST_WORKER_CONNECTION, TaskMessage};

pub struct TaskContext<'a> {
  pub message: &'a TaskMessage,
  pub executor: &'a Arc<dyn Executor>,
  pub worker_id: &'a str,
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
  fn kind(&self) -> &'static str;

  /// Path recorded in the request log for this task.
  fn audit_path(&self, message: &TaskMessage) -> String {
    format!("/worker/{}", message.kind)
  }

  async fn handle(&self, ctx: &TaskContext<'_>) -> HandlerOutcome;
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
  handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> Result<(), DataError> {
    let kind = handler.kind();
    if self.handlers.contains_key(kind) {
      return Err(DataError::DuplicateHandler(kind.to_string()));
    }
    self.handlers.insert(kind, handler);
    Ok(())
  }

  pub fn get(&self, kind: &str) -> Result<Arc<dyn TaskHandler>, DataError> {
    self
      .handlers
      .get(kind)
      .cloned()
      .ok_or_else(|| DataError::HandlerNotFound(kind.to_string()))
  }

  /// Registry with every built-in task kind.
  pub fn with_defaults() -> Self {
    let mut registry = Self::new();
    let defaults: [Arc<dyn TaskHandler>; 2] = [Arc::new(CreateProductFromUser), Arc::new(TestWorkerConnection)];
    for handler in defaults {
      registry.handlers.insert(handler.kind(), handler);
    }
    registry
  }
}

#[derive(Debug, Deserialize)]
struct CreateProductArgs {
  user_id: i64,
  user_name: String,
}

pub struct CreateProductFromUser;

#[async_trait]
impl TaskHandler for CreateProductFromUser {
  fn kind(&self) -> &'static str {
    CREATE_PRODUCT_FROM_USER
  }

  fn audit_path(&self, message: &TaskMessage) -> String {
    match message.args.get("user_id") {
      Some(user_id) => format!("/worker/create-product/{}", user_id),
      None => "/worker/create-product".to_string(),
    }
  }

  async fn handle(&self, ctx: &TaskContext<'_>) -> HandlerOutcome {
    let args: CreateProductArgs = match serde_json::from_value(ctx.message.args.clone()) {
      Ok(args) => args,
      Err(e) => return HandlerOutcome::Fatal(format!("invalid arguments: {}", e)),
    };

    let product = NewProduct::for_user(&args.user_name);
    let inserted = match ctx.executor.execute(Role::Primary, product.insert_query()).await {
      Ok(output) => output,
      Err(e) => return HandlerOutcome::Retryable(format!("Database write error: {}", e)),
    };
    let product_id = inserted.inserted_id();
    info!(
      "Worker {}: created product {:?} for user {}",
      ctx.worker_id, product_id, args.user_id
    );

    HandlerOutcome::Success(json!({
      "status": "success",
      "message": format!("Product created successfully for user {}", args.user_name),
      "product_id": product_id,
      "product_name": product.name,
      "price": product.price,
      "stock_quantity": product.stock_quantity,
      "category": product.category,
      "task_id": ctx.message.id,
      "created_at": Utc::now().to_rfc3339(),
    }))
  }
}

pub struct TestWorkerConnection;

#[async_trait]
impl TaskHandler for TestWorkerConnection {
  fn kind(&self) -> &'static str {
    TEST_WORKER_CONNECTION
  }

  async fn handle(&self, _ctx: &TaskContext<'_>) -> HandlerOutcome {
    HandlerOutcome::Success(json!({
      "status": "success",
      "message": "Worker is running",
      "timestamp": Utc::now().to_rfc3339(),
    }))
  }
}

pub fn args_for_product_creation(user_id: i64, user_name: &str) -> Value {
  json!({ "user_id": user_id, "user_name": user_name })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn duplicate_registration_is_rejected() {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(TestWorkerConnection)).unwrap();
    let err = registry.register(Arc::new(TestWorkerConnection)).unwrap_err();
    assert!(matches!(err, DataError::DuplicateHandler(kind) if kind == TEST_WORKER_CONNECTION));
  }

  #[test]
  fn defaults_cover_builtin_kinds() {
    let registry = HandlerRegistry::with_defaults();
    assert!(registry.get(CREATE_PRODUCT_FROM_USER).is_ok());
    assert!(registry.get(TEST_WORKER_CONNECTION).is_ok());
    assert!(matches!(registry.get("nope"), Err(DataError::HandlerNotFound(_))));
  }

  #[test]
  fn product_audit_path_names_the_user() {
    let message = TaskMessage::new(CREATE_PRODUCT_FROM_USER, args_for_product_creation(42, "Ann"));
    assert_eq!(CreateProductFromUser.audit_path(&message), "/worker/create-product/42");
    let selftest = TaskMessage::new(TEST_WORKER_CONNECTION, json!({}));
    assert_eq!(TestWorkerConnection.audit_path(&selftest), "/worker/test_worker_connection");
  }
}

use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info};

use crate::error::DataError;
use crate::messaging::TaskBroker;
use crate::results::ResultStore;
use crate::task::{TaskId, TaskMessage};

/// Fire-and-forget enqueue. Returns as soon as the broker has the message;
/// nothing here waits on, or deduplicates, execution.
#[derive(Clone)]
pub struct TaskDispatcher {
  broker: Arc<dyn TaskBroker>,
  results: Arc<dyn ResultStore>,
}

impl TaskDispatcher {
  pub fn new(broker: Arc<dyn TaskBroker>, results: Arc<dyn ResultStore>) -> Self {
    Self { broker, results }
  }

  pub async fn enqueue(&self, kind: &str, args: Value) -> Result<TaskId, DataError> {
    let message = TaskMessage::new(kind, args);
    self.results.record_pending(message.id, kind).await?;

    if let Err(e) = self.broker.publish(&message).await {
      error!(task_id = %message.id, kind, "Failed to publish task: {}", e);
      if let Err(store_err) = self.results.record_failure(message.id, &e.to_string()).await {
        error!(task_id = %message.id, "Failed to mark undeliverable task: {}", store_err);
      }
      return Err(e);
    }

    info!(task_id = %message.id, kind, "Task {} enqueued", message.id);
    Ok(message.id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::messaging::InMemoryBroker;
  use crate::results::{InMemoryResultStore, TaskStatusTracker};
  use crate::task::TaskState;
  use serde_json::json;

  #[tokio::test]
  async fn enqueue_returns_before_anything_runs() {
    let (broker, mut rx) = InMemoryBroker::new();
    let store = Arc::new(InMemoryResultStore::new());
    let dispatcher = TaskDispatcher::new(Arc::new(broker), store.clone());

    let id = dispatcher.enqueue("k", json!({"a": 1})).await.unwrap();

    let status = TaskStatusTracker::new(store).status(id).await.unwrap();
    assert_eq!(status.state, TaskState::Pending);
    let message = rx.recv().await.unwrap();
    assert_eq!(message.id, id);
    assert_eq!(message.args, json!({"a": 1}));
    assert_eq!(message.attempt, 0);
  }

  #[tokio::test]
  async fn publish_failure_marks_task_failed() {
    let (broker, rx) = InMemoryBroker::new();
    drop(rx);
    let store = Arc::new(InMemoryResultStore::new());
    let dispatcher = TaskDispatcher::new(Arc::new(broker), store.clone());

    let err = dispatcher.enqueue("k", json!({})).await.unwrap_err();
    assert!(matches!(err, DataError::Messaging(_)));

    let records = store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, TaskState::Failure);
    assert_eq!(records[0].error.as_deref(), Some(err.to_string().as_str()));
    assert_eq!(store.history(records[0].id).await, vec![TaskState::Pending, TaskState::Failure]);
  }
}

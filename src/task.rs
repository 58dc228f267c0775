use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type TaskId = Uuid;

pub const CREATE_PRODUCT_FROM_USER: &str = "create_product_from_user";
pub const TEST_WORKER_CONNECTION: &str = "test_worker_connection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
  Pending,
  Started,
  Success,
  Failure,
  Retry,
}

impl TaskState {
  pub fn as_str(&self) -> &'static str {
    match self {
      TaskState::Pending => "PENDING",
      TaskState::Started => "STARTED",
      TaskState::Success => "SUCCESS",
      TaskState::Failure => "FAILURE",
      TaskState::Retry => "RETRY",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, TaskState::Success | TaskState::Failure)
  }

  /// States a task may move into `self` from. Started accepts itself so a
  /// task redelivered after a worker crash can be picked up again.
  pub fn predecessors(&self) -> &'static [TaskState] {
    match self {
      TaskState::Pending => &[],
      TaskState::Started => &[TaskState::Pending, TaskState::Started, TaskState::Retry],
      TaskState::Success | TaskState::Failure | TaskState::Retry => &[TaskState::Started],
    }
  }

  pub fn can_transition_to(&self, next: TaskState) -> bool {
    next.predecessors().contains(self)
  }
}

impl fmt::Display for TaskState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskState {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "PENDING" => Ok(TaskState::Pending),
      "STARTED" => Ok(TaskState::Started),
      "SUCCESS" => Ok(TaskState::Success),
      "FAILURE" => Ok(TaskState::Failure),
      "RETRY" => Ok(TaskState::Retry),
      other => Err(format!("unknown task state {}", other)),
    }
  }
}

/// Wire format pushed onto the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
  pub id: TaskId,
  pub kind: String,
  pub args: Value,
  /// Attempts already made before this delivery.
  #[serde(default)]
  pub attempt: u32,
  pub enqueued_at: DateTime<Utc>,
}

impl TaskMessage {
  pub fn new(kind: impl Into<String>, args: Value) -> Self {
    Self {
      id: Uuid::new_v4(),
      kind: kind.into(),
      args,
      attempt: 0,
      enqueued_at: Utc::now(),
    }
  }

  pub fn next_attempt(&self) -> Self {
    Self {
      attempt: self.attempt + 1,
      ..self.clone()
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
  pub id: TaskId,
  pub kind: String,
  pub state: TaskState,
  pub attempts: u32,
  pub result: Option<Value>,
  pub error: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
  pub task_id: TaskId,
  pub state: TaskState,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub result: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  pub attempts: u32,
}

impl TaskStatus {
  pub fn pending(task_id: TaskId) -> Self {
    Self {
      task_id,
      state: TaskState::Pending,
      result: None,
      error: None,
      attempts: 0,
    }
  }
}

impl From<TaskRecord> for TaskStatus {
  fn from(record: TaskRecord) -> Self {
    Self {
      task_id: record.id,
      state: record.state,
      result: record.result,
      error: record.error,
      attempts: record.attempts,
    }
  }
}

/// What a handler reports back; the worker owns the retry decision.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
  Success(Value),
  Retryable(String),
  Fatal(String),
}

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::audit::RequestAuditLogger;
use crate::config::TaskLimits;
use crate::database::Executor;
use crate::error::DataError;
use crate::handlers::{HandlerRegistry, TaskContext, TaskHandler};
use crate::messaging::TaskBroker;
use crate::models::RequestLogEntry;
use crate::results::ResultStore;
use crate::task::{HandlerOutcome, TaskMessage, TaskState};

/// What the transport should do with the delivery once `process` returns.
/// Every variant means the delivery can be acknowledged; an `Err` from
/// `process` means it should be handed back to the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
  Completed(TaskState),
  RetryScheduled { attempt: u32 },
  Skipped,
}

#[derive(Clone)]
pub struct TaskWorker {
  worker_id: String,
  registry: HandlerRegistry,
  executor: Arc<dyn Executor>,
  broker: Arc<dyn TaskBroker>,
  results: Arc<dyn ResultStore>,
  audit: RequestAuditLogger,
  limits: TaskLimits,
}

impl TaskWorker {
  pub fn new(
    worker_id: impl Into<String>,
    registry: HandlerRegistry,
    executor: Arc<dyn Executor>,
    broker: Arc<dyn TaskBroker>,
    results: Arc<dyn ResultStore>,
    audit: RequestAuditLogger,
    limits: TaskLimits,
  ) -> Self {
    Self {
      worker_id: worker_id.into(),
      registry,
      executor,
      broker,
      results,
      audit,
      limits,
    }
  }

  pub async fn process(&self, message: TaskMessage) -> Result<Disposition, DataError> {
    let attempt = message.attempt + 1;
    if !self.results.record_started(message.id, &message.kind, attempt).await? {
      info!(task_id = %message.id, "Task already finished, skipping redelivery");
      return Ok(Disposition::Skipped);
    }

    let handler = match self.registry.get(&message.kind) {
      Ok(handler) => handler,
      Err(e) => {
        error!(task_id = %message.id, kind = %message.kind, "{}", e);
        self.results.record_failure(message.id, &e.to_string()).await?;
        return Ok(Disposition::Completed(TaskState::Failure));
      }
    };

    info!(task_id = %message.id, kind = %message.kind, attempt, "Worker {}: task started", self.worker_id);
    let started = Instant::now();
    let outcome = self.run_with_limits(handler.as_ref(), &message).await;
    let elapsed_ms = started.elapsed().as_millis() as i64;

    match outcome {
      HandlerOutcome::Success(result) => {
        self.results.record_success(message.id, result).await?;
        self.audit_attempt(handler.as_ref(), &message, "TASK", format!("Task: {}", message.id), elapsed_ms);
        info!(task_id = %message.id, attempt, "Task {} processed successfully", message.id);
        Ok(Disposition::Completed(TaskState::Success))
      }
      HandlerOutcome::Retryable(err) => {
        self.audit_failure(handler.as_ref(), &message, &err, elapsed_ms);
        if attempt < self.limits.max_attempts {
          self.results.record_retry(message.id, &err).await?;
          self.broker.publish_delayed(&message.next_attempt(), self.limits.retry_delay).await?;
          warn!(task_id = %message.id, attempt, "Retrying task {} (attempt {}): {}", message.id, attempt, err);
          Ok(Disposition::RetryScheduled { attempt })
        } else {
          let exhausted = DataError::TaskRetryExhausted { attempts: attempt, error: err };
          error!(task_id = %message.id, "Max attempts reached for task {}: {}", message.id, exhausted);
          self.results.record_failure(message.id, &exhausted.to_string()).await?;
          Ok(Disposition::Completed(TaskState::Failure))
        }
      }
      HandlerOutcome::Fatal(err) => {
        self.audit_failure(handler.as_ref(), &message, &err, elapsed_ms);
        error!(task_id = %message.id, "Task {} failed permanently: {}", message.id, err);
        self.results.record_failure(message.id, &err).await?;
        Ok(Disposition::Completed(TaskState::Failure))
      }
    }
  }

  /// Soft limit logs once; hard limit abandons the handler and counts the
  /// attempt as a retryable failure.
  async fn run_with_limits(&self, handler: &dyn TaskHandler, message: &TaskMessage) -> HandlerOutcome {
    let ctx = TaskContext {
      message,
      executor: &self.executor,
      worker_id: &self.worker_id,
    };
    let work = handler.handle(&ctx);
    tokio::pin!(work);
    let soft = sleep(self.limits.soft_time_limit);
    tokio::pin!(soft);
    let hard = sleep(self.limits.hard_time_limit);
    tokio::pin!(hard);
    let mut warned = false;

    loop {
      tokio::select! {
        outcome = &mut work => return outcome,
        _ = &mut soft, if !warned => {
          warned = true;
          warn!(task_id = %message.id, kind = %message.kind, "Task exceeded soft time limit of {:?}", self.limits.soft_time_limit);
        }
        _ = &mut hard => {
          error!(task_id = %message.id, kind = %message.kind, "Task killed after hard time limit of {:?}", self.limits.hard_time_limit);
          return HandlerOutcome::Retryable(format!(
            "hard time limit of {}s exceeded",
            self.limits.hard_time_limit.as_secs()
          ));
        }
      }
    }
  }

  fn audit_failure(&self, handler: &dyn TaskHandler, message: &TaskMessage, err: &str, elapsed_ms: i64) {
    self.audit_attempt(
      handler,
      message,
      "TASK_ERROR",
      format!("Task Error: {} - {}", message.id, err),
      elapsed_ms,
    );
  }

  fn audit_attempt(&self, handler: &dyn TaskHandler, message: &TaskMessage, method: &str, user_agent: String, elapsed_ms: i64) {
    self.audit.record(RequestLogEntry {
      server_id: self.worker_id.clone(),
      endpoint: handler.audit_path(message),
      method: method.to_string(),
      client_ip: Some("worker".to_string()),
      user_agent: Some(user_agent),
      response_time_ms: elapsed_ms,
      timestamp: Utc::now(),
    });
  }
}

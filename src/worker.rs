use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions};
use lapin::types::FieldTable;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use rwsplit::{
  audit::RequestAuditLogger,
  config::Config,
  database::{Executor, QueryExecutor, setup_database},
  handlers::HandlerRegistry,
  init_tracing,
  messaging::{RabbitBroker, TASK_QUEUE, create_rabbit_channel, declare_queues, set_prefetch},
  results::PgResultStore,
  task::TaskMessage,
  task_worker::TaskWorker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  init_tracing();
  let config = Config::from_env();

  let executor: Arc<dyn Executor> = Arc::new(QueryExecutor::new(Arc::new(config.router())));
  let result_pool = setup_database(config.result_backend()?)
    .await
    .context("Failed to prepare result backend")?;
  let results = Arc::new(PgResultStore::new(result_pool));

  let rabbit_channel = create_rabbit_channel(&config.rabbitmq_url)
    .await
    .context("Failed to create RabbitMQ channel")?;
  declare_queues(&rabbit_channel).await?;
  // one unacknowledged delivery per free slot
  set_prefetch(&rabbit_channel, config.worker_concurrency as u16).await?;

  let mut consumer = rabbit_channel
    .basic_consume(TASK_QUEUE, &config.worker_id, BasicConsumeOptions::default(), FieldTable::default())
    .await
    .context("Failed to start consumer")?;

  let audit = RequestAuditLogger::spawn(executor.clone(), config.audit_queue_capacity);
  let worker = TaskWorker::new(
    config.worker_id.clone(),
    HandlerRegistry::with_defaults(),
    executor,
    Arc::new(RabbitBroker::new(rabbit_channel.clone())),
    results,
    audit,
    config.task_limits.clone(),
  );
  let semaphore = Arc::new(Semaphore::new(config.worker_concurrency));
  info!(worker_id = %config.worker_id, concurrency = config.worker_concurrency, "Worker consuming {}", TASK_QUEUE);

  while let Some(delivery) = consumer.next().await {
    let delivery = match delivery {
      Ok(delivery) => delivery,
      Err(e) => {
        error!("Consumer error: {:?}", e);
        continue;
      }
    };

    let message = match serde_json::from_slice::<TaskMessage>(&delivery.data) {
      Ok(message) => message,
      Err(e) => {
        error!("Failed to parse task: {:?}", e);
        let _ = delivery.ack(BasicAckOptions::default()).await;
        continue;
      }
    };

    let permit = semaphore.clone().acquire_owned().await?;
    let worker = worker.clone();
    tokio::spawn(async move {
      let task_id = message.id;
      match worker.process(message).await {
        Ok(disposition) => {
          info!(task_id = %task_id, ?disposition, "Delivery handled");
          if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            error!(task_id = %task_id, "Ack failed: {:?}", e);
          }
        }
        Err(e) => {
          warn!(task_id = %task_id, "Task bookkeeping failed, returning to queue: {}", e);
          let requeue = BasicNackOptions {
            requeue: true,
            ..BasicNackOptions::default()
          };
          if let Err(e) = delivery.nack(requeue).await {
            error!(task_id = %task_id, "Nack failed: {:?}", e);
          }
        }
      }
      drop(permit);
    });
  }
  warn!("Consumer stream closed");
  Ok(())
}

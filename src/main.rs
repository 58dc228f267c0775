use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use rwsplit::{
  audit::RequestAuditLogger,
  config::Config,
  database::{Executor, QueryExecutor, setup_database},
  dispatcher::TaskDispatcher,
  init_tracing,
  messaging::{RabbitBroker, create_rabbit_channel, declare_queues},
  results::{PgResultStore, TaskStatusTracker},
  routes::routes,
  service::AppService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  init_tracing();
  let config = Config::from_env();
  info!(
    server_id = %config.server_id,
    primary = ?config.primary,
    replicas = config.replicas.len(),
    "Starting API server"
  );

  let executor: Arc<dyn Executor> = Arc::new(QueryExecutor::new(Arc::new(config.router())));

  let result_pool = setup_database(config.result_backend()?)
    .await
    .context("Failed to prepare result backend")?;
  let results = Arc::new(PgResultStore::new(result_pool));

  let rabbit_channel = create_rabbit_channel(&config.rabbitmq_url)
    .await
    .context("Failed to create RabbitMQ channel")?;
  declare_queues(&rabbit_channel).await?;
  let broker = Arc::new(RabbitBroker::new(rabbit_channel));

  let audit = RequestAuditLogger::spawn(executor.clone(), config.audit_queue_capacity);
  let service = AppService::new(
    config.server_id.clone(),
    executor,
    TaskDispatcher::new(broker, results.clone()),
    TaskStatusTracker::new(results),
    audit,
  );

  info!("Listening on port {}", config.server_port);
  warp::serve(routes(service))
    .run(([0, 0, 0, 0], config.server_port))
    .await;
  Ok(())
}

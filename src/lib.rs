pub mod audit;
pub mod config;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod messaging;
pub mod models;
pub mod results;
pub mod router;
pub mod routes;
pub mod service;
pub mod task;
pub mod task_worker;

pub fn init_tracing() {
  let filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();
}

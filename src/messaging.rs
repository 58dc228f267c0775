use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, BasicQosOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info, warn};

use crate::error::DataError;
use crate::task::TaskMessage;

pub const TASK_QUEUE: &str = "task_queue";
pub const RETRY_QUEUE: &str = "task_queue.retry";

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

/// Durable queue the dispatcher publishes to and the worker re-publishes
/// retries through.
#[async_trait]
pub trait TaskBroker: Send + Sync {
  async fn publish(&self, message: &TaskMessage) -> Result<(), DataError>;

  /// Makes the message visible to consumers once `delay` has elapsed.
  async fn publish_delayed(&self, message: &TaskMessage, delay: Duration) -> Result<(), DataError>;
}

pub async fn create_rabbit_channel(rabbitmq_url: &str) -> Result<Channel, DataError> {
  let conn = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    Connection::connect(rabbitmq_url, ConnectionProperties::default())
  })
    .await?;
  let channel = conn.create_channel().await?;
  info!("RabbitMQ channel created");
  Ok(channel)
}

/// Declares the work queue and the retry queue that dead-letters expired
/// messages back into it.
pub async fn declare_queues(channel: &Channel) -> Result<(), DataError> {
  let durable = || QueueDeclareOptions {
    durable: true,
    ..QueueDeclareOptions::default()
  };
  channel.queue_declare(TASK_QUEUE, durable(), FieldTable::default()).await?;

  let mut retry_args = FieldTable::default();
  retry_args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
  retry_args.insert("x-dead-letter-routing-key".into(), AMQPValue::LongString(TASK_QUEUE.into()));
  channel.queue_declare(RETRY_QUEUE, durable(), retry_args).await?;
  info!("Queues {} and {} declared", TASK_QUEUE, RETRY_QUEUE);
  Ok(())
}

pub async fn set_prefetch(channel: &Channel, prefetch: u16) -> Result<(), DataError> {
  channel.basic_qos(prefetch, BasicQosOptions::default()).await?;
  Ok(())
}

pub async fn publish_message(
  channel: &Channel,
  queue: &str,
  payload: &[u8],
  properties: BasicProperties,
) -> Result<(), DataError> {
  Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || async {
    channel.basic_publish("", queue, BasicPublishOptions::default(), payload, properties.clone()).await
  })
    .await?;
  Ok(())
}

fn task_properties(message: &TaskMessage) -> BasicProperties {
  BasicProperties::default()
    .with_content_type(ShortString::from("application/json"))
    .with_delivery_mode(2)
    .with_correlation_id(ShortString::from(message.id.to_string()))
}

#[derive(Clone)]
pub struct RabbitBroker {
  channel: Channel,
}

impl RabbitBroker {
  pub fn new(channel: Channel) -> Self {
    Self { channel }
  }
}

#[async_trait]
impl TaskBroker for RabbitBroker {
  async fn publish(&self, message: &TaskMessage) -> Result<(), DataError> {
    let payload = serde_json::to_vec(message)?;
    publish_message(&self.channel, TASK_QUEUE, &payload, task_properties(message)).await?;
    debug!(task_id = %message.id, kind = %message.kind, "Task published");
    Ok(())
  }

  async fn publish_delayed(&self, message: &TaskMessage, delay: Duration) -> Result<(), DataError> {
    let payload = serde_json::to_vec(message)?;
    let properties = task_properties(message).with_expiration(ShortString::from(delay.as_millis().to_string()));
    publish_message(&self.channel, RETRY_QUEUE, &payload, properties).await?;
    debug!(task_id = %message.id, delay_ms = delay.as_millis() as u64, "Task scheduled for retry");
    Ok(())
  }
}

/// Channel-backed broker for single-process runs and tests.
#[derive(Clone)]
pub struct InMemoryBroker {
  sender: mpsc::UnboundedSender<TaskMessage>,
}

impl InMemoryBroker {
  pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskMessage>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Self { sender }, receiver)
  }

  fn send(&self, message: TaskMessage) -> Result<(), DataError> {
    self
      .sender
      .send(message)
      .map_err(|_| DataError::Messaging("in-memory queue closed".into()))
  }
}

#[async_trait]
impl TaskBroker for InMemoryBroker {
  async fn publish(&self, message: &TaskMessage) -> Result<(), DataError> {
    self.send(message.clone())
  }

  async fn publish_delayed(&self, message: &TaskMessage, delay: Duration) -> Result<(), DataError> {
    if delay.is_zero() {
      return self.send(message.clone());
    }
    let broker = self.clone();
    let message = message.clone();
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let task_id = message.id;
      if let Err(e) = broker.send(message) {
        warn!(task_id = %task_id, "Dropped delayed task: {}", e);
      }
    });
    Ok(())
  }
}

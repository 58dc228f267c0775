//! Best-effort request audit trail.
//!
//! `RequestAuditLogger::record` never blocks and never fails: entries go onto
//! a bounded channel and a detached `AuditWriter` drains them into the
//! `requests` table on the primary. A full channel drops the entry, a failed
//! insert is reported to the log, and neither reaches the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::database::Executor;
use crate::models::RequestLogEntry;
use crate::router::Role;

#[derive(Debug, Default)]
pub struct AuditStats {
  written: AtomicU64,
  failed: AtomicU64,
  dropped: AtomicU64,
}

impl AuditStats {
  pub fn written(&self) -> u64 {
    self.written.load(Ordering::Relaxed)
  }

  pub fn failed(&self) -> u64 {
    self.failed.load(Ordering::Relaxed)
  }

  pub fn dropped(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }
}

#[derive(Clone)]
pub struct RequestAuditLogger {
  sender: mpsc::Sender<RequestLogEntry>,
  stats: Arc<AuditStats>,
}

pub struct AuditWriter {
  receiver: mpsc::Receiver<RequestLogEntry>,
  executor: Arc<dyn Executor>,
  stats: Arc<AuditStats>,
}

impl RequestAuditLogger {
  pub fn new(executor: Arc<dyn Executor>, capacity: usize) -> (Self, AuditWriter) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let stats = Arc::new(AuditStats::default());
    let logger = Self {
      sender,
      stats: stats.clone(),
    };
    let writer = AuditWriter {
      receiver,
      executor,
      stats,
    };
    (logger, writer)
  }

  /// Builds the logger and spawns its writer on the current runtime.
  pub fn spawn(executor: Arc<dyn Executor>, capacity: usize) -> Self {
    let (logger, writer) = Self::new(executor, capacity);
    tokio::spawn(writer.run());
    logger
  }

  pub fn record(&self, entry: RequestLogEntry) {
    match self.sender.try_send(entry) {
      Ok(()) => {}
      Err(mpsc::error::TrySendError::Full(entry)) => {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(endpoint = %entry.endpoint, "Audit queue full, dropping entry");
      }
      Err(mpsc::error::TrySendError::Closed(entry)) => {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(endpoint = %entry.endpoint, "Audit writer stopped, dropping entry");
      }
    }
  }

  pub fn stats(&self) -> Arc<AuditStats> {
    self.stats.clone()
  }
}

impl AuditWriter {
  /// Drains entries until every logger handle has been dropped.
  pub async fn run(mut self) {
    while let Some(entry) = self.receiver.recv().await {
      match self.executor.execute(Role::Primary, entry.insert_query()).await {
        Ok(_) => {
          self.stats.written.fetch_add(1, Ordering::Relaxed);
          debug!(endpoint = %entry.endpoint, method = %entry.method, "Audit entry written");
        }
        Err(e) => {
          self.stats.failed.fetch_add(1, Ordering::Relaxed);
          warn!(endpoint = %entry.endpoint, method = %entry.method, "Audit write failed: {}", e);
        }
      }
    }
  }
}

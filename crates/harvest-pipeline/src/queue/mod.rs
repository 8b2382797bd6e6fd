//! Durable named queues
//!
//! [`QueueTransport`] sits on top of a [`QueueBackend`] and adds the listener used by
//! [`DrainConsumer`]. A delivered message is claimed while its handler runs, deleted
//! when the handler returns `Ok`, and released back to the queue when the handler
//! returns `Err`. Handlers route per-message failures themselves and return `Ok`;
//! an `Err` is reserved for failures that must stop the stage.

pub mod drain;
pub mod memory;
pub mod sqlite;

pub use drain::{DrainConfig, DrainConsumer, DrainOutcome, ProbeExhaustion};
pub use memory::MemoryQueue;
pub use sqlite::SqliteQueue;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::model::{QueueMessage, QueueName};

/// A message claimed by one listener
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    pub queue: QueueName,
    pub message: QueueMessage,
}

/// Message counts for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub ready: u64,
    pub in_flight: u64,
}

impl QueueDepth {
    pub fn total(&self) -> u64 {
        self.ready + self.in_flight
    }
}

/// Storage for named queues
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn push(&self, queue: &QueueName, message: &QueueMessage) -> Result<()>;

    /// Claim the oldest unclaimed message, if any
    async fn claim(&self, queue: &QueueName, consumer: &str) -> Result<Option<Delivery>>;

    /// Remove a claimed message for good
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Return a claimed message to the queue
    async fn release(&self, delivery: &Delivery) -> Result<()>;

    /// Return every claimed message in `queue` to it, or only those held by `consumer`
    async fn release_claims(&self, queue: &QueueName, consumer: Option<&str>) -> Result<u64>;

    /// Whether the queue holds any message, claimed ones included
    async fn has_messages(&self, queue: &QueueName) -> Result<bool>;

    async fn depth(&self, queue: &QueueName) -> Result<QueueDepth>;
}

/// Callback invoked once per delivered message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: QueueMessage) -> Result<()>;
}

/// Enqueue and consume over a shared backend
#[derive(Clone)]
pub struct QueueTransport {
    backend: Arc<dyn QueueBackend>,
    idle_backoff: Duration,
}

impl QueueTransport {
    pub fn new(backend: Arc<dyn QueueBackend>, idle_backoff: Duration) -> Self {
        Self {
            backend,
            idle_backoff,
        }
    }

    pub async fn enqueue(&self, queue: &QueueName, message: &QueueMessage) -> Result<()> {
        self.backend.push(queue, message).await?;
        info!(record = %message.record_identity, queue = %queue, "Record added to queue");
        Ok(())
    }

    pub async fn has_messages(&self, queue: &QueueName) -> Result<bool> {
        self.backend.has_messages(queue).await
    }

    pub async fn depth(&self, queue: &QueueName) -> Result<QueueDepth> {
        self.backend.depth(queue).await
    }

    pub async fn release_claims(&self, queue: &QueueName, consumer: Option<&str>) -> Result<u64> {
        self.backend.release_claims(queue, consumer).await
    }

    /// Attach `handler` to `queue` on a background listener
    pub fn consume(&self, queue: &QueueName, handler: Arc<dyn MessageHandler>) -> ConsumerHandle {
        let cancel = CancellationToken::new();
        let listener = Listener {
            id: Uuid::new_v4().to_string(),
            backend: Arc::clone(&self.backend),
            queue: queue.clone(),
            handler,
            idle_backoff: self.idle_backoff,
            cancel: cancel.clone(),
        };
        info!(queue = %queue, listener = %listener.id, "Processing messages");
        ConsumerHandle {
            cancel,
            task: tokio::spawn(listener.run()),
        }
    }
}

struct Listener {
    id: String,
    backend: Arc<dyn QueueBackend>,
    queue: QueueName,
    handler: Arc<dyn MessageHandler>,
    idle_backoff: Duration,
    cancel: CancellationToken,
}

impl Listener {
    async fn run(self) -> Result<()> {
        // Set when a claim failed after its row may already have been marked
        let mut claim_unsettled = false;

        while !self.cancel.is_cancelled() {
            if claim_unsettled {
                match self.backend.release_claims(&self.queue, Some(&self.id)).await {
                    Ok(released) => {
                        if released > 0 {
                            warn!(
                                queue = %self.queue,
                                released,
                                "Returned message claimed by a failed claim to the queue"
                            );
                        }
                        claim_unsettled = false;
                    }
                    Err(e) => {
                        debug!(queue = %self.queue, error = %e, "Release after failed claim failed");
                    }
                }
            }

            let delivery = match self.backend.claim(&self.queue, &self.id).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.idle_backoff) => continue,
                    }
                }
                Err(e) => {
                    // Reachability is judged by the drain check, not here.
                    debug!(queue = %self.queue, error = %e, "Claim failed, backing off");
                    claim_unsettled = true;
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.idle_backoff) => continue,
                    }
                }
            };

            match self.handler.handle(delivery.message.clone()).await {
                Ok(()) => self.backend.ack(&delivery).await?,
                Err(e) => {
                    error!(
                        record = %delivery.message.record_identity,
                        queue = %self.queue,
                        error = %e,
                        "Handler failed, message returned to queue"
                    );
                    self.backend.release(&delivery).await?;
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// Running listener attached by [`QueueTransport::consume`]
pub struct ConsumerHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl ConsumerHandle {
    /// The listener exits early only when a handler failed
    pub fn has_stopped(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the listener after its current message and surface any handler failure
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::transport(format!("Listener task failed: {}", e))),
        }
    }
}

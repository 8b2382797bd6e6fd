//! Transform stage
//!
//! Converts each queued record into its canonical document and forwards it to the
//! primary ingest queue. A record that cannot be transformed is moved, unchanged, to the
//! tier's failure target. No retries happen here; the driver walks the tiers.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{TierCounters, TierStats};
use crate::document::CanonicalDocument;
use crate::error::Result;
use crate::model::{QueueMessage, QueueName, QueueNames, RecordKind, Stage};
use crate::queue::{DrainConsumer, MessageHandler, QueueTransport};

/// Produces the canonical document for a record
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, kind: RecordKind, id: &str) -> Result<CanonicalDocument>;
}

pub struct TransformStage {
    transformer: Arc<dyn Transformer>,
    drain: DrainConsumer,
    names: QueueNames,
}

impl TransformStage {
    pub fn new(transformer: Arc<dyn Transformer>, drain: DrainConsumer, names: QueueNames) -> Self {
        Self {
            transformer,
            drain,
            names,
        }
    }

    /// Drain `source`, forwarding to ingest or routing failures to `fail_target`
    pub async fn run_tier(
        &self,
        source: &QueueName,
        fail_target: &QueueName,
        kind: RecordKind,
    ) -> Result<TierStats> {
        match self.drain.transport().depth(source).await {
            Ok(depth) => info!(queue = %source, ready = depth.ready, in_flight = depth.in_flight, "Starting transform tier"),
            Err(e) => warn!(queue = %source, error = %e, "Could not read queue depth"),
        }

        let counters = Arc::new(TierCounters::default());
        let handler = Arc::new(TransformHandler {
            transformer: Arc::clone(&self.transformer),
            transport: self.drain.transport().clone(),
            kind,
            source: source.clone(),
            forward_to: self.names.primary(Stage::Ingest, kind),
            fail_target: fail_target.clone(),
            counters: Arc::clone(&counters),
        });

        let outcome = self.drain.process_messages(source, handler).await?;
        let stats = counters.finish(outcome);
        info!(
            queue = %source,
            processed = stats.processed,
            routed_to_failure = stats.routed_to_failure,
            "Records processed from transform queue"
        );
        Ok(stats)
    }
}

struct TransformHandler {
    transformer: Arc<dyn Transformer>,
    transport: QueueTransport,
    kind: RecordKind,
    source: QueueName,
    forward_to: QueueName,
    fail_target: QueueName,
    counters: Arc<TierCounters>,
}

impl TransformHandler {
    async fn convert(&self, message: &QueueMessage) -> Result<QueueMessage> {
        let id = message.body_str()?;
        let document = self.transformer.transform(self.kind, id).await?;
        Ok(QueueMessage {
            body: document.body,
            content_type: document.content_type,
            ..message.clone()
        })
    }
}

#[async_trait]
impl MessageHandler for TransformHandler {
    async fn handle(&self, message: QueueMessage) -> Result<()> {
        match self.convert(&message).await {
            Ok(transformed) => {
                self.transport.enqueue(&self.forward_to, &transformed).await?;
                self.counters.inc_processed();
                info!(record = %message.record_identity, from = %self.source, to = %self.forward_to, "Record transformed");
            }
            Err(e) => {
                error!(
                    record = %message.record_identity,
                    from = %self.source,
                    to = %self.fail_target,
                    error = %e,
                    "Transform failed, record routed to next tier"
                );
                self.transport.enqueue(&self.fail_target, &message).await?;
                self.counters.inc_routed();
            }
        }
        Ok(())
    }
}

//! Ingest stage
//!
//! Publishes transformed documents to the downstream store at most once per change.
//! For each message:
//!
//! 1. Validate the document against its content type.
//! 2. Look up the publish registry entry and the store's current version.
//! 3. If the entry tracks the current version and already covers this harvest date,
//!    skip without writing anything.
//! 4. Otherwise compare against the store's current document: publish when absent or
//!    different, and record the (new) version; when identical, only refresh the
//!    registry's checked time.
//!
//! Any failure routes the message as received to the tier's failure target, except
//! registry failures, which stop the stage.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{TierCounters, TierStats};
use crate::document::CanonicalDocument;
use crate::error::Result;
use crate::model::{QueueMessage, QueueName};
use crate::queue::{DrainConsumer, MessageHandler, QueueTransport};
use crate::registry::{PublishRegistry, PublishRegistryEntry};

/// Current downstream representation of a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub version: String,
    pub document: CanonicalDocument,
}

#[async_trait]
pub trait DownstreamStore: Send + Sync {
    async fn fetch_current(&self, record_identity: &str) -> Result<Option<StoredDocument>>;

    /// Publish `document`, as a new version of `previous_version` when given.
    /// Returns the new version's identifier.
    async fn publish(
        &self,
        record_identity: &str,
        document: &CanonicalDocument,
        previous_version: Option<&str>,
    ) -> Result<String>;
}

/// What ingest did with one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Published { version: String },
    Updated { version: String },
    Unchanged { version: String },
    AlreadyCurrent,
}

impl IngestOutcome {
    /// Version the registry should track after this outcome
    pub fn version(&self) -> Option<&str> {
        match self {
            IngestOutcome::Published { version }
            | IngestOutcome::Updated { version }
            | IngestOutcome::Unchanged { version } => Some(version),
            IngestOutcome::AlreadyCurrent => None,
        }
    }
}

pub struct IngestStage {
    store: Arc<dyn DownstreamStore>,
    registry: Arc<dyn PublishRegistry>,
    drain: DrainConsumer,
}

impl IngestStage {
    pub fn new(
        store: Arc<dyn DownstreamStore>,
        registry: Arc<dyn PublishRegistry>,
        drain: DrainConsumer,
    ) -> Self {
        Self {
            store,
            registry,
            drain,
        }
    }

    /// Drain `source`, publishing changes and routing failures to `fail_target`
    pub async fn run_tier(&self, source: &QueueName, fail_target: &QueueName) -> Result<TierStats> {
        match self.drain.transport().depth(source).await {
            Ok(depth) => info!(queue = %source, ready = depth.ready, in_flight = depth.in_flight, "Starting ingest tier"),
            Err(e) => warn!(queue = %source, error = %e, "Could not read queue depth"),
        }

        let counters = Arc::new(TierCounters::default());
        let handler = Arc::new(IngestHandler {
            publisher: Publisher {
                store: Arc::clone(&self.store),
                registry: Arc::clone(&self.registry),
            },
            transport: self.drain.transport().clone(),
            source: source.clone(),
            fail_target: fail_target.clone(),
            counters: Arc::clone(&counters),
        });

        let outcome = self.drain.process_messages(source, handler).await?;
        let stats = counters.finish(outcome);
        info!(
            queue = %source,
            processed = stats.processed,
            routed_to_failure = stats.routed_to_failure,
            "Records processed from ingest queue"
        );
        Ok(stats)
    }

    /// Apply the publish decision to one message outside of any queue
    pub async fn ingest_one(&self, message: &QueueMessage) -> Result<IngestOutcome> {
        Publisher {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
        }
        .ingest(message)
        .await
    }
}

struct Publisher {
    store: Arc<dyn DownstreamStore>,
    registry: Arc<dyn PublishRegistry>,
}

impl Publisher {
    async fn ingest(&self, message: &QueueMessage) -> Result<IngestOutcome> {
        let identity = message.record_identity.as_str();
        let candidate = CanonicalDocument::from_message(message);
        candidate.validate()?;

        let entry = self.registry.get(identity).await?;
        let current = self.store.fetch_current(identity).await?;

        if let Some(entry) = &entry {
            let current_version = current.as_ref().map(|c| c.version.as_str());
            if entry.is_up_to_date(current_version, message.harvest_date) {
                return Ok(IngestOutcome::AlreadyCurrent);
            }
        }

        let outcome = match current {
            None => IngestOutcome::Published {
                version: self.store.publish(identity, &candidate, None).await?,
            },
            Some(stored) if !stored.document.semantically_equals(&candidate)? => {
                IngestOutcome::Updated {
                    version: self
                        .store
                        .publish(identity, &candidate, Some(&stored.version))
                        .await?,
                }
            }
            Some(stored) => IngestOutcome::Unchanged {
                version: stored.version,
            },
        };

        if let Some(version) = outcome.version() {
            self.registry
                .register(&PublishRegistryEntry {
                    record_identity: identity.to_string(),
                    last_published_version: version.to_string(),
                    record_date: message.harvest_date,
                    last_checked: Utc::now(),
                })
                .await?;
        }

        Ok(outcome)
    }
}

struct IngestHandler {
    publisher: Publisher,
    transport: QueueTransport,
    source: QueueName,
    fail_target: QueueName,
    counters: Arc<TierCounters>,
}

#[async_trait]
impl MessageHandler for IngestHandler {
    async fn handle(&self, message: QueueMessage) -> Result<()> {
        match self.publisher.ingest(&message).await {
            Ok(outcome) => {
                self.counters.inc_processed();
                match outcome {
                    IngestOutcome::AlreadyCurrent => info!(
                        record = %message.record_identity,
                        queue = %self.source,
                        "Latest version of the record already published, skipped"
                    ),
                    IngestOutcome::Unchanged { version } => info!(
                        record = %message.record_identity,
                        queue = %self.source,
                        version = %version,
                        "Record unchanged since last harvest, skipped"
                    ),
                    IngestOutcome::Published { version } | IngestOutcome::Updated { version } => {
                        info!(
                            record = %message.record_identity,
                            queue = %self.source,
                            version = %version,
                            "Record published"
                        )
                    }
                }
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                error!(
                    record = %message.record_identity,
                    from = %self.source,
                    to = %self.fail_target,
                    error = %e,
                    "Ingest failed, record routed to next tier"
                );
                self.transport.enqueue(&self.fail_target, &message).await?;
                self.counters.inc_routed();
            }
        }
        Ok(())
    }
}

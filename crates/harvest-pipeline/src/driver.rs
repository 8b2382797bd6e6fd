//! Harvest cycle driver
//!
//! Runs identify once, then walks each stage's retry chain in [`RetryTier::DRIVER_ORDER`],
//! draining each tier before the next. Older failures are drained before fresh messages.
//! A message that fails every attempt reaches `fail` at the end of its third cycle.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::HarvestConfig;
use crate::error::Result;
use crate::filters::FilterParams;
use crate::model::{
    IdentityScheme, QueueMessage, QueueName, QueueNames, RecordKind, RetryTier, RunContext, Stage,
};
use crate::queue::{DrainConsumer, MessageHandler, QueueTransport, SqliteQueue};
use crate::registry::SqliteRegistry;
use crate::source::ApiClient;
use crate::stages::{IdentifyStage, IdentifyStats, IngestStage, TierStats, TransformStage};
use crate::store::StoreClient;

/// Which part of the pipeline to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Process {
    Identify,
    Transform,
    Ingest,
    All,
    Requeuefails,
}

/// Messages moved back from the fail queues
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequeueStats {
    pub transform: u64,
    pub ingest: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HarvestReport {
    pub identified: Option<IdentifyStats>,
    pub transformed: Option<TierStats>,
    pub ingested: Option<TierStats>,
    pub requeued: Option<RequeueStats>,
}

pub struct HarvestDriver {
    identify: IdentifyStage,
    transform: TransformStage,
    ingest: IngestStage,
    drain: DrainConsumer,
    names: QueueNames,
}

impl HarvestDriver {
    pub fn new(
        identify: IdentifyStage,
        transform: TransformStage,
        ingest: IngestStage,
        drain: DrainConsumer,
        names: QueueNames,
    ) -> Self {
        Self {
            identify,
            transform,
            ingest,
            drain,
            names,
        }
    }

    /// Wire SQLite queues and registries and the HTTP collaborators from configuration
    pub async fn connect(config: &HarvestConfig) -> Result<Self> {
        let registry = Arc::new(
            SqliteRegistry::connect_with(&config.database.url, config.database.max_connections)
                .await?,
        );
        let queue = if config.database.queue_url == config.database.url {
            SqliteQueue::new(registry.pool().clone())
        } else {
            SqliteQueue::connect_with(&config.database.queue_url, config.database.max_connections)
                .await?
        };

        let reclaimed = queue.reclaim_stale_claims(config.stale_claim_age()).await?;
        if reclaimed > 0 {
            warn!(reclaimed, "Released claims left by an earlier run");
        }

        let names = QueueNames::new(&config.queues.transform_base, &config.queues.ingest_base);
        let scheme = IdentityScheme::new(&config.source.record_base_url, &config.source.api_base_url);
        let api = Arc::new(ApiClient::new(
            &config.source.api_base_url,
            config.source.api_token.clone(),
            config.source.page_size,
            config.http_timeout(),
            scheme.clone(),
        )?);
        let store = Arc::new(StoreClient::new(
            &config.store.base_url,
            config.store.token.clone(),
            config.http_timeout(),
        )?);

        let transport = QueueTransport::new(Arc::new(queue), config.listener_idle());
        let drain = DrainConsumer::new(transport.clone(), config.drain_config());

        Ok(Self::new(
            IdentifyStage::new(
                api.clone(),
                api.clone(),
                registry.clone(),
                transport,
                names.clone(),
                scheme,
                config.identify_settings(),
            ),
            TransformStage::new(api, drain.clone(), names.clone()),
            IngestStage::new(store, registry, drain.clone()),
            drain,
            names,
        ))
    }

    pub async fn run(
        &self,
        kind: RecordKind,
        process: Process,
        filters: &FilterParams,
    ) -> Result<HarvestReport> {
        let mut report = HarvestReport::default();

        if matches!(process, Process::Identify | Process::All) {
            let run = RunContext::start();
            report.identified = Some(self.identify.identify(&run, kind, filters).await?);
        }
        if matches!(process, Process::Transform | Process::All) {
            report.transformed = Some(self.run_chain(Stage::Transform, kind).await?);
        }
        if matches!(process, Process::Ingest | Process::All) {
            report.ingested = Some(self.run_chain(Stage::Ingest, kind).await?);
        }
        if process == Process::Requeuefails {
            report.requeued = Some(RequeueStats {
                transform: self.requeue_fails(Stage::Transform, kind).await?,
                ingest: self.requeue_fails(Stage::Ingest, kind).await?,
            });
        }

        Ok(report)
    }

    /// One pass over a stage's tiers in driver order
    pub async fn run_chain(&self, stage: Stage, kind: RecordKind) -> Result<TierStats> {
        let mut total = TierStats::default();
        for (source_tier, target_tier) in RetryTier::DRIVER_ORDER {
            let source = self.names.queue(stage, kind, source_tier);
            let target = source.with_tier(target_tier);
            let stats = match stage {
                Stage::Transform => self.transform.run_tier(&source, &target, kind).await?,
                Stage::Ingest => self.ingest.run_tier(&source, &target).await?,
            };
            if stats.unverified_drains > 0 {
                warn!(queue = %source, "Drain not verified, re-check this harvest for completeness");
            }
            total.merge(&stats);
        }
        info!(stage = %stage, kind = %kind, processed = total.processed, "Stage chain finished");
        Ok(total)
    }

    /// Move every message in the stage's fail queue back to its primary queue
    pub async fn requeue_fails(&self, stage: Stage, kind: RecordKind) -> Result<u64> {
        let fail = self.names.queue(stage, kind, RetryTier::Fail);
        let handler = Arc::new(RequeueHandler {
            transport: self.drain.transport().clone(),
            target: self.names.primary(stage, kind),
            moved: AtomicU64::new(0),
        });
        self.drain
            .process_messages(&fail, Arc::clone(&handler) as Arc<dyn MessageHandler>)
            .await?;
        let moved = handler.moved.load(Ordering::Relaxed);
        info!(from = %fail, to = %handler.target, moved, "Requeued failed records");
        Ok(moved)
    }
}

struct RequeueHandler {
    transport: QueueTransport,
    target: QueueName,
    moved: AtomicU64,
}

#[async_trait]
impl MessageHandler for RequeueHandler {
    async fn handle(&self, message: QueueMessage) -> Result<()> {
        self.transport.enqueue(&self.target, &message).await?;
        self.moved.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

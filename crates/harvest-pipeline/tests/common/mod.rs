//! Shared fixtures for pipeline integration tests
#![allow(dead_code, clippy::unwrap_used)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use harvest_pipeline::document::{CanonicalDocument, CONTENT_TYPE_JSON};
use harvest_pipeline::error::{PipelineError, Result};
use harvest_pipeline::filters::FilterParams;
use harvest_pipeline::model::{IdentityScheme, QueueMessage, RecordDescriptor, RecordKind};
use harvest_pipeline::queue::{DrainConfig, DrainConsumer, MemoryQueue, ProbeExhaustion, QueueTransport};
use harvest_pipeline::registry::{MemoryRegistry, PublishRegistry, PublishRegistryEntry};
use harvest_pipeline::source::{ParentRef, ParentResolver, RecordSource};
use harvest_pipeline::stages::{DownstreamStore, StoredDocument, Transformer};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

pub fn scheme() -> IdentityScheme {
    IdentityScheme::new("https://osf.io/", "https://api.osf.io/v2/")
}

/// Drain settings for paused-clock tests
pub fn fast_drain() -> DrainConfig {
    DrainConfig {
        poll_interval: Duration::from_millis(50),
        probe_failure_tolerance: 3,
        grace_period: Duration::from_millis(100),
        on_exhaustion: ProbeExhaustion::AssumeDrained,
    }
}

pub fn memory_transport(queue: &Arc<MemoryQueue>) -> QueueTransport {
    QueueTransport::new(queue.clone(), Duration::from_millis(5))
}

pub fn memory_drain(queue: &Arc<MemoryQueue>) -> DrainConsumer {
    DrainConsumer::new(memory_transport(queue), fast_drain())
}

pub fn descriptor(id: &str, kind: RecordKind, at: DateTime<Utc>) -> RecordDescriptor {
    RecordDescriptor {
        identity: id.to_string(),
        kind,
        filter_timestamp: at,
        retrieved_timestamp: at,
    }
}

pub fn json_message(id: &str, body: &str, harvest_date: DateTime<Utc>) -> QueueMessage {
    QueueMessage {
        body: body.as_bytes().to_vec(),
        record_identity: format!("https://osf.io/{}/", id),
        source_uri: format!("https://api.osf.io/v2/nodes/{}/", id),
        content_type: CONTENT_TYPE_JSON.to_string(),
        harvest_date,
        retrieved_date: harvest_date,
    }
}

/// Source serving a fixed listing and recording the filters it was opened with
#[derive(Default)]
pub struct StaticSource {
    pub items: Vec<Result<RecordDescriptor>>,
    pub opened_with: Mutex<Vec<FilterParams>>,
}

impl StaticSource {
    pub fn new(items: Vec<RecordDescriptor>) -> Self {
        Self {
            items: items.into_iter().map(Ok).collect(),
            opened_with: Mutex::new(Vec::new()),
        }
    }
}

impl RecordSource for StaticSource {
    fn open(
        &self,
        _kind: RecordKind,
        filters: &FilterParams,
    ) -> BoxStream<'_, Result<RecordDescriptor>> {
        self.opened_with.lock().unwrap().push(filters.clone());
        let items: Vec<Result<RecordDescriptor>> = self
            .items
            .iter()
            .map(|item| match item {
                Ok(d) => Ok(d.clone()),
                Err(e) => Err(PipelineError::source_fetch(e.to_string())),
            })
            .collect();
        stream::iter(items).boxed()
    }
}

/// Parent graph with a set of records anonymous clients cannot see
#[derive(Default)]
pub struct GraphResolver {
    pub parents: HashMap<String, String>,
    pub private: HashSet<String>,
}

impl GraphResolver {
    pub fn with_parent(mut self, child: &str, parent: &str) -> Self {
        self.parents.insert(child.to_string(), parent.to_string());
        self
    }

    pub fn with_private(mut self, id: &str) -> Self {
        self.private.insert(id.to_string());
        self
    }
}

#[async_trait]
impl ParentResolver for GraphResolver {
    async fn parent_of(&self, _kind: RecordKind, id: &str) -> Result<Option<ParentRef>> {
        Ok(self.parents.get(id).map(|parent| ParentRef {
            id: parent.clone(),
            url: format!("https://api.osf.io/v2/nodes/{}/", parent),
        }))
    }

    async fn is_accessible(&self, parent: &ParentRef) -> Result<bool> {
        Ok(!self.private.contains(&parent.id))
    }
}

/// Transformer that fails for every record
pub struct FailingTransformer;

#[async_trait]
impl Transformer for FailingTransformer {
    async fn transform(&self, _kind: RecordKind, id: &str) -> Result<CanonicalDocument> {
        Err(PipelineError::transform(format!("{} is unavailable", id)))
    }
}

/// Store with one current version per identity, counting publishes
#[derive(Default)]
pub struct MemoryStore {
    current: Mutex<HashMap<String, StoredDocument>>,
    pub publishes: AtomicU64,
    pub fail_publish: bool,
}

impl MemoryStore {
    pub fn failing() -> Self {
        Self {
            fail_publish: true,
            ..Self::default()
        }
    }

    pub fn publish_count(&self) -> u64 {
        self.publishes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DownstreamStore for MemoryStore {
    async fn fetch_current(&self, record_identity: &str) -> Result<Option<StoredDocument>> {
        Ok(self.current.lock().unwrap().get(record_identity).cloned())
    }

    async fn publish(
        &self,
        record_identity: &str,
        document: &CanonicalDocument,
        _previous_version: Option<&str>,
    ) -> Result<String> {
        if self.fail_publish {
            return Err(PipelineError::publish("store unavailable"));
        }
        let n = self.publishes.fetch_add(1, Ordering::SeqCst) + 1;
        let version = format!("{}v{}", record_identity, n);
        self.current.lock().unwrap().insert(
            record_identity.to_string(),
            StoredDocument {
                version: version.clone(),
                document: document.clone(),
            },
        );
        Ok(version)
    }
}

/// Publish registry wrapper counting writes
#[derive(Default)]
pub struct CountingRegistry {
    pub inner: MemoryRegistry,
    pub writes: AtomicU64,
}

impl CountingRegistry {
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PublishRegistry for CountingRegistry {
    async fn get(&self, record_identity: &str) -> Result<Option<PublishRegistryEntry>> {
        self.inner.get(record_identity).await
    }

    async fn register(&self, entry: &PublishRegistryEntry) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.register(entry).await
    }
}

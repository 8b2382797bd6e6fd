//! In-process registries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{PublishRegistry, PublishRegistryEntry, RunRegistry};
use crate::error::Result;

#[derive(Default)]
pub struct MemoryRegistry {
    runs: RwLock<HashMap<String, Vec<DateTime<Utc>>>>,
    published: RwLock<HashMap<String, PublishRegistryEntry>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRegistry for MemoryRegistry {
    async fn last_run(&self, stream: &str) -> Result<Option<DateTime<Utc>>> {
        let runs = self.runs.read().await;
        Ok(runs.get(stream).and_then(|history| history.last().copied()))
    }

    async fn record_run(&self, stream: &str, run_at: DateTime<Utc>) -> Result<()> {
        self.runs
            .write()
            .await
            .entry(stream.to_string())
            .or_default()
            .push(run_at);
        Ok(())
    }
}

#[async_trait]
impl PublishRegistry for MemoryRegistry {
    async fn get(&self, record_identity: &str) -> Result<Option<PublishRegistryEntry>> {
        Ok(self.published.read().await.get(record_identity).cloned())
    }

    async fn register(&self, entry: &PublishRegistryEntry) -> Result<()> {
        self.published
            .write()
            .await
            .insert(entry.record_identity.clone(), entry.clone());
        Ok(())
    }
}

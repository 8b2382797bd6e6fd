//! Run and publish registries
//!
//! The run registry holds one watermark per harvest stream (`<base>.<kind>`); only the
//! identify stage touches it. The publish registry tracks, per record identity, the
//! downstream version last published or confirmed; only the ingest stage touches it.

mod memory;
mod sqlite;

pub use memory::MemoryRegistry;
pub use sqlite::SqliteRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::RecordKind;

/// Registry stream name for a kind
pub fn stream_name(base: &str, kind: RecordKind) -> String {
    format!("{}.{}", base, kind)
}

#[async_trait]
pub trait RunRegistry: Send + Sync {
    /// Most recently recorded run instant for `stream`
    async fn last_run(&self, stream: &str) -> Result<Option<DateTime<Utc>>>;

    async fn record_run(&self, stream: &str, run_at: DateTime<Utc>) -> Result<()>;
}

/// Last known publish state of one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRegistryEntry {
    pub record_identity: String,
    pub last_published_version: String,
    /// Harvest date of the message that last touched this entry
    pub record_date: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,
}

impl PublishRegistryEntry {
    /// Whether this entry already covers a message harvested at `harvest_date`
    /// given the downstream store's current version
    pub fn is_up_to_date(&self, current_version: Option<&str>, harvest_date: DateTime<Utc>) -> bool {
        current_version == Some(self.last_published_version.as_str())
            && self.record_date >= harvest_date
    }
}

#[async_trait]
pub trait PublishRegistry: Send + Sync {
    async fn get(&self, record_identity: &str) -> Result<Option<PublishRegistryEntry>>;

    /// Create or replace the entry for `entry.record_identity`
    async fn register(&self, entry: &PublishRegistryEntry) -> Result<()>;
}

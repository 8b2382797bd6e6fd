//! Pipeline stages: identify -> transform -> ingest

pub mod identify;
pub mod ingest;
pub mod transform;

pub use identify::{promote, IdentifySettings, IdentifyStage, IdentifyStats, MAX_PROMOTION_DEPTH};
pub use ingest::{DownstreamStore, IngestOutcome, IngestStage, StoredDocument};
pub use transform::{TransformStage, Transformer};

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::queue::DrainOutcome;

/// Counts for one or more tier runs of a stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    /// Messages handled without being routed to a failure tier
    pub processed: u64,
    /// Messages routed to the next tier
    pub routed_to_failure: u64,
    /// Tiers whose drain could not be verified
    pub unverified_drains: u64,
}

impl TierStats {
    pub fn merge(&mut self, other: &TierStats) {
        self.processed += other.processed;
        self.routed_to_failure += other.routed_to_failure;
        self.unverified_drains += other.unverified_drains;
    }
}

/// Counters shared with a running message handler
#[derive(Debug, Default)]
pub(crate) struct TierCounters {
    processed: AtomicU64,
    routed: AtomicU64,
}

impl TierCounters {
    pub(crate) fn inc_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_routed(&self) {
        self.routed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn finish(&self, outcome: DrainOutcome) -> TierStats {
        TierStats {
            processed: self.processed.load(Ordering::Relaxed),
            routed_to_failure: self.routed.load(Ordering::Relaxed),
            unverified_drains: u64::from(!outcome.is_verified()),
        }
    }
}

//! Queue naming and the retry/fail chain
//!
//! Queue names have the exact form `<base>.<kind>[.<tier>]`; the primary queue has no
//! tier segment. Per (base, kind) the tiers form the linear chain
//! `none -> retry1 -> retry2 -> retry3 -> fail`.

use std::fmt;

use super::RecordKind;

/// Position of a message along the escalation chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RetryTier {
    None,
    Retry1,
    Retry2,
    Retry3,
    Fail,
}

impl RetryTier {
    /// (source, fail target) pairs in the order a stage walks them each cycle
    pub const DRIVER_ORDER: [(RetryTier, RetryTier); 4] = [
        (RetryTier::Retry3, RetryTier::Fail),
        (RetryTier::Retry2, RetryTier::Retry3),
        (RetryTier::None, RetryTier::Retry1),
        (RetryTier::Retry1, RetryTier::Retry2),
    ];

    /// Name segment, absent for the primary queue
    pub fn suffix(self) -> Option<&'static str> {
        match self {
            RetryTier::None => None,
            RetryTier::Retry1 => Some("retry1"),
            RetryTier::Retry2 => Some("retry2"),
            RetryTier::Retry3 => Some("retry3"),
            RetryTier::Fail => Some("fail"),
        }
    }

    /// The tier a failure on this tier escalates to; `fail` is terminal
    pub fn next(self) -> Option<RetryTier> {
        match self {
            RetryTier::None => Some(RetryTier::Retry1),
            RetryTier::Retry1 => Some(RetryTier::Retry2),
            RetryTier::Retry2 => Some(RetryTier::Retry3),
            RetryTier::Retry3 => Some(RetryTier::Fail),
            RetryTier::Fail => None,
        }
    }
}

impl fmt::Display for RetryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix().unwrap_or("none"))
    }
}

/// Pipeline stage owning a chain of queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Transform,
    Ingest,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Transform => f.write_str("transform"),
            Stage::Ingest => f.write_str("ingest"),
        }
    }
}

/// Composite queue identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueName {
    pub base: String,
    pub kind: RecordKind,
    pub tier: RetryTier,
}

impl QueueName {
    pub fn new(base: impl Into<String>, kind: RecordKind, tier: RetryTier) -> Self {
        Self {
            base: base.into(),
            kind,
            tier,
        }
    }

    /// Same base and kind, different tier
    pub fn with_tier(&self, tier: RetryTier) -> Self {
        Self {
            base: self.base.clone(),
            kind: self.kind,
            tier,
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.base, self.kind)?;
        if let Some(suffix) = self.tier.suffix() {
            write!(f, ".{}", suffix)?;
        }
        Ok(())
    }
}

/// Base names for the two stage chains
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub transform_base: String,
    pub ingest_base: String,
}

impl QueueNames {
    pub fn new(transform_base: impl Into<String>, ingest_base: impl Into<String>) -> Self {
        Self {
            transform_base: transform_base.into(),
            ingest_base: ingest_base.into(),
        }
    }

    pub fn queue(&self, stage: Stage, kind: RecordKind, tier: RetryTier) -> QueueName {
        let base = match stage {
            Stage::Transform => &self.transform_base,
            Stage::Ingest => &self.ingest_base,
        };
        QueueName::new(base.clone(), kind, tier)
    }

    pub fn primary(&self, stage: Stage, kind: RecordKind) -> QueueName {
        self.queue(stage, kind, RetryTier::None)
    }
}

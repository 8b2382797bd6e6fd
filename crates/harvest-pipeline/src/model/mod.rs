//! Harvest data model
//!
//! [`RecordKind`] is the single strategy table for everything that varies per kind:
//! API collection, the timestamp field used for incremental selection, whether
//! parent promotion applies and whether the `filter[public]` default is added.

mod queue_name;

pub use queue_name::{QueueName, QueueNames, RetryTier, Stage};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::PipelineError;

/// Classification of a harvested entity
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    User,
    Node,
    Registration,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::User => "user",
            RecordKind::Node => "node",
            RecordKind::Registration => "registration",
        }
    }

    /// API collection path segment
    pub fn collection(self) -> &'static str {
        match self {
            RecordKind::User => "users",
            RecordKind::Node => "nodes",
            RecordKind::Registration => "registrations",
        }
    }

    /// Source field carrying the filter timestamp
    pub fn filter_field(self) -> &'static str {
        match self {
            RecordKind::User => "date_registered",
            RecordKind::Node | RecordKind::Registration => "date_modified",
        }
    }

    /// Whether identify replaces the identity with its highest accessible ancestor
    pub fn is_promoted(self) -> bool {
        matches!(self, RecordKind::Node | RecordKind::Registration)
    }

    /// Whether listings default to `filter[public]=true`
    pub fn public_by_default(self) -> bool {
        !matches!(self, RecordKind::User)
    }

    /// Whether the identify run passes its lower bound to the source query
    pub fn query_lower_bound(self) -> bool {
        !matches!(self, RecordKind::User)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lightweight listing entry produced by a record source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDescriptor {
    /// Source-local id; rewritten by parent promotion
    pub identity: String,
    pub kind: RecordKind,
    pub filter_timestamp: DateTime<Utc>,
    pub retrieved_timestamp: DateTime<Utc>,
}

/// A unit of work moving through the queues
///
/// Identify creates it with the bare source id as body and the kind as content type.
/// Transform replaces body and content type with the canonical document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub body: Vec<u8>,
    pub record_identity: String,
    pub source_uri: String,
    pub content_type: String,
    pub harvest_date: DateTime<Utc>,
    pub retrieved_date: DateTime<Utc>,
}

impl QueueMessage {
    pub fn body_str(&self) -> crate::error::Result<&str> {
        std::str::from_utf8(&self.body).map_err(|e| {
            PipelineError::transform(format!(
                "Message body for {} is not UTF-8: {}",
                self.record_identity, e
            ))
        })
    }
}

/// Immutable per-run values threaded through the identify stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunContext {
    started_at: DateTime<Utc>,
}

impl RunContext {
    /// Capture the current instant as the run start
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
        }
    }

    pub fn at(started_at: DateTime<Utc>) -> Self {
        Self { started_at }
    }

    /// Upper bound (exclusive) for every record considered in this run
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Builds record identity and source URIs from a bare source id
#[derive(Debug, Clone)]
pub struct IdentityScheme {
    record_base: String,
    api_base: String,
}

impl IdentityScheme {
    pub fn new(record_base: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            record_base: with_trailing_slash(record_base.into()),
            api_base: with_trailing_slash(api_base.into()),
        }
    }

    pub fn record_identity(&self, id: &str) -> String {
        format!("{}{}/", self.record_base, id)
    }

    pub fn source_uri(&self, kind: RecordKind, id: &str) -> String {
        format!("{}{}/{}/", self.api_base, kind.collection(), id)
    }

    /// Initial message for a descriptor, before any transform
    pub fn message_for(&self, descriptor: &RecordDescriptor) -> QueueMessage {
        QueueMessage {
            body: descriptor.identity.as_bytes().to_vec(),
            record_identity: self.record_identity(&descriptor.identity),
            source_uri: self.source_uri(descriptor.kind, &descriptor.identity),
            content_type: descriptor.kind.as_str().to_string(),
            harvest_date: descriptor.filter_timestamp,
            retrieved_date: descriptor.retrieved_timestamp,
        }
    }
}

fn with_trailing_slash(mut base: String) -> String {
    if !base.ends_with('/') {
        base.push('/');
    }
    base
}

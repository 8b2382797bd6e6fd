//! Identify stage
//!
//! Lists records changed since the last run, promotes nodes and registrations to their
//! highest accessible ancestor, de-duplicates within the run and enqueues each record on
//! the primary transform queue.
//!
//! When the caller gives no explicit time-range filter the run is windowed:
//! `[lower bound, run start)`. The lower bound is the stream's last run, or a lookback
//! from the run start on a first run. The new watermark is recorded before listing
//! starts. Listings arrive newest first, so the first record older than the lower bound
//! ends the listing.

use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::filters::FilterParams;
use crate::model::{IdentityScheme, QueueNames, RecordDescriptor, RecordKind, RunContext, Stage};
use crate::queue::QueueTransport;
use crate::registry::{stream_name, RunRegistry};
use crate::source::{ParentResolver, RecordSource};

/// Parent lookups allowed before promotion gives up
pub const MAX_PROMOTION_DEPTH: usize = 64;

/// Default first-run lookback
pub const DEFAULT_LOOKBACK_HOURS: i64 = 24;

/// Default first-run lookback for users, applied in memory only
pub const DEFAULT_USER_LOOKBACK_HOURS: i64 = 48;

#[derive(Debug, Clone)]
pub struct IdentifySettings {
    /// Run registry stream prefix
    pub stream_base: String,
    pub default_lookback: Duration,
    pub user_lookback: Duration,
}

impl Default for IdentifySettings {
    fn default() -> Self {
        Self {
            stream_base: "harvest".to_string(),
            default_lookback: Duration::hours(DEFAULT_LOOKBACK_HOURS),
            user_lookback: Duration::hours(DEFAULT_USER_LOOKBACK_HOURS),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IdentifyStats {
    pub enqueued: u64,
    pub duplicates: u64,
    /// Skipped for falling at or after the run start
    pub filtered: u64,
    pub failed: u64,
    /// Whether the listing ended at the lower bound
    pub stopped_at_boundary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Accept,
    Skip,
    Stop,
}

#[derive(Debug, Clone, Copy)]
struct TimeWindow {
    lower: DateTime<Utc>,
    upper: DateTime<Utc>,
}

impl TimeWindow {
    fn admit(&self, filter_timestamp: DateTime<Utc>) -> Admission {
        if filter_timestamp < self.lower {
            Admission::Stop
        } else if filter_timestamp >= self.upper {
            Admission::Skip
        } else {
            Admission::Accept
        }
    }
}

pub struct IdentifyStage {
    source: Arc<dyn RecordSource>,
    resolver: Arc<dyn ParentResolver>,
    runs: Arc<dyn RunRegistry>,
    transport: QueueTransport,
    names: QueueNames,
    scheme: IdentityScheme,
    settings: IdentifySettings,
}

impl IdentifyStage {
    pub fn new(
        source: Arc<dyn RecordSource>,
        resolver: Arc<dyn ParentResolver>,
        runs: Arc<dyn RunRegistry>,
        transport: QueueTransport,
        names: QueueNames,
        scheme: IdentityScheme,
        settings: IdentifySettings,
    ) -> Self {
        Self {
            source,
            resolver,
            runs,
            transport,
            names,
            scheme,
            settings,
        }
    }

    /// Enqueue every newly changed record of `kind` for transform
    ///
    /// Per-record failures are logged and counted; run registry failures abort the run.
    pub async fn identify(
        &self,
        run: &RunContext,
        kind: RecordKind,
        filters: &FilterParams,
    ) -> Result<IdentifyStats> {
        let mut params = filters.clone();
        params.apply_kind_defaults(kind);

        let window = if params.has_time_range() {
            None
        } else {
            Some(self.open_window(run, kind, &mut params).await?)
        };

        let queue = self.names.primary(Stage::Transform, kind);
        info!(kind = %kind, queue = %queue, filters = %params, "Adding records to queue");

        let mut stats = IdentifyStats::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut listing = self.source.open(kind, &params);

        while let Some(item) = listing.next().await {
            let descriptor = match item {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    stats.failed += 1;
                    error!(kind = %kind, error = %e, "Could not read record from source, continuing");
                    continue;
                }
            };

            if let Some(window) = &window {
                match window.admit(descriptor.filter_timestamp) {
                    Admission::Accept => {}
                    Admission::Skip => {
                        stats.filtered += 1;
                        debug!(record = %descriptor.identity, "Record modified after run start, skipped");
                        continue;
                    }
                    Admission::Stop => {
                        stats.stopped_at_boundary = true;
                        debug!(record = %descriptor.identity, "Reached records older than the lower bound");
                        break;
                    }
                }
            }

            let descriptor = match self.promoted(descriptor).await {
                Ok(descriptor) => descriptor,
                Err((identity, e)) => {
                    stats.failed += 1;
                    error!(record = %identity, queue = %queue, error = %e, "Could not identify record, continuing");
                    continue;
                }
            };

            if !seen.insert(descriptor.identity.clone()) {
                stats.duplicates += 1;
                info!(
                    record = %descriptor.identity,
                    queue = %queue,
                    "Record was already added in this run, skipped"
                );
                continue;
            }

            let message = self.scheme.message_for(&descriptor);
            match self.transport.enqueue(&queue, &message).await {
                Ok(()) => stats.enqueued += 1,
                Err(e) => {
                    seen.remove(&descriptor.identity);
                    stats.failed += 1;
                    error!(record = %message.record_identity, queue = %queue, error = %e, "Could not enqueue record");
                }
            }
        }

        info!(
            kind = %kind,
            enqueued = stats.enqueued,
            duplicates = stats.duplicates,
            filtered = stats.filtered,
            failed = stats.failed,
            "Identify finished"
        );
        Ok(stats)
    }

    /// Compute the run window, set the query-level bound and record the new watermark
    async fn open_window(
        &self,
        run: &RunContext,
        kind: RecordKind,
        params: &mut FilterParams,
    ) -> Result<TimeWindow> {
        let stream = stream_name(&self.settings.stream_base, kind);
        let last_run = self.runs.last_run(&stream).await?;

        let lower = if kind.query_lower_bound() {
            let lower = last_run.unwrap_or(run.started_at() - self.settings.default_lookback);
            params.set_lower_bound(kind, lower);
            lower
        } else {
            last_run.unwrap_or(run.started_at() - self.settings.user_lookback)
        };

        self.runs.record_run(&stream, run.started_at()).await?;
        info!(
            stream = %stream,
            lower_bound = %lower,
            run_start = %run.started_at(),
            previous_run = ?last_run,
            "Recorded harvest watermark"
        );

        Ok(TimeWindow {
            lower,
            upper: run.started_at(),
        })
    }

    async fn promoted(
        &self,
        descriptor: RecordDescriptor,
    ) -> std::result::Result<RecordDescriptor, (String, PipelineError)> {
        if !descriptor.kind.is_promoted() {
            return Ok(descriptor);
        }
        let promoted = promote(self.resolver.as_ref(), descriptor.kind, &descriptor.identity)
            .await
            .map_err(|e| (descriptor.identity.clone(), e))?;
        if promoted != descriptor.identity {
            info!(
                record = %promoted,
                replaces = %descriptor.identity,
                "Accessible parent record queued in place of the harvested one"
            );
        }
        // The original filter timestamp is kept; the parent may not reflect the change.
        Ok(RecordDescriptor {
            identity: promoted,
            ..descriptor
        })
    }
}

/// Walk up from `id` while the parent exists and is publicly accessible
///
/// Returns the highest accessible ancestor, or `id` itself. Applying it to its own
/// output returns the output unchanged.
pub async fn promote(resolver: &dyn ParentResolver, kind: RecordKind, id: &str) -> Result<String> {
    let mut current = id.to_string();
    for _ in 0..MAX_PROMOTION_DEPTH {
        let Some(parent) = resolver.parent_of(kind, &current).await? else {
            return Ok(current);
        };
        if parent.id == current {
            return Ok(current);
        }
        if !resolver.is_accessible(&parent).await? {
            debug!(record = %current, parent = %parent.id, "Parent not accessible");
            return Ok(current);
        }
        current = parent.id;
    }
    warn!(record = %id, depth = MAX_PROMOTION_DEPTH, "Parent walk did not converge");
    Err(PipelineError::promotion(
        id,
        format!("no root found within {} parent lookups", MAX_PROMOTION_DEPTH),
    ))
}

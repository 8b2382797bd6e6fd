//! Identify stage tests
//!
//! Covers the run window, the first-run lookback, watermark recording, parent
//! promotion and per-run de-duplication, against in-memory queues and registries.

mod common;

use chrono::Duration as ChronoDuration;
use common::*;
use harvest_pipeline::error::PipelineError;
use harvest_pipeline::filters::FilterParams;
use harvest_pipeline::model::{QueueNames, RecordKind, RunContext, Stage};
use harvest_pipeline::queue::MemoryQueue;
use harvest_pipeline::registry::{MemoryRegistry, RunRegistry};
use harvest_pipeline::source::{ParentRef, ParentResolver};
use harvest_pipeline::stages::{promote, IdentifySettings, IdentifyStage, MAX_PROMOTION_DEPTH};
use std::sync::Arc;

struct Harness {
    queue: Arc<MemoryQueue>,
    runs: Arc<MemoryRegistry>,
    source: Arc<StaticSource>,
    names: QueueNames,
    stage: IdentifyStage,
}

fn harness(items: Vec<harvest_pipeline::model::RecordDescriptor>, resolver: GraphResolver) -> Harness {
    harness_with(StaticSource::new(items), Arc::new(resolver))
}

fn harness_with(source: StaticSource, resolver: Arc<dyn ParentResolver>) -> Harness {
    let queue = Arc::new(MemoryQueue::new());
    let runs = Arc::new(MemoryRegistry::new());
    let source = Arc::new(source);
    let names = QueueNames::new("harvest.transform", "harvest.ingest");
    let stage = IdentifyStage::new(
        source.clone(),
        resolver,
        runs.clone(),
        memory_transport(&queue),
        names.clone(),
        scheme(),
        IdentifySettings::default(),
    );
    Harness {
        queue,
        runs,
        source,
        names,
        stage,
    }
}

async fn queued_ids(h: &Harness, kind: RecordKind) -> Vec<String> {
    h.queue
        .messages(&h.names.primary(Stage::Transform, kind))
        .await
        .into_iter()
        .map(|m| String::from_utf8(m.body).unwrap())
        .collect()
}

// ============================================================================
// Run window
// ============================================================================

#[tokio::test]
async fn test_listing_stops_at_first_record_older_than_last_run() {
    let h = harness(
        vec![
            descriptor("aaa01", RecordKind::Node, ts(2024, 1, 9)),
            descriptor("bbb02", RecordKind::Node, ts(2023, 12, 31)),
            descriptor("ccc03", RecordKind::Node, ts(2024, 1, 5)),
        ],
        GraphResolver::default(),
    );
    h.runs.record_run("harvest.node", ts(2024, 1, 1)).await.unwrap();

    let stats = h
        .stage
        .identify(&RunContext::at(ts(2024, 1, 10)), RecordKind::Node, &FilterParams::new())
        .await
        .unwrap();

    assert_eq!(stats.enqueued, 1);
    assert!(stats.stopped_at_boundary);
    assert_eq!(queued_ids(&h, RecordKind::Node).await, vec!["aaa01"]);
}

#[tokio::test]
async fn test_records_at_or_after_run_start_are_skipped() {
    let h = harness(
        vec![
            descriptor("late01", RecordKind::Node, ts(2024, 1, 10)),
            descriptor("ok0002", RecordKind::Node, ts(2024, 1, 9)),
        ],
        GraphResolver::default(),
    );
    h.runs.record_run("harvest.node", ts(2024, 1, 1)).await.unwrap();

    let stats = h
        .stage
        .identify(&RunContext::at(ts(2024, 1, 10)), RecordKind::Node, &FilterParams::new())
        .await
        .unwrap();

    assert_eq!(stats.filtered, 1);
    assert_eq!(queued_ids(&h, RecordKind::Node).await, vec!["ok0002"]);
}

#[tokio::test]
async fn test_first_run_uses_lookback_and_records_watermark() {
    let start = ts(2024, 1, 10);
    let h = harness(
        vec![
            descriptor("new001", RecordKind::Node, start - ChronoDuration::hours(2)),
            descriptor("old001", RecordKind::Node, start - ChronoDuration::hours(30)),
        ],
        GraphResolver::default(),
    );

    let stats = h
        .stage
        .identify(&RunContext::at(start), RecordKind::Node, &FilterParams::new())
        .await
        .unwrap();

    assert_eq!(stats.enqueued, 1);
    assert_eq!(h.runs.last_run("harvest.node").await.unwrap(), Some(start));

    let opened = h.source.opened_with.lock().unwrap();
    assert_eq!(opened[0].get("filter[date_modified][gte]"), Some("2024-01-09"));
    assert_eq!(opened[0].get("filter[public]"), Some("true"));
}

#[tokio::test]
async fn test_users_have_no_query_bound_and_longer_lookback() {
    let start = ts(2024, 1, 10);
    let h = harness(
        vec![
            descriptor("usr001", RecordKind::User, start - ChronoDuration::hours(40)),
            descriptor("usr002", RecordKind::User, start - ChronoDuration::hours(50)),
        ],
        GraphResolver::default(),
    );

    let stats = h
        .stage
        .identify(&RunContext::at(start), RecordKind::User, &FilterParams::new())
        .await
        .unwrap();

    assert_eq!(stats.enqueued, 1);
    assert_eq!(queued_ids(&h, RecordKind::User).await, vec!["usr001"]);

    let opened = h.source.opened_with.lock().unwrap();
    assert!(!opened[0].has_time_range());
    assert_eq!(opened[0].get("filter[public]"), None);
}

#[tokio::test]
async fn test_explicit_time_filter_disables_window() {
    let h = harness(
        vec![
            descriptor("aaa01", RecordKind::Node, ts(2024, 1, 9)),
            descriptor("bbb02", RecordKind::Node, ts(2023, 6, 1)),
        ],
        GraphResolver::default(),
    );
    let filters = FilterParams::parse("filter[date_modified][gte]=2023-01-01").unwrap();

    let stats = h
        .stage
        .identify(&RunContext::at(ts(2024, 1, 10)), RecordKind::Node, &filters)
        .await
        .unwrap();

    assert_eq!(stats.enqueued, 2);
    assert!(h.runs.last_run("harvest.node").await.unwrap().is_none());
}

// ============================================================================
// Promotion and de-duplication
// ============================================================================

#[tokio::test]
async fn test_children_promoted_to_same_parent_are_enqueued_once() {
    let resolver = GraphResolver::default()
        .with_parent("child1", "root01")
        .with_parent("child2", "root01");
    let h = harness(
        vec![
            descriptor("child1", RecordKind::Node, ts(2024, 1, 9)),
            descriptor("child2", RecordKind::Node, ts(2024, 1, 8)),
        ],
        resolver,
    );
    h.runs.record_run("harvest.node", ts(2024, 1, 1)).await.unwrap();

    let stats = h
        .stage
        .identify(&RunContext::at(ts(2024, 1, 10)), RecordKind::Node, &FilterParams::new())
        .await
        .unwrap();

    assert_eq!(stats.enqueued, 1);
    assert_eq!(stats.duplicates, 1);

    let messages = h
        .queue
        .messages(&h.names.primary(Stage::Transform, RecordKind::Node))
        .await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].record_identity, "https://osf.io/root01/");
    // Harvest date stays with the record that changed
    assert_eq!(messages[0].harvest_date, ts(2024, 1, 9));
}

#[tokio::test]
async fn test_promotion_stops_below_private_parent() {
    let resolver = GraphResolver::default()
        .with_parent("leaf01", "mid001")
        .with_parent("mid001", "top001")
        .with_private("top001");

    let promoted = promote(&resolver, RecordKind::Node, "leaf01").await.unwrap();
    assert_eq!(promoted, "mid001");

    // Idempotent on its own output
    let again = promote(&resolver, RecordKind::Node, &promoted).await.unwrap();
    assert_eq!(again, promoted);
}

#[tokio::test]
async fn test_promotion_of_root_is_identity() {
    let resolver = GraphResolver::default();
    assert_eq!(
        promote(&resolver, RecordKind::Registration, "root01").await.unwrap(),
        "root01"
    );
}

struct EndlessResolver;

#[async_trait::async_trait]
impl ParentResolver for EndlessResolver {
    async fn parent_of(
        &self,
        _kind: RecordKind,
        id: &str,
    ) -> harvest_pipeline::Result<Option<ParentRef>> {
        let parent = format!("{}x", id);
        Ok(Some(ParentRef {
            url: format!("https://api.osf.io/v2/nodes/{}/", parent),
            id: parent,
        }))
    }

    async fn is_accessible(&self, _parent: &ParentRef) -> harvest_pipeline::Result<bool> {
        Ok(true)
    }
}

#[tokio::test]
async fn test_promotion_gives_up_on_unbounded_ancestry() {
    let err = promote(&EndlessResolver, RecordKind::Node, "n").await.unwrap_err();
    assert!(matches!(err, PipelineError::Promotion { .. }));
    assert!(err.to_string().contains(&MAX_PROMOTION_DEPTH.to_string()));
}

#[tokio::test]
async fn test_users_are_not_promoted() {
    let resolver = GraphResolver::default().with_parent("usr001", "usr999");
    let h = harness(
        vec![descriptor("usr001", RecordKind::User, ts(2024, 1, 9))],
        resolver,
    );
    h.runs.record_run("harvest.user", ts(2024, 1, 1)).await.unwrap();

    h.stage
        .identify(&RunContext::at(ts(2024, 1, 10)), RecordKind::User, &FilterParams::new())
        .await
        .unwrap();

    assert_eq!(queued_ids(&h, RecordKind::User).await, vec!["usr001"]);
}

/// Resolver whose parent lookup fails for one record
struct UnreachableParent {
    failing: &'static str,
}

#[async_trait::async_trait]
impl ParentResolver for UnreachableParent {
    async fn parent_of(
        &self,
        _kind: RecordKind,
        id: &str,
    ) -> harvest_pipeline::Result<Option<ParentRef>> {
        if id == self.failing {
            return Err(PipelineError::source_fetch(format!("{} timed out", id)));
        }
        Ok(None)
    }

    async fn is_accessible(&self, _parent: &ParentRef) -> harvest_pipeline::Result<bool> {
        Ok(true)
    }
}

#[tokio::test]
async fn test_record_failures_do_not_end_the_listing() {
    let source = StaticSource {
        items: vec![
            Ok(descriptor("aaa01", RecordKind::Node, ts(2024, 1, 9))),
            Err(PipelineError::source_fetch("malformed record")),
            Ok(descriptor("bad01", RecordKind::Node, ts(2024, 1, 8))),
            Ok(descriptor("ccc03", RecordKind::Node, ts(2024, 1, 7))),
        ],
        opened_with: Default::default(),
    };
    let h = harness_with(source, Arc::new(UnreachableParent { failing: "bad01" }));
    h.runs.record_run("harvest.node", ts(2024, 1, 1)).await.unwrap();

    let stats = h
        .stage
        .identify(&RunContext::at(ts(2024, 1, 10)), RecordKind::Node, &FilterParams::new())
        .await
        .unwrap();

    assert_eq!(stats.enqueued, 2);
    assert_eq!(stats.failed, 2);
    assert!(!stats.stopped_at_boundary);
    assert_eq!(queued_ids(&h, RecordKind::Node).await, vec!["aaa01", "ccc03"]);
}

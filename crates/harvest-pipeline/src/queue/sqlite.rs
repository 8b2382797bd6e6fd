//! SQLite-backed queue storage

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqlitePool, SqlitePoolOptions},
    Row,
};
use std::time::Duration;

use super::{Delivery, QueueBackend, QueueDepth};
use crate::error::{PipelineError, Result};
use crate::model::{QueueMessage, QueueName};

/// Queue rows in the `queue_messages` table
#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    id: i64,
    body: Vec<u8>,
    record_identity: String,
    source_uri: String,
    content_type: String,
    harvest_date: DateTime<Utc>,
    retrieved_date: DateTime<Utc>,
}

impl QueueRow {
    fn into_delivery(self, queue: &QueueName) -> Delivery {
        Delivery {
            id: self.id,
            queue: queue.clone(),
            message: QueueMessage {
                body: self.body,
                record_identity: self.record_identity,
                source_uri: self.source_uri,
                content_type: self.content_type,
                harvest_date: self.harvest_date,
                retrieved_date: self.retrieved_date,
            },
        }
    }
}

fn transport_err(context: &str) -> impl FnOnce(sqlx::Error) -> PipelineError + '_ {
    move |e| PipelineError::transport(format!("{}: {}", context, e))
}

impl SqliteQueue {
    /// Use a pool that has already been migrated
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) and migrate the database at `url`
    pub async fn connect_with(url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(transport_err("Failed to open queue database"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| PipelineError::transport(format!("Migration failed: {}", e)))?;
        Ok(Self { pool })
    }

    /// Release claims older than `older_than`, left behind by a listener that died
    pub async fn reclaim_stale_claims(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now().timestamp_millis() - older_than.as_millis() as i64;
        let result = sqlx::query(
            r#"
            UPDATE queue_messages SET claimed_by = NULL, claimed_at = NULL
            WHERE claimed_by IS NOT NULL AND claimed_at < ?1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(transport_err("Failed to reclaim stale claims"))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl QueueBackend for SqliteQueue {
    async fn push(&self, queue: &QueueName, message: &QueueMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_messages
                (queue, body, record_identity, source_uri, content_type, harvest_date, retrieved_date, enqueued_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(queue.to_string())
        .bind(&message.body)
        .bind(&message.record_identity)
        .bind(&message.source_uri)
        .bind(&message.content_type)
        .bind(message.harvest_date)
        .bind(message.retrieved_date)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(transport_err("Failed to enqueue message"))?;

        Ok(())
    }

    async fn claim(&self, queue: &QueueName, consumer: &str) -> Result<Option<Delivery>> {
        let row = sqlx::query_as::<_, QueueRow>(
            r#"
            UPDATE queue_messages SET claimed_by = ?1, claimed_at = ?2
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue = ?3 AND claimed_by IS NULL
                ORDER BY id
                LIMIT 1
            )
            RETURNING id, body, record_identity, source_uri, content_type, harvest_date, retrieved_date
            "#,
        )
        .bind(consumer)
        .bind(Utc::now().timestamp_millis())
        .bind(queue.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(transport_err("Failed to claim message"))?;

        Ok(row.map(|row| row.into_delivery(queue)))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query("DELETE FROM queue_messages WHERE id = ?1")
            .bind(delivery.id)
            .execute(&self.pool)
            .await
            .map_err(transport_err("Failed to acknowledge message"))?;
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query(
            "UPDATE queue_messages SET claimed_by = NULL, claimed_at = NULL WHERE id = ?1",
        )
        .bind(delivery.id)
        .execute(&self.pool)
        .await
        .map_err(transport_err("Failed to release message"))?;
        Ok(())
    }

    async fn release_claims(&self, queue: &QueueName, consumer: Option<&str>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages SET claimed_by = NULL, claimed_at = NULL
            WHERE queue = ?1 AND claimed_by IS NOT NULL AND (?2 IS NULL OR claimed_by = ?2)
            "#,
        )
        .bind(queue.to_string())
        .bind(consumer)
        .execute(&self.pool)
        .await
        .map_err(transport_err("Failed to release claims"))?;

        Ok(result.rows_affected())
    }

    async fn has_messages(&self, queue: &QueueName) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM queue_messages WHERE queue = ?1) AS present",
        )
        .bind(queue.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PipelineError::probe(e.to_string()))?;

        let present: i64 = row.get("present");
        Ok(present != 0)
    }

    async fn depth(&self, queue: &QueueName) -> Result<QueueDepth> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total, COUNT(claimed_by) AS in_flight
            FROM queue_messages WHERE queue = ?1
            "#,
        )
        .bind(queue.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(transport_err("Failed to read queue depth"))?;

        let total: i64 = row.get("total");
        let in_flight: i64 = row.get("in_flight");
        Ok(QueueDepth {
            ready: (total - in_flight).max(0) as u64,
            in_flight: in_flight.max(0) as u64,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{RecordKind, RetryTier};
    use crate::queue::{DrainConfig, DrainConsumer, MessageHandler, QueueTransport};
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    async fn create_test_queue() -> SqliteQueue {
        // Single connection so every query sees the same in-memory database
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        SqliteQueue::new(pool)
    }

    fn message(id: &str) -> QueueMessage {
        let date = Utc.with_ymd_and_hms(2024, 1, 9, 0, 0, 0).unwrap();
        QueueMessage {
            body: id.as_bytes().to_vec(),
            record_identity: format!("https://osf.io/{}/", id),
            source_uri: format!("https://api.osf.io/v2/nodes/{}/", id),
            content_type: "node".to_string(),
            harvest_date: date,
            retrieved_date: date,
        }
    }

    fn queue(tier: RetryTier) -> QueueName {
        QueueName::new("harvest.transform", RecordKind::Node, tier)
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_exclusive() {
        let store = create_test_queue().await;
        let q = queue(RetryTier::None);
        store.push(&q, &message("a")).await.unwrap();
        store.push(&q, &message("b")).await.unwrap();

        let first = store.claim(&q, "l1").await.unwrap().unwrap();
        assert_eq!(first.message, message("a"));
        let second = store.claim(&q, "l2").await.unwrap().unwrap();
        assert_eq!(second.message, message("b"));
        assert!(store.claim(&q, "l3").await.unwrap().is_none());

        assert_eq!(store.depth(&q).await.unwrap(), QueueDepth { ready: 0, in_flight: 2 });
    }

    #[tokio::test]
    async fn test_in_flight_counts_until_ack() {
        let store = create_test_queue().await;
        let q = queue(RetryTier::Retry1);
        store.push(&q, &message("a")).await.unwrap();

        let delivery = store.claim(&q, "l1").await.unwrap().unwrap();
        assert!(store.has_messages(&q).await.unwrap());

        store.ack(&delivery).await.unwrap();
        assert!(!store.has_messages(&q).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_makes_message_claimable_again() {
        let store = create_test_queue().await;
        let q = queue(RetryTier::None);
        store.push(&q, &message("a")).await.unwrap();

        let delivery = store.claim(&q, "l1").await.unwrap().unwrap();
        store.release(&delivery).await.unwrap();

        let again = store.claim(&q, "l2").await.unwrap().unwrap();
        assert_eq!(again.id, delivery.id);
    }

    #[tokio::test]
    async fn test_queues_are_isolated_by_name() {
        let store = create_test_queue().await;
        store.push(&queue(RetryTier::Fail), &message("a")).await.unwrap();

        assert!(!store.has_messages(&queue(RetryTier::None)).await.unwrap());
        assert!(store.claim(&queue(RetryTier::None), "l1").await.unwrap().is_none());
        assert_eq!(store.depth(&queue(RetryTier::Fail)).await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_reclaim_stale_claims() {
        let store = create_test_queue().await;
        let q = queue(RetryTier::None);
        store.push(&q, &message("a")).await.unwrap();
        store.claim(&q, "crashed").await.unwrap().unwrap();

        assert_eq!(store.reclaim_stale_claims(Duration::from_secs(3600)).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.reclaim_stale_claims(Duration::ZERO).await.unwrap(), 1);
        assert!(store.claim(&q, "l2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_claims_by_owner() {
        let store = create_test_queue().await;
        let q = queue(RetryTier::Retry2);
        for id in ["a", "b", "c"] {
            store.push(&q, &message(id)).await.unwrap();
        }
        store.claim(&q, "l1").await.unwrap().unwrap();
        store.claim(&q, "l2").await.unwrap().unwrap();

        assert_eq!(store.release_claims(&q, Some("l2")).await.unwrap(), 1);
        assert_eq!(store.depth(&q).await.unwrap(), QueueDepth { ready: 2, in_flight: 1 });

        assert_eq!(store.release_claims(&q, None).await.unwrap(), 1);
        assert_eq!(store.depth(&q).await.unwrap(), QueueDepth { ready: 3, in_flight: 0 });
    }

    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, message: QueueMessage) -> Result<()> {
            self.0.lock().unwrap().push(message.record_identity);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_drain_after_restart_takes_over_orphaned_claim() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("queue.db").display());
        let q = queue(RetryTier::None);

        // First run is killed while its listener holds a claim
        let killed = SqliteQueue::connect_with(&url, 1).await.unwrap();
        killed.push(&q, &message("a")).await.unwrap();
        killed.claim(&q, "killed-listener").await.unwrap().unwrap();
        killed.pool.close().await;

        // Restarted well inside the stale claim window
        let store = SqliteQueue::connect_with(&url, 2).await.unwrap();
        assert_eq!(store.reclaim_stale_claims(Duration::from_secs(3600)).await.unwrap(), 0);

        let drain = DrainConsumer::new(
            QueueTransport::new(Arc::new(store.clone()), Duration::from_millis(5)),
            DrainConfig {
                poll_interval: Duration::from_millis(20),
                ..DrainConfig::default()
            },
        );
        let handler = Arc::new(Recorder(Mutex::new(Vec::new())));
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            drain.process_messages(&q, handler.clone()),
        )
        .await
        .expect("drain did not finish")
        .unwrap();

        assert!(outcome.is_verified());
        assert_eq!(*handler.0.lock().unwrap(), vec!["https://osf.io/a/".to_string()]);
        assert_eq!(store.depth(&q).await.unwrap().total(), 0);
    }
}

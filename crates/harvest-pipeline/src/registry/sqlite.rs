//! SQLite registry storage

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqlitePool, SqlitePoolOptions},
    Row,
};

use super::{PublishRegistry, PublishRegistryEntry, RunRegistry};
use crate::error::{PipelineError, Result};

/// Both registries over one pool
#[derive(Clone)]
pub struct SqliteRegistry {
    pool: SqlitePool,
}

fn registry_err(context: &str) -> impl FnOnce(sqlx::Error) -> PipelineError + '_ {
    move |e| PipelineError::registry(format!("{}: {}", context, e))
}

impl SqliteRegistry {
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
            .map_err(registry_err("Failed to open registry database"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| PipelineError::registry(format!("Migration failed: {}", e)))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl RunRegistry for SqliteRegistry {
    async fn last_run(&self, stream: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            r#"
            SELECT run_at FROM harvest_runs WHERE stream = ?1
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(stream)
        .fetch_optional(&self.pool)
        .await
        .map_err(registry_err("Failed to read last run"))?;

        row.map(|row| row.try_get::<DateTime<Utc>, _>("run_at"))
            .transpose()
            .map_err(registry_err("Failed to decode last run"))
    }

    async fn record_run(&self, stream: &str, run_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT INTO harvest_runs (stream, run_at) VALUES (?1, ?2)")
            .bind(stream)
            .bind(run_at)
            .execute(&self.pool)
            .await
            .map_err(registry_err("Failed to record run"))?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct PublishRow {
    record_identity: String,
    last_published_version: String,
    record_date: DateTime<Utc>,
    last_checked: DateTime<Utc>,
}

#[async_trait]
impl PublishRegistry for SqliteRegistry {
    async fn get(&self, record_identity: &str) -> Result<Option<PublishRegistryEntry>> {
        let row = sqlx::query_as::<_, PublishRow>(
            r#"
            SELECT record_identity, last_published_version, record_date, last_checked
            FROM publish_registry WHERE record_identity = ?1
            "#,
        )
        .bind(record_identity)
        .fetch_optional(&self.pool)
        .await
        .map_err(registry_err("Failed to read publish registry"))?;

        Ok(row.map(|row| PublishRegistryEntry {
            record_identity: row.record_identity,
            last_published_version: row.last_published_version,
            record_date: row.record_date,
            last_checked: row.last_checked,
        }))
    }

    async fn register(&self, entry: &PublishRegistryEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO publish_registry (record_identity, last_published_version, record_date, last_checked)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(record_identity) DO UPDATE SET
                last_published_version = excluded.last_published_version,
                record_date = excluded.record_date,
                last_checked = excluded.last_checked
            "#,
        )
        .bind(&entry.record_identity)
        .bind(&entry.last_published_version)
        .bind(entry.record_date)
        .bind(entry.last_checked)
        .execute(&self.pool)
        .await
        .map_err(registry_err("Failed to update publish registry"))?;
        Ok(())
    }
}

//! In-process queue storage with the same claim semantics as [`super::SqliteQueue`]

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use super::{Delivery, QueueBackend, QueueDepth};
use crate::error::Result;
use crate::model::{QueueMessage, QueueName};

#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    // Ordered by id, so iteration order is enqueue order
    rows: BTreeMap<i64, MemoryRow>,
}

struct MemoryRow {
    queue: QueueName,
    message: QueueMessage,
    claimed_by: Option<String>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages currently in `queue`, claimed ones included, oldest first
    pub async fn messages(&self, queue: &QueueName) -> Vec<QueueMessage> {
        let state = self.state.lock().await;
        state
            .rows
            .values()
            .filter(|row| &row.queue == queue)
            .map(|row| row.message.clone())
            .collect()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn push(&self, queue: &QueueName, message: &QueueMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state.rows.insert(
            id,
            MemoryRow {
                queue: queue.clone(),
                message: message.clone(),
                claimed_by: None,
            },
        );
        Ok(())
    }

    async fn claim(&self, queue: &QueueName, consumer: &str) -> Result<Option<Delivery>> {
        let mut state = self.state.lock().await;
        let next = state
            .rows
            .iter_mut()
            .find(|(_, row)| &row.queue == queue && row.claimed_by.is_none());

        Ok(next.map(|(id, row)| {
            row.claimed_by = Some(consumer.to_string());
            Delivery {
                id: *id,
                queue: queue.clone(),
                message: row.message.clone(),
            }
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.state.lock().await.rows.remove(&delivery.id);
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<()> {
        if let Some(row) = self.state.lock().await.rows.get_mut(&delivery.id) {
            row.claimed_by = None;
        }
        Ok(())
    }

    async fn release_claims(&self, queue: &QueueName, consumer: Option<&str>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut released = 0;
        for row in state.rows.values_mut().filter(|row| &row.queue == queue) {
            let held = match (&row.claimed_by, consumer) {
                (Some(_), None) => true,
                (Some(owner), Some(consumer)) => owner == consumer,
                (None, _) => false,
            };
            if held {
                row.claimed_by = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn has_messages(&self, queue: &QueueName) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.rows.values().any(|row| &row.queue == queue))
    }

    async fn depth(&self, queue: &QueueName) -> Result<QueueDepth> {
        let state = self.state.lock().await;
        let mut depth = QueueDepth::default();
        for row in state.rows.values().filter(|row| &row.queue == queue) {
            if row.claimed_by.is_some() {
                depth.in_flight += 1;
            } else {
                depth.ready += 1;
            }
        }
        Ok(depth)
    }
}

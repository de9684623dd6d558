//! Durable outbox rows.
//!
//! Work that must happen after a transaction commits (notifications, delayed
//! pokes) is written as an [`OutboxRecord`] inside that same transaction.
//! A dispatcher later reads due rows, delivers them and acknowledges them by
//! deleting the row. Delivery is therefore at-least-once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage_traits::Entity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Sortable by creation time, unique.
    pub id: String,
    /// Not delivered before this time.
    pub eta: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Opaque task payload, decoded by the consumer.
    pub task: serde_json::Value,
}

impl OutboxRecord {
    pub fn new(created_at: DateTime<Utc>, eta: DateTime<Utc>, task: serde_json::Value) -> Self {
        let id = format!(
            "{:020}-{}",
            created_at.timestamp_micros().max(0),
            uuid::Uuid::new_v4().simple()
        );
        Self {
            id,
            eta,
            created_at,
            task,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.eta <= now
    }
}

impl Entity for OutboxRecord {
    const KIND: &'static str = "outbox";

    fn entity_key(&self) -> String {
        self.id.clone()
    }
}

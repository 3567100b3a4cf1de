use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Searching,
    Matched,
    Expired,
    Cancelled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Searching => "searching",
            QueueStatus::Matched => "matched",
            QueueStatus::Expired => "expired",
            QueueStatus::Cancelled => "cancelled",
        }
    }
}

/// Short-lived matchmaking row. FIFO within a stake partition; the
/// in-process queue is a cache validated against this row on every pop.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MatchQueueEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub stake: Decimal,
    pub status: String,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl MatchQueueEntry {
    pub fn is_searching(&self) -> bool {
        self.status == QueueStatus::Searching.as_str()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Immutable record of a player's first tap in a match. One per
/// (match, user), enforced by a unique constraint; inserts are
/// first-write-wins.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TapEvent {
    pub id: Uuid,
    pub match_id: Uuid,
    pub user_id: Uuid,
    pub client_timestamp: Option<i64>,
    pub server_timestamp: i64,
    pub reaction_ms: i64,
    pub is_valid: bool,
    pub disqualified: bool,
    pub disqualify_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TapEvent {
    pub fn summary(&self) -> crate::models::match_model::TapSummary {
        crate::models::match_model::TapSummary {
            reaction_ms: self.reaction_ms,
            is_valid: self.is_valid,
            disqualified: self.disqualified,
        }
    }
}

/// Wire shape of a recorded tap.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TapOutcome {
    pub reaction_ms: i64,
    pub is_valid: bool,
    pub disqualified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<&TapEvent> for TapOutcome {
    fn from(event: &TapEvent) -> Self {
        Self {
            reaction_ms: event.reaction_ms,
            is_valid: event.is_valid,
            disqualified: event.disqualified,
            reason: event.disqualify_reason.clone(),
        }
    }
}

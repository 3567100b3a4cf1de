use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Identity plus aggregate stats. Created on first authenticated login;
/// stats are mutated only by the orchestrator on match completion.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub wallet_address: String,
    pub wins: i32,
    pub losses: i32,
    pub matches_played: i32,
    pub avg_reaction_ms: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Rolling average update for a newly recorded valid reaction.
    pub fn next_avg_reaction(&self, reaction_ms: i64) -> f64 {
        let played = self.matches_played as f64;
        match self.avg_reaction_ms {
            Some(avg) if played > 0.0 => (avg * played + reaction_ms as f64) / (played + 1.0),
            _ => reaction_ms as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(avg: Option<f64>, played: i32) -> User {
        User {
            id: Uuid::new_v4(),
            wallet_address: "0xabc".to_string(),
            wins: 0,
            losses: 0,
            matches_played: played,
            avg_reaction_ms: avg,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn first_reaction_seeds_the_average() {
        assert_eq!(user(None, 0).next_avg_reaction(240), 240.0);
    }

    #[test]
    fn rolling_average_accumulates() {
        let next = user(Some(200.0), 4).next_avg_reaction(300);
        assert!((next - 220.0).abs() < f64::EPSILON);
    }
}

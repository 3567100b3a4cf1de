//! Anti-cheat validation.
//!
//! Pure per-tap plausibility checks plus aggregate pattern sweeps over a
//! player's recent history. Aggregate findings go to the audit table and
//! never block the match in which they were detected.

use crate::api_error::ApiError;
use crate::config::GameConfig;
use crate::db::DbPool;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const TIMING_DISCREPANCY_LIMIT_MS: i64 = 500;
pub const SUSPICIOUS_REACTION_MS: i64 = 100;
pub const SPAM_TAP_COUNT: usize = 3;
pub const SPAM_TAP_WINDOW_MS: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionFault {
    FalseStart,
    TooFast,
    Timeout,
}

impl ReactionFault {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReactionFault::FalseStart => "false_start",
            ReactionFault::TooFast => "too_fast",
            ReactionFault::Timeout => "timeout",
        }
    }
}

/// Verdict on a single tap relative to the signal.
#[derive(Debug, Clone, Copy)]
pub struct ReactionCheck {
    pub valid: bool,
    pub reaction_ms: i64,
    pub reason: Option<ReactionFault>,
    pub suspicious: bool,
}

impl ReactionCheck {
    /// False starts forfeit the match for the tapper.
    pub fn disqualifies(&self) -> bool {
        matches!(self.reason, Some(ReactionFault::FalseStart))
    }
}

/// True iff the reaction lies inside the plausible human band.
pub fn is_human_reaction(reaction_ms: i64, game: &GameConfig) -> bool {
    reaction_ms >= game.min_human_reaction_ms && reaction_ms <= game.max_reaction_ms
}

/// Validate a server-side tap against the signal instant.
///
/// Negative reactions inside the clock-sync tolerance clamp to zero; beyond
/// it the tap is a false start. Reactions above the maximum are timeouts
/// (invalid but not disqualifying). Sub-threshold reactions stay valid but
/// carry the `too_fast` fault for the audit trail.
pub fn validate_reaction(server_tap_ms: i64, signal_ms: i64, game: &GameConfig) -> ReactionCheck {
    let raw = server_tap_ms - signal_ms;

    if raw < -game.clock_sync_tolerance_ms {
        return ReactionCheck {
            valid: false,
            reaction_ms: raw,
            reason: Some(ReactionFault::FalseStart),
            suspicious: false,
        };
    }

    let reaction_ms = raw.max(0);

    if reaction_ms > game.max_reaction_ms {
        return ReactionCheck {
            valid: false,
            reaction_ms,
            reason: Some(ReactionFault::Timeout),
            suspicious: false,
        };
    }

    let suspicious = reaction_ms < SUSPICIOUS_REACTION_MS;
    let reason = if !is_human_reaction(reaction_ms, game) {
        Some(ReactionFault::TooFast)
    } else {
        None
    };

    ReactionCheck {
        valid: true,
        reaction_ms,
        reason,
        suspicious,
    }
}

/// Hard check on the client-reported reaction versus the server's. Callers
/// must reject the tap outright when this fails.
pub fn check_timing_discrepancy(client_reaction_ms: i64, server_reaction_ms: i64) -> Result<(), i64> {
    let discrepancy = (client_reaction_ms - server_reaction_ms).abs();
    if discrepancy > TIMING_DISCREPANCY_LIMIT_MS {
        Err(discrepancy)
    } else {
        Ok(())
    }
}

/// Spam detection over a tap-attempt burst.
pub fn detect_spam_tapping(count: usize, window_ms: i64) -> bool {
    count > SPAM_TAP_COUNT && window_ms < SPAM_TAP_WINDOW_MS
}

pub struct AntiCheatService {
    pool: DbPool,
}

impl AntiCheatService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Aggregate pattern sweep over a player's recent history. Runs after a
    /// match resolves; failures are logged, never propagated into gameplay.
    pub async fn sweep_player(&self, user_id: Uuid, match_id: Uuid) {
        if let Err(e) = self.run_sweep(user_id, match_id).await {
            warn!(user_id = %user_id, error = %e, "Anti-cheat sweep failed");
        }
    }

    async fn run_sweep(&self, user_id: Uuid, match_id: Uuid) -> Result<(), ApiError> {
        let reactions: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT reaction_ms FROM tap_events
            WHERE user_id = $1 AND is_valid = TRUE
            ORDER BY created_at DESC
            LIMIT 20
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::database_error)?;

        if reactions.len() >= 10 {
            let (mean, stddev) = mean_stddev(&reactions);
            if stddev < 10.0 && mean < 150.0 {
                self.record_finding(
                    user_id,
                    Some(match_id),
                    "bot_like_consistency",
                    serde_json::json!({ "mean_ms": mean, "stddev_ms": stddev, "samples": reactions.len() }),
                )
                .await?;
            }
        }

        if reactions.len() >= 5 {
            let recent = &reactions[..5];
            let mean = recent.iter().sum::<i64>() as f64 / recent.len() as f64;
            if mean < 100.0 {
                self.record_finding(
                    user_id,
                    Some(match_id),
                    "inhuman_mean_reaction",
                    serde_json::json!({ "mean_ms": mean, "samples": recent.len() }),
                )
                .await?;
            }
        }

        let row: Option<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE winner_id = $1)
            FROM matches
            WHERE (player1_id = $1 OR player2_id = $1)
              AND status = 'completed'
              AND completed_at > NOW() - INTERVAL '7 days'
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(ApiError::database_error)?;

        if let Some((total, wins)) = row {
            if total >= 20 && (wins as f64) / (total as f64) > 0.9 {
                self.record_finding(
                    user_id,
                    Some(match_id),
                    "high_win_rate",
                    serde_json::json!({ "wins": wins, "total": total }),
                )
                .await?;
            }
        }

        Ok(())
    }

    pub async fn record_finding(
        &self,
        user_id: Uuid,
        match_id: Option<Uuid>,
        finding: &str,
        details: serde_json::Value,
    ) -> Result<(), ApiError> {
        info!(user_id = %user_id, finding = finding, "Anti-cheat finding recorded");
        sqlx::query(
            r#"
            INSERT INTO anti_cheat_audit (id, user_id, match_id, finding, details)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(match_id)
        .bind(finding)
        .bind(details)
        .execute(&self.pool)
        .await
        .map_err(ApiError::database_error)?;
        Ok(())
    }
}

fn mean_stddev(samples: &[i64]) -> (f64, f64) {
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<i64>() as f64 / n;
    let variance = samples
        .iter()
        .map(|&s| {
            let d = s as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game() -> GameConfig {
        GameConfig::from_env().unwrap()
    }

    #[test]
    fn human_reaction_band() {
        let game = game();
        assert!(!is_human_reaction(79, &game));
        assert!(is_human_reaction(80, &game));
        assert!(is_human_reaction(3000, &game));
        assert!(!is_human_reaction(3001, &game));
    }

    #[test]
    fn clock_sync_grace_clamps_to_zero() {
        let game = game();
        let check = validate_reaction(1000 - 50, 1000, &game);
        assert!(check.valid);
        assert_eq!(check.reaction_ms, 0);

        let check = validate_reaction(1000 - 1, 1000, &game);
        assert!(check.valid);
        assert_eq!(check.reaction_ms, 0);
    }

    #[test]
    fn false_start_beyond_tolerance() {
        let game = game();
        let check = validate_reaction(1000 - 51, 1000, &game);
        assert!(!check.valid);
        assert_eq!(check.reason, Some(ReactionFault::FalseStart));
    }

    #[test]
    fn zero_and_max_reaction_are_valid() {
        let game = game();
        let at_zero = validate_reaction(1000, 1000, &game);
        assert!(at_zero.valid);
        assert_eq!(at_zero.reaction_ms, 0);

        let at_max = validate_reaction(1000 + game.max_reaction_ms, 1000, &game);
        assert!(at_max.valid);
        assert!(at_max.reason.is_none());

        let past_max = validate_reaction(1000 + game.max_reaction_ms + 1, 1000, &game);
        assert!(!past_max.valid);
        assert_eq!(past_max.reason, Some(ReactionFault::Timeout));
    }

    #[test]
    fn sub_threshold_reaction_is_flagged_not_rejected() {
        let game = game();
        let check = validate_reaction(1050, 1000, &game);
        assert!(check.valid);
        assert_eq!(check.reason, Some(ReactionFault::TooFast));
        assert!(check.suspicious);

        let check = validate_reaction(1099, 1000, &game);
        assert!(check.suspicious);
        let check = validate_reaction(1100, 1000, &game);
        assert!(!check.suspicious);
    }

    #[test]
    fn timing_discrepancy_hard_limit() {
        assert!(check_timing_discrepancy(200, 700).is_err());
        assert!(check_timing_discrepancy(200, 700 - 1).is_ok());
        assert!(check_timing_discrepancy(700, 200).is_err());
        assert_eq!(check_timing_discrepancy(900, 200).unwrap_err(), 700);
    }

    #[test]
    fn spam_tapping_rule() {
        assert!(detect_spam_tapping(4, 499));
        assert!(!detect_spam_tapping(3, 100));
        assert!(!detect_spam_tapping(4, 500));
        assert!(detect_spam_tapping(10, 300));
    }

    #[test]
    fn stddev_math() {
        let (mean, stddev) = mean_stddev(&[100, 100, 100, 100]);
        assert_eq!(mean, 100.0);
        assert_eq!(stddev, 0.0);

        let (mean, stddev) = mean_stddev(&[90, 110]);
        assert_eq!(mean, 100.0);
        assert_eq!(stddev, 10.0);
    }
}

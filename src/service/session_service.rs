//! Session coordinator.
//!
//! Owns per-user liveness: the single-active-match gate, the single active
//! connection, queue-disconnect grace markers, and disconnect
//! classification. All keys live in redis with TTLs; they are hints over
//! store-backed truth and are rebuilt naturally as clients reconnect.

use crate::api_error::ApiError;
use crate::config::GameConfig;
use crate::db::DbPool;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Classification of a dropped connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectClass {
    /// Lifetime below the stable-connection threshold; not counted.
    Early,
    /// Counted against the per-player hard-disconnect budget.
    Hard { count: i32 },
    /// Budget exceeded; the caller should cancel the match.
    ExceededBudget { count: i32 },
}

#[derive(Clone)]
pub struct SessionService {
    redis: ConnectionManager,
    game: GameConfig,
}

impl SessionService {
    pub fn new(redis: ConnectionManager, game: GameConfig) -> Self {
        Self { redis, game }
    }

    fn active_match_key(user_id: Uuid) -> String {
        format!("active_match:{}", user_id)
    }

    fn active_socket_key(user_id: Uuid) -> String {
        format!("active_socket:{}", user_id)
    }

    fn queue_disconnect_key(user_id: Uuid, stake_key: &str) -> String {
        format!("queue_disconnect:{}:{}", user_id, stake_key)
    }

    // ---- single-active-match gate ----

    pub async fn set_active_match(&self, user_id: Uuid, match_id: Uuid) -> Result<(), ApiError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .set_ex(
                Self::active_match_key(user_id),
                match_id.to_string(),
                self.game.active_match_ttl_secs,
            )
            .await
            .map_err(redis_error)?;
        Ok(())
    }

    pub async fn get_active_match(&self, user_id: Uuid) -> Result<Option<Uuid>, ApiError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn
            .get(Self::active_match_key(user_id))
            .await
            .map_err(redis_error)?;
        Ok(raw.and_then(|s| Uuid::parse_str(&s).ok()))
    }

    pub async fn clear_active_match(&self, user_id: Uuid) -> Result<(), ApiError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .del(Self::active_match_key(user_id))
            .await
            .map_err(redis_error)?;
        Ok(())
    }

    // ---- single active connection ----

    /// Register a connection for the user, forcibly superseding any prior
    /// one. Returns the replaced connection id, if any.
    pub async fn register_connection(
        &self,
        user_id: Uuid,
        connection_id: &str,
    ) -> Result<Option<String>, ApiError> {
        let mut conn = self.redis.clone();
        let key = Self::active_socket_key(user_id);
        let prior: Option<String> = conn.get(&key).await.map_err(redis_error)?;
        let _: () = conn
            .set_ex(&key, connection_id, self.game.active_socket_ttl_secs)
            .await
            .map_err(redis_error)?;
        if let Some(ref replaced) = prior {
            if replaced != connection_id {
                info!(user_id = %user_id, replaced = %replaced, "Superseding prior connection");
            }
        }
        Ok(prior.filter(|p| p != connection_id))
    }

    pub async fn connection_alive(&self, user_id: Uuid) -> Result<bool, ApiError> {
        let mut conn = self.redis.clone();
        let existing: Option<String> = conn
            .get(Self::active_socket_key(user_id))
            .await
            .map_err(redis_error)?;
        Ok(existing.is_some())
    }

    /// Refresh the connection TTL on heartbeat.
    pub async fn touch_connection(&self, user_id: Uuid) -> Result<(), ApiError> {
        let mut conn = self.redis.clone();
        let key = Self::active_socket_key(user_id);
        let _: bool = conn
            .expire(&key, self.game.active_socket_ttl_secs as i64)
            .await
            .map_err(redis_error)?;
        Ok(())
    }

    pub async fn clear_connection(&self, user_id: Uuid) -> Result<(), ApiError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .del(Self::active_socket_key(user_id))
            .await
            .map_err(redis_error)?;
        Ok(())
    }

    // ---- queue disconnect grace ----

    pub async fn mark_queue_disconnect(
        &self,
        user_id: Uuid,
        stake_key: &str,
    ) -> Result<(), ApiError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .set_ex(
                Self::queue_disconnect_key(user_id, stake_key),
                "1",
                self.game.queue_grace_period_secs,
            )
            .await
            .map_err(redis_error)?;
        Ok(())
    }

    /// Consume the grace marker; true iff the user reconnected in time.
    pub async fn take_queue_disconnect(
        &self,
        user_id: Uuid,
        stake_key: &str,
    ) -> Result<bool, ApiError> {
        let mut conn = self.redis.clone();
        let key = Self::queue_disconnect_key(user_id, stake_key);
        let present: Option<String> = conn.get(&key).await.map_err(redis_error)?;
        if present.is_some() {
            let _: () = conn.del(&key).await.map_err(redis_error)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ---- disconnect classification ----

    /// Record a dropped connection against a live match and decide whether
    /// the reconnect budget is exhausted. The caller owns the actual
    /// cancellation.
    pub async fn record_disconnect(
        &self,
        pool: &DbPool,
        match_id: Uuid,
        user_id: Uuid,
        connection_lifetime_ms: i64,
    ) -> Result<DisconnectClass, ApiError> {
        if connection_lifetime_ms < self.game.stable_connection_threshold_ms {
            debug!(
                user_id = %user_id,
                lifetime_ms = connection_lifetime_ms,
                "Early disconnect, not counted"
            );
            return Ok(DisconnectClass::Early);
        }

        let row: Option<(i32, String, bool, bool, Option<i64>, i64)> = sqlx::query_as(
            r#"
            UPDATE matches
            SET player1_disconnects = player1_disconnects + CASE WHEN player1_id = $2 THEN 1 ELSE 0 END,
                player2_disconnects = player2_disconnects + CASE WHEN player2_id = $2 THEN 1 ELSE 0 END,
                updated_at = NOW()
            WHERE id = $1 AND (player1_id = $2 OR player2_id = $2)
            RETURNING
                CASE WHEN player1_id = $2 THEN player1_disconnects ELSE player2_disconnects END,
                status,
                player1_ready,
                player2_ready,
                green_light_time,
                (EXTRACT(EPOCH FROM (NOW() - created_at)) * 1000)::BIGINT
            "#,
        )
        .bind(match_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(ApiError::database_error)?;

        let Some((count, status, p1_ready, p2_ready, green_light, age_ms)) = row else {
            return Err(ApiError::not_found("Match not found"));
        };

        if count <= self.game.max_hard_reconnects {
            return Ok(DisconnectClass::Hard { count });
        }

        // Rapid client remounts during initial funding are forgiven.
        let funding_grace = status == "funding"
            && !p1_ready
            && !p2_ready
            && green_light.is_none()
            && age_ms < self.game.min_funding_duration_ms;

        if funding_grace {
            debug!(match_id = %match_id, count = count, "Reconnect budget exceeded inside funding grace");
            Ok(DisconnectClass::Hard { count })
        } else {
            warn!(match_id = %match_id, user_id = %user_id, count = count, "Reconnect budget exhausted");
            Ok(DisconnectClass::ExceededBudget { count })
        }
    }
}

fn redis_error(err: redis::RedisError) -> ApiError {
    ApiError::internal_error(format!("Redis error: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_partitions_by_user_and_stake() {
        let user = Uuid::new_v4();
        assert!(SessionService::active_match_key(user).starts_with("active_match:"));
        assert!(SessionService::active_socket_key(user).starts_with("active_socket:"));
        let key = SessionService::queue_disconnect_key(user, "0.5");
        assert!(key.ends_with(":0.5"));
        assert!(key.contains(&user.to_string()));
    }

    #[test]
    fn disconnect_class_carries_count() {
        match (DisconnectClass::Hard { count: 2 }, DisconnectClass::ExceededBudget { count: 6 }) {
            (DisconnectClass::Hard { count: a }, DisconnectClass::ExceededBudget { count: b }) => {
                assert_eq!(a, 2);
                assert_eq!(b, 6);
            }
            _ => unreachable!(),
        }
    }
}

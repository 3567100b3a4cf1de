//! Matchmaking queue.
//!
//! Per-stake FIFO with TTL. Queue rows in the store are authoritative; the
//! in-process deques are caches validated against the row on every pop and
//! rebuilt lazily after a restart. The single-active-match gate lives in the
//! session coordinator.

use crate::api_error::ApiError;
use crate::config::GameConfig;
use crate::db::DbPool;
use crate::models::queue::{MatchQueueEntry, QueueStatus};
use crate::service::session_service::SessionService;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct QueueTicket {
    entry_id: Uuid,
    user_id: Uuid,
}

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    Searching,
    Paired {
        /// The head-of-queue opponent; they become player 1.
        opponent_id: Uuid,
        opponent_entry_id: Uuid,
        own_entry_id: Uuid,
    },
}

pub struct MatchmakingService {
    pool: DbPool,
    sessions: Arc<SessionService>,
    game: GameConfig,
    queues: Mutex<HashMap<String, VecDeque<QueueTicket>>>,
}

/// Canonical partition key for a stake amount.
pub fn stake_key(stake: &Decimal) -> String {
    stake.normalize().to_string()
}

impl MatchmakingService {
    pub fn new(pool: DbPool, sessions: Arc<SessionService>, game: GameConfig) -> Self {
        Self {
            pool,
            sessions,
            game,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue a user at the given stake, pairing immediately when an
    /// opponent is waiting.
    pub async fn enqueue(&self, user_id: Uuid, stake: Decimal) -> Result<EnqueueOutcome, ApiError> {
        if stake.is_sign_negative() {
            return Err(ApiError::bad_request("Stake must be non-negative"));
        }

        if let Some(active) = self.sessions.get_active_match(user_id).await? {
            return Err(ApiError::conflict(
                "already_in_match",
                format!("User already has active match {}", active),
            ));
        }

        // Re-enqueue while already searching is idempotent.
        if let Some(existing) = self.searching_entry(user_id).await? {
            if !existing.is_expired(Utc::now()) {
                debug!(user_id = %user_id, "Already searching, enqueue is a no-op");
                return Ok(EnqueueOutcome::Searching);
            }
        }

        if let Some(opponent) = self.find_match(user_id, &stake).await? {
            let own_entry_id = self.insert_entry(user_id, &stake, QueueStatus::Matched).await?;
            self.mark_entry(opponent.entry_id, QueueStatus::Matched).await?;
            info!(
                user_id = %user_id,
                opponent = %opponent.user_id,
                stake = %stake,
                "Matchmaking pair found"
            );
            return Ok(EnqueueOutcome::Paired {
                opponent_id: opponent.user_id,
                opponent_entry_id: opponent.entry_id,
                own_entry_id,
            });
        }

        let entry_id = self.insert_entry(user_id, &stake, QueueStatus::Searching).await?;
        self.push_ticket(&stake, QueueTicket { entry_id, user_id });
        info!(user_id = %user_id, stake = %stake, "Enqueued for matchmaking");
        Ok(EnqueueOutcome::Searching)
    }

    /// Pop the next live opponent from the stake queue. Stale or dead heads
    /// are discarded as they surface; a head that is the caller's own ticket
    /// is pushed back and the search reports empty.
    async fn find_match(
        &self,
        user_id: Uuid,
        stake: &Decimal,
    ) -> Result<Option<QueueTicket>, ApiError> {
        let key = stake_key(stake);

        self.ensure_cache(&key, stake).await?;

        loop {
            let ticket = {
                let mut queues = self.queues.lock().unwrap();
                queues.get_mut(&key).and_then(|q| q.pop_front())
            };
            let Some(ticket) = ticket else {
                return Ok(None);
            };

            if ticket.user_id == user_id {
                let mut queues = self.queues.lock().unwrap();
                queues.entry(key).or_default().push_front(ticket);
                return Ok(None);
            }

            let Some(entry) = self.entry_by_id(ticket.entry_id).await? else {
                continue;
            };
            if !entry.is_searching() || entry.disconnected_at.is_some() {
                continue;
            }
            if entry.is_expired(Utc::now()) {
                self.mark_entry(entry.id, QueueStatus::Expired).await?;
                debug!(entry_id = %entry.id, "Discarded stale queue entry");
                continue;
            }

            return Ok(Some(ticket));
        }
    }

    /// Cancel a pending search.
    pub async fn cancel(&self, user_id: Uuid, stake: Decimal) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            UPDATE match_queue_entries
            SET status = $3
            WHERE user_id = $1 AND stake = $2 AND status = $4
            "#,
        )
        .bind(user_id)
        .bind(stake)
        .bind(QueueStatus::Cancelled.as_str())
        .bind(QueueStatus::Searching.as_str())
        .execute(&self.pool)
        .await
        .map_err(ApiError::database_error)?;
        info!(user_id = %user_id, "Matchmaking search cancelled");
        Ok(())
    }

    /// Session ended while queued (the entry's TTL lapsed without a cancel
    /// or pair-up): keep the entry and start the grace clock instead of
    /// removing it.
    async fn mark_disconnected(&self, entry: &MatchQueueEntry) -> Result<(), ApiError> {
        sqlx::query("UPDATE match_queue_entries SET disconnected_at = NOW() WHERE id = $1")
            .bind(entry.id)
            .execute(&self.pool)
            .await
            .map_err(ApiError::database_error)?;
        self.sessions
            .mark_queue_disconnect(entry.user_id, &stake_key(&entry.stake))
            .await?;
        debug!(user_id = %entry.user_id, entry_id = %entry.id, "Queue entry marked disconnected");
        Ok(())
    }

    /// Reconnect within the grace period restores the entry in place: its
    /// original queue position is preserved because the ticket was never
    /// removed, and the TTL restarts.
    pub async fn restore_on_reconnect(
        &self,
        user_id: Uuid,
        stake: Decimal,
    ) -> Result<bool, ApiError> {
        let key = stake_key(&stake);
        if !self.sessions.take_queue_disconnect(user_id, &key).await? {
            return Ok(false);
        }
        let expires_at = Utc::now() + Duration::milliseconds(self.game.matchmaking_timeout_ms);
        let restored = sqlx::query(
            r#"
            UPDATE match_queue_entries
            SET disconnected_at = NULL, expires_at = $4
            WHERE user_id = $1 AND stake = $2 AND status = $3 AND disconnected_at IS NOT NULL
            "#,
        )
        .bind(user_id)
        .bind(stake)
        .bind(QueueStatus::Searching.as_str())
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(ApiError::database_error)?;
        if restored.rows_affected() > 0 {
            info!(user_id = %user_id, "Queue entry restored after reconnect");
        }
        Ok(restored.rows_affected() > 0)
    }

    /// Queue housekeeping, run by the maintenance sweep: lapsed entries get
    /// the disconnect grace first, then are physically removed.
    pub async fn gc(&self) -> Result<u64, ApiError> {
        let lapsed = sqlx::query_as::<_, MatchQueueEntry>(
            r#"
            SELECT id, user_id, stake, status, disconnected_at, created_at, expires_at
            FROM match_queue_entries
            WHERE status = $1 AND disconnected_at IS NULL AND expires_at <= NOW()
            "#,
        )
        .bind(QueueStatus::Searching.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::database_error)?;
        for entry in &lapsed {
            self.mark_disconnected(entry).await?;
        }

        let grace = Duration::seconds(self.game.queue_grace_period_secs as i64);
        let expired = sqlx::query(
            "UPDATE match_queue_entries SET status = $1 WHERE status = $2 AND disconnected_at <= $3",
        )
        .bind(QueueStatus::Expired.as_str())
        .bind(QueueStatus::Searching.as_str())
        .bind(Utc::now() - grace)
        .execute(&self.pool)
        .await
        .map_err(ApiError::database_error)?;

        let purged = sqlx::query(
            "DELETE FROM match_queue_entries WHERE status != $1 AND created_at < NOW() - INTERVAL '1 hour'",
        )
        .bind(QueueStatus::Searching.as_str())
        .execute(&self.pool)
        .await
        .map_err(ApiError::database_error)?;

        Ok(expired.rows_affected() + purged.rows_affected())
    }

    async fn insert_entry(
        &self,
        user_id: Uuid,
        stake: &Decimal,
        status: QueueStatus,
    ) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        let expires_at = Utc::now() + Duration::milliseconds(self.game.matchmaking_timeout_ms);
        sqlx::query(
            r#"
            INSERT INTO match_queue_entries (id, user_id, stake, status, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(stake)
        .bind(status.as_str())
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(ApiError::database_error)?;
        Ok(id)
    }

    async fn mark_entry(&self, entry_id: Uuid, status: QueueStatus) -> Result<(), ApiError> {
        sqlx::query("UPDATE match_queue_entries SET status = $2 WHERE id = $1")
            .bind(entry_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(ApiError::database_error)?;
        Ok(())
    }

    async fn entry_by_id(&self, entry_id: Uuid) -> Result<Option<MatchQueueEntry>, ApiError> {
        sqlx::query_as::<_, MatchQueueEntry>(
            r#"
            SELECT id, user_id, stake, status, disconnected_at, created_at, expires_at
            FROM match_queue_entries
            WHERE id = $1
            "#,
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(ApiError::database_error)
    }

    async fn searching_entry(&self, user_id: Uuid) -> Result<Option<MatchQueueEntry>, ApiError> {
        sqlx::query_as::<_, MatchQueueEntry>(
            r#"
            SELECT id, user_id, stake, status, disconnected_at, created_at, expires_at
            FROM match_queue_entries
            WHERE user_id = $1 AND status = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(QueueStatus::Searching.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(ApiError::database_error)
    }

    fn push_ticket(&self, stake: &Decimal, ticket: QueueTicket) {
        let mut queues = self.queues.lock().unwrap();
        queues.entry(stake_key(stake)).or_default().push_back(ticket);
    }

    /// Rebuild the in-process queue from the store when it is empty, so a
    /// restarted instance keeps serving waiting players in FIFO order.
    async fn ensure_cache(&self, key: &str, stake: &Decimal) -> Result<(), ApiError> {
        {
            let queues = self.queues.lock().unwrap();
            if queues.get(key).map(|q| !q.is_empty()).unwrap_or(false) {
                return Ok(());
            }
        }

        let rows = sqlx::query_as::<_, MatchQueueEntry>(
            r#"
            SELECT id, user_id, stake, status, disconnected_at, created_at, expires_at
            FROM match_queue_entries
            WHERE stake = $1 AND status = $2 AND expires_at > NOW()
            ORDER BY created_at ASC
            "#,
        )
        .bind(stake)
        .bind(QueueStatus::Searching.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::database_error)?;

        if rows.is_empty() {
            return Ok(());
        }

        let mut queues = self.queues.lock().unwrap();
        let queue = queues.entry(key.to_string()).or_default();
        for row in rows {
            if !queue.iter().any(|t| t.entry_id == row.id) {
                queue.push_back(QueueTicket {
                    entry_id: row.id,
                    user_id: row.user_id,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn stake_key_normalizes_trailing_zeros() {
        let a = Decimal::from_str("0.50").unwrap();
        let b = Decimal::from_str("0.5").unwrap();
        assert_eq!(stake_key(&a), stake_key(&b));
        assert_eq!(stake_key(&Decimal::ZERO), "0");
    }

    #[test]
    fn enqueue_outcome_shapes() {
        let paired = EnqueueOutcome::Paired {
            opponent_id: Uuid::new_v4(),
            opponent_entry_id: Uuid::new_v4(),
            own_entry_id: Uuid::new_v4(),
        };
        match paired {
            EnqueueOutcome::Paired { opponent_id, .. } => {
                assert_ne!(opponent_id, Uuid::nil());
            }
            EnqueueOutcome::Searching => unreachable!(),
        }
    }
}

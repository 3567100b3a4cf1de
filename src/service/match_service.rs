//! Match orchestrator.
//!
//! Owns the per-match engine: idempotent creation, stake confirmation,
//! ready/signal scheduling, tap recording, winner determination, settlement
//! handoff, and the claim/refund controllers. Every state transition is
//! serialized by a row lock on the match row; tap inserts are
//! first-write-wins through the unique (match_id, user_id) constraint.

use crate::api_error::ApiError;
use crate::config::GameConfig;
use crate::db::DbPool;
use crate::models::match_model::*;
use crate::models::payment::{PaymentIntent, RefundStatus};
use crate::models::tap_event::{TapEvent, TapOutcome};
use crate::service::anti_cheat::{self, AntiCheatService};
use crate::service::escrow_service::{EscrowCallResult, EscrowService};
use crate::service::session_service::SessionService;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use rust_decimal::Decimal;
use sqlx::{Postgres, Transaction};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MATCH_COLS: &str = "id, idempotency_key, player1_id, player2_id, player1_wallet, player2_wallet, \
     stake_amount, status, green_light_time, signal_delay_ms, winner_id, result_type, completed_at, \
     player1_ready, player2_ready, player1_ready_at, player2_ready_at, player1_staked, player2_staked, \
     player1_disqualified, player2_disqualified, player1_reaction_ms, player2_reaction_ms, fee_amount, \
     claim_status, claim_deadline, winner_wallet, loser_wallet, player1_last_ping, player2_last_ping, \
     player1_disconnects, player2_disconnects, cancel_reason, created_at, updated_at";

const TAP_COLS: &str = "id, match_id, user_id, client_timestamp, server_timestamp, reaction_ms, \
     is_valid, disqualified, disqualify_reason, created_at";

/// Identity snapshot used at match creation; wallets are frozen then.
#[derive(Debug, Clone)]
pub struct PlayerRef {
    pub id: Uuid,
    pub wallet: String,
}

pub struct MatchService {
    pool: DbPool,
    escrow: Arc<EscrowService>,
    sessions: Arc<SessionService>,
    anti_cheat: Arc<AntiCheatService>,
    game: GameConfig,
    /// Per-(match, player) tap-attempt stamps for spam detection. A hint;
    /// cleared opportunistically.
    tap_attempts: Mutex<HashMap<(Uuid, Uuid), VecDeque<i64>>>,
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Platform fee on the full pot.
pub fn platform_fee(pot: Decimal, percent: u32) -> Decimal {
    (pot * Decimal::from(percent) / Decimal::from(100)).round_dp(6)
}

/// Refund amount for a round that was actually played to a no-winner
/// outcome: each side's deposit minus the per-side platform fee.
pub fn refund_after_play(stake: Decimal, percent: u32) -> Decimal {
    stake - platform_fee(stake, percent)
}

/// Derived sub-state for the polling endpoint.
pub fn derive_sub_state(
    status: MatchStatus,
    both_ready: bool,
    green_light_time: Option<i64>,
    now_ms: i64,
    countdown_duration_ms: i64,
) -> (String, bool, Option<i64>) {
    match status {
        MatchStatus::Matched | MatchStatus::Funding => ("funding".to_string(), false, None),
        MatchStatus::Ready => {
            let state = if both_ready {
                "waiting_for_go"
            } else {
                "waiting_for_ready"
            };
            (state.to_string(), false, None)
        }
        MatchStatus::Started => match green_light_time {
            Some(green) => {
                let delta = green - now_ms;
                if delta > countdown_duration_ms {
                    ("waiting_for_go".to_string(), false, None)
                } else if delta > 0 {
                    let seconds = (delta + 999) / 1000;
                    ("countdown".to_string(), false, Some(seconds))
                } else {
                    ("go".to_string(), true, None)
                }
            }
            None => ("waiting_for_go".to_string(), false, None),
        },
        MatchStatus::Completed => ("completed".to_string(), false, None),
        MatchStatus::Cancelled => ("cancelled".to_string(), false, None),
        MatchStatus::Refunded => ("refunded".to_string(), false, None),
    }
}

/// Store-backed liveness: a player counts as connected while their last ping
/// (or, before any ping, the match creation) is within the disconnect
/// threshold.
pub fn is_player_live(
    last_ping: Option<DateTime<Utc>>,
    match_created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    threshold_ms: i64,
) -> bool {
    let reference = last_ping.unwrap_or(match_created_at);
    (now - reference).num_milliseconds() < threshold_ms
}

enum ResolveOutcome {
    Resolved,
    AlreadyTerminal,
    NotReady,
}

impl MatchService {
    pub fn new(
        pool: DbPool,
        escrow: Arc<EscrowService>,
        sessions: Arc<SessionService>,
        anti_cheat: Arc<AntiCheatService>,
        game: GameConfig,
    ) -> Self {
        Self {
            pool,
            escrow,
            sessions,
            anti_cheat,
            game,
            tap_attempts: Mutex::new(HashMap::new()),
        }
    }

    // =========================================================================
    // USERS
    // =========================================================================

    /// Upsert the user row on first authenticated contact.
    pub async fn ensure_user(&self, user_id: Uuid, wallet: &str) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, wallet_address)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET wallet_address = EXCLUDED.wallet_address, updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(wallet)
        .execute(&self.pool)
        .await
        .map_err(ApiError::database_error)?;
        Ok(())
    }

    pub async fn user_wallet(&self, user_id: Uuid) -> Result<String, ApiError> {
        sqlx::query_scalar::<_, String>("SELECT wallet_address FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ApiError::database_error)?
            .ok_or_else(|| ApiError::not_found("User not found"))
    }

    // =========================================================================
    // CREATION
    // =========================================================================

    /// Create a match for a freshly paired couple. Idempotent on the key:
    /// replays return the existing match.
    pub async fn create_for_pair(
        &self,
        player1: PlayerRef,
        player2: PlayerRef,
        stake: Decimal,
        idempotency_key: Option<String>,
    ) -> Result<MatchEntity, ApiError> {
        if player1.id == player2.id {
            return Err(ApiError::bad_request("A match requires two distinct players"));
        }
        if stake.is_sign_negative() {
            return Err(ApiError::bad_request("Stake must be non-negative"));
        }

        if let Some(ref key) = idempotency_key {
            if let Some(existing) = self.match_by_idempotency_key(key).await? {
                info!(
                    idempotency_key = %key,
                    match_id = %existing.id,
                    "Returning existing match for idempotent request"
                );
                return Ok(existing);
            }
        }

        let match_id = Uuid::new_v4();
        let entity = sqlx::query_as::<_, MatchEntity>(&format!(
            r#"
            INSERT INTO matches (id, idempotency_key, player1_id, player2_id,
                                 player1_wallet, player2_wallet, stake_amount, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {MATCH_COLS}
            "#
        ))
        .bind(match_id)
        .bind(&idempotency_key)
        .bind(player1.id)
        .bind(player2.id)
        .bind(&player1.wallet)
        .bind(&player2.wallet)
        .bind(stake)
        .bind(MatchStatus::Matched.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(ApiError::database_error)?;

        let correlation_id = entity.correlation_id();
        info!(
            match_id = %match_id,
            player1 = %player1.id,
            player2 = %player2.id,
            stake = %stake,
            correlation_id = %correlation_id,
            "Match created"
        );
        self.record_transition_row(&entity, MatchStatus::Matched, MatchStatus::Matched, Some("created"))
            .await?;

        if !entity.is_free() {
            let chain = self
                .escrow_once("escrow_create", match_id, Some(stake * Decimal::from(2)), || {
                    self.escrow
                        .create_match(match_id, &player1.wallet, &player2.wallet, stake)
                })
                .await;

            match chain {
                Ok(result) if result.ok => {
                    let mut tx = self.begin().await?;
                    let locked = self.lock_match(&mut tx, match_id).await?;
                    self.apply_transition(&mut tx, &locked, MatchStatus::Funding, Some("stake_required"))
                        .await?;
                    tx.commit().await.map_err(ApiError::database_error)?;
                }
                Ok(result) => {
                    error!(match_id = %match_id, error = ?result.error, "Escrow registration rejected");
                    self.cancel_match(match_id, "escrow_create_failed").await?;
                    return Err(ApiError::internal_error("Escrow registration failed"));
                }
                Err(e) => {
                    error!(match_id = %match_id, error = %e, "Escrow registration failed");
                    self.cancel_match(match_id, "escrow_create_failed").await?;
                    return Err(e);
                }
            }
        } else {
            let mut tx = self.begin().await?;
            let locked = self.lock_match(&mut tx, match_id).await?;
            self.apply_transition(&mut tx, &locked, MatchStatus::Ready, Some("free_match"))
                .await?;
            tx.commit().await.map_err(ApiError::database_error)?;
        }

        self.sessions.set_active_match(player1.id, match_id).await?;
        self.sessions.set_active_match(player2.id, match_id).await?;

        self.match_by_id(match_id).await
    }

    // =========================================================================
    // FUNDING
    // =========================================================================

    /// Link a confirmed payment intent to the match and set the caller's
    /// stake flag. When the second flag lands, escrow is verified and the
    /// match moves to READY (or is cancelled with refund eligibility).
    pub async fn confirm_stake(
        &self,
        user_id: Uuid,
        match_id: Uuid,
        payment_reference: &str,
    ) -> Result<ConfirmStakeResponse, ApiError> {
        let became_both_staked;
        {
            let mut tx = self.begin().await?;
            let entity = self.lock_match(&mut tx, match_id).await?;
            let slot = entity
                .slot_of(user_id)
                .ok_or_else(|| ApiError::forbidden("Not a participant in this match"))?;
            let status = self.status_of(&entity)?;

            // Replays after the flag landed return identical flags.
            let already = match slot {
                PlayerSlot::One => entity.player1_staked,
                PlayerSlot::Two => entity.player2_staked,
            };
            if already {
                let can_start = matches!(status, MatchStatus::Ready | MatchStatus::Started);
                return Ok(ConfirmStakeResponse {
                    success: true,
                    both_staked: entity.both_staked(),
                    can_start,
                });
            }

            if status != MatchStatus::Funding {
                return Err(ApiError::precondition(
                    "match_not_funding",
                    format!("Match is {}, stakes cannot be confirmed", status),
                ));
            }

            let intent = sqlx::query_as::<_, PaymentIntent>(&format!(
                "SELECT {cols} FROM payment_intents WHERE reference = $1 FOR UPDATE",
                cols = crate::service::payment_service::INTENT_COLS
            ))
            .bind(payment_reference)
            .fetch_optional(&mut *tx)
            .await
            .map_err(ApiError::database_error)?
            .ok_or_else(|| ApiError::not_found("Payment not found"))?;

            if intent.user_id != user_id {
                return Err(ApiError::forbidden("Payment belongs to another user"));
            }
            if !intent.is_confirmed() {
                return Err(ApiError::precondition(
                    "payment_not_confirmed",
                    format!("Payment is {}", intent.normalized_status),
                ));
            }
            if intent.amount != entity.stake_amount {
                return Err(ApiError::bad_request(format!(
                    "Stake mismatch: payment {} vs match {}",
                    intent.amount, entity.stake_amount
                )));
            }
            match intent.match_id {
                None => {
                    sqlx::query("UPDATE payment_intents SET match_id = $2, updated_at = NOW() WHERE id = $1")
                        .bind(intent.id)
                        .bind(match_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(ApiError::database_error)?;
                }
                Some(linked) if linked != match_id => {
                    return Err(ApiError::conflict(
                        "payment_already_linked",
                        "Payment is linked to another match",
                    ));
                }
                Some(_) => {}
            }

            let column = match slot {
                PlayerSlot::One => "player1_staked",
                PlayerSlot::Two => "player2_staked",
            };
            sqlx::query(&format!(
                "UPDATE matches SET {column} = TRUE, updated_at = NOW() WHERE id = $1"
            ))
            .bind(match_id)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::database_error)?;

            became_both_staked = match slot {
                PlayerSlot::One => entity.player2_staked,
                PlayerSlot::Two => entity.player1_staked,
            };
            tx.commit().await.map_err(ApiError::database_error)?;
            info!(match_id = %match_id, user_id = %user_id, "Stake confirmed");
        }

        let mut can_start = false;
        if became_both_staked {
            can_start = self.verify_escrow_and_advance(match_id).await?;
        }

        let entity = self.match_by_id(match_id).await?;
        Ok(ConfirmStakeResponse {
            success: true,
            both_staked: entity.both_staked(),
            can_start,
        })
    }

    /// Escrow gate for FUNDING -> READY. The verification round-trip runs
    /// outside any row lock; the transition re-validates under the lock.
    async fn verify_escrow_and_advance(&self, match_id: Uuid) -> Result<bool, ApiError> {
        let entity = self.match_by_id(match_id).await?;
        let failure = match self.escrow.get_match(match_id).await {
            Ok(Some(state)) => {
                let amount_delta = (state.stake_amount - entity.stake_amount).abs();
                if state.completed || state.cancelled {
                    Some("escrow already settled".to_string())
                } else if !(state.player1_staked && state.player2_staked) {
                    Some("deposits missing on chain".to_string())
                } else if amount_delta > Decimal::new(1, 3) {
                    Some(format!("stake amount mismatch: {}", amount_delta))
                } else {
                    None
                }
            }
            Ok(None) => Some("match not registered on chain".to_string()),
            Err(e) => Some(e.to_string()),
        };

        let mut tx = self.begin().await?;
        let locked = self.lock_match(&mut tx, match_id).await?;
        if self.status_of(&locked)? != MatchStatus::Funding {
            // Raced with a watchdog; nothing to do.
            return Ok(matches!(self.status_of(&locked)?, MatchStatus::Ready | MatchStatus::Started));
        }

        match failure {
            None => {
                self.apply_transition(&mut tx, &locked, MatchStatus::Ready, Some("escrow_verified"))
                    .await?;
                tx.commit().await.map_err(ApiError::database_error)?;
                info!(match_id = %match_id, "Escrow verified, match ready");
                Ok(true)
            }
            Some(reason) => {
                warn!(match_id = %match_id, reason = %reason, "Escrow verification failed");
                self.apply_transition(
                    &mut tx,
                    &locked,
                    MatchStatus::Cancelled,
                    Some("escrow_verification_failed"),
                )
                .await?;
                self.set_cancel_reason(&mut tx, match_id, "escrow_verification_failed")
                    .await?;
                self.mark_refund_eligibility(&mut tx, &locked, false, "escrow_verification_failed")
                    .await?;
                tx.commit().await.map_err(ApiError::database_error)?;
                self.clear_sessions(&locked).await;
                Ok(false)
            }
        }
    }

    // =========================================================================
    // READY & SIGNAL
    // =========================================================================

    /// Set the caller's ready flag under the match row lock. The second
    /// ready schedules the green light atomically in the same transaction;
    /// `green_light_time` is set exactly once per match.
    pub async fn ready(&self, user_id: Uuid, match_id: Uuid) -> Result<ReadyResponse, ApiError> {
        let mut tx = self.begin().await?;
        let entity = self.lock_match(&mut tx, match_id).await?;
        let slot = entity
            .slot_of(user_id)
            .ok_or_else(|| ApiError::forbidden("Not a participant in this match"))?;
        let status = self.status_of(&entity)?;

        match status {
            MatchStatus::Ready => {}
            MatchStatus::Started => {
                let already_ready = match slot {
                    PlayerSlot::One => entity.player1_ready,
                    PlayerSlot::Two => entity.player2_ready,
                };
                if already_ready {
                    return Ok(ReadyResponse {
                        success: true,
                        both_ready: true,
                        green_light_time: entity.green_light_time,
                        random_delay: entity.signal_delay_ms,
                    });
                }
                return Err(ApiError::precondition(
                    "match_already_started",
                    "Signal already scheduled",
                ));
            }
            MatchStatus::Matched | MatchStatus::Funding => {
                return Err(ApiError::precondition(
                    "stakes_not_confirmed",
                    "Both stakes must be confirmed before ready",
                ));
            }
            other => {
                return Err(ApiError::precondition(
                    "match_not_active",
                    format!("Match is {}", other),
                ));
            }
        }

        let column = match slot {
            PlayerSlot::One => ("player1_ready", "player1_ready_at"),
            PlayerSlot::Two => ("player2_ready", "player2_ready_at"),
        };
        sqlx::query(&format!(
            "UPDATE matches SET {flag} = TRUE, {at} = COALESCE({at}, NOW()), updated_at = NOW() WHERE id = $1",
            flag = column.0,
            at = column.1
        ))
        .bind(match_id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::database_error)?;

        let other_ready = match slot {
            PlayerSlot::One => entity.player2_ready,
            PlayerSlot::Two => entity.player1_ready,
        };

        if !other_ready {
            tx.commit().await.map_err(ApiError::database_error)?;
            info!(match_id = %match_id, user_id = %user_id, "Player ready, waiting for opponent");
            return Ok(ReadyResponse {
                success: true,
                both_ready: false,
                green_light_time: None,
                random_delay: None,
            });
        }

        if entity.green_light_time.is_some() {
            return Err(ApiError::conflict(
                "signal_already_scheduled",
                "Green light already set for this match",
            ));
        }

        // READY -> STARTED requires both connections live.
        let now = Utc::now();
        let both_live = is_player_live(
            entity.player1_last_ping,
            entity.created_at,
            now,
            self.game.disconnect_threshold_ms,
        ) && is_player_live(
            entity.player2_last_ping,
            entity.created_at,
            now,
            self.game.disconnect_threshold_ms,
        );
        if !both_live {
            tx.commit().await.map_err(ApiError::database_error)?;
            warn!(match_id = %match_id, "Both ready but a connection is stale; start deferred");
            return Ok(ReadyResponse {
                success: true,
                both_ready: true,
                green_light_time: None,
                random_delay: None,
            });
        }

        let delay: i64 =
            OsRng.gen_range(self.game.signal_delay_min_ms..=self.game.signal_delay_max_ms);
        let green_light_time = now_ms() + self.game.countdown_duration_ms + delay;

        sqlx::query(
            "UPDATE matches SET green_light_time = $2, signal_delay_ms = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(match_id)
        .bind(green_light_time)
        .bind(delay)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::database_error)?;

        self.apply_transition(&mut tx, &entity, MatchStatus::Started, Some("both_ready"))
            .await?;
        tx.commit().await.map_err(ApiError::database_error)?;

        info!(
            match_id = %match_id,
            green_light_time = green_light_time,
            random_delay_ms = delay,
            correlation_id = %entity.correlation_id(),
            "Signal scheduled"
        );

        Ok(ReadyResponse {
            success: true,
            both_ready: true,
            green_light_time: Some(green_light_time),
            random_delay: Some(delay),
        })
    }

    // =========================================================================
    // STATE POLLING
    // =========================================================================

    pub async fn get_state(
        &self,
        user_id: Uuid,
        match_id: Uuid,
    ) -> Result<MatchStateResponse, ApiError> {
        let entity = self.match_by_id(match_id).await?;
        let slot = entity
            .slot_of(user_id)
            .ok_or_else(|| ApiError::forbidden("Not a participant in this match"))?;
        let status = self.status_of(&entity)?;

        let taps: Vec<Uuid> =
            sqlx::query_scalar("SELECT user_id FROM tap_events WHERE match_id = $1")
                .bind(match_id)
                .fetch_all(&self.pool)
                .await
                .map_err(ApiError::database_error)?;

        let opponent_slot = slot.other();
        let server_time = now_ms();
        let (state, green_light_active, countdown) = derive_sub_state(
            status,
            entity.both_ready(),
            entity.green_light_time,
            server_time,
            self.game.countdown_duration_ms,
        );

        Ok(MatchStateResponse {
            match_id,
            state,
            status: entity.status.clone(),
            stake_amount: entity.stake_amount,
            green_light_time: entity.green_light_time,
            green_light_active,
            countdown,
            player_tapped: taps.contains(&user_id),
            opponent_tapped: taps.contains(&entity.player_id(opponent_slot)),
            winner_id: entity.winner_id,
            result_type: entity.result_type.clone(),
            server_time,
            opponent: OpponentInfo {
                user_id: entity.player_id(opponent_slot),
                wallet: entity.wallet(opponent_slot).to_string(),
            },
            state_locked: status.is_terminal(),
            claim_status: entity.claim_status.clone(),
            claim_deadline: entity.claim_deadline,
            cancel_reason: entity.cancel_reason.clone(),
        })
    }

    // =========================================================================
    // TAP
    // =========================================================================

    pub async fn tap(
        &self,
        user_id: Uuid,
        match_id: Uuid,
        client_timestamp: Option<i64>,
    ) -> Result<TapResponse, ApiError> {
        let server_now = now_ms();

        if self.note_tap_attempt(match_id, user_id, server_now) {
            self.audit_finding(user_id, match_id, "spam_tapping", serde_json::json!({}));
            return Err(ApiError::rate_limited("Too many tap attempts"));
        }

        let entity = self.match_by_id(match_id).await?;
        let slot = entity
            .slot_of(user_id)
            .ok_or_else(|| ApiError::forbidden("Not a participant in this match"))?;

        // Replays return the original event untouched, whatever happened since.
        if let Some(existing) = self.tap_by_player(match_id, user_id).await? {
            let opponent_tapped = self
                .tap_by_player(match_id, entity.player_id(slot.other()))
                .await?
                .is_some();
            return Ok(TapResponse {
                success: true,
                tap: TapOutcome::from(&existing),
                waiting_for_opponent: !opponent_tapped,
                disqualified: existing.disqualified.then_some(true),
                reason: existing.disqualify_reason.clone(),
            });
        }

        let status = self.status_of(&entity)?;
        if status != MatchStatus::Started {
            return Err(ApiError::precondition(
                "match_not_started",
                format!("Match is {}", status),
            ));
        }
        let green = entity.green_light_time.ok_or_else(|| {
            ApiError::precondition("signal_not_sent", "Green light not scheduled")
        })?;

        let raw_reaction = server_now - green;
        if raw_reaction > self.game.max_tap_window_ms {
            return Err(ApiError::precondition(
                "window_expired",
                "Tap window has expired",
            ));
        }

        let check = anti_cheat::validate_reaction(server_now, green, &self.game);

        if let Some(client_ts) = client_timestamp {
            if client_ts <= 0 {
                return Err(ApiError::bad_request("Invalid client timestamp"));
            }
            if !check.disqualifies() {
                let client_reaction = client_ts - green;
                if let Err(discrepancy) =
                    anti_cheat::check_timing_discrepancy(client_reaction, raw_reaction)
                {
                    self.audit_finding(
                        user_id,
                        match_id,
                        "timing_discrepancy",
                        serde_json::json!({ "discrepancy_ms": discrepancy }),
                    );
                    return Err(ApiError::bad_request(format!(
                        "Timing discrepancy too large: {} ms",
                        discrepancy
                    )));
                }
            }
        }

        let (event, inserted) = if check.disqualifies() {
            self.insert_tap(
                match_id,
                user_id,
                client_timestamp,
                server_now,
                -1,
                false,
                true,
                Some("early_tap"),
            )
            .await?
        } else {
            self.insert_tap(
                match_id,
                user_id,
                client_timestamp,
                server_now,
                check.reaction_ms,
                check.valid,
                false,
                None,
            )
            .await?
        };

        if !inserted {
            // Lost the first-write race; the stored row wins.
            let opponent_tapped = self
                .tap_by_player(match_id, entity.player_id(slot.other()))
                .await?
                .is_some();
            return Ok(TapResponse {
                success: true,
                tap: TapOutcome::from(&event),
                waiting_for_opponent: !opponent_tapped,
                disqualified: event.disqualified.then_some(true),
                reason: event.disqualify_reason.clone(),
            });
        }

        self.store_tap_on_match(&entity, slot, &event).await?;

        if check.suspicious && !event.disqualified {
            self.audit_finding(
                user_id,
                match_id,
                "suspicious_reaction",
                serde_json::json!({ "reaction_ms": event.reaction_ms }),
            );
        }

        info!(
            match_id = %match_id,
            user_id = %user_id,
            reaction_ms = event.reaction_ms,
            is_valid = event.is_valid,
            disqualified = event.disqualified,
            "Tap recorded"
        );

        let opponent_tap = self
            .tap_by_player(match_id, entity.player_id(slot.other()))
            .await?;
        let mut resolved = false;
        if opponent_tap.is_some() {
            resolved = matches!(self.resolve_match(match_id).await?, ResolveOutcome::Resolved);
        }

        Ok(TapResponse {
            success: true,
            tap: TapOutcome::from(&event),
            waiting_for_opponent: opponent_tap.is_none() && !resolved,
            disqualified: event.disqualified.then_some(true),
            reason: event.disqualify_reason.clone(),
        })
    }

    /// Sliding-window spam detection on tap attempts.
    fn note_tap_attempt(&self, match_id: Uuid, user_id: Uuid, now_ms: i64) -> bool {
        let mut attempts = self.tap_attempts.lock().unwrap();
        let window = attempts.entry((match_id, user_id)).or_default();
        window.push_back(now_ms);
        while window
            .front()
            .map(|&t| now_ms - t >= anti_cheat::SPAM_TAP_WINDOW_MS)
            .unwrap_or(false)
        {
            window.pop_front();
        }
        let burst = window.len();
        let oldest = window.front().copied().unwrap_or(now_ms);
        anti_cheat::detect_spam_tapping(burst, now_ms - oldest + 1)
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_tap(
        &self,
        match_id: Uuid,
        user_id: Uuid,
        client_timestamp: Option<i64>,
        server_timestamp: i64,
        reaction_ms: i64,
        is_valid: bool,
        disqualified: bool,
        reason: Option<&str>,
    ) -> Result<(TapEvent, bool), ApiError> {
        let inserted = sqlx::query_as::<_, TapEvent>(&format!(
            r#"
            INSERT INTO tap_events (id, match_id, user_id, client_timestamp, server_timestamp,
                                    reaction_ms, is_valid, disqualified, disqualify_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (match_id, user_id) DO NOTHING
            RETURNING {TAP_COLS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(match_id)
        .bind(user_id)
        .bind(client_timestamp)
        .bind(server_timestamp)
        .bind(reaction_ms)
        .bind(is_valid)
        .bind(disqualified)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(ApiError::database_error)?;

        match inserted {
            Some(event) => Ok((event, true)),
            None => {
                let existing = self
                    .tap_by_player(match_id, user_id)
                    .await?
                    .ok_or_else(|| ApiError::internal_error("Tap vanished after conflict"))?;
                Ok((existing, false))
            }
        }
    }

    async fn store_tap_on_match(
        &self,
        entity: &MatchEntity,
        slot: PlayerSlot,
        event: &TapEvent,
    ) -> Result<(), ApiError> {
        let (reaction_col, dq_col) = match slot {
            PlayerSlot::One => ("player1_reaction_ms", "player1_disqualified"),
            PlayerSlot::Two => ("player2_reaction_ms", "player2_disqualified"),
        };
        sqlx::query(&format!(
            "UPDATE matches SET {reaction_col} = $2, {dq_col} = $3, updated_at = NOW() WHERE id = $1"
        ))
        .bind(entity.id)
        .bind(event.reaction_ms)
        .bind(event.disqualified)
        .execute(&self.pool)
        .await
        .map_err(ApiError::database_error)?;
        Ok(())
    }

    // =========================================================================
    // WINNER DETERMINATION & SETTLEMENT HANDOFF
    // =========================================================================

    /// Resolve a match once both taps exist. Serialized by the row lock;
    /// losers of the race observe a terminal state and back off.
    async fn resolve_match(&self, match_id: Uuid) -> Result<ResolveOutcome, ApiError> {
        let mut tx = self.begin().await?;
        let entity = self.lock_match(&mut tx, match_id).await?;
        let status = self.status_of(&entity)?;
        if status.is_terminal() {
            return Ok(ResolveOutcome::AlreadyTerminal);
        }
        if status != MatchStatus::Started {
            return Ok(ResolveOutcome::NotReady);
        }

        let taps = self.taps_for_match_locked(&mut tx, match_id).await?;
        let p1 = taps.iter().find(|t| t.user_id == entity.player1_id);
        let p2 = taps.iter().find(|t| t.user_id == entity.player2_id);
        let (Some(p1), Some(p2)) = (p1, p2) else {
            return Ok(ResolveOutcome::NotReady);
        };

        let (winner_slot, result_type) =
            determine_outcome(p1.summary(), p2.summary(), self.game.tie_threshold_ms);
        self.finalize_completed(&mut tx, &entity, winner_slot, result_type)
            .await?;
        tx.commit().await.map_err(ApiError::database_error)?;

        self.post_completion(&entity, winner_slot, result_type).await;
        Ok(ResolveOutcome::Resolved)
    }

    /// Completion bookkeeping inside the transition transaction.
    async fn finalize_completed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entity: &MatchEntity,
        winner_slot: Option<PlayerSlot>,
        result_type: ResultType,
    ) -> Result<(), ApiError> {
        let staked = !entity.is_free();
        let pot = entity.stake_amount * Decimal::from(2);
        let fee = staked.then(|| platform_fee(pot, self.game.platform_fee_percent));
        let claim_deadline = Utc::now() + Duration::seconds(self.game.claim_window_secs);

        let (winner_id, winner_wallet, loser_wallet, claim_status) = match winner_slot {
            Some(slot) => (
                Some(entity.player_id(slot)),
                Some(entity.wallet(slot).to_string()),
                Some(entity.wallet(slot.other()).to_string()),
                staked.then(|| ClaimStatus::Unclaimed.as_str().to_string()),
            ),
            None => (None, None, None, staked.then(|| ClaimStatus::Expired.as_str().to_string())),
        };

        sqlx::query(
            r#"
            UPDATE matches
            SET winner_id = $2, result_type = $3, completed_at = NOW(), fee_amount = $4,
                claim_status = $5, claim_deadline = $6, winner_wallet = $7, loser_wallet = $8,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(entity.id)
        .bind(winner_id)
        .bind(result_type.as_str())
        .bind(fee)
        .bind(&claim_status)
        .bind(staked.then_some(claim_deadline))
        .bind(&winner_wallet)
        .bind(&loser_wallet)
        .execute(&mut **tx)
        .await
        .map_err(ApiError::database_error)?;

        if staked && result_type.is_no_winner() {
            // A played round that nobody won: refund each deposit net of fee.
            self.mark_refund_eligibility(tx, entity, true, result_type.as_str())
                .await?;
        }

        self.apply_transition(tx, entity, MatchStatus::Completed, Some(result_type.as_str()))
            .await?;

        info!(
            match_id = %entity.id,
            winner_id = ?winner_id,
            result_type = %result_type,
            correlation_id = %entity.correlation_id(),
            "Match completed"
        );
        Ok(())
    }

    /// Post-commit effects of completion: stats, liveness keys, pattern sweep.
    async fn post_completion(
        &self,
        entity: &MatchEntity,
        winner_slot: Option<PlayerSlot>,
        _result_type: ResultType,
    ) {
        if let Err(e) = self.update_stats(entity.id, winner_slot).await {
            warn!(match_id = %entity.id, error = %e, "Stats update failed");
        }
        self.clear_sessions(entity).await;

        let anti_cheat = self.anti_cheat.clone();
        let (p1, p2, match_id) = (entity.player1_id, entity.player2_id, entity.id);
        tokio::spawn(async move {
            anti_cheat.sweep_player(p1, match_id).await;
            anti_cheat.sweep_player(p2, match_id).await;
        });
    }

    async fn update_stats(
        &self,
        match_id: Uuid,
        winner_slot: Option<PlayerSlot>,
    ) -> Result<(), ApiError> {
        let entity = self.match_by_id(match_id).await?;
        for slot in [PlayerSlot::One, PlayerSlot::Two] {
            let user_id = entity.player_id(slot);
            let won = winner_slot == Some(slot);
            let lost = winner_slot.is_some() && !won;
            let reaction = match slot {
                PlayerSlot::One => entity.player1_reaction_ms,
                PlayerSlot::Two => entity.player2_reaction_ms,
            }
            .filter(|&r| r >= 0);

            let user = sqlx::query_as::<_, crate::models::user::User>(
                "SELECT id, wallet_address, wins, losses, matches_played, avg_reaction_ms, created_at, updated_at FROM users WHERE id = $1",
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ApiError::database_error)?;
            let Some(user) = user else { continue };

            let avg = reaction.map(|r| user.next_avg_reaction(r)).or(user.avg_reaction_ms);
            sqlx::query(
                r#"
                UPDATE users
                SET wins = wins + $2, losses = losses + $3, matches_played = matches_played + 1,
                    avg_reaction_ms = $4, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(user_id)
            .bind(if won { 1 } else { 0 })
            .bind(if lost { 1 } else { 0 })
            .bind(avg)
            .execute(&self.pool)
            .await
            .map_err(ApiError::database_error)?;
        }
        Ok(())
    }

    // =========================================================================
    // CANCELLATION & REFUNDS
    // =========================================================================

    /// Cancel a non-terminal match. When both deposits sit in escrow the
    /// refund is attempted immediately and a success lands in REFUNDED;
    /// otherwise the match parks in CANCELLED with refund-eligible intents.
    pub async fn cancel_match(&self, match_id: Uuid, reason: &str) -> Result<(), ApiError> {
        let entity = {
            let mut tx = self.begin().await?;
            let entity = self.lock_match(&mut tx, match_id).await?;
            let status = self.status_of(&entity)?;
            if status.is_terminal() {
                return Ok(());
            }
            self.set_cancel_reason(&mut tx, match_id, reason).await?;
            // Pre-signal cancellations refund in full.
            let net_fee = entity.green_light_time.is_some();
            self.mark_refund_eligibility(&mut tx, &entity, net_fee, reason)
                .await?;
            tx.commit().await.map_err(ApiError::database_error)?;
            entity
        };

        let escrow_refundable = !entity.is_free() && entity.both_staked();
        let mut refunded = false;
        if escrow_refundable {
            refunded = self.try_escrow_refund(&entity).await;
        }

        let mut tx = self.begin().await?;
        let locked = self.lock_match(&mut tx, match_id).await?;
        if !self.status_of(&locked)?.is_terminal() {
            let target = if refunded {
                MatchStatus::Refunded
            } else {
                MatchStatus::Cancelled
            };
            self.apply_transition(&mut tx, &locked, target, Some(reason)).await?;
            tx.commit().await.map_err(ApiError::database_error)?;
        }

        self.clear_sessions(&entity).await;
        info!(match_id = %match_id, reason = reason, refunded = refunded, "Match cancelled");
        Ok(())
    }

    /// Pick the escrow operation for a refund: a round that reached its
    /// signal settles as an even split net of fee, anything earlier is a
    /// plain deposit refund.
    async fn escrow_refund_call(&self, entity: &MatchEntity) -> Result<EscrowCallResult, ApiError> {
        let pot = entity.stake_amount * Decimal::from(2);
        if entity.green_light_time.is_some() {
            self.escrow_once("escrow_split", entity.id, Some(pot), || {
                self.escrow.split_pot(entity.id)
            })
            .await
        } else {
            self.escrow_once("escrow_cancel", entity.id, Some(pot), || {
                self.escrow.cancel_match(entity.id)
            })
            .await
        }
    }

    async fn try_escrow_refund(&self, entity: &MatchEntity) -> bool {
        match self.escrow_refund_call(entity).await {
            Ok(result) if result.ok => {
                if let Err(e) = self
                    .settle_refund_intents(entity.id, result.tx_hash.as_deref())
                    .await
                {
                    warn!(match_id = %entity.id, error = %e, "Refund bookkeeping failed");
                }
                true
            }
            Ok(result) => {
                warn!(match_id = %entity.id, error = ?result.error, "Escrow refund rejected");
                false
            }
            Err(e) => {
                warn!(match_id = %entity.id, error = %e, "Escrow refund failed");
                false
            }
        }
    }

    async fn settle_refund_intents(
        &self,
        match_id: Uuid,
        _tx_hash: Option<&str>,
    ) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            UPDATE payment_intents
            SET refund_status = $2, updated_at = NOW()
            WHERE match_id = $1 AND refund_status IN ($3, $4)
            "#,
        )
        .bind(match_id)
        .bind(RefundStatus::Completed.as_str())
        .bind(RefundStatus::Eligible.as_str())
        .bind(RefundStatus::Processing.as_str())
        .execute(&self.pool)
        .await
        .map_err(ApiError::database_error)?;
        Ok(())
    }

    /// Mark confirmed linked intents refund-eligible. `net_fee` applies the
    /// played-round rule (3% of each deposit retained).
    async fn mark_refund_eligibility(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entity: &MatchEntity,
        net_fee: bool,
        reason: &str,
    ) -> Result<(), ApiError> {
        if entity.is_free() {
            return Ok(());
        }
        let amount = if net_fee {
            refund_after_play(entity.stake_amount, self.game.platform_fee_percent)
        } else {
            entity.stake_amount
        };
        let deadline = Utc::now() + Duration::seconds(self.game.refund_window_secs);
        sqlx::query(
            r#"
            UPDATE payment_intents
            SET refund_status = $2, refund_deadline = $3, refund_amount = $4,
                refund_reason = $5, updated_at = NOW()
            WHERE match_id = $1 AND normalized_status = 'confirmed' AND refund_status = 'none'
            "#,
        )
        .bind(entity.id)
        .bind(RefundStatus::Eligible.as_str())
        .bind(deadline)
        .bind(amount)
        .bind(reason)
        .execute(&mut **tx)
        .await
        .map_err(ApiError::database_error)?;
        Ok(())
    }

    /// User-triggered refund of an eligible deposit. One escrow cancel
    /// refunds both sides; bookkeeping marks both intents.
    pub async fn refund(&self, user_id: Uuid, match_id: Uuid) -> Result<RefundResponse, ApiError> {
        let entity = self.match_by_id(match_id).await?;
        if !entity.is_participant(user_id) {
            return Err(ApiError::forbidden("Not a participant in this match"));
        }

        let intent = sqlx::query_as::<_, PaymentIntent>(&format!(
            "SELECT {cols} FROM payment_intents WHERE match_id = $1 AND user_id = $2",
            cols = crate::service::payment_service::INTENT_COLS
        ))
        .bind(match_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(ApiError::database_error)?
        .ok_or_else(|| ApiError::not_found("No payment linked to this match"))?;

        match intent.refund() {
            Some(RefundStatus::Eligible) => {}
            Some(RefundStatus::Completed) => {
                return Ok(RefundResponse {
                    success: true,
                    refund_status: RefundStatus::Completed.as_str().to_string(),
                    refund_amount: intent.refund_amount,
                    tx_hash: None,
                });
            }
            _ => {
                return Err(ApiError::precondition(
                    "not_refund_eligible",
                    format!("Refund status is {}", intent.refund_status),
                ));
            }
        }
        if let Some(deadline) = intent.refund_deadline {
            if Utc::now() > deadline {
                return Err(ApiError::precondition(
                    "refund_window_expired",
                    "Refund window has expired",
                ));
            }
        }

        self.process_refund_for_match(&entity).await?;

        let refreshed = sqlx::query_as::<_, PaymentIntent>(&format!(
            "SELECT {cols} FROM payment_intents WHERE id = $1",
            cols = crate::service::payment_service::INTENT_COLS
        ))
        .bind(intent.id)
        .fetch_one(&self.pool)
        .await
        .map_err(ApiError::database_error)?;

        Ok(RefundResponse {
            success: refreshed.refund() == Some(RefundStatus::Completed),
            refund_status: refreshed.refund_status.clone(),
            refund_amount: refreshed.refund_amount,
            tx_hash: None,
        })
    }

    /// Core refund execution shared by the user endpoint and the expiration
    /// worker. Marks intents processing, cancels escrow once, then settles
    /// or reverts to eligible for a later retry.
    pub async fn process_refund_for_match(&self, entity: &MatchEntity) -> Result<(), ApiError> {
        sqlx::query(
            "UPDATE payment_intents SET refund_status = $2, updated_at = NOW() WHERE match_id = $1 AND refund_status = $3",
        )
        .bind(entity.id)
        .bind(RefundStatus::Processing.as_str())
        .bind(RefundStatus::Eligible.as_str())
        .execute(&self.pool)
        .await
        .map_err(ApiError::database_error)?;

        let result = self.escrow_refund_call(entity).await;

        match result {
            Ok(outcome) if outcome.ok => {
                self.settle_refund_intents(entity.id, outcome.tx_hash.as_deref())
                    .await?;
                let mut tx = self.begin().await?;
                let locked = self.lock_match(&mut tx, entity.id).await?;
                if !self.status_of(&locked)?.is_terminal() {
                    self.apply_transition(&mut tx, &locked, MatchStatus::Refunded, Some("refund_processed"))
                        .await?;
                    tx.commit().await.map_err(ApiError::database_error)?;
                }
                info!(match_id = %entity.id, "Refund processed");
                Ok(())
            }
            Ok(outcome) => {
                self.revert_refund_to_eligible(entity.id, outcome.error.as_deref())
                    .await?;
                Err(ApiError::internal_error(
                    outcome.error.unwrap_or_else(|| "escrow refund rejected".to_string()),
                ))
            }
            Err(e) => {
                self.revert_refund_to_eligible(entity.id, Some(&e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    async fn revert_refund_to_eligible(
        &self,
        match_id: Uuid,
        error: Option<&str>,
    ) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            UPDATE payment_intents
            SET refund_status = $2, refund_reason = COALESCE($3, refund_reason), updated_at = NOW()
            WHERE match_id = $1 AND refund_status = $4
            "#,
        )
        .bind(match_id)
        .bind(RefundStatus::Eligible.as_str())
        .bind(error)
        .bind(RefundStatus::Processing.as_str())
        .execute(&self.pool)
        .await
        .map_err(ApiError::database_error)?;
        Ok(())
    }

    // =========================================================================
    // CLAIM
    // =========================================================================

    /// Winner withdraws the pot within the claim window.
    pub async fn claim(&self, user_id: Uuid, match_id: Uuid) -> Result<ClaimResponse, ApiError> {
        let entity = self.match_by_id(match_id).await?;
        if !entity.is_participant(user_id) {
            return Err(ApiError::forbidden("Not a participant in this match"));
        }
        if self.status_of(&entity)? != MatchStatus::Completed {
            return Err(ApiError::precondition("match_not_completed", "Nothing to claim"));
        }
        if entity.winner_id != Some(user_id) {
            return Err(ApiError::forbidden("Only the winner can claim"));
        }
        if entity.is_free() {
            return Err(ApiError::precondition("free_match", "Free matches have no pot"));
        }

        match entity.claim_status.as_deref().and_then(ClaimStatus::parse) {
            Some(ClaimStatus::Unclaimed) => {}
            Some(ClaimStatus::Claimed) => {
                return Err(ApiError::conflict("already_claimed", "Winnings already claimed"));
            }
            _ => {
                return Err(ApiError::precondition(
                    "claim_window_expired",
                    "Claim window has expired",
                ));
            }
        }
        if let Some(deadline) = entity.claim_deadline {
            if Utc::now() > deadline {
                sqlx::query("UPDATE matches SET claim_status = $2, updated_at = NOW() WHERE id = $1")
                    .bind(match_id)
                    .bind(ClaimStatus::Expired.as_str())
                    .execute(&self.pool)
                    .await
                    .map_err(ApiError::database_error)?;
                return Err(ApiError::precondition(
                    "claim_window_expired",
                    "Claim window has expired",
                ));
            }
        }

        let winner_wallet = entity
            .winner_wallet
            .clone()
            .ok_or_else(|| ApiError::internal_error("Winner wallet missing"))?;
        let pot = entity.stake_amount * Decimal::from(2);
        let fee = entity
            .fee_amount
            .unwrap_or_else(|| platform_fee(pot, self.game.platform_fee_percent));

        let outcome = self
            .escrow_once("escrow_complete", match_id, Some(pot - fee), || {
                self.escrow.complete_match(match_id, &winner_wallet)
            })
            .await?;
        if !outcome.ok {
            return Err(ApiError::internal_error(
                outcome.error.unwrap_or_else(|| "escrow payout rejected".to_string()),
            ));
        }

        sqlx::query("UPDATE matches SET claim_status = $2, updated_at = NOW() WHERE id = $1")
            .bind(match_id)
            .bind(ClaimStatus::Claimed.as_str())
            .execute(&self.pool)
            .await
            .map_err(ApiError::database_error)?;

        info!(match_id = %match_id, user_id = %user_id, "Winnings claimed");
        Ok(ClaimResponse {
            success: true,
            tx_hash: outcome.tx_hash,
            amount: pot - fee,
        })
    }

    // =========================================================================
    // RESULT, HISTORY, HEARTBEAT
    // =========================================================================

    pub async fn result(
        &self,
        user_id: Uuid,
        match_id: Uuid,
    ) -> Result<MatchResultResponse, ApiError> {
        let entity = self.match_by_id(match_id).await?;
        let slot = entity
            .slot_of(user_id)
            .ok_or_else(|| ApiError::forbidden("Not a participant in this match"))?;

        let taps = sqlx::query_as::<_, TapEvent>(&format!(
            "SELECT {TAP_COLS} FROM tap_events WHERE match_id = $1 ORDER BY created_at ASC"
        ))
        .bind(match_id)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::database_error)?;

        let (player_reaction, opponent_reaction) = match slot {
            PlayerSlot::One => (entity.player1_reaction_ms, entity.player2_reaction_ms),
            PlayerSlot::Two => (entity.player2_reaction_ms, entity.player1_reaction_ms),
        };
        let pot = entity.stake_amount * Decimal::from(2);
        let winner_payout = (!entity.is_free() && entity.winner_id.is_some())
            .then(|| pot - entity.fee_amount.unwrap_or_default());

        Ok(MatchResultResponse {
            match_id,
            status: entity.status.clone(),
            winner_id: entity.winner_id,
            result_type: entity.result_type.clone(),
            is_winner: entity.winner_id == Some(user_id),
            player_reaction_ms: player_reaction,
            opponent_reaction_ms: opponent_reaction,
            taps: taps
                .iter()
                .map(|t| TapDetail {
                    user_id: t.user_id,
                    reaction_ms: t.reaction_ms,
                    is_valid: t.is_valid,
                    disqualified: t.disqualified,
                })
                .collect(),
            claim_status: entity.claim_status.clone(),
            claim_deadline: entity.claim_deadline,
            winner_payout,
        })
    }

    pub async fn history(&self, user_id: Uuid, limit: i64) -> Result<Vec<HistoryItem>, ApiError> {
        let limit = limit.clamp(1, 100);
        let matches = sqlx::query_as::<_, MatchEntity>(&format!(
            r#"
            SELECT {MATCH_COLS} FROM matches
            WHERE player1_id = $1 OR player2_id = $1
            ORDER BY COALESCE(completed_at, created_at) DESC
            LIMIT $2
            "#
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::database_error)?;

        let ids: Vec<Uuid> = matches.iter().map(|m| m.id).collect();
        let intents = sqlx::query_as::<_, PaymentIntent>(&format!(
            "SELECT {cols} FROM payment_intents WHERE user_id = $1 AND match_id = ANY($2)",
            cols = crate::service::payment_service::INTENT_COLS
        ))
        .bind(user_id)
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::database_error)?;
        let refunds: HashMap<Uuid, &PaymentIntent> = intents
            .iter()
            .filter_map(|i| i.match_id.map(|m| (m, i)))
            .collect();

        Ok(matches
            .iter()
            .filter_map(|m| {
                let slot = m.slot_of(user_id)?;
                let opponent_slot = slot.other();
                let refund = refunds.get(&m.id);
                let refund_eligible = refund
                    .map(|i| i.refund() == Some(RefundStatus::Eligible))
                    .unwrap_or(false);
                Some(HistoryItem {
                    match_id: m.id,
                    opponent: OpponentInfo {
                        user_id: m.player_id(opponent_slot),
                        wallet: m.wallet(opponent_slot).to_string(),
                    },
                    stake_amount: m.stake_amount,
                    status: m.status.clone(),
                    result_type: m.result_type.clone(),
                    winner_id: m.winner_id,
                    is_winner: m.winner_id.map(|w| w == user_id),
                    completed_at: m.completed_at,
                    claim_status: (m.winner_id == Some(user_id))
                        .then(|| m.claim_status.clone())
                        .flatten(),
                    claim_deadline: (m.winner_id == Some(user_id))
                        .then_some(m.claim_deadline)
                        .flatten(),
                    refund_eligible,
                    refundable_amount: refund
                        .filter(|i| i.refund() == Some(RefundStatus::Eligible))
                        .and_then(|i| i.refund_amount),
                    cancel_reason: m.cancel_reason.clone(),
                })
            })
            .collect())
    }

    pub async fn heartbeat(
        &self,
        user_id: Uuid,
        match_id: Uuid,
    ) -> Result<HeartbeatResponse, ApiError> {
        let entity = self.match_by_id(match_id).await?;
        let slot = entity
            .slot_of(user_id)
            .ok_or_else(|| ApiError::forbidden("Not a participant in this match"))?;

        // A ping after a silence longer than the disconnect threshold is a
        // reconnect; the lapsed connection is recorded against the player's
        // reconnect budget.
        let prior_ping = match slot {
            PlayerSlot::One => entity.player1_last_ping,
            PlayerSlot::Two => entity.player2_last_ping,
        };
        let status = self.status_of(&entity)?;
        if let Some(prior) = prior_ping {
            let gap_ms = (Utc::now() - prior).num_milliseconds();
            if gap_ms > self.game.disconnect_threshold_ms && !status.is_terminal() {
                let lifetime_ms = (prior - entity.created_at).num_milliseconds().max(0);
                let class = self
                    .sessions
                    .record_disconnect(&self.pool, match_id, user_id, lifetime_ms)
                    .await?;
                if let crate::service::session_service::DisconnectClass::ExceededBudget { count } =
                    class
                {
                    warn!(match_id = %match_id, user_id = %user_id, count = count, "Reconnect budget exhausted, cancelling");
                    self.cancel_match(match_id, "max_reconnects_exceeded").await?;
                    return Ok(HeartbeatResponse {
                        success: false,
                        ping: now_ms(),
                    });
                }
            }
        }

        let column = match slot {
            PlayerSlot::One => "player1_last_ping",
            PlayerSlot::Two => "player2_last_ping",
        };
        sqlx::query(&format!(
            "UPDATE matches SET {column} = NOW(), updated_at = NOW() WHERE id = $1"
        ))
        .bind(match_id)
        .execute(&self.pool)
        .await
        .map_err(ApiError::database_error)?;

        if self.sessions.connection_alive(user_id).await? {
            self.sessions.touch_connection(user_id).await?;
        } else {
            self.sessions
                .register_connection(user_id, &user_id.to_string())
                .await?;
        }

        Ok(HeartbeatResponse {
            success: true,
            ping: now_ms(),
        })
    }

    // =========================================================================
    // WATCHDOG ENTRY POINTS (driven by the maintenance worker)
    // =========================================================================

    /// FUNDING matches that never collected both stakes in time. Before
    /// cancelling, the on-chain stake status gets one last look: deposits
    /// that landed without a confirm-stake call still advance the match.
    pub async fn expire_deposit_timeouts(&self) -> Result<u64, ApiError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM matches
            WHERE status IN ('matched', 'funding') AND stake_amount > 0
              AND created_at < NOW() - ($1 * INTERVAL '1 millisecond')
            "#,
        )
        .bind(self.game.stake_deposit_timeout_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::database_error)?;
        let count = ids.len() as u64;
        for id in ids {
            let stakes = self.escrow.verify_stake_status(id).await;
            if stakes.has_stakes {
                info!(match_id = %id, "Deposits found on chain at deposit timeout, reconciling");
                sqlx::query(
                    "UPDATE matches SET player1_staked = TRUE, player2_staked = TRUE, updated_at = NOW() WHERE id = $1",
                )
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(ApiError::database_error)?;
                if let Err(e) = self.verify_escrow_and_advance(id).await {
                    warn!(match_id = %id, error = %e, "Deposit-timeout reconciliation failed");
                }
                continue;
            }
            if let Err(e) = self.cancel_match(id, "stake_timeout").await {
                warn!(match_id = %id, error = %e, "Deposit-timeout cancellation failed");
            }
        }
        Ok(count)
    }

    /// Both players ready but no signal was ever persisted (crash between
    /// flag and schedule). Cancel and refund.
    pub async fn expire_ready_timeouts(&self) -> Result<u64, ApiError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM matches
            WHERE status = 'ready' AND player1_ready AND player2_ready
              AND green_light_time IS NULL
              AND GREATEST(player1_ready_at, player2_ready_at) < NOW() - ($1 * INTERVAL '1 millisecond')
            "#,
        )
        .bind(self.game.match_start_timeout_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::database_error)?;
        let count = ids.len() as u64;
        for id in ids {
            if let Err(e) = self.cancel_match(id, "ready_timeout").await {
                warn!(match_id = %id, error = %e, "Ready-timeout cancellation failed");
            }
        }
        Ok(count)
    }

    /// Started matches whose tap window has lapsed: complete one-sided, or
    /// cancel when nobody tapped.
    pub async fn expire_tap_windows(&self) -> Result<u64, ApiError> {
        let cutoff = now_ms() - self.game.max_tap_window_ms;
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM matches WHERE status = 'started' AND green_light_time IS NOT NULL AND green_light_time < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::database_error)?;
        let count = ids.len() as u64;
        for id in ids {
            if let Err(e) = self.resolve_expired_window(id).await {
                warn!(match_id = %id, error = %e, "Tap-window resolution failed");
            }
        }
        Ok(count)
    }

    async fn resolve_expired_window(&self, match_id: Uuid) -> Result<(), ApiError> {
        let resolved = {
            let mut tx = self.begin().await?;
            let entity = self.lock_match(&mut tx, match_id).await?;
            if self.status_of(&entity)? != MatchStatus::Started {
                return Ok(());
            }
            let taps = self.taps_for_match_locked(&mut tx, match_id).await?;
            match taps.len() {
                2 => {
                    let p1 = taps.iter().find(|t| t.user_id == entity.player1_id);
                    let p2 = taps.iter().find(|t| t.user_id == entity.player2_id);
                    if let (Some(p1), Some(p2)) = (p1, p2) {
                        let (winner, result) = determine_outcome(
                            p1.summary(),
                            p2.summary(),
                            self.game.tie_threshold_ms,
                        );
                        self.finalize_completed(&mut tx, &entity, winner, result).await?;
                        tx.commit().await.map_err(ApiError::database_error)?;
                        Some((entity, winner, result))
                    } else {
                        None
                    }
                }
                1 => {
                    let tap = &taps[0];
                    let slot = entity
                        .slot_of(tap.user_id)
                        .ok_or_else(|| ApiError::internal_error("Tap from non-participant"))?;
                    let (winner, result) = determine_one_sided_outcome(slot, tap.summary());
                    self.finalize_completed(&mut tx, &entity, winner, result).await?;
                    tx.commit().await.map_err(ApiError::database_error)?;
                    Some((entity, winner, result))
                }
                _ => None,
            }
        };

        match resolved {
            Some((entity, winner, result)) => {
                self.post_completion(&entity, winner, result).await;
                Ok(())
            }
            // Nobody tapped: nothing to score, refund the pot.
            None => self.cancel_match(match_id, "tap_timeout").await,
        }
    }

    /// Matches where both players went silent past the disconnect threshold.
    pub async fn expire_abandoned(&self) -> Result<u64, ApiError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM matches
            WHERE status IN ('matched', 'funding', 'ready', 'started')
              AND COALESCE(player1_last_ping, created_at) < NOW() - ($1 * INTERVAL '1 millisecond')
              AND COALESCE(player2_last_ping, created_at) < NOW() - ($1 * INTERVAL '1 millisecond')
            "#,
        )
        .bind(self.game.disconnect_threshold_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::database_error)?;
        let count = ids.len() as u64;
        for id in ids {
            if let Err(e) = self.cancel_match(id, "abandoned").await {
                warn!(match_id = %id, error = %e, "Abandonment cancellation failed");
            }
        }
        Ok(count)
    }

    /// Safety net: cancel anything non-terminal past the hard age limit.
    pub async fn gc_stale_matches(&self) -> Result<u64, ApiError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM matches
            WHERE status IN ('matched', 'funding', 'ready', 'started')
              AND created_at < NOW() - ($1 * INTERVAL '1 second')
            "#,
        )
        .bind(self.game.stale_match_max_age_secs)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::database_error)?;
        let count = ids.len() as u64;
        for id in ids {
            if let Err(e) = self.cancel_match(id, "stale_match_gc").await {
                warn!(match_id = %id, error = %e, "GC cancellation failed");
            }
        }
        Ok(count)
    }

    /// Unclaimed winnings past the deadline return to the treasury.
    pub async fn expire_claims(&self) -> Result<u64, ApiError> {
        let result = sqlx::query(
            "UPDATE matches SET claim_status = $1, updated_at = NOW() WHERE claim_status = $2 AND claim_deadline < NOW()",
        )
        .bind(ClaimStatus::Expired.as_str())
        .bind(ClaimStatus::Unclaimed.as_str())
        .execute(&self.pool)
        .await
        .map_err(ApiError::database_error)?;
        if result.rows_affected() > 0 {
            info!(expired = result.rows_affected(), "Unclaimed winnings expired to treasury");
        }
        Ok(result.rows_affected())
    }

    /// Expiration worker half of the refund controller: process eligible
    /// refunds whose window has lapsed.
    pub async fn process_due_refunds(&self) -> Result<u64, ApiError> {
        let match_ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT match_id FROM payment_intents
            WHERE refund_status = 'eligible' AND refund_deadline < NOW() AND match_id IS NOT NULL
            LIMIT 20
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::database_error)?;
        let count = match_ids.len() as u64;
        for match_id in match_ids {
            let entity = match self.match_by_id(match_id).await {
                Ok(entity) => entity,
                Err(e) => {
                    warn!(match_id = %match_id, error = %e, "Refund sweep lookup failed");
                    continue;
                }
            };
            if let Err(e) = self.process_refund_for_match(&entity).await {
                warn!(match_id = %match_id, error = %e, "Overdue refund processing failed");
            }
        }
        Ok(count)
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    async fn begin(&self) -> Result<Transaction<'_, Postgres>, ApiError> {
        self.pool.begin().await.map_err(ApiError::database_error)
    }

    async fn lock_match(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        match_id: Uuid,
    ) -> Result<MatchEntity, ApiError> {
        sqlx::query_as::<_, MatchEntity>(&format!(
            "SELECT {MATCH_COLS} FROM matches WHERE id = $1 FOR UPDATE"
        ))
        .bind(match_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(ApiError::database_error)?
        .ok_or_else(|| ApiError::not_found("Match not found"))
    }

    pub async fn match_by_id(&self, match_id: Uuid) -> Result<MatchEntity, ApiError> {
        sqlx::query_as::<_, MatchEntity>(&format!(
            "SELECT {MATCH_COLS} FROM matches WHERE id = $1"
        ))
        .bind(match_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(ApiError::database_error)?
        .ok_or_else(|| ApiError::not_found("Match not found"))
    }

    async fn match_by_idempotency_key(&self, key: &str) -> Result<Option<MatchEntity>, ApiError> {
        sqlx::query_as::<_, MatchEntity>(&format!(
            "SELECT {MATCH_COLS} FROM matches WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(ApiError::database_error)
    }

    async fn tap_by_player(
        &self,
        match_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<TapEvent>, ApiError> {
        sqlx::query_as::<_, TapEvent>(&format!(
            "SELECT {TAP_COLS} FROM tap_events WHERE match_id = $1 AND user_id = $2"
        ))
        .bind(match_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(ApiError::database_error)
    }

    async fn taps_for_match_locked(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        match_id: Uuid,
    ) -> Result<Vec<TapEvent>, ApiError> {
        sqlx::query_as::<_, TapEvent>(&format!(
            "SELECT {TAP_COLS} FROM tap_events WHERE match_id = $1"
        ))
        .bind(match_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(ApiError::database_error)
    }

    fn status_of(&self, entity: &MatchEntity) -> Result<MatchStatus, ApiError> {
        entity
            .status()
            .ok_or_else(|| ApiError::internal_error(format!("Unknown match status {}", entity.status)))
    }

    /// Validate and persist an FSM transition under the caller's row lock.
    /// Invalid attempts are rejected without mutation.
    async fn apply_transition(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entity: &MatchEntity,
        to: MatchStatus,
        reason: Option<&str>,
    ) -> Result<(), ApiError> {
        let from = self.status_of(entity)?;
        if !from.can_transition_to(&to) {
            warn!(
                match_id = %entity.id,
                from = %from,
                to = %to,
                correlation_id = %entity.correlation_id(),
                "Invalid state transition rejected"
            );
            return Err(ApiError::conflict(
                "invalid_transition",
                format!("Cannot transition from {} to {}", from, to),
            ));
        }

        sqlx::query("UPDATE matches SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(entity.id)
            .bind(to.as_str())
            .execute(&mut **tx)
            .await
            .map_err(ApiError::database_error)?;

        sqlx::query(
            r#"
            INSERT INTO match_transitions (id, match_id, from_status, to_status, correlation_id, reason)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entity.id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(entity.correlation_id())
        .bind(reason)
        .execute(&mut **tx)
        .await
        .map_err(ApiError::database_error)?;

        debug!(
            match_id = %entity.id,
            from = %from,
            to = %to,
            correlation_id = %entity.correlation_id(),
            "State transition applied"
        );
        Ok(())
    }

    async fn record_transition_row(
        &self,
        entity: &MatchEntity,
        from: MatchStatus,
        to: MatchStatus,
        reason: Option<&str>,
    ) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            INSERT INTO match_transitions (id, match_id, from_status, to_status, correlation_id, reason)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entity.id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(entity.correlation_id())
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(ApiError::database_error)?;
        Ok(())
    }

    async fn set_cancel_reason(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        match_id: Uuid,
        reason: &str,
    ) -> Result<(), ApiError> {
        sqlx::query("UPDATE matches SET cancel_reason = $2, updated_at = NOW() WHERE id = $1")
            .bind(match_id)
            .bind(reason)
            .execute(&mut **tx)
            .await
            .map_err(ApiError::database_error)?;
        Ok(())
    }

    /// Ledger-guarded escrow call: a completed transaction of the same kind
    /// short-circuits; otherwise the call runs and its outcome is recorded.
    async fn escrow_once<F, Fut>(
        &self,
        kind: &str,
        match_id: Uuid,
        amount: Option<Decimal>,
        submit: F,
    ) -> Result<EscrowCallResult, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<EscrowCallResult, crate::service::escrow_service::EscrowError>>,
    {
        let existing: Option<Option<String>> = sqlx::query_scalar(
            "SELECT tx_hash FROM transactions WHERE match_id = $1 AND kind = $2 AND status = 'completed' LIMIT 1",
        )
        .bind(match_id)
        .bind(kind)
        .fetch_optional(&self.pool)
        .await
        .map_err(ApiError::database_error)?;
        if let Some(tx_hash) = existing {
            debug!(match_id = %match_id, kind = kind, "Escrow call already settled in ledger");
            return Ok(EscrowCallResult {
                ok: true,
                tx_hash,
                error: None,
            });
        }

        let ledger_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO transactions (id, match_id, kind, status, amount) VALUES ($1, $2, $3, 'pending', $4)",
        )
        .bind(ledger_id)
        .bind(match_id)
        .bind(kind)
        .bind(amount)
        .execute(&self.pool)
        .await
        .map_err(ApiError::database_error)?;

        let outcome = submit().await;
        match &outcome {
            Ok(result) if result.ok => {
                sqlx::query(
                    "UPDATE transactions SET status = 'completed', tx_hash = $2, completed_at = NOW() WHERE id = $1",
                )
                .bind(ledger_id)
                .bind(&result.tx_hash)
                .execute(&self.pool)
                .await
                .map_err(ApiError::database_error)?;
            }
            Ok(result) => {
                sqlx::query("UPDATE transactions SET status = 'failed' WHERE id = $1")
                    .bind(ledger_id)
                    .execute(&self.pool)
                    .await
                    .map_err(ApiError::database_error)?;
                debug!(match_id = %match_id, kind = kind, error = ?result.error, "Escrow call recorded as failed");
            }
            Err(e) => {
                sqlx::query("UPDATE transactions SET status = 'failed' WHERE id = $1")
                    .bind(ledger_id)
                    .execute(&self.pool)
                    .await
                    .map_err(ApiError::database_error)?;
                debug!(match_id = %match_id, kind = kind, error = %e, "Escrow call errored");
            }
        }

        outcome.map_err(|e| ApiError::internal_error(format!("Escrow call failed: {}", e)))
    }

    async fn clear_sessions(&self, entity: &MatchEntity) {
        for user_id in [entity.player1_id, entity.player2_id] {
            if let Err(e) = self.sessions.clear_active_match(user_id).await {
                warn!(user_id = %user_id, error = %e, "Failed to clear active-match key");
            }
        }
        let mut attempts = self.tap_attempts.lock().unwrap();
        attempts.retain(|(m, _), _| *m != entity.id);
    }

    fn audit_finding(&self, user_id: Uuid, match_id: Uuid, finding: &str, details: serde_json::Value) {
        let anti_cheat = self.anti_cheat.clone();
        let finding = finding.to_string();
        tokio::spawn(async move {
            if let Err(e) = anti_cheat
                .record_finding(user_id, Some(match_id), &finding, details)
                .await
            {
                warn!(user_id = %user_id, error = %e, "Failed to record anti-cheat finding");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn platform_fee_matches_the_published_rule() {
        // Two deposits of 0.5: pot 1.0, fee 3% = 0.03, payout 0.97.
        let pot = Decimal::from_str("1.0").unwrap();
        let fee = platform_fee(pot, 3);
        assert_eq!(fee, Decimal::from_str("0.03").unwrap());
        assert_eq!(pot - fee, Decimal::from_str("0.97").unwrap());
    }

    #[test]
    fn refund_after_play_is_net_of_per_side_fee() {
        let stake = Decimal::from_str("0.5").unwrap();
        assert_eq!(refund_after_play(stake, 3), Decimal::from_str("0.485").unwrap());
        assert_eq!(refund_after_play(Decimal::ZERO, 3), Decimal::ZERO);
    }

    #[test]
    fn sub_state_tracks_the_countdown() {
        // green = start + countdown + random delay, per the signal formula.
        let green = 3000 + 3200;
        let (state, active, countdown) =
            derive_sub_state(MatchStatus::Started, true, Some(green), 0, 3000);
        assert_eq!(state, "waiting_for_go");
        assert!(!active);
        assert!(countdown.is_none());

        let (state, _, countdown) =
            derive_sub_state(MatchStatus::Started, true, Some(green), green - 2500, 3000);
        assert_eq!(state, "countdown");
        assert_eq!(countdown, Some(3));

        let (state, _, countdown) =
            derive_sub_state(MatchStatus::Started, true, Some(green), green - 1, 3000);
        assert_eq!(state, "countdown");
        assert_eq!(countdown, Some(1));

        let (state, active, _) =
            derive_sub_state(MatchStatus::Started, true, Some(green), green, 3000);
        assert_eq!(state, "go");
        assert!(active);

        let (state, active, _) =
            derive_sub_state(MatchStatus::Started, true, Some(green), green + 500, 3000);
        assert_eq!(state, "go");
        assert!(active);
    }

    #[test]
    fn sub_state_before_signal() {
        let (state, _, _) = derive_sub_state(MatchStatus::Funding, false, None, 0, 3000);
        assert_eq!(state, "funding");
        let (state, _, _) = derive_sub_state(MatchStatus::Ready, false, None, 0, 3000);
        assert_eq!(state, "waiting_for_ready");
        let (state, _, _) = derive_sub_state(MatchStatus::Completed, true, Some(100), 200, 3000);
        assert_eq!(state, "completed");
    }

    #[test]
    fn liveness_uses_ping_then_creation() {
        let now = Utc::now();
        let created = now - Duration::seconds(10);
        // No ping yet, young match: live.
        assert!(is_player_live(None, created, now, 30_000));
        // No ping, old match: dead.
        assert!(!is_player_live(None, now - Duration::seconds(60), now, 30_000));
        // Fresh ping on an old match: live.
        assert!(is_player_live(
            Some(now - Duration::seconds(5)),
            now - Duration::seconds(600),
            now,
            30_000
        ));
        // Stale ping: dead.
        assert!(!is_player_live(
            Some(now - Duration::seconds(31)),
            created,
            now,
            30_000
        ));
    }
}

use crate::api_error::ApiError;
use crate::auth::ClaimsExt;
use crate::http::AppState;
use crate::service::matchmaking_service::EnqueueOutcome;
use crate::service::match_service::PlayerRef;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use validator::{Validate, ValidationError};

fn authed_user(req: &HttpRequest) -> Result<(Uuid, String), ApiError> {
    let claims = req
        .claims()
        .ok_or_else(|| ApiError::unauthorized("Missing authentication"))?;
    let user_id = claims
        .user_id()
        .ok_or_else(|| ApiError::unauthorized("Invalid token subject"))?;
    Ok((user_id, claims.wallet))
}

fn validate_stake(stake: &Decimal) -> Result<(), ValidationError> {
    if stake.is_sign_negative() {
        return Err(ValidationError::new("stake_negative"));
    }
    Ok(())
}

// =============================================================================
// ENQUEUE / CANCEL
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct EnqueueRequest {
    #[validate(custom(function = "validate_stake"))]
    pub stake: Decimal,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_id: Option<Uuid>,
}

/// POST /api/match/enqueue
pub async fn enqueue(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<EnqueueRequest>,
) -> Result<impl Responder, ApiError> {
    let (user_id, wallet) = authed_user(&req)?;
    body.validate()
        .map_err(|e| ApiError::bad_request(format!("Validation error: {}", e)))?;
    info!(user_id = %user_id, stake = %body.stake, "Received enqueue request");

    state.matches.ensure_user(user_id, &wallet).await?;
    state
        .sessions
        .register_connection(user_id, &user_id.to_string())
        .await?;

    // A reconnect inside the grace window restores the queued entry in place.
    if state
        .matchmaking
        .restore_on_reconnect(user_id, body.stake)
        .await?
    {
        return Ok(HttpResponse::Ok().json(EnqueueResponse {
            status: "searching",
            match_id: None,
        }));
    }

    match state.matchmaking.enqueue(user_id, body.stake).await? {
        EnqueueOutcome::Searching => Ok(HttpResponse::Ok().json(EnqueueResponse {
            status: "searching",
            match_id: None,
        })),
        EnqueueOutcome::Paired {
            opponent_id,
            opponent_entry_id,
            own_entry_id,
        } => {
            let opponent_wallet = state.matches.user_wallet(opponent_id).await?;
            let entity = state
                .matches
                .create_for_pair(
                    PlayerRef {
                        id: opponent_id,
                        wallet: opponent_wallet,
                    },
                    PlayerRef {
                        id: user_id,
                        wallet,
                    },
                    body.stake,
                    Some(format!("pair:{}:{}", opponent_entry_id, own_entry_id)),
                )
                .await?;
            Ok(HttpResponse::Ok().json(EnqueueResponse {
                status: "matched",
                match_id: Some(entity.id),
            }))
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CancelRequest {
    #[validate(custom(function = "validate_stake"))]
    pub stake: Decimal,
}

/// POST /api/match/cancel
pub async fn cancel_search(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CancelRequest>,
) -> Result<impl Responder, ApiError> {
    let (user_id, _) = authed_user(&req)?;
    body.validate()
        .map_err(|e| ApiError::bad_request(format!("Validation error: {}", e)))?;
    state.matchmaking.cancel(user_id, body.stake).await?;
    state.sessions.clear_connection(user_id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "status": "cancelled" })))
}

// =============================================================================
// FUNDING / READY
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfirmStakeRequest {
    pub match_id: Uuid,
    /// Wallet-flow reference: 32 lower-hex chars, no separators.
    #[validate(length(equal = 32))]
    pub payment_reference: String,
}

/// POST /api/match/confirm-stake
pub async fn confirm_stake(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<ConfirmStakeRequest>,
) -> Result<impl Responder, ApiError> {
    let (user_id, _) = authed_user(&req)?;
    body.validate()
        .map_err(|e| ApiError::bad_request(format!("Validation error: {}", e)))?;
    info!(user_id = %user_id, match_id = %body.match_id, "Received confirm-stake request");
    let response = state
        .matches
        .confirm_stake(user_id, body.match_id, &body.payment_reference)
        .await?;
    Ok(HttpResponse::Ok().json(response))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReadyRequest {
    pub match_id: Uuid,
}

/// POST /api/match/ready
pub async fn ready(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<ReadyRequest>,
) -> Result<impl Responder, ApiError> {
    let (user_id, _) = authed_user(&req)?;
    info!(user_id = %user_id, match_id = %body.match_id, "Received ready request");
    let response = state.matches.ready(user_id, body.match_id).await?;
    Ok(HttpResponse::Ok().json(response))
}

// =============================================================================
// STATE / TAP / RESULT
// =============================================================================

/// GET /api/match/state/:matchId
///
/// Polled at high frequency; intermediary caching must stay off.
pub async fn get_state(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<impl Responder, ApiError> {
    let (user_id, _) = authed_user(&req)?;
    let response = state.matches.get_state(user_id, path.into_inner()).await?;
    Ok(HttpResponse::Ok()
        .insert_header(("Cache-Control", "no-store, no-cache, must-revalidate"))
        .insert_header(("Pragma", "no-cache"))
        .json(response))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TapRequest {
    pub match_id: Uuid,
    /// Advisory client clock, epoch milliseconds.
    #[validate(range(min = 1))]
    pub client_timestamp: Option<i64>,
}

/// POST /api/match/tap
pub async fn tap(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<TapRequest>,
) -> Result<impl Responder, ApiError> {
    let (user_id, _) = authed_user(&req)?;
    body.validate()
        .map_err(|e| ApiError::bad_request(format!("Validation error: {}", e)))?;
    let response = state
        .matches
        .tap(user_id, body.match_id, body.client_timestamp)
        .await?;
    Ok(HttpResponse::Ok().json(response))
}

/// GET /api/match/result/:matchId
pub async fn get_result(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<impl Responder, ApiError> {
    let (user_id, _) = authed_user(&req)?;
    let response = state.matches.result(user_id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

// =============================================================================
// HEARTBEAT / HISTORY
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HeartbeatRequest {
    pub match_id: Uuid,
}

/// POST /api/match/heartbeat
pub async fn heartbeat(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<HeartbeatRequest>,
) -> Result<impl Responder, ApiError> {
    let (user_id, _) = authed_user(&req)?;
    let response = state.matches.heartbeat(user_id, body.match_id).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

/// GET /api/matches/history?limit=N
pub async fn history(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<HistoryQuery>,
) -> Result<impl Responder, ApiError> {
    let (user_id, _) = authed_user(&req)?;
    let items = state
        .matches
        .history(user_id, query.limit.unwrap_or(20))
        .await?;
    Ok(HttpResponse::Ok().json(items))
}

// =============================================================================
// CLAIM / REFUND
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClaimRequest {
    pub match_id: Uuid,
}

/// POST /api/match/claim
pub async fn claim(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<ClaimRequest>,
) -> Result<impl Responder, ApiError> {
    let (user_id, _) = authed_user(&req)?;
    info!(user_id = %user_id, match_id = %body.match_id, "Received claim request");
    let response = state.matches.claim(user_id, body.match_id).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RefundRequest {
    pub match_id: Uuid,
}

/// POST /api/match/refund
pub async fn refund(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<RefundRequest>,
) -> Result<impl Responder, ApiError> {
    let (user_id, _) = authed_user(&req)?;
    info!(user_id = %user_id, match_id = %body.match_id, "Received refund request");
    let response = state.matches.refund(user_id, body.match_id).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = serde_json::json!({ "matchId": Uuid::new_v4(), "extra": 1 });
        assert!(serde_json::from_value::<ReadyRequest>(raw).is_err());

        let raw = serde_json::json!({ "stake": "0.5", "surprise": true });
        assert!(serde_json::from_value::<EnqueueRequest>(raw).is_err());
    }

    #[test]
    fn tap_request_accepts_optional_timestamp() {
        let raw = serde_json::json!({ "matchId": Uuid::new_v4() });
        let parsed: TapRequest = serde_json::from_value(raw).unwrap();
        assert!(parsed.client_timestamp.is_none());
        assert!(parsed.validate().is_ok());

        let raw = serde_json::json!({ "matchId": Uuid::new_v4(), "clientTimestamp": 123456789_i64 });
        let parsed: TapRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.client_timestamp, Some(123456789));
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn tap_request_rejects_non_positive_timestamp() {
        let raw = serde_json::json!({ "matchId": Uuid::new_v4(), "clientTimestamp": 0_i64 });
        let parsed: TapRequest = serde_json::from_value(raw).unwrap();
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn negative_stake_fails_validation() {
        use std::str::FromStr;

        let request = EnqueueRequest {
            stake: Decimal::from_str("-0.5").unwrap(),
        };
        assert!(request.validate().is_err());

        let request = EnqueueRequest {
            stake: Decimal::ZERO,
        };
        assert!(request.validate().is_ok());
    }

    #[test]
    fn payment_reference_must_be_32_chars() {
        let request = ConfirmStakeRequest {
            match_id: Uuid::new_v4(),
            payment_reference: "a".repeat(32),
        };
        assert!(request.validate().is_ok());

        let request = ConfirmStakeRequest {
            match_id: Uuid::new_v4(),
            payment_reference: "a".repeat(31),
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn enqueue_response_omits_match_id_when_searching() {
        let json = serde_json::to_string(&EnqueueResponse {
            status: "searching",
            match_id: None,
        })
        .unwrap();
        assert!(!json.contains("matchId"));
    }
}

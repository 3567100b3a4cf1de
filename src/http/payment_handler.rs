use crate::api_error::ApiError;
use crate::auth::ClaimsExt;
use crate::http::AppState;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use rust_decimal::Decimal;
use serde::Deserialize;
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

fn validate_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if *amount <= Decimal::ZERO {
        return Err(ValidationError::new("amount_not_positive"));
    }
    Ok(())
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct InitiatePaymentRequest {
    #[validate(custom(function = "validate_amount"))]
    pub amount: Decimal,
}

/// POST /api/initiate-payment
pub async fn initiate_payment(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<InitiatePaymentRequest>,
) -> Result<impl Responder, ApiError> {
    let (user_id, wallet) = authed_user(&req)?;
    body.validate()
        .map_err(|e| ApiError::bad_request(format!("Validation error: {}", e)))?;
    state.matches.ensure_user(user_id, &wallet).await?;
    info!(user_id = %user_id, amount = %body.amount, "Received initiate-payment request");
    let response = state.payments.initiate(user_id, body.amount).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ConfirmPaymentPayload {
    #[validate(length(equal = 32))]
    pub reference: String,
    #[validate(length(min = 1, max = 128))]
    pub transaction_id: String,
    #[validate(length(min = 1, max = 64))]
    pub status: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ConfirmPaymentRequest {
    #[validate(nested)]
    pub payload: ConfirmPaymentPayload,
}

/// POST /api/confirm-payment
pub async fn confirm_payment(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<ConfirmPaymentRequest>,
) -> Result<impl Responder, ApiError> {
    let (user_id, _) = authed_user(&req)?;
    body.validate()
        .map_err(|e| ApiError::bad_request(format!("Validation error: {}", e)))?;
    info!(
        user_id = %user_id,
        reference = %body.payload.reference,
        "Received confirm-payment request"
    );
    let response = state
        .payments
        .confirm(
            user_id,
            &body.payload.reference,
            &body.payload.transaction_id,
            &body.payload.status,
        )
        .await?;
    Ok(HttpResponse::Ok().json(response))
}

/// GET /api/payment/:reference
pub async fn get_payment(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<impl Responder, ApiError> {
    let (user_id, _) = authed_user(&req)?;
    let response = state.payments.detail(user_id, &path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_payload_is_nested() {
        let raw = serde_json::json!({
            "payload": {
                "reference": "a".repeat(32),
                "transaction_id": "txn_1",
                "status": "submitted"
            }
        });
        let parsed: ConfirmPaymentRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.payload.reference.len(), 32);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn confirm_validation_reaches_the_nested_payload() {
        let raw = serde_json::json!({
            "payload": {
                "reference": "short",
                "transaction_id": "txn_1",
                "status": "submitted"
            }
        });
        let parsed: ConfirmPaymentRequest = serde_json::from_value(raw).unwrap();
        assert!(parsed.validate().is_err());

        let raw = serde_json::json!({
            "payload": {
                "reference": "a".repeat(32),
                "transaction_id": "",
                "status": "submitted"
            }
        });
        let parsed: ConfirmPaymentRequest = serde_json::from_value(raw).unwrap();
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn unknown_fields_rejected() {
        let raw = serde_json::json!({ "amount": "1.0", "bonus": 1 });
        assert!(serde_json::from_value::<InitiatePaymentRequest>(raw).is_err());
    }

    #[test]
    fn non_positive_amount_fails_validation() {
        use std::str::FromStr;

        let request = InitiatePaymentRequest {
            amount: Decimal::ZERO,
        };
        assert!(request.validate().is_err());

        let request = InitiatePaymentRequest {
            amount: Decimal::from_str("0.5").unwrap(),
        };
        assert!(request.validate().is_ok());
    }
}

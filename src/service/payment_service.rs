//! Payment intent lifecycle.
//!
//! Initiation mints an opaque reference handed to the wallet flow; the
//! confirm endpoint records what the client observed; the payment worker is
//! the only component that trusts the oracle and finalizes statuses.

use crate::api_error::ApiError;
use crate::db::DbPool;
use crate::models::payment::{NormalizedStatus, PaymentDetail, PaymentIntent};
use rand::rngs::OsRng;
use rand::RngCore;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const INTENT_COLS: &str = "id, reference, user_id, amount, match_id, raw_status, normalized_status, \
     oracle_transaction_id, transaction_hash, locked_at, locked_by, retry_count, last_retry_at, \
     next_retry_at, last_error, refund_status, refund_deadline, refund_amount, refund_reason, \
     created_at, updated_at";

#[derive(Debug, Serialize)]
pub struct InitiateResponse {
    pub id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<bool>,
    pub transaction: Option<String>,
    pub payment: PaymentDetail,
}

/// Reference token for the wallet flow: 32 lower-hex chars, no separators.
pub fn generate_reference() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub struct PaymentService {
    pool: DbPool,
}

impl PaymentService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn initiate(&self, user_id: Uuid, amount: Decimal) -> Result<InitiateResponse, ApiError> {
        if amount <= Decimal::ZERO {
            return Err(ApiError::bad_request("Amount must be positive"));
        }

        let reference = generate_reference();
        sqlx::query(
            r#"
            INSERT INTO payment_intents (id, reference, user_id, amount, normalized_status)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&reference)
        .bind(user_id)
        .bind(amount)
        .bind(NormalizedStatus::Pending.as_str())
        .execute(&self.pool)
        .await
        .map_err(ApiError::database_error)?;

        info!(user_id = %user_id, reference = %reference, amount = %amount, "Payment initiated");
        Ok(InitiateResponse { id: reference })
    }

    /// Record the client-observed transaction for an intent. The worker
    /// verifies against the oracle before anything is treated as money;
    /// client-reported success never confirms directly.
    pub async fn confirm(
        &self,
        user_id: Uuid,
        reference: &str,
        transaction_id: &str,
        raw_status: &str,
    ) -> Result<ConfirmResponse, ApiError> {
        let intent = self.intent_by_reference(reference).await?;
        if intent.user_id != user_id {
            return Err(ApiError::forbidden("Payment belongs to another user"));
        }

        if intent
            .normalized()
            .map(|s| s.is_terminal())
            .unwrap_or(false)
        {
            // Terminal intents replay their recorded state.
            return Ok(ConfirmResponse {
                success: intent.is_confirmed(),
                pending: None,
                transaction: intent.oracle_transaction_id.clone(),
                payment: intent.into(),
            });
        }

        let client_normalized = NormalizedStatus::from_raw(Some(raw_status));
        // Client-reported failure/cancellation is terminal; success stays
        // pending until the worker hears it from the oracle.
        let next_status = match client_normalized {
            NormalizedStatus::Failed => NormalizedStatus::Failed,
            NormalizedStatus::Cancelled => NormalizedStatus::Cancelled,
            _ => NormalizedStatus::Pending,
        };

        let updated = sqlx::query_as::<_, PaymentIntent>(&format!(
            r#"
            UPDATE payment_intents
            SET oracle_transaction_id = $2, raw_status = $3,
                normalized_status = CASE WHEN normalized_status = 'pending' THEN $4 ELSE normalized_status END,
                updated_at = NOW()
            WHERE reference = $1
            RETURNING {INTENT_COLS}
            "#
        ))
        .bind(reference)
        .bind(transaction_id)
        .bind(raw_status)
        .bind(next_status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(ApiError::database_error)?;

        if next_status != NormalizedStatus::Pending {
            warn!(reference = %reference, status = %next_status, "Payment reported terminal by client");
        } else {
            info!(reference = %reference, transaction_id = %transaction_id, "Payment awaiting oracle confirmation");
        }

        Ok(ConfirmResponse {
            success: next_status != NormalizedStatus::Failed
                && next_status != NormalizedStatus::Cancelled,
            pending: (next_status == NormalizedStatus::Pending).then_some(true),
            transaction: updated.oracle_transaction_id.clone(),
            payment: updated.into(),
        })
    }

    pub async fn detail(&self, user_id: Uuid, reference: &str) -> Result<PaymentDetail, ApiError> {
        let intent = self.intent_by_reference(reference).await?;
        if intent.user_id != user_id {
            return Err(ApiError::forbidden("Payment belongs to another user"));
        }
        Ok(intent.into())
    }

    async fn intent_by_reference(&self, reference: &str) -> Result<PaymentIntent, ApiError> {
        sqlx::query_as::<_, PaymentIntent>(&format!(
            "SELECT {INTENT_COLS} FROM payment_intents WHERE reference = $1"
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(ApiError::database_error)?
        .ok_or_else(|| ApiError::not_found("Payment not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_is_hex_without_separators() {
        let reference = generate_reference();
        assert_eq!(reference.len(), 32);
        assert!(reference.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!reference.contains('-'));
    }

    #[test]
    fn references_are_unique_enough() {
        let a = generate_reference();
        let b = generate_reference();
        assert_ne!(a, b);
    }
}

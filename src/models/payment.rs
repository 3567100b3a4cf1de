use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Canonical payment status derived from the oracle's raw string.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NormalizedStatus {
    Pending,
    Confirmed,
    Failed,
    Cancelled,
}

impl NormalizedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NormalizedStatus::Pending => "pending",
            NormalizedStatus::Confirmed => "confirmed",
            NormalizedStatus::Failed => "failed",
            NormalizedStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<NormalizedStatus> {
        match raw {
            "pending" => Some(NormalizedStatus::Pending),
            "confirmed" => Some(NormalizedStatus::Confirmed),
            "failed" => Some(NormalizedStatus::Failed),
            "cancelled" => Some(NormalizedStatus::Cancelled),
            _ => None,
        }
    }

    /// Normalize an oracle-reported status. Comparison is case-insensitive
    /// and trimmed; anything unrecognized stays pending, never confirmed.
    pub fn from_raw(raw: Option<&str>) -> NormalizedStatus {
        let raw = match raw {
            Some(r) => r.trim().to_lowercase(),
            None => return NormalizedStatus::Pending,
        };
        match raw.as_str() {
            "mined" | "confirmed" | "success" => NormalizedStatus::Confirmed,
            "failed" | "error" | "rejected" => NormalizedStatus::Failed,
            "expired" | "cancelled" | "canceled" | "declined" => NormalizedStatus::Cancelled,
            "initiated" | "authorized" | "broadcast" | "pending" | "pending_confirmation"
            | "submitted" => NormalizedStatus::Pending,
            _ => NormalizedStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, NormalizedStatus::Pending)
    }
}

impl std::fmt::Display for NormalizedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    None,
    Eligible,
    Processing,
    Completed,
    Failed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::None => "none",
            RefundStatus::Eligible => "eligible",
            RefundStatus::Processing => "processing",
            RefundStatus::Completed => "completed",
            RefundStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<RefundStatus> {
        match raw {
            "none" => Some(RefundStatus::None),
            "eligible" => Some(RefundStatus::Eligible),
            "processing" => Some(RefundStatus::Processing),
            "completed" => Some(RefundStatus::Completed),
            "failed" => Some(RefundStatus::Failed),
            _ => None,
        }
    }
}

/// A funding attempt. Created on initiation, advanced by the payment worker
/// and the orchestrator, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentIntent {
    pub id: Uuid,
    pub reference: String,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub match_id: Option<Uuid>,
    pub raw_status: Option<String>,
    pub normalized_status: String,
    pub oracle_transaction_id: Option<String>,
    pub transaction_hash: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub retry_count: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub refund_status: String,
    pub refund_deadline: Option<DateTime<Utc>>,
    pub refund_amount: Option<Decimal>,
    pub refund_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentIntent {
    pub fn normalized(&self) -> Option<NormalizedStatus> {
        NormalizedStatus::parse(&self.normalized_status)
    }

    pub fn refund(&self) -> Option<RefundStatus> {
        RefundStatus::parse(&self.refund_status)
    }

    pub fn is_confirmed(&self) -> bool {
        self.normalized() == Some(NormalizedStatus::Confirmed)
    }
}

/// Payment detail returned over HTTP.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDetail {
    pub reference: String,
    pub amount: Decimal,
    pub status: String,
    pub raw_status: Option<String>,
    pub transaction_hash: Option<String>,
    pub match_id: Option<Uuid>,
    pub refund_status: String,
    pub refund_amount: Option<Decimal>,
    pub refund_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<PaymentIntent> for PaymentDetail {
    fn from(intent: PaymentIntent) -> Self {
        Self {
            reference: intent.reference,
            amount: intent.amount,
            status: intent.normalized_status,
            raw_status: intent.raw_status,
            transaction_hash: intent.transaction_hash,
            match_id: intent.match_id,
            refund_status: intent.refund_status,
            refund_amount: intent.refund_amount,
            refund_deadline: intent.refund_deadline,
            created_at: intent.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_table() {
        for raw in ["mined", "confirmed", "success", "MINED", "  Success  "] {
            assert_eq!(
                NormalizedStatus::from_raw(Some(raw)),
                NormalizedStatus::Confirmed,
                "raw = {raw}"
            );
        }
        for raw in ["failed", "error", "rejected"] {
            assert_eq!(NormalizedStatus::from_raw(Some(raw)), NormalizedStatus::Failed);
        }
        for raw in ["expired", "cancelled", "canceled", "declined"] {
            assert_eq!(
                NormalizedStatus::from_raw(Some(raw)),
                NormalizedStatus::Cancelled
            );
        }
        for raw in [
            "initiated",
            "authorized",
            "broadcast",
            "pending",
            "pending_confirmation",
            "submitted",
        ] {
            assert_eq!(NormalizedStatus::from_raw(Some(raw)), NormalizedStatus::Pending);
        }
    }

    #[test]
    fn unknown_status_never_confirms() {
        assert_eq!(
            NormalizedStatus::from_raw(Some("definitely_not_a_status")),
            NormalizedStatus::Pending
        );
        assert_eq!(NormalizedStatus::from_raw(Some("")), NormalizedStatus::Pending);
        assert_eq!(NormalizedStatus::from_raw(None), NormalizedStatus::Pending);
    }

    #[test]
    fn terminality() {
        assert!(!NormalizedStatus::Pending.is_terminal());
        assert!(NormalizedStatus::Confirmed.is_terminal());
        assert!(NormalizedStatus::Failed.is_terminal());
        assert!(NormalizedStatus::Cancelled.is_terminal());
    }

    #[test]
    fn refund_status_round_trip() {
        for status in [
            RefundStatus::None,
            RefundStatus::Eligible,
            RefundStatus::Processing,
            RefundStatus::Completed,
            RefundStatus::Failed,
        ] {
            assert_eq!(RefundStatus::parse(status.as_str()), Some(status));
        }
    }
}

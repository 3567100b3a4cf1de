//! Payment oracle client.
//!
//! Polls the dev-portal transaction endpoint for the raw status of a funding
//! transaction. All calls go through the oracle circuit breaker; a 404 is a
//! terminal "not found" outcome, everything else transient.

use crate::config::OracleConfig;
use crate::service::circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitOpenError};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("transaction not found")]
    NotFound,
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
    #[error("oracle transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("oracle returned HTTP {0}")]
    UpstreamStatus(u16),
    #[error("invalid oracle response: {0}")]
    InvalidResponse(String),
}

impl OracleError {
    /// Circuit-open rejections must not increment retry counts.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, OracleError::CircuitOpen(_))
    }
}

/// Raw transaction view as reported by the oracle.
#[derive(Debug, Clone, Deserialize)]
pub struct OracleTransaction {
    #[serde(rename = "transactionId")]
    pub transaction_id: Option<String>,
    #[serde(rename = "transactionStatus")]
    pub transaction_status: Option<String>,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: Option<String>,
    pub reference: Option<String>,
}

pub struct PaymentOracleClient {
    config: OracleConfig,
    client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
}

impl PaymentOracleClient {
    pub fn new(config: OracleConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            breaker: Arc::new(CircuitBreaker::new(
                "payment_oracle",
                BreakerConfig::oracle_defaults(),
            )),
        }
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    pub async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<OracleTransaction, OracleError> {
        self.breaker.try_acquire()?;

        let url = format!(
            "{}/api/v2/minikit/transaction/{}?app_id={}&type=payment",
            self.config.base_url, transaction_id, self.config.app_id
        );

        let response = match self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.breaker.record_failure();
                return Err(OracleError::Transport(e));
            }
        };

        let status = response.status();
        if status.as_u16() == 404 {
            // The oracle answered; the transaction just does not exist.
            self.breaker.record_success();
            debug!(transaction_id = transaction_id, "Oracle reports transaction not found");
            return Err(OracleError::NotFound);
        }
        if !status.is_success() {
            self.breaker.record_failure();
            warn!(
                transaction_id = transaction_id,
                status = status.as_u16(),
                "Oracle returned error status"
            );
            return Err(OracleError::UpstreamStatus(status.as_u16()));
        }

        match response.json::<OracleTransaction>().await {
            Ok(txn) => {
                self.breaker.record_success();
                Ok(txn)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(OracleError::InvalidResponse(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_deserializes_from_oracle_shape() {
        let json = serde_json::json!({
            "transactionId": "txn_1",
            "transactionStatus": "mined",
            "transactionHash": "0xdead",
            "reference": "abc123"
        });
        let txn: OracleTransaction = serde_json::from_value(json).unwrap();
        assert_eq!(txn.transaction_status.as_deref(), Some("mined"));
        assert_eq!(txn.transaction_hash.as_deref(), Some("0xdead"));
    }

    #[test]
    fn partial_payloads_are_tolerated() {
        let json = serde_json::json!({ "transactionId": "txn_2" });
        let txn: OracleTransaction = serde_json::from_value(json).unwrap();
        assert!(txn.transaction_status.is_none());
        assert!(txn.transaction_hash.is_none());
    }

    #[test]
    fn circuit_open_is_distinguishable() {
        let err = OracleError::CircuitOpen(CircuitOpenError {
            target: "payment_oracle",
        });
        assert!(err.is_circuit_open());
        assert!(!OracleError::NotFound.is_circuit_open());
    }
}

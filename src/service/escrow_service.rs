//! Escrow settlement client.
//!
//! Thin layer over the on-chain settlement backend. Builds, submits, and
//! reports contract calls for match escrow: registration, payout, split,
//! and refund. Mutating calls are collapsed in-process per
//! `(operation, match_id)` so concurrent duplicates share one submission;
//! cross-process idempotency is the caller's job via the settlement ledger.

use crate::config::EscrowConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("RPC request failed: {0}")]
    Rpc(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Retry limit exceeded")]
    RetryLimitExceeded,
}

/// Result of a mutating escrow call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowCallResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// On-chain view of a match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowMatchState {
    pub player1: String,
    pub player2: String,
    pub stake_amount: Decimal,
    pub player1_staked: bool,
    pub player2_staked: bool,
    pub completed: bool,
    pub cancelled: bool,
}

/// Convenience read used by the FUNDING -> READY guard.
#[derive(Debug, Clone, Serialize)]
pub struct StakeStatus {
    pub has_stakes: bool,
    pub player1_staked: bool,
    pub player2_staked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Serialize)]
struct ContractRequest<'a> {
    contract: &'a str,
    method: &'a str,
    params: serde_json::Value,
    signer: &'a str,
}

#[derive(Debug, Deserialize)]
struct ContractResponse {
    ok: bool,
    #[serde(rename = "txHash")]
    tx_hash: Option<String>,
    error: Option<String>,
    result: Option<serde_json::Value>,
}

type OpKey = (&'static str, Uuid);
type SharedResult = Arc<OnceCell<Result<EscrowCallResult, String>>>;

pub struct EscrowService {
    config: EscrowConfig,
    client: reqwest::Client,
    retry: RetryConfig,
    op_locks: Mutex<HashMap<OpKey, SharedResult>>,
}

impl EscrowService {
    pub fn new(config: EscrowConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            retry: RetryConfig::default(),
            op_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry_config(config: EscrowConfig, retry: RetryConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            retry,
            op_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Register the match on chain. Callable before any deposit lands.
    pub async fn create_match(
        &self,
        match_id: Uuid,
        player1_wallet: &str,
        player2_wallet: &str,
        stake: Decimal,
    ) -> Result<EscrowCallResult, EscrowError> {
        let params = serde_json::json!({
            "matchId": match_id,
            "player1": player1_wallet,
            "player2": player2_wallet,
            "stakeAmount": stake,
            "feeRecipient": self.config.platform_wallet,
        });
        self.locked_call("create_match", match_id, || {
            self.invoke("create_match", params.clone())
        })
        .await
    }

    /// Distribute pot minus platform fee to the winner.
    pub async fn complete_match(
        &self,
        match_id: Uuid,
        winner_wallet: &str,
    ) -> Result<EscrowCallResult, EscrowError> {
        let params = serde_json::json!({
            "matchId": match_id,
            "winner": winner_wallet,
        });
        self.locked_call("complete_match", match_id, || {
            self.invoke("complete_match", params.clone())
        })
        .await
    }

    /// Split (pot - fee) evenly between the two players.
    pub async fn split_pot(&self, match_id: Uuid) -> Result<EscrowCallResult, EscrowError> {
        let params = serde_json::json!({ "matchId": match_id });
        self.locked_call("split_pot", match_id, || self.invoke("split_pot", params.clone()))
            .await
    }

    /// Refund both deposits. Only succeeds when both deposits exist.
    pub async fn cancel_match(&self, match_id: Uuid) -> Result<EscrowCallResult, EscrowError> {
        let params = serde_json::json!({ "matchId": match_id });
        self.locked_call("cancel_match", match_id, || {
            self.invoke("cancel_match", params.clone())
        })
        .await
    }

    pub async fn get_match(
        &self,
        match_id: Uuid,
    ) -> Result<Option<EscrowMatchState>, EscrowError> {
        let params = serde_json::json!({ "matchId": match_id });
        let response = self.call_with_retry("get_match", &params).await?;
        if !response.ok {
            let error = response.error.unwrap_or_else(|| "unknown error".to_string());
            if error.contains("not found") {
                return Ok(None);
            }
            return Err(EscrowError::Rpc(error));
        }
        match response.result {
            Some(value) if value.is_null() => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| EscrowError::InvalidResponse(e.to_string())),
            None => Ok(None),
        }
    }

    /// Never fails the caller: transport errors surface in `error`.
    pub async fn verify_stake_status(&self, match_id: Uuid) -> StakeStatus {
        match self.get_match(match_id).await {
            Ok(Some(state)) => StakeStatus {
                has_stakes: state.player1_staked && state.player2_staked,
                player1_staked: state.player1_staked,
                player2_staked: state.player2_staked,
                error: None,
            },
            Ok(None) => StakeStatus {
                has_stakes: false,
                player1_staked: false,
                player2_staked: false,
                error: Some("match not registered on chain".to_string()),
            },
            Err(e) => {
                warn!(match_id = %match_id, error = %e, "Stake status check failed");
                StakeStatus {
                    has_stakes: false,
                    player1_staked: false,
                    player2_staked: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Collapse concurrent duplicate mutating calls: the first caller runs the
    /// submission, later waiters on the same `(operation, match_id)` receive
    /// the first result. The slot is removed afterwards so a later retry
    /// issues a fresh call.
    async fn locked_call<F, Fut>(
        &self,
        operation: &'static str,
        match_id: Uuid,
        submit: F,
    ) -> Result<EscrowCallResult, EscrowError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<EscrowCallResult, EscrowError>>,
    {
        let key: OpKey = (operation, match_id);
        let cell = {
            let mut locks = self.op_locks.lock().unwrap();
            locks
                .entry(key)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let shared = cell
            .get_or_init(|| async { submit().await.map_err(|e| e.to_string()) })
            .await
            .clone();

        let mut locks = self.op_locks.lock().unwrap();
        if let Some(existing) = locks.get(&key) {
            if Arc::ptr_eq(existing, &cell) {
                locks.remove(&key);
            }
        }

        shared.map_err(EscrowError::Rpc)
    }

    async fn invoke(
        &self,
        method: &'static str,
        params: serde_json::Value,
    ) -> Result<EscrowCallResult, EscrowError> {
        info!(method = method, contract = %self.config.contract_address, "Invoking escrow contract");
        let response = self.call_with_retry(method, &params).await?;
        if response.ok {
            debug!(method = method, tx_hash = ?response.tx_hash, "Escrow call succeeded");
        } else {
            warn!(method = method, error = ?response.error, "Escrow call rejected");
        }
        Ok(EscrowCallResult {
            ok: response.ok,
            tx_hash: response.tx_hash,
            error: response.error,
        })
    }

    /// Exponential-backoff retry on transport failures. Contract-level
    /// rejections are returned to the caller untouched.
    async fn call_with_retry(
        &self,
        method: &str,
        params: &serde_json::Value,
    ) -> Result<ContractResponse, EscrowError> {
        let mut attempt = 0;
        let mut delay = self.retry.initial_delay_ms;
        loop {
            match self.call_once(method, params).await {
                Ok(response) => return Ok(response),
                Err(EscrowError::Network(e)) => {
                    if attempt >= self.retry.max_retries {
                        warn!(method = method, error = %e, "Escrow retry limit exceeded");
                        return Err(EscrowError::RetryLimitExceeded);
                    }
                    debug!(
                        method = method,
                        attempt = attempt,
                        delay_ms = delay,
                        "Escrow transport error, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    delay = ((delay as f64 * self.retry.backoff_multiplier) as u64)
                        .min(self.retry.max_delay_ms);
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn call_once(
        &self,
        method: &str,
        params: &serde_json::Value,
    ) -> Result<ContractResponse, EscrowError> {
        let request = ContractRequest {
            contract: &self.config.contract_address,
            method,
            params: params.clone(),
            signer: &self.config.signer_key,
        };

        let response = self
            .client
            .post(&self.config.rpc_url)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(EscrowError::Rpc(format!("HTTP {}: {}", status, text)));
        }

        serde_json::from_str(&text).map_err(|e| EscrowError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EscrowConfig {
        EscrowConfig {
            rpc_url: "http://127.0.0.1:1/escrow".to_string(),
            contract_address: "0xescrow".to_string(),
            signer_key: "0xsigner".to_string(),
            platform_wallet: "0xplatform".to_string(),
        }
    }

    #[test]
    fn call_result_serialization_omits_empty_fields() {
        let result = EscrowCallResult {
            ok: true,
            tx_hash: Some("0xdead".to_string()),
            error: None,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("0xdead"));
        assert!(!json.contains("error"));
    }

    #[test]
    fn match_state_deserializes_from_backend_shape() {
        let json = serde_json::json!({
            "player1": "0xaaa",
            "player2": "0xbbb",
            "stake_amount": "0.5",
            "player1_staked": true,
            "player2_staked": false,
            "completed": false,
            "cancelled": false
        });
        let state: EscrowMatchState = serde_json::from_value(json).unwrap();
        assert!(state.player1_staked);
        assert!(!state.player2_staked);
        assert_eq!(state.stake_amount, Decimal::new(5, 1));
    }

    #[tokio::test]
    async fn locked_call_shares_one_submission_across_waiters() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let service = Arc::new(EscrowService::new(config()));
        let calls = Arc::new(AtomicU32::new(0));
        let match_id = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let service = service.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                service
                    .locked_call("complete_match", match_id, || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(EscrowCallResult {
                                ok: true,
                                tx_hash: Some("0x1".to_string()),
                                error: None,
                            })
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert!(result.ok);
            assert_eq!(result.tx_hash.as_deref(), Some("0x1"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn locked_call_slot_is_released_after_completion() {
        let service = EscrowService::new(config());
        let match_id = Uuid::new_v4();

        let first = service
            .locked_call("cancel_match", match_id, || async {
                Ok(EscrowCallResult {
                    ok: true,
                    tx_hash: None,
                    error: None,
                })
            })
            .await
            .unwrap();
        assert!(first.ok);

        // A later call must run its own submission, not replay the cached one.
        let second = service
            .locked_call("cancel_match", match_id, || async {
                Ok(EscrowCallResult {
                    ok: false,
                    tx_hash: None,
                    error: Some("both deposits missing".to_string()),
                })
            })
            .await
            .unwrap();
        assert!(!second.ok);
    }
}

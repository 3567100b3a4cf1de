//! Payment intent worker.
//!
//! Polls pending intents against the oracle under crash-safe leases:
//! intents are leased inside a short transaction with
//! `FOR UPDATE SKIP LOCKED`, the transaction commits before any external
//! I/O, and a worker death simply lets the lease lapse for the next cycle.
//! Status updates are keyed by reference and monotonic; a terminal status
//! is never downgraded.

use crate::config::WorkerConfig;
use crate::db::DbPool;
use crate::models::payment::{NormalizedStatus, PaymentIntent};
use crate::service::circuit_breaker::{BreakerConfig, CircuitBreaker};
use crate::service::oracle_service::{OracleError, PaymentOracleClient};
use crate::service::payment_service::INTENT_COLS;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct PaymentWorker {
    pool: DbPool,
    oracle: Arc<PaymentOracleClient>,
    config: WorkerConfig,
    store_breaker: CircuitBreaker,
    worker_id: String,
}

impl PaymentWorker {
    pub fn new(pool: DbPool, oracle: Arc<PaymentOracleClient>, config: WorkerConfig) -> Self {
        let worker_id = format!(
            "{}:{}",
            std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string()),
            std::process::id()
        );
        Self {
            pool,
            oracle,
            config,
            store_breaker: CircuitBreaker::new("store", BreakerConfig::store_defaults()),
            worker_id,
        }
    }

    /// Run forever. A single intent failure never kills the loop.
    pub async fn run(self: Arc<Self>) {
        info!(worker_id = %self.worker_id, interval_ms = self.config.poll_interval_ms, "Payment worker started");
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.cycle().await {
                error!(worker_id = %self.worker_id, error = %e, "Payment worker cycle failed");
            }
        }
    }

    pub async fn cycle(&self) -> Result<()> {
        let expired = self.expire_stale().await?;
        if expired > 0 {
            info!(expired = expired, "Stale payment intents failed");
        }

        let batch = self.lease_batch().await?;
        if batch.is_empty() {
            return Ok(());
        }
        debug!(leased = batch.len(), worker_id = %self.worker_id, "Leased payment intents");

        for intent in batch {
            if let Err(e) = self.process_intent(&intent).await {
                warn!(reference = %intent.reference, error = %e, "Intent processing failed");
                if let Err(release_err) = self.release_lease(&intent.reference).await {
                    warn!(reference = %intent.reference, error = %release_err, "Lease release failed");
                }
            }
        }
        Ok(())
    }

    /// Step 1: intents that never produced an oracle transaction id go
    /// terminal after the stale window.
    async fn expire_stale(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE payment_intents
            SET normalized_status = 'failed', last_error = 'stale_no_transaction', updated_at = NOW()
            WHERE oracle_transaction_id IS NULL
              AND normalized_status = 'pending'
              AND created_at < NOW() - ($1 * INTERVAL '1 second')
            "#,
        )
        .bind(self.config.stale_window_secs)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Step 2: lease a batch under SKIP LOCKED and commit before any
    /// external I/O.
    async fn lease_batch(&self) -> Result<Vec<PaymentIntent>> {
        if let Err(e) = self.store_breaker.try_acquire() {
            debug!(error = %e, "Store breaker open, skipping lease cycle");
            return Ok(Vec::new());
        }

        let leased = async {
            let mut tx = self.pool.begin().await?;
            let batch = sqlx::query_as::<_, PaymentIntent>(&format!(
                r#"
                SELECT {INTENT_COLS} FROM payment_intents
                WHERE normalized_status = 'pending'
                  AND (locked_at IS NULL OR locked_at < NOW() - ($1 * INTERVAL '1 second'))
                  AND (next_retry_at IS NULL OR next_retry_at <= NOW())
                ORDER BY next_retry_at ASC NULLS FIRST, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
                "#
            ))
            .bind(self.config.lease_ttl_secs)
            .bind(self.config.batch_size)
            .fetch_all(&mut *tx)
            .await?;

            if !batch.is_empty() {
                let ids: Vec<Uuid> = batch.iter().map(|i| i.id).collect();
                sqlx::query(
                    "UPDATE payment_intents SET locked_at = NOW(), locked_by = $1 WHERE id = ANY($2)",
                )
                .bind(&self.worker_id)
                .bind(&ids)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok::<_, sqlx::Error>(batch)
        }
        .await;

        match leased {
            Ok(batch) => {
                self.store_breaker.record_success();
                Ok(batch)
            }
            Err(e) => {
                self.store_breaker.record_failure();
                Err(e.into())
            }
        }
    }

    /// Step 3: process one leased intent, outside any transaction.
    async fn process_intent(&self, intent: &PaymentIntent) -> Result<()> {
        let Some(ref transaction_id) = intent.oracle_transaction_id else {
            // Nothing to poll yet; stale expiry owns the deadline.
            return self.release_lease(&intent.reference).await;
        };

        match self.oracle.get_transaction(transaction_id).await {
            Ok(txn) => {
                let normalized = NormalizedStatus::from_raw(txn.transaction_status.as_deref());
                if normalized == NormalizedStatus::Confirmed && txn.transaction_hash.is_none() {
                    // Confirmed without a hash is not yet settlement-grade.
                    debug!(reference = %intent.reference, "Confirmed without hash, short retry");
                    return self
                        .schedule_retry(intent, "confirmed_without_hash")
                        .await;
                }
                self.apply_status(
                    &intent.reference,
                    normalized,
                    txn.transaction_status.as_deref(),
                    txn.transaction_hash.as_deref(),
                    None,
                )
                .await?;
                if normalized.is_terminal() {
                    info!(reference = %intent.reference, status = %normalized, "Payment intent settled");
                }
                Ok(())
            }
            Err(OracleError::NotFound) => {
                self.apply_status(
                    &intent.reference,
                    NormalizedStatus::Failed,
                    intent.raw_status.as_deref(),
                    None,
                    Some("not_found"),
                )
                .await
            }
            Err(e) if e.is_circuit_open() => {
                // Back off naturally next cycle; no retry-count increment.
                debug!(reference = %intent.reference, "Oracle circuit open, releasing lease");
                self.release_lease(&intent.reference).await
            }
            Err(e) => {
                warn!(reference = %intent.reference, error = %e, "Oracle poll failed, scheduling retry");
                self.schedule_retry(intent, &e.to_string()).await
            }
        }
    }

    /// Monotonic status update keyed by reference; releases the lease.
    async fn apply_status(
        &self,
        reference: &str,
        normalized: NormalizedStatus,
        raw_status: Option<&str>,
        tx_hash: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE payment_intents
            SET normalized_status = CASE WHEN normalized_status = 'pending' THEN $2 ELSE normalized_status END,
                raw_status = COALESCE($3, raw_status),
                transaction_hash = COALESCE($4, transaction_hash),
                last_error = COALESCE($5, last_error),
                locked_at = NULL, locked_by = NULL,
                updated_at = NOW()
            WHERE reference = $1
            "#,
        )
        .bind(reference)
        .bind(normalized.as_str())
        .bind(raw_status)
        .bind(tx_hash)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Step 4: exponential retry schedule, capped at the configured maximum.
    async fn schedule_retry(&self, intent: &PaymentIntent, error: &str) -> Result<()> {
        let next_count = intent.retry_count + 1;
        let delay_secs = self.retry_delay_secs(next_count);
        let next_retry_at = Utc::now() + chrono::Duration::seconds(delay_secs);

        sqlx::query(
            r#"
            UPDATE payment_intents
            SET retry_count = $2, last_retry_at = NOW(), next_retry_at = $3,
                last_error = $4, locked_at = NULL, locked_by = NULL, updated_at = NOW()
            WHERE reference = $1
            "#,
        )
        .bind(&intent.reference)
        .bind(next_count)
        .bind(next_retry_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        debug!(
            reference = %intent.reference,
            retry_count = next_count,
            delay_secs = delay_secs,
            "Retry scheduled"
        );
        Ok(())
    }

    fn retry_delay_secs(&self, retry_count: i32) -> i64 {
        let shift = retry_count.clamp(0, 30) as u32;
        let exponential = self
            .config
            .retry_base_secs
            .saturating_mul(1i64 << shift.min(20));
        exponential.clamp(self.config.retry_base_secs, self.config.retry_max_secs)
    }

    async fn release_lease(&self, reference: &str) -> Result<()> {
        sqlx::query(
            "UPDATE payment_intents SET locked_at = NULL, locked_by = NULL, updated_at = NOW() WHERE reference = $1",
        )
        .bind(reference)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OracleConfig;

    fn worker() -> PaymentWorker {
        let config = WorkerConfig {
            poll_interval_ms: 10_000,
            stale_window_secs: 600,
            batch_size: 10,
            lease_ttl_secs: 60,
            retry_base_secs: 5,
            retry_max_secs: 60,
            watchdog_interval_ms: 5000,
            gc_interval_secs: 300,
        };
        let oracle = Arc::new(PaymentOracleClient::new(OracleConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            app_id: "app_test".to_string(),
            api_key: "key".to_string(),
        }));
        PaymentWorker::new(
            sqlx::PgPool::connect_lazy("postgres://localhost/blinkduel_test").unwrap(),
            oracle,
            config,
        )
    }

    #[tokio::test]
    async fn retry_delay_doubles_up_to_the_cap() {
        let worker = worker();
        assert_eq!(worker.retry_delay_secs(1), 10);
        assert_eq!(worker.retry_delay_secs(2), 20);
        assert_eq!(worker.retry_delay_secs(3), 40);
        assert_eq!(worker.retry_delay_secs(4), 60);
        assert_eq!(worker.retry_delay_secs(10), 60);
        assert_eq!(worker.retry_delay_secs(30), 60);
    }

    #[tokio::test]
    async fn retry_delay_never_undershoots_base() {
        let worker = worker();
        assert!(worker.retry_delay_secs(0) >= 5);
    }

    #[tokio::test]
    async fn worker_id_carries_pid() {
        let worker = worker();
        assert!(worker.worker_id.contains(':'));
    }
}

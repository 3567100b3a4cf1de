//! Match maintenance loops.
//!
//! Two cadences over the orchestrator's watchdog entry points: a fast tick
//! for gameplay deadlines (deposits, ready watchdog, tap windows,
//! abandonment) and a slow garbage-collection sweep (stale matches, claim
//! expiry, overdue refunds, queue cleanup). Sweeps log and continue; a
//! single failure never kills the loop.

use crate::config::WorkerConfig;
use crate::service::match_service::MatchService;
use crate::service::matchmaking_service::MatchmakingService;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

pub struct MaintenanceWorker {
    matches: Arc<MatchService>,
    matchmaking: Arc<MatchmakingService>,
    config: WorkerConfig,
}

impl MaintenanceWorker {
    pub fn new(
        matches: Arc<MatchService>,
        matchmaking: Arc<MatchmakingService>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            matches,
            matchmaking,
            config,
        }
    }

    /// Fast cadence: gameplay deadlines.
    pub async fn run_watchdog(self: Arc<Self>) {
        info!(interval_ms = self.config.watchdog_interval_ms, "Match watchdog started");
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.watchdog_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.watchdog_tick().await;
        }
    }

    async fn watchdog_tick(&self) {
        if let Err(e) = self.matches.expire_deposit_timeouts().await {
            error!(error = %e, "Deposit-timeout sweep failed");
        }
        if let Err(e) = self.matches.expire_ready_timeouts().await {
            error!(error = %e, "Ready-timeout sweep failed");
        }
        if let Err(e) = self.matches.expire_tap_windows().await {
            error!(error = %e, "Tap-window sweep failed");
        }
        if let Err(e) = self.matches.expire_abandoned().await {
            error!(error = %e, "Abandonment sweep failed");
        }
        // Queue TTLs and the disconnect grace run on second granularity.
        match self.matchmaking.gc().await {
            Ok(removed) if removed > 0 => debug!(removed = removed, "Queue entries expired"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Queue GC failed"),
        }
    }

    /// Slow cadence: garbage collection and deadline expiry.
    pub async fn run_gc(self: Arc<Self>) {
        info!(interval_secs = self.config.gc_interval_secs, "Maintenance GC started");
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.gc_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.gc_tick().await;
        }
    }

    async fn gc_tick(&self) {
        match self.matches.gc_stale_matches().await {
            Ok(cancelled) if cancelled > 0 => {
                info!(cancelled = cancelled, "Stale matches cancelled")
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Stale-match GC failed"),
        }
        if let Err(e) = self.matches.expire_claims().await {
            error!(error = %e, "Claim expiry sweep failed");
        }
        match self.matches.process_due_refunds().await {
            Ok(processed) if processed > 0 => {
                info!(processed = processed, "Overdue refunds processed")
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Refund sweep failed"),
        }
    }
}

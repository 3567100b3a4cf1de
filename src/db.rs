use crate::api_error::ApiError;
use crate::config::DatabaseConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

pub type DbPool = PgPool;

pub async fn create_pool(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.url)
        .await
}

pub async fn health_check(pool: &DbPool) -> Result<(), ApiError> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(ApiError::database_error)?;
    Ok(())
}

/// Startup migrations. Every statement is idempotent (IF NOT EXISTS) so the
/// set can be re-applied on every boot.
const MIGRATIONS: &[&str] = &[
    // users
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id              UUID PRIMARY KEY,
        wallet_address  TEXT NOT NULL,
        wins            INTEGER NOT NULL DEFAULT 0,
        losses          INTEGER NOT NULL DEFAULT 0,
        matches_played  INTEGER NOT NULL DEFAULT 0,
        avg_reaction_ms DOUBLE PRECISION,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_wallet ON users (wallet_address)",
    // matches: green_light_time is an absolute epoch-millisecond BIGINT to
    // keep millisecond precision out of time-zone territory.
    r#"
    CREATE TABLE IF NOT EXISTS matches (
        id                    UUID PRIMARY KEY,
        idempotency_key       TEXT,
        player1_id            UUID NOT NULL,
        player2_id            UUID NOT NULL,
        player1_wallet        TEXT NOT NULL,
        player2_wallet        TEXT NOT NULL,
        stake_amount          NUMERIC NOT NULL,
        status                TEXT NOT NULL,
        green_light_time      BIGINT,
        signal_delay_ms       BIGINT,
        winner_id             UUID,
        result_type           TEXT,
        completed_at          TIMESTAMPTZ,
        player1_ready         BOOLEAN NOT NULL DEFAULT FALSE,
        player2_ready         BOOLEAN NOT NULL DEFAULT FALSE,
        player1_ready_at      TIMESTAMPTZ,
        player2_ready_at      TIMESTAMPTZ,
        player1_staked        BOOLEAN NOT NULL DEFAULT FALSE,
        player2_staked        BOOLEAN NOT NULL DEFAULT FALSE,
        player1_disqualified  BOOLEAN NOT NULL DEFAULT FALSE,
        player2_disqualified  BOOLEAN NOT NULL DEFAULT FALSE,
        player1_reaction_ms   BIGINT,
        player2_reaction_ms   BIGINT,
        fee_amount            NUMERIC,
        claim_status          TEXT,
        claim_deadline        TIMESTAMPTZ,
        winner_wallet         TEXT,
        loser_wallet          TEXT,
        player1_last_ping     TIMESTAMPTZ,
        player2_last_ping     TIMESTAMPTZ,
        player1_disconnects   INTEGER NOT NULL DEFAULT 0,
        player2_disconnects   INTEGER NOT NULL DEFAULT 0,
        cancel_reason         TEXT,
        created_at            TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at            TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_matches_idempotency ON matches (idempotency_key) WHERE idempotency_key IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_matches_player1 ON matches (player1_id, completed_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_matches_player2 ON matches (player2_id, completed_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_matches_status ON matches (status)",
    // tap_events: first-write-wins hinges on the unique pair constraint.
    r#"
    CREATE TABLE IF NOT EXISTS tap_events (
        id                UUID PRIMARY KEY,
        match_id          UUID NOT NULL,
        user_id           UUID NOT NULL,
        client_timestamp  BIGINT,
        server_timestamp  BIGINT NOT NULL,
        reaction_ms       BIGINT NOT NULL,
        is_valid          BOOLEAN NOT NULL,
        disqualified      BOOLEAN NOT NULL DEFAULT FALSE,
        disqualify_reason TEXT,
        created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_tap_events_match_user ON tap_events (match_id, user_id)",
    // payment_intents
    r#"
    CREATE TABLE IF NOT EXISTS payment_intents (
        id                    UUID PRIMARY KEY,
        reference             TEXT NOT NULL,
        user_id               UUID NOT NULL,
        amount                NUMERIC NOT NULL,
        match_id              UUID,
        raw_status            TEXT,
        normalized_status     TEXT NOT NULL,
        oracle_transaction_id TEXT,
        transaction_hash      TEXT,
        locked_at             TIMESTAMPTZ,
        locked_by             TEXT,
        retry_count           INTEGER NOT NULL DEFAULT 0,
        last_retry_at         TIMESTAMPTZ,
        next_retry_at         TIMESTAMPTZ,
        last_error            TEXT,
        refund_status         TEXT NOT NULL DEFAULT 'none',
        refund_deadline       TIMESTAMPTZ,
        refund_amount         NUMERIC,
        refund_reason         TEXT,
        created_at            TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at            TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_payment_intents_reference ON payment_intents (reference)",
    "CREATE INDEX IF NOT EXISTS idx_payment_intents_user ON payment_intents (user_id)",
    "CREATE INDEX IF NOT EXISTS idx_payment_intents_match ON payment_intents (match_id)",
    "CREATE INDEX IF NOT EXISTS idx_payment_intents_status ON payment_intents (normalized_status)",
    "CREATE INDEX IF NOT EXISTS idx_payment_intents_next_retry ON payment_intents (next_retry_at) WHERE next_retry_at IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_payment_intents_locked ON payment_intents (locked_at) WHERE locked_at IS NOT NULL",
    // matchmaking queue entries (authoritative; in-process FIFO is a cache)
    r#"
    CREATE TABLE IF NOT EXISTS match_queue_entries (
        id              UUID PRIMARY KEY,
        user_id         UUID NOT NULL,
        stake           NUMERIC NOT NULL,
        status          TEXT NOT NULL,
        disconnected_at TIMESTAMPTZ,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        expires_at      TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_queue_user ON match_queue_entries (user_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_queue_stake ON match_queue_entries (stake, status, created_at)",
    // FSM transition audit
    r#"
    CREATE TABLE IF NOT EXISTS match_transitions (
        id             UUID PRIMARY KEY,
        match_id       UUID NOT NULL,
        from_status    TEXT NOT NULL,
        to_status      TEXT NOT NULL,
        correlation_id TEXT NOT NULL,
        reason         TEXT,
        created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_transitions_match ON match_transitions (match_id, created_at)",
    // settlement ledger backing escrow idempotency
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        id           UUID PRIMARY KEY,
        match_id     UUID,
        user_id      UUID,
        kind         TEXT NOT NULL,
        status       TEXT NOT NULL,
        tx_hash      TEXT,
        amount       NUMERIC,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        completed_at TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_transactions_match_kind ON transactions (match_id, kind, status)",
    // anti-cheat findings; advisory only, never blocks a match
    r#"
    CREATE TABLE IF NOT EXISTS anti_cheat_audit (
        id         UUID PRIMARY KEY,
        user_id    UUID NOT NULL,
        match_id   UUID,
        finding    TEXT NOT NULL,
        details    JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_anti_cheat_user ON anti_cheat_audit (user_id, created_at)",
];

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    for statement in MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = MIGRATIONS.len(), "Database migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent_by_construction() {
        for statement in MIGRATIONS {
            let normalized = statement.to_uppercase();
            assert!(
                normalized.contains("IF NOT EXISTS"),
                "non-idempotent migration: {}",
                &statement[..60.min(statement.len())]
            );
        }
    }

    #[test]
    fn required_payment_intent_indexes_present() {
        let all = MIGRATIONS.join("\n");
        for idx in [
            "idx_payment_intents_reference",
            "idx_payment_intents_user",
            "idx_payment_intents_match",
            "idx_payment_intents_status",
            "idx_payment_intents_next_retry",
            "idx_payment_intents_locked",
            "idx_tap_events_match_user",
        ] {
            assert!(all.contains(idx), "missing index {}", idx);
        }
    }
}

use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub escrow: EscrowConfig,
    pub oracle: OracleConfig,
    pub game: GameConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub frontend_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowConfig {
    pub rpc_url: String,
    pub contract_address: String,
    pub signer_key: String,
    pub platform_wallet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    pub base_url: String,
    pub app_id: String,
    pub api_key: String,
}

/// Gameplay timing and fee constants. Millisecond fields are i64 because they
/// participate in epoch-millisecond arithmetic against `green_light_time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    pub signal_delay_min_ms: i64,
    pub signal_delay_max_ms: i64,
    pub countdown_duration_ms: i64,
    pub min_human_reaction_ms: i64,
    pub max_reaction_ms: i64,
    pub clock_sync_tolerance_ms: i64,
    pub max_tap_window_ms: i64,
    pub tie_threshold_ms: i64,
    pub platform_fee_percent: u32,
    pub matchmaking_timeout_ms: i64,
    pub match_start_timeout_ms: i64,
    pub stake_deposit_timeout_ms: i64,
    pub claim_window_secs: i64,
    pub refund_window_secs: i64,
    pub disconnect_threshold_ms: i64,
    pub queue_grace_period_secs: u64,
    pub stable_connection_threshold_ms: i64,
    pub max_hard_reconnects: i32,
    pub min_funding_duration_ms: i64,
    pub active_match_ttl_secs: u64,
    pub active_socket_ttl_secs: u64,
    pub stale_match_max_age_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub stale_window_secs: i64,
    pub batch_size: i64,
    pub lease_ttl_secs: i64,
    pub retry_base_secs: i64,
    pub retry_max_secs: i64,
    pub watchdog_interval_ms: u64,
    pub gc_interval_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn optional(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse::<T>().map_err(|_| ConfigError::Invalid(name, raw)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is fine in production.
        dotenvy::dotenv().ok();

        Ok(Self {
            server: ServerConfig {
                host: optional("HOST", "0.0.0.0"),
                port: parse("PORT", 8080)?,
                frontend_url: env::var("FRONTEND_URL").ok(),
            },
            database: DatabaseConfig {
                url: required("DATABASE_URL")?,
                max_connections: parse("DATABASE_MAX_CONNECTIONS", 10)?,
            },
            redis: RedisConfig {
                url: optional("REDIS_URL", "redis://127.0.0.1:6379"),
            },
            auth: AuthConfig {
                jwt_secret: required("JWT_SECRET")?,
            },
            escrow: EscrowConfig {
                rpc_url: required("WORLD_CHAIN_RPC_URL")?,
                contract_address: required("ESCROW_CONTRACT_ADDRESS")?,
                signer_key: required("BACKEND_PRIVATE_KEY")?,
                platform_wallet: required("PLATFORM_WALLET_ADDRESS")?,
            },
            oracle: OracleConfig {
                base_url: optional("ORACLE_BASE_URL", "https://developer.worldcoin.org"),
                app_id: required("APP_ID")?,
                api_key: required("DEV_PORTAL_API_KEY")?,
            },
            game: GameConfig::from_env()?,
            worker: WorkerConfig {
                poll_interval_ms: parse("PAYMENT_POLL_INTERVAL_MS", 10_000)?,
                stale_window_secs: parse("PAYMENT_STALE_WINDOW_SECS", 600)?,
                batch_size: parse("PAYMENT_BATCH_SIZE", 10)?,
                lease_ttl_secs: parse("PAYMENT_LEASE_TTL_SECS", 60)?,
                retry_base_secs: parse("PAYMENT_RETRY_BASE_SECS", 5)?,
                retry_max_secs: parse("PAYMENT_RETRY_MAX_SECS", 60)?,
                watchdog_interval_ms: parse("WATCHDOG_INTERVAL_MS", 5000)?,
                gc_interval_secs: parse("GC_INTERVAL_SECS", 300)?,
            },
        })
    }
}

impl GameConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            signal_delay_min_ms: parse("SIGNAL_DELAY_MIN_MS", 2000)?,
            signal_delay_max_ms: parse("SIGNAL_DELAY_MAX_MS", 5000)?,
            countdown_duration_ms: parse("COUNTDOWN_DURATION_MS", 3000)?,
            min_human_reaction_ms: parse("MIN_REACTION_MS", 80)?,
            max_reaction_ms: parse("MAX_REACTION_MS", 3000)?,
            clock_sync_tolerance_ms: parse("CLOCK_SYNC_TOLERANCE_MS", 50)?,
            max_tap_window_ms: parse("MAX_TAP_WINDOW_MS", 10_000)?,
            tie_threshold_ms: parse("TIE_THRESHOLD_MS", 1)?,
            platform_fee_percent: parse("PLATFORM_FEE_PERCENT", 3)?,
            matchmaking_timeout_ms: parse("MATCHMAKING_TIMEOUT_MS", 30_000)?,
            match_start_timeout_ms: parse("MATCH_START_TIMEOUT_MS", 60_000)?,
            stake_deposit_timeout_ms: parse("STAKE_DEPOSIT_TIMEOUT_MS", 120_000)?,
            claim_window_secs: parse("CLAIM_WINDOW_SECS", 3600)?,
            refund_window_secs: parse("REFUND_WINDOW_SECS", 86_400)?,
            disconnect_threshold_ms: parse("DISCONNECT_THRESHOLD_MS", 30_000)?,
            queue_grace_period_secs: parse("QUEUE_GRACE_PERIOD_SECS", 30)?,
            stable_connection_threshold_ms: parse("STABLE_CONNECTION_THRESHOLD_MS", 5000)?,
            max_hard_reconnects: parse("MAX_HARD_RECONNECTS", 5)?,
            min_funding_duration_ms: parse("MIN_FUNDING_DURATION_MS", 20_000)?,
            active_match_ttl_secs: parse("ACTIVE_MATCH_TTL_SECS", 7200)?,
            active_socket_ttl_secs: parse("ACTIVE_SOCKET_TTL_SECS", 3600)?,
            stale_match_max_age_secs: parse("STALE_MATCH_MAX_AGE_SECS", 600)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn game_defaults_are_internally_consistent() {
        let game = GameConfig::from_env().unwrap();
        assert!(game.signal_delay_min_ms < game.signal_delay_max_ms);
        assert!(game.clock_sync_tolerance_ms < game.min_human_reaction_ms);
        assert!(game.max_reaction_ms < game.max_tap_window_ms);
        assert_eq!(game.platform_fee_percent, 3);
    }

    #[test]
    fn parse_falls_back_to_default() {
        assert_eq!(parse::<i64>("NO_SUCH_ENV_VAR_XYZ", 42).unwrap(), 42);
    }
}

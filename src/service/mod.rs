// Service layer
pub mod anti_cheat;
pub mod circuit_breaker;
pub mod escrow_service;
pub mod maintenance_worker;
pub mod match_service;
pub mod matchmaking_service;
pub mod oracle_service;
pub mod payment_service;
pub mod payment_worker;
pub mod session_service;

pub use anti_cheat::AntiCheatService;
pub use circuit_breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitOpenError};
pub use escrow_service::{EscrowCallResult, EscrowError, EscrowMatchState, EscrowService, StakeStatus};
pub use maintenance_worker::MaintenanceWorker;
pub use match_service::{MatchService, PlayerRef};
pub use matchmaking_service::{EnqueueOutcome, MatchmakingService};
pub use oracle_service::{OracleError, OracleTransaction, PaymentOracleClient};
pub use payment_service::PaymentService;
pub use payment_worker::PaymentWorker;
pub use session_service::{DisconnectClass, SessionService};

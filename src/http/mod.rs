pub mod health;
pub mod match_handler;
pub mod payment_handler;

use crate::service::circuit_breaker::CircuitBreaker;
use crate::service::match_service::MatchService;
use crate::service::matchmaking_service::MatchmakingService;
use crate::service::payment_service::PaymentService;
use crate::service::session_service::SessionService;
use actix_web::web;
use std::sync::Arc;

/// Shared handler state.
pub struct AppState {
    pub matches: Arc<MatchService>,
    pub matchmaking: Arc<MatchmakingService>,
    pub payments: Arc<PaymentService>,
    pub sessions: Arc<SessionService>,
    pub oracle_breaker: Arc<CircuitBreaker>,
}

/// Authenticated API routes, mounted under /api behind the auth middleware.
pub fn configure_api_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/match")
            .route("/enqueue", web::post().to(match_handler::enqueue))
            .route("/cancel", web::post().to(match_handler::cancel_search))
            .route("/confirm-stake", web::post().to(match_handler::confirm_stake))
            .route("/ready", web::post().to(match_handler::ready))
            .route("/state/{match_id}", web::get().to(match_handler::get_state))
            .route("/tap", web::post().to(match_handler::tap))
            .route("/result/{match_id}", web::get().to(match_handler::get_result))
            .route("/heartbeat", web::post().to(match_handler::heartbeat))
            .route("/claim", web::post().to(match_handler::claim))
            .route("/refund", web::post().to(match_handler::refund)),
    )
    .route("/matches/history", web::get().to(match_handler::history))
    .route(
        "/initiate-payment",
        web::post().to(payment_handler::initiate_payment),
    )
    .route(
        "/confirm-payment",
        web::post().to(payment_handler::confirm_payment),
    )
    .route(
        "/payment/{reference}",
        web::get().to(payment_handler::get_payment),
    );
}

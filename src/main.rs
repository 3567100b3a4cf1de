use actix_web::{web, App, HttpServer};
use std::io;
use std::sync::Arc;
use tokio::signal;

mod api_error;
mod auth;
mod config;
mod db;
mod http;
mod middleware;
mod models;
mod service;
mod telemetry;

use crate::auth::{AuthMiddleware, JwtService};
use crate::config::Config;
use crate::db::{create_pool, run_migrations};
use crate::http::AppState;
use crate::middleware::cors_middleware;
use crate::service::{
    AntiCheatService, EscrowService, MaintenanceWorker, MatchService, MatchmakingService,
    PaymentOracleClient, PaymentService, PaymentWorker, SessionService,
};
use crate::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> io::Result<()> {
    let config = Config::from_env().expect("Failed to load configuration");

    init_telemetry();

    let db_pool = create_pool(&config.database)
        .await
        .expect("Failed to create database pool");
    run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let redis_client =
        redis::Client::open(config.redis.url.clone()).expect("Invalid Redis URL");
    let redis_conn = redis_client
        .get_connection_manager()
        .await
        .expect("Failed to connect to Redis");

    let sessions = Arc::new(SessionService::new(redis_conn, config.game.clone()));
    let escrow = Arc::new(EscrowService::new(config.escrow.clone()));
    let oracle = Arc::new(PaymentOracleClient::new(config.oracle.clone()));
    let anti_cheat = Arc::new(AntiCheatService::new(db_pool.clone()));
    let matches = Arc::new(MatchService::new(
        db_pool.clone(),
        escrow.clone(),
        sessions.clone(),
        anti_cheat.clone(),
        config.game.clone(),
    ));
    let matchmaking = Arc::new(MatchmakingService::new(
        db_pool.clone(),
        sessions.clone(),
        config.game.clone(),
    ));
    let payments = Arc::new(PaymentService::new(db_pool.clone()));

    let payment_worker = Arc::new(PaymentWorker::new(
        db_pool.clone(),
        oracle.clone(),
        config.worker.clone(),
    ));
    tokio::spawn(payment_worker.run());

    let maintenance = Arc::new(MaintenanceWorker::new(
        matches.clone(),
        matchmaking.clone(),
        config.worker.clone(),
    ));
    tokio::spawn(maintenance.clone().run_watchdog());
    tokio::spawn(maintenance.run_gc());

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "Starting reaction-duel backend"
    );

    let jwt_secret = config.auth.jwt_secret.clone();
    let frontend_url = config.server.frontend_url.clone();
    let bind_addr = (config.server.host.clone(), config.server.port);

    let server = HttpServer::new(move || {
        let app_state = AppState {
            matches: matches.clone(),
            matchmaking: matchmaking.clone(),
            payments: payments.clone(),
            sessions: sessions.clone(),
            oracle_breaker: oracle.breaker(),
        };
        App::new()
            .app_data(web::Data::new(db_pool.clone()))
            .app_data(web::Data::new(app_state))
            .wrap(cors_middleware(frontend_url.as_deref()))
            .wrap(actix_web::middleware::Logger::default())
            .service(
                web::scope("/api")
                    .route("/health", web::get().to(crate::http::health::health_check))
                    .service(
                        web::scope("")
                            .wrap(AuthMiddleware::new(JwtService::new(&jwt_secret)))
                            .configure(crate::http::configure_api_routes),
                    ),
            )
    })
    .bind(bind_addr)?
    .run();

    // Graceful shutdown
    let server_handle = server.handle();
    tokio::spawn(async move {
        signal::ctrl_c()
            .await
            .expect("Failed to listen for shutdown signal");
        tracing::info!("Shutdown signal received, stopping server...");
        server_handle.stop(true).await;
    });

    server.await
}

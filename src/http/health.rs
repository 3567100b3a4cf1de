use crate::api_error::ApiError;
use crate::db::DbPool;
use crate::http::AppState;
use actix_web::{web, HttpResponse, Result};

pub async fn health_check(
    db_pool: web::Data<DbPool>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    crate::db::health_check(&db_pool).await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "database": "ok",
        "oracle_breaker": state.oracle_breaker.stats()
    })))
}

use actix_web::{http::StatusCode, HttpResponse};
use serde::{Deserialize, Serialize};
use std::fmt;

/// API error envelope. `error` carries the machine-readable detail code,
/// `code` the HTTP class used for status mapping.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
    pub code: String,
}

impl ApiError {
    pub fn new(error: impl Into<String>, message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            code: code.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("Bad Request", message, "BAD_REQUEST")
    }

    /// State-not-suitable errors (match already started, payment not
    /// confirmed, ...). `detail` is the machine-readable code clients branch on.
    pub fn precondition(detail: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(detail, message, "PRECONDITION_FAILED")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("Not Found", message, "NOT_FOUND")
    }

    pub fn conflict(detail: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(detail, message, "CONFLICT")
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new("Too Many Requests", message, "RATE_LIMITED")
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new("Internal Server Error", message, "INTERNAL_ERROR")
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("Unauthorized", message, "UNAUTHORIZED")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("Forbidden", message, "FORBIDDEN")
    }

    pub fn database_error(err: impl std::fmt::Display) -> Self {
        Self::internal_error(format!("Database error: {}", err))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

impl actix_web::ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let status_code = match self.code.as_str() {
            "BAD_REQUEST" | "PRECONDITION_FAILED" => StatusCode::BAD_REQUEST,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
            "FORBIDDEN" => StatusCode::FORBIDDEN,
            "CONFLICT" => StatusCode::CONFLICT,
            "RATE_LIMITED" => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        HttpResponse::build(status_code).json(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::ResponseError;

    #[test]
    fn status_mapping_covers_the_taxonomy() {
        assert_eq!(
            ApiError::precondition("escrow_not_verified", "stakes missing")
                .error_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::conflict("already_in_match", "active match exists")
                .error_response()
                .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::rate_limited("slow down").error_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::not_found("no such match").error_response().status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn precondition_keeps_machine_code_in_error_field() {
        let err = ApiError::precondition("payment_not_confirmed", "intent still pending");
        assert_eq!(err.error, "payment_not_confirmed");
        assert_eq!(err.code, "PRECONDITION_FAILED");
    }
}

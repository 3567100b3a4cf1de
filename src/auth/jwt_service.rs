use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// JWT-related errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("Token generation failed: {0}")]
    TokenGeneration(String),

    #[error("Token validation failed: {0}")]
    TokenValidation(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    InvalidToken,
}

impl From<jsonwebtoken::errors::Error> for JwtError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::TokenExpired,
            _ => JwtError::TokenValidation(err.to_string()),
        }
    }
}

/// Claims minted by the auth service on wallet login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    /// Wallet address bound at login
    pub wallet: String,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn user_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.sub).ok()
    }
}

#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    token_expiry: Duration,
}

impl JwtService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            token_expiry: Duration::hours(12),
        }
    }

    /// Issue a token for a wallet-authenticated user. The nonce handshake
    /// itself lives in the out-of-scope auth service.
    pub fn generate_token(&self, user_id: Uuid, wallet: &str) -> Result<String, JwtError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            wallet: wallet.to_string(),
            iat: now.timestamp(),
            exp: (now + self.token_expiry).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| JwtError::TokenGeneration(e.to_string()))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, JwtError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        if data.claims.user_id().is_none() {
            return Err(JwtError::InvalidToken);
        }
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> JwtService {
        JwtService::new("test-secret")
    }

    #[test]
    fn round_trip_preserves_identity() {
        let service = service();
        let user_id = Uuid::new_v4();
        let token = service.generate_token(user_id, "0xabc").unwrap();
        let claims = service.validate_token(&token).unwrap();
        assert_eq!(claims.user_id(), Some(user_id));
        assert_eq!(claims.wallet, "0xabc");
    }

    #[test]
    fn tampered_token_is_rejected() {
        let service = service();
        let token = service.generate_token(Uuid::new_v4(), "0xabc").unwrap();
        let other = JwtService::new("different-secret");
        assert!(other.validate_token(&token).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(service().validate_token("not.a.token").is_err());
    }

    #[test]
    fn non_uuid_subject_is_rejected() {
        let service = service();
        let now = Utc::now();
        let claims = Claims {
            sub: "not-a-uuid".to_string(),
            wallet: "0xabc".to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::hours(1)).timestamp(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(matches!(
            service.validate_token(&token),
            Err(JwtError::InvalidToken)
        ));
    }
}

//! Authentication
//!
//! HS256 bearer tokens carrying the account id and email. `require_auth`
//! verifies the token and makes an [`AuthUser`] available to handlers as a
//! request extension.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Account id
    pub sub: Uuid,
    pub email: String,
    pub exp: i64,
    pub iat: i64,
}

/// The authenticated caller, inserted into request extensions by
/// [`require_auth`]
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub account_id: Uuid,
    pub email: String,
}

#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiry_hours: i64,
}

impl JwtManager {
    pub fn new(secret: &str, expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiry_hours,
        }
    }

    /// Mint a token for the given account. Production tokens come from the
    /// external identity service with the same secret; this path exists for
    /// local development tooling and the tests below.
    pub fn create_token(&self, account_id: Uuid, email: &str) -> Result<String, ApiError> {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: account_id,
            email: email.to_string(),
            iat: now.unix_timestamp(),
            exp: (now + time::Duration::hours(self.expiry_hours)).unix_timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| ApiError::Internal(format!("failed to sign token: {}", e)))
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|_| ApiError::Unauthorized("invalid or expired token".into()))
    }
}

/// Reject the request unless it carries a valid bearer token
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;

    let claims = state.jwt_manager.verify_token(token)?;
    request.extensions_mut().insert(AuthUser {
        account_id: claims.sub,
        email: claims.email,
    });
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "a-test-secret-that-is-long-enough!!";

    #[test]
    fn test_token_round_trip() {
        let manager = JwtManager::new(SECRET, 24);
        let account_id = Uuid::new_v4();
        let token = manager.create_token(account_id, "user@example.com").unwrap();
        let claims = manager.verify_token(&token).unwrap();
        assert_eq!(claims.sub, account_id);
        assert_eq!(claims.email, "user@example.com");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_garbage_token_rejected() {
        let manager = JwtManager::new(SECRET, 24);
        assert!(manager.verify_token("not-a-token").is_err());
        assert!(manager.verify_token("").is_err());
    }

    #[test]
    fn test_token_from_other_secret_rejected() {
        let issuer = JwtManager::new("some-other-secret-also-long-enough!", 24);
        let verifier = JwtManager::new(SECRET, 24);
        let token = issuer
            .create_token(Uuid::new_v4(), "user@example.com")
            .unwrap();
        assert!(verifier.verify_token(&token).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        // Negative expiry puts exp in the past
        let manager = JwtManager::new(SECRET, -1);
        let token = manager
            .create_token(Uuid::new_v4(), "user@example.com")
            .unwrap();
        assert!(manager.verify_token(&token).is_err());
    }
}

//! Session authentication
//!
//! Tokens are HS256 JWTs issued elsewhere; `sub` carries the user UUID. The
//! token is read from `Authorization: Bearer ...` or the `session_token`
//! cookie.

use crate::errors::ApiError;
use actix_web::{dev::Payload, http::header, web, FromRequest, HttpRequest};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use loyalty_core::UserId;
use serde::{Deserialize, Serialize};
use std::future::{ready, Ready};
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "session_token";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

#[derive(Clone)]
pub struct JwtKeys {
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Resolve a token to the user it was issued for
    pub fn authenticate(&self, token: &str) -> Result<UserId, ApiError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|err| {
            tracing::warn!("JWT validation failed: {:?}", err);
            ApiError::Unauthorized("invalid or expired token".to_string())
        })?;

        let id = Uuid::parse_str(&data.claims.sub)
            .map_err(|_| ApiError::Unauthorized("token subject is not a user id".to_string()))?;
        Ok(UserId::new(id))
    }
}

fn bearer_token(req: &HttpRequest) -> Option<String> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

/// Extractor for the requesting user
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedUser(pub UserId);

impl FromRequest for AuthenticatedUser {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let keys = match req.app_data::<web::Data<JwtKeys>>() {
            Some(keys) => keys,
            None => {
                return ready(Err(ApiError::Internal(
                    "authentication is not configured".to_string(),
                )))
            }
        };

        let token = bearer_token(req).or_else(|| req.cookie(SESSION_COOKIE).map(|c| c.value().to_string()));

        ready(match token {
            Some(token) => keys.authenticate(&token).map(AuthenticatedUser),
            None => Err(ApiError::Unauthorized("missing session token".to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn sign(secret: &str, sub: String, exp: i64) -> String {
        let claims = Claims {
            sub,
            exp: exp as usize,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn in_an_hour() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn test_authenticate_valid_token() {
        let keys = JwtKeys::new("secret");
        let user = UserId::generate();

        let token = sign("secret", user.to_string(), in_an_hour());
        assert_eq!(keys.authenticate(&token).unwrap(), user);
    }

    #[test]
    fn test_expired_or_malformed_subject_rejected() {
        let keys = JwtKeys::new("secret");

        let expired = sign("secret", UserId::generate().to_string(), 1_000);
        assert!(matches!(keys.authenticate(&expired), Err(ApiError::Unauthorized(_))));

        let not_a_user = sign("secret", "alice".to_string(), in_an_hour());
        assert!(matches!(keys.authenticate(&not_a_user), Err(ApiError::Unauthorized(_))));
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let token = sign("other", UserId::generate().to_string(), in_an_hour());

        assert!(matches!(
            JwtKeys::new("secret").authenticate(&token),
            Err(ApiError::Unauthorized(_))
        ));
    }
}

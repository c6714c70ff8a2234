//! Short-lived signed bearer tokens for out-of-band flows.
//!
//! A token carries a single payload string (the recipient email) plus
//! `iat`/`exp` claims, signed with HS256. Verify-account and change-password
//! flows each get their own codec with an independent secret and TTL.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    value: String,
    iat: i64,
    exp: i64,
}

/// Issues and verifies tokens for one flow.
#[derive(Clone)]
pub struct TokenCodec {
    secret: SecretString,
    ttl: Duration,
}

impl TokenCodec {
    #[must_use]
    pub fn new(secret: SecretString, ttl: Duration) -> Self {
        Self { secret, ttl }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token carrying `value`, expiring after the configured TTL.
    ///
    /// # Errors
    /// Returns `INTERNAL` when signing fails.
    pub fn issue(&self, value: &str) -> ServiceResult<String> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            value: value.to_string(),
            iat: now,
            exp: now.saturating_add(ttl),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.expose_secret().as_bytes()),
        )
        .map_err(|err| ServiceError::internal(format!("can't create token: {err}")))
    }

    /// Verify a token and return its payload string.
    ///
    /// # Errors
    /// Signature mismatch, expiry in the past, structural malformation, and
    /// any algorithm other than HS256 all surface as `INVALID_ARGUMENT`.
    pub fn parse(&self, token: &str) -> ServiceResult<String> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.expose_secret().as_bytes()),
            &validation,
        )
        .map(|data| data.claims.value)
        .map_err(|err| ServiceError::invalid_argument(format!("invalid token: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(secret: &str, ttl: Duration) -> TokenCodec {
        TokenCodec::new(SecretString::from(secret.to_string()), ttl)
    }

    #[test]
    fn issue_then_parse_returns_payload() {
        let codec = codec("verify-secret", Duration::from_secs(60));
        let token = codec.issue("a@b.c").expect("issue");
        assert_eq!(codec.parse(&token).expect("parse"), "a@b.c");
    }

    #[test]
    fn parse_rejects_wrong_secret() {
        let issuer = codec("verify-secret", Duration::from_secs(60));
        let other = codec("change-password-secret", Duration::from_secs(60));
        let token = issuer.issue("a@b.c").expect("issue");
        let err = other.parse(&token).expect_err("must fail");
        assert_eq!(err.kind, crate::error::Kind::InvalidArgument);
    }

    #[test]
    fn parse_rejects_expired_token() {
        let codec = codec("verify-secret", Duration::from_secs(60));
        let now = Utc::now().timestamp();
        let claims = Claims {
            value: "a@b.c".to_string(),
            iat: now - 120,
            exp: now - 60,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"verify-secret"),
        )
        .expect("encode");
        let err = codec.parse(&token).expect_err("must fail");
        assert_eq!(err.kind, crate::error::Kind::InvalidArgument);
    }

    #[test]
    fn parse_rejects_foreign_algorithm() {
        let codec = codec("verify-secret", Duration::from_secs(60));
        let now = Utc::now().timestamp();
        let claims = Claims {
            value: "a@b.c".to_string(),
            iat: now,
            exp: now + 60,
        };
        let token = encode(
            &Header::new(Algorithm::HS384),
            &claims,
            &EncodingKey::from_secret(b"verify-secret"),
        )
        .expect("encode");
        assert!(codec.parse(&token).is_err());
    }

    #[test]
    fn parse_rejects_garbage() {
        let codec = codec("verify-secret", Duration::from_secs(60));
        assert!(codec.parse("not-a-token").is_err());
        assert!(codec.parse("").is_err());
    }
}

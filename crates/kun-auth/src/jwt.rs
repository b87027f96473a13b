//! Login tokens (HS256 JWT)

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_ISSUER: &str = "kun";
pub const DEFAULT_AUDIENCE: &str = "kun-tunnel";

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("Token encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    Expired,
}

/// Claims of a login token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginClaims {
    /// Access key id the token was issued to
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
    /// Token id
    pub jti: String,
}

impl LoginClaims {
    pub fn new(access_key_id: &str, issuer: &str, audience: &str, validity: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: access_key_id.to_string(),
            iat: now.timestamp(),
            exp: (now + validity).timestamp(),
            iss: issuer.to_string(),
            aud: audience.to_string(),
            jti: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Issues and verifies login tokens with a shared secret
#[derive(Clone)]
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
    validity: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &[u8], validity: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            issuer: DEFAULT_ISSUER.to_string(),
            audience: DEFAULT_AUDIENCE.to_string(),
            validity,
        }
    }

    /// Issuer with a random per-process secret; tokens do not survive a restart
    pub fn ephemeral(validity: Duration) -> Self {
        let secret = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        Self::new(secret.as_bytes(), validity)
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    pub fn issue(&self, access_key_id: &str) -> Result<(String, DateTime<Utc>), JwtError> {
        let claims = LoginClaims::new(access_key_id, &self.issuer, &self.audience, self.validity);
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| JwtError::EncodingFailed(e.to_string()))?;
        Ok((token, claims.expires_at()))
    }

    pub fn verify(&self, token: &str) -> Result<LoginClaims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.leeway = 0;

        decode::<LoginClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                _ => JwtError::InvalidToken(e.to_string()),
            })
    }
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("validity", &self.validity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let issuer = TokenIssuer::new(b"test-secret", Duration::hours(1));
        let (token, expires_at) = issuer.issue("key-1").unwrap();
        assert!(expires_at > Utc::now());

        let claims = issuer.verify(&token).unwrap();
        assert_eq!(claims.sub, "key-1");
        assert_eq!(claims.iss, DEFAULT_ISSUER);
        assert_eq!(claims.expires_at(), expires_at);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = TokenIssuer::new(b"secret-a", Duration::hours(1));
        let other = TokenIssuer::new(b"secret-b", Duration::hours(1));
        let (token, _) = issuer.issue("key-1").unwrap();
        assert!(matches!(other.verify(&token), Err(JwtError::InvalidToken(_))));
        assert!(matches!(issuer.verify("garbage"), Err(JwtError::InvalidToken(_))));
    }

    #[test]
    fn test_expired_token() {
        let issuer = TokenIssuer::new(b"secret", Duration::seconds(-10));
        let (token, _) = issuer.issue("key-1").unwrap();
        assert!(matches!(issuer.verify(&token), Err(JwtError::Expired)));
    }

    #[test]
    fn test_issuer_mismatch() {
        let a = TokenIssuer::new(b"secret", Duration::hours(1));
        let b = TokenIssuer::new(b"secret", Duration::hours(1)).with_issuer("other");
        let (token, _) = a.issue("key-1").unwrap();
        assert!(b.verify(&token).is_err());
    }
}

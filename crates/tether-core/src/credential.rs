//! Bearer credentials.
//!
//! Tokens are JWT-shaped (`header.claims.signature`). The client only reads
//! the claims segment to learn who the token belongs to and when it expires;
//! the signature is the server's business.

use crate::identity::{Identity, IdentityParseError};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The claims the client cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject the token was issued to.
    pub sub: String,
    /// Issued at (Unix seconds).
    pub iat: i64,
    /// Expiration time (Unix seconds).
    pub exp: i64,
}

impl Claims {
    pub fn new(subject: &Identity, issued_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            sub: subject.to_string(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        }
    }

    /// Encode as an unsigned (`alg: none`) token.
    ///
    /// Useful for development servers and fixtures; a production server
    /// signs its own tokens.
    pub fn encode_unsigned(&self) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        // Serializing three plain fields cannot fail.
        let claims = serde_json::to_vec(self).unwrap_or_default();
        format!("{header}.{}.unsigned", URL_SAFE_NO_PAD.encode(claims))
    }
}

/// A bearer token plus its decoded identity and validity window.
///
/// Credentials are replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    identity: Identity,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Credential {
    /// Decode a token, checking that its claims are well formed.
    ///
    /// Expiry is not checked here; use [`Credential::is_expired_at`].
    pub fn decode(token: impl Into<String>) -> Result<Self, CredentialError> {
        let token = token.into();
        let mut segments = token.split('.');
        let claims = match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(claims), Some(_), None) if !claims.is_empty() => claims,
            _ => return Err(CredentialError::Malformed),
        };

        let bytes = URL_SAFE_NO_PAD.decode(claims.trim_end_matches('='))?;
        let claims: Claims = serde_json::from_slice(&bytes)?;

        let identity = Identity::new(claims.sub)?;
        let issued_at = DateTime::from_timestamp(claims.iat, 0)
            .ok_or(CredentialError::Timestamp(claims.iat))?;
        let expires_at = DateTime::from_timestamp(claims.exp, 0)
            .ok_or(CredentialError::Timestamp(claims.exp))?;
        if expires_at <= issued_at {
            return Err(CredentialError::InvalidLifetime {
                issued_at,
                expires_at,
            });
        }

        Ok(Self {
            token,
            identity,
            issued_at,
            expires_at,
        })
    }

    /// The raw bearer token.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Total validity window (`exp - iat`).
    pub fn lifetime(&self) -> Duration {
        (self.expires_at - self.issued_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Why a token could not be turned into a [`Credential`].
///
/// Callers treat all of these as "no credential", never as a crash.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("token is not a three-segment bearer token")]
    Malformed,
    #[error("claims segment is not base64url: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("claims segment is not valid JSON claims: {0}")]
    Claims(#[from] serde_json::Error),
    #[error("invalid subject: {0}")]
    Subject(#[from] IdentityParseError),
    #[error("timestamp out of range: {0}")]
    Timestamp(i64),
    #[error("token expires ({expires_at}) before it was issued ({issued_at})")]
    InvalidLifetime {
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    #[error("token expired at {0}")]
    Expired(DateTime<Utc>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn token_for(sub: &str, lifetime_secs: i64) -> String {
        let now = Utc::now();
        Claims {
            sub: sub.to_string(),
            iat: now.timestamp(),
            exp: (now + TimeDelta::seconds(lifetime_secs)).timestamp(),
        }
        .encode_unsigned()
    }

    #[test]
    fn decode_unsigned_token() {
        let cred = Credential::decode(token_for("alice", 900)).unwrap();
        assert_eq!(cred.identity().as_str(), "alice");
        assert_eq!(cred.lifetime(), Duration::from_secs(900));
        assert!(!cred.is_expired());
    }

    #[test]
    fn expiry_is_reported_not_rejected() {
        let now = Utc::now();
        let token = Claims {
            sub: "alice".into(),
            iat: (now - TimeDelta::seconds(120)).timestamp(),
            exp: (now - TimeDelta::seconds(60)).timestamp(),
        }
        .encode_unsigned();
        let cred = Credential::decode(token).unwrap();
        assert!(cred.is_expired());
        assert_eq!(cred.remaining_at(now), Duration::ZERO);
    }

    #[test]
    fn malformed_tokens() {
        assert!(matches!(
            Credential::decode("not-a-token"),
            Err(CredentialError::Malformed)
        ));
        assert!(matches!(
            Credential::decode("a..c"),
            Err(CredentialError::Malformed)
        ));
        assert!(matches!(
            Credential::decode("a.!!!.c"),
            Err(CredentialError::Encoding(_))
        ));
        let not_claims = URL_SAFE_NO_PAD.encode(br#"{"hello":1}"#);
        assert!(matches!(
            Credential::decode(format!("h.{not_claims}.s")),
            Err(CredentialError::Claims(_))
        ));
    }

    #[test]
    fn lifetime_must_be_positive() {
        let token = Claims {
            sub: "alice".into(),
            iat: 1_700_000_100,
            exp: 1_700_000_000,
        }
        .encode_unsigned();
        assert!(matches!(
            Credential::decode(token),
            Err(CredentialError::InvalidLifetime { .. })
        ));
    }
}

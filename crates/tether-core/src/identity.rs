//! Session identity.
//!
//! An identity is the subject a credential was issued to. Two credentials
//! with the same identity describe the same logged-in user, which is what
//! decides whether a credential change can be applied in-band or needs a
//! fresh connection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The subject of a credential (e.g. `user_42`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Create an identity, validating the subject.
    pub fn new(subject: impl Into<String>) -> Result<Self, IdentityParseError> {
        subject.into().try_into()
    }

    /// The raw subject string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.to_string().try_into()
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.is_empty() {
            return Err(IdentityParseError::Empty);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(IdentityParseError::Whitespace(s));
        }
        Ok(Self(s))
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.0
    }
}

/// Error parsing an identity string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityParseError {
    #[error("identity subject cannot be empty")]
    Empty,
    #[error("identity subject cannot contain whitespace, got: {0:?}")]
    Whitespace(String),
}

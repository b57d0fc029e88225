//! [`SessionIdentifier`], the opaque key under which a [`crate::proxy::SessionProxy`] is
//! reachable in the [`crate::registry::SessionRegistry`].
//!
//! A session identifier is whatever the external control plane chose when it materialized the
//! session (commonly a Kubernetes object name or a UUID). The core does not mint these; it only
//! validates that a candidate is safe to embed verbatim in a URL path segment and in log output,
//! since it is used as both.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum length we accept for a session identifier.
///
/// Generous enough for a Kubernetes object name (max 253) while keeping log lines and URLs
/// bounded.
const MAX_LEN: usize = 253;

/// An opaque, URL-path-safe, short string identifying one active session.
///
/// Unique per active session within the process. Safe to log and to embed verbatim in a URL path
/// segment: construction rejects anything that is not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionIdentifier(String);

/// A candidate session identifier was rejected.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvalidSessionIdentifier {
    /// The candidate was empty.
    #[error("session identifier must not be empty")]
    Empty,
    /// The candidate exceeded [`MAX_LEN`].
    #[error("session identifier longer than {MAX_LEN} characters")]
    TooLong,
    /// The candidate contained a byte that is not safe in a URL path segment.
    #[error("session identifier contains a character that is not URL-path-safe: {0:?}")]
    InvalidChar(char),
}

impl SessionIdentifier {
    /// Validates and wraps `id`.
    ///
    /// Accepts ASCII letters, digits, `-`, `_` and `.` only, a conservative subset of what is
    /// legal in a URL path segment, chosen so the identifier never needs percent-encoding and
    /// never collides with the `/kas` suffix or a neighboring path separator.
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidSessionIdentifier> {
        let id = id.into();
        if id.is_empty() {
            return Err(InvalidSessionIdentifier::Empty);
        }
        if id.len() > MAX_LEN {
            return Err(InvalidSessionIdentifier::TooLong);
        }
        if let Some(bad) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(InvalidSessionIdentifier::InvalidChar(bad));
        }
        Ok(Self(id))
    }

    /// Borrows the identifier as a plain string, e.g. for use as a log field or path segment.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionIdentifier {
    type Error = InvalidSessionIdentifier;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionIdentifier> for String {
    fn from(value: SessionIdentifier) -> Self {
        value.0
    }
}

//! Bearer tokens.

use crate::principal::{Principal, PrincipalClass};
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for a token.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId(Uuid);

impl TokenId {
    /// Generate a new random token ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({})", self.0)
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored bearer token bound to one principal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub principal: String,
    pub class: PrincipalClass,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub description: Option<String>,
}

impl Token {
    /// Check if the token is valid at `now` (not expired or revoked).
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }

        if let Some(expires_at) = self.expires_at
            && now >= expires_at
        {
            return false;
        }

        true
    }

    /// Check if the token is currently valid.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(OffsetDateTime::now_utc())
    }

    /// The principal this token authenticates.
    pub fn principal(&self) -> Principal {
        Principal {
            identity: self.principal.clone(),
            class: self.class,
        }
    }
}

/// Normalise a configured token hash: strip an optional `sha256:` prefix,
/// lowercase, and require 64 hex characters.
pub fn normalize_token_hash(raw: &str) -> crate::Result<String> {
    let hash = raw.strip_prefix("sha256:").unwrap_or(raw).to_lowercase();
    if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(crate::Error::InvalidToken(
            "token hash must be 64 hex characters".to_string(),
        ));
    }
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn token() -> Token {
        Token {
            id: TokenId::new(),
            principal: "uploader".to_string(),
            class: PrincipalClass::Upload,
            expires_at: None,
            revoked_at: None,
            created_at: OffsetDateTime::now_utc(),
            description: None,
        }
    }

    #[test]
    fn test_validity() {
        let now = OffsetDateTime::now_utc();
        let mut t = token();
        assert!(t.is_valid_at(now));

        t.expires_at = Some(now - Duration::seconds(1));
        assert!(!t.is_valid_at(now));

        t.expires_at = Some(now + Duration::hours(1));
        assert!(t.is_valid_at(now));

        t.revoked_at = Some(now);
        assert!(!t.is_valid_at(now));
    }

    #[test]
    fn test_principal() {
        let p = token().principal();
        assert_eq!(p.identity, "uploader");
        assert!(p.is_upload());
    }

    #[test]
    fn test_normalize_token_hash() {
        let upper = "9F735E0DF9A1DDC702BF0A1A7B83033F9F7153A00C29DE82CEDADC9957289B05";
        let normalized = normalize_token_hash(&format!("sha256:{upper}")).unwrap();
        assert_eq!(normalized, upper.to_lowercase());
        assert!(normalize_token_hash("abc").is_err());
        assert!(normalize_token_hash(&"z".repeat(64)).is_err());
    }
}

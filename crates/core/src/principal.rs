//! Authenticated principals.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Class of an authenticated principal.
///
/// Only the upload principal may destroy an image together with its
/// dependent instances.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalClass {
    Ordinary,
    Upload,
}

impl PrincipalClass {
    /// Parse from string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "ordinary" => Ok(Self::Ordinary),
            "upload" => Ok(Self::Upload),
            _ => Err(crate::Error::InvalidPrincipalClass(s.to_string())),
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ordinary => "ordinary",
            Self::Upload => "upload",
        }
    }
}

impl fmt::Display for PrincipalClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The caller behind a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Identity string (e.g. an email address or service name).
    pub identity: String,
    pub class: PrincipalClass,
}

impl Principal {
    pub fn ordinary(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            class: PrincipalClass::Ordinary,
        }
    }

    pub fn upload(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            class: PrincipalClass::Upload,
        }
    }

    pub fn is_upload(&self) -> bool {
        self.class == PrincipalClass::Upload
    }
}

//! Image identity and lifecycle state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Store-assigned image identifier. Never reused once assigned.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(i64);

impl ImageId {
    /// Wrap a raw identifier.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Parse from a string (e.g. a path segment).
    ///
    /// Only positive decimal integers name an image.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s.parse::<i64>() {
            Ok(id) if id > 0 && !s.starts_with('+') => Ok(Self(id)),
            _ => Err(crate::Error::InvalidImageId(s.to_string())),
        }
    }

    /// Get the raw identifier.
    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl FromStr for ImageId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Debug for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageId({})", self.0)
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An image: a snapshot of an uploaded backup that becomes the clone
/// source for instances once finalised.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    pub id: ImageId,
    /// When the source database backup was taken.
    pub backed_up_at: OffsetDateTime,
    /// Script run against the upload before it is sealed read-only.
    /// Opaque to the orchestrator.
    pub anonymisation_script: Vec<u8>,
    /// Flips from false to true exactly once, on finalisation.
    pub ready: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Image {
    /// Whether instances may be cloned from this image.
    pub fn can_clone(&self) -> bool {
        self.ready
    }
}

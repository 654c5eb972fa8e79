//! Instance identity.

use crate::image::ImageId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Instance identifier, reserved from the store before the executor runs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(i64);

impl InstanceId {
    /// Wrap a raw identifier.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Parse from a string (e.g. a path segment).
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s.parse::<i64>() {
            Ok(id) if id > 0 && !s.starts_with('+') => Ok(Self(id)),
            _ => Err(crate::Error::InvalidInstanceId(s.to_string())),
        }
    }

    /// Get the raw identifier.
    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl FromStr for InstanceId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A running, writable clone of a ready image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instance {
    pub id: InstanceId,
    pub image_id: ImageId,
    /// TCP port the database process listens on. Unique among live instances.
    pub port: u16,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Convert a stored port column back to a port number.
pub fn port_from_i64(value: i64) -> crate::Result<u16> {
    u16::try_from(value)
        .ok()
        .filter(|p| *p != 0)
        .ok_or(crate::Error::InvalidPort(value))
}

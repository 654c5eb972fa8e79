//! Database models mapping to the store schema.

use clonedb_core::instance::port_from_i64;
use clonedb_core::{Image, ImageId, Instance, InstanceId, PrincipalClass, Token, TokenId};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Images
// =============================================================================

/// Image record.
#[derive(Debug, Clone, FromRow)]
pub struct ImageRow {
    pub image_id: i64,
    pub backed_up_at: OffsetDateTime,
    pub anonymisation_script: Vec<u8>,
    pub ready: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Fields supplied when registering a new image. The id is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub backed_up_at: OffsetDateTime,
    pub anonymisation_script: Vec<u8>,
    pub created_at: OffsetDateTime,
}

impl From<ImageRow> for Image {
    fn from(row: ImageRow) -> Self {
        Image {
            id: ImageId::new(row.image_id),
            backed_up_at: row.backed_up_at,
            anonymisation_script: row.anonymisation_script,
            ready: row.ready,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

// =============================================================================
// Instances
// =============================================================================

/// Instance record.
#[derive(Debug, Clone, FromRow)]
pub struct InstanceRow {
    pub instance_id: i64,
    pub image_id: i64,
    pub port: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl InstanceRow {
    pub fn new(instance: &Instance) -> Self {
        Self {
            instance_id: instance.id.get(),
            image_id: instance.image_id.get(),
            port: i64::from(instance.port),
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

impl TryFrom<InstanceRow> for Instance {
    type Error = clonedb_core::Error;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(Instance {
            id: InstanceId::new(row.instance_id),
            image_id: ImageId::new(row.image_id),
            port: port_from_i64(row.port)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// =============================================================================
// Tokens
// =============================================================================

/// Token record.
#[derive(Debug, Clone, FromRow)]
pub struct TokenRow {
    pub token_id: Uuid,
    pub principal: String,
    pub principal_class: String,
    pub token_hash: String,
    pub expires_at: Option<OffsetDateTime>,
    pub revoked_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
    pub description: Option<String>,
}

impl TryFrom<TokenRow> for Token {
    type Error = clonedb_core::Error;

    fn try_from(row: TokenRow) -> Result<Self, Self::Error> {
        Ok(Token {
            id: TokenId::from_uuid(row.token_id),
            principal: row.principal,
            class: PrincipalClass::parse(&row.principal_class)?,
            expires_at: row.expires_at,
            revoked_at: row.revoked_at,
            created_at: row.created_at,
            description: row.description,
        })
    }
}

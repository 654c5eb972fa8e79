//! Core domain types for clonedb.
//!
//! This crate defines the data model shared by every other crate:
//! - Images (finalisable snapshots of uploaded database backups)
//! - Instances (running clones of a ready image)
//! - Principals and the class that gates cascading destroys
//! - Bearer tokens
//! - Service configuration

pub mod config;
pub mod error;
pub mod image;
pub mod instance;
pub mod principal;
pub mod token;

pub use error::{Error, Result};
pub use image::{Image, ImageId};
pub use instance::{Instance, InstanceId};
pub use principal::{Principal, PrincipalClass};
pub use token::{Token, TokenId};

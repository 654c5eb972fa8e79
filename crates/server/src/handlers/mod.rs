//! HTTP request handlers.

pub mod auth;
pub mod common;
pub mod health;
pub mod images;
pub mod instances;

pub use auth::*;
pub use common::*;
pub use health::*;
pub use images::*;
pub use instances::*;

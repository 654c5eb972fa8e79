//! Repository traits for store operations.

pub mod bootstrap;
pub mod images;
pub mod instances;
pub mod tokens;

pub use bootstrap::BootstrapRepo;
pub use images::ImageRepo;
pub use instances::InstanceRepo;
pub use tokens::TokenRepo;

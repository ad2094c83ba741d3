pub mod backend;
pub mod error;
mod factory;
mod models;
pub mod path;

pub use crate::backend::{BackendConfig, ConnectionPool, StorageBackend};
pub use crate::factory::{ClientFactory, DefaultFactory};
pub use crate::models::{DEFAULT_MODE, FileEntry, Protocol};
pub use fsbridge_config::{Settings, StorageDescriptor};

pub type BackendHandle = Box<dyn StorageBackend + Send + Sync>;

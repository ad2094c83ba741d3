//! Configuration error types.

use derive_more::{Display, Error};
use std::path::PathBuf;

pub type Error = exn::Exn<ConfigError>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    /// The file could not be read or did not match the expected shape.
    #[display("failed to load configuration from {}", _0.display())]
    Load(#[error(not(source))] PathBuf),
    #[display("unsupported configuration format: {}", _0.display())]
    UnsupportedFormat(#[error(not(source))] PathBuf),
    #[display("could not determine the configuration directory")]
    NoConfigDirectory,
}

//! percept-core: shared foundation for the percept perception pipeline
//!
//! Error types, configuration file loading and capture timestamps used by
//! every other crate in the workspace.

pub mod config;
pub mod error;
pub mod stamp;

pub use config::{load_config, ConfigFormat, LoggingConfig};
pub use error::{Error, Result};
pub use stamp::Stamp;

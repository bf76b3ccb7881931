pub mod config;
pub mod error;

pub use config::{Backend, DeviceConfig, HarnessConfig, ProfileConfig, StatusPolicy};
pub use error::ConfigError;

pub mod config;
pub mod manifest;
pub mod sharing_key;
pub mod types;

pub use config::{ConfigError, ProviderConfig};
pub use manifest::*;
pub use sharing_key::make_ip_sharing_key;
pub use types::*;

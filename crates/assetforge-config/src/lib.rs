//! KDL configuration parsing for assetforge.
//!
//! This crate handles parsing of:
//! - System configuration (assetforge.kdl): server, database, providers, queues
//! - Duration strings (`500ms`, `5s`, `5m`, `24h`, `1d`)

pub mod duration;
pub mod error;
mod nodes;
pub mod system;

pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use system::{
    DatabaseConfig, ProviderConfig, ProviderKind, QueueConfig, RateLimitConfig, RetentionConfig,
    ServerConfig, SystemConfig, TimeoutConfig, load_from_path, parse_system_config,
};

/// Default config file name.
pub const DEFAULT_CONFIG_PATH: &str = "assetforge.kdl";

/// Environment variable overriding the config path.
pub const CONFIG_PATH_ENV: &str = "ASSETFORGE_CONFIG";

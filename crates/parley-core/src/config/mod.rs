//! Configuration module for parley
//!
//! Handles loading and parsing of `.parley.toml` configuration files
//! with support for environment variable expansion.

mod loader;
mod profiles;
mod types;

pub use loader::{load_config, load_from_file, parse_config, sample_config, user_config_path, ConfigError};
pub use profiles::{default_profiles, IdleConfig, IdleStrategy, ProfilesConfig, ProgramProfile};
pub use types::{
    LoggingConfig, OutputConfig, ParleyConfig, RepliesConfig, RouterConfig, ServerConfig,
};

//! Configuration loader with environment variable expansion
//!
//! Loads configuration from `.parley.toml` in the project root or the user
//! config directory.

use super::types::ParleyConfig;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: String, value: String },
}

impl From<ConfigError> for crate::error::ParleyError {
    fn from(err: ConfigError) -> Self {
        crate::error::ParleyError::Config(err.to_string())
    }
}

/// Load configuration from various sources
///
/// Priority order:
/// 1. Project-level `.parley.toml`
/// 2. User-level `~/.config/parley/config.toml`
/// 3. Default configuration
pub fn load_config(project_dir: &Path) -> Result<ParleyConfig, ConfigError> {
    let project_config = project_dir.join(".parley.toml");
    if project_config.exists() {
        return load_from_file(&project_config);
    }

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            return load_from_file(&user_config);
        }
    }

    apply_env_overrides(ParleyConfig::default())
}

/// User config file path
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("parley").join("config.toml"))
}

/// Load configuration from a specific file
pub fn load_from_file(path: &Path) -> Result<ParleyConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse configuration text, expand `${VAR}` references and apply overrides
pub fn parse_config(content: &str) -> Result<ParleyConfig, ConfigError> {
    let mut config: ParleyConfig = toml::from_str(content)?;
    config.profiles.merge_defaults();
    expand_env_vars(&mut config);
    apply_env_overrides(config)
}

fn env_regex() -> &'static Regex {
    static ENV_REGEX: OnceLock<Regex> = OnceLock::new();
    ENV_REGEX.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("static regex"))
}

/// Expand ${VAR} patterns in profile commands, arguments and env values
fn expand_env_vars(config: &mut ParleyConfig) {
    let regex = env_regex();

    for profile in config.profiles.profiles.values_mut() {
        profile.command = expand_string(&profile.command, regex);
        for arg in profile.default_args.iter_mut() {
            *arg = expand_string(arg, regex);
        }
        for value in profile.env.values_mut() {
            *value = expand_string(value, regex);
        }
    }
}

/// Expand environment variables in a single string
fn expand_string(s: &str, regex: &Regex) -> String {
    regex
        .replace_all(s, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        })
        .to_string()
}

/// Apply environment variable overrides
///
/// - PARLEY_HOME -> home
/// - PARLEY_ROUNDTRIP_TIMEOUT_SECS -> router.roundtrip_timeout_secs
/// - PARLEY_LOG -> logging.level
fn apply_env_overrides(mut config: ParleyConfig) -> Result<ParleyConfig, ConfigError> {
    if let Ok(home) = std::env::var("PARLEY_HOME") {
        if !home.is_empty() {
            config.home = Some(PathBuf::from(home));
        }
    }

    if let Ok(value) = std::env::var("PARLEY_ROUNDTRIP_TIMEOUT_SECS") {
        config.router.roundtrip_timeout_secs =
            value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "PARLEY_ROUNDTRIP_TIMEOUT_SECS".to_string(),
                value: value.clone(),
            })?;
    }

    if let Ok(level) = std::env::var("PARLEY_LOG") {
        if !level.is_empty() {
            config.logging.level = level;
        }
    }

    Ok(config)
}

/// Sample configuration for documentation
pub fn sample_config() -> &'static str {
    r#"# parley configuration
# home = "/home/me/.parley"

[router]
roundtrip_timeout_secs = 60
poll_interval_ms = 500

[replies]
retention_secs = 3600

[server]
host = "127.0.0.1"
port = 0

[profiles.reviewer]
name = "Reviewer"
command = "claude"
default_args = ["--model", "${REVIEW_MODEL}"]
skills = ["review"]

[profiles.reviewer.idle]
strategy = "hybrid"
pattern = '(?m)^\s*>\s*$'
quiet_ms = 2000
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdleStrategy;

    #[test]
    fn test_sample_config_parses() {
        let config = parse_config(sample_config()).unwrap();
        let reviewer = config.profiles.get("reviewer").unwrap();
        assert_eq!(reviewer.idle.strategy, IdleStrategy::Hybrid);
        assert_eq!(reviewer.idle.quiet_ms, 2000);
        // built-ins survive a user-defined profile table
        assert!(config.profiles.get("claude").is_some());
    }

    #[test]
    fn test_expand_string() {
        std::env::set_var("PARLEY_TEST_MODEL", "opus");
        let out = expand_string("--model=${PARLEY_TEST_MODEL}", env_regex());
        assert_eq!(out, "--model=opus");

        let untouched = expand_string("${PARLEY_TEST_UNSET_VAR}", env_regex());
        assert_eq!(untouched, "${PARLEY_TEST_UNSET_VAR}");
    }

    #[test]
    fn test_load_from_project_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(".parley.toml"),
            "[router]\npoll_interval_ms = 50\n",
        )
        .unwrap();
        let config = load_config(dir.path()).unwrap();
        assert_eq!(config.router.poll_interval_ms, 50);
    }

    #[test]
    fn test_parse_error() {
        let err = parse_config("[router\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}

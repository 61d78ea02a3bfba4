//! Program profiles
//!
//! A profile tells the supervisor how to launch one kind of interactive CLI
//! and how to tell when it is waiting for input.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// How the supervisor decides that a session is idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleStrategy {
    /// A regex on the output tail
    Pattern,
    /// A quiet interval with no output
    Timeout,
    /// Pattern first, quiet interval once the pattern stops showing up
    Hybrid,
}

/// Idle detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleConfig {
    #[serde(default = "default_strategy")]
    pub strategy: IdleStrategy,

    /// Ready-prompt regex, required for `pattern` and `hybrid`
    #[serde(default)]
    pub pattern: Option<String>,

    /// Quiet interval for `timeout` and the `hybrid` fallback
    #[serde(default = "default_quiet_ms")]
    pub quiet_ms: u64,

    /// How long `hybrid` waits for the pattern before falling back
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

fn default_strategy() -> IdleStrategy {
    IdleStrategy::Timeout
}

fn default_quiet_ms() -> u64 {
    1500
}

fn default_grace_ms() -> u64 {
    10_000
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            pattern: None,
            quiet_ms: default_quiet_ms(),
            grace_ms: default_grace_ms(),
        }
    }
}

impl IdleConfig {
    pub fn pattern(pattern: &str) -> Self {
        Self {
            strategy: IdleStrategy::Pattern,
            pattern: Some(pattern.to_string()),
            ..Self::default()
        }
    }

    pub fn hybrid(pattern: &str) -> Self {
        Self {
            strategy: IdleStrategy::Hybrid,
            pattern: Some(pattern.to_string()),
            ..Self::default()
        }
    }

    pub fn quiet(&self) -> Duration {
        Duration::from_millis(self.quiet_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// Configuration for one wrapped program
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramProfile {
    /// Human-readable name for display
    #[serde(default)]
    pub name: String,

    /// Command to execute (e.g., "claude", "codex")
    pub command: String,

    /// Arguments passed on every launch
    #[serde(default)]
    pub default_args: Vec<String>,

    /// Whether to run in the current working directory
    #[serde(default = "default_true")]
    pub use_cwd: bool,

    /// Additional environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub idle: IdleConfig,

    /// Bytes that commit a line of input
    #[serde(default = "default_submit")]
    pub submit_sequence: String,

    /// Pause between payload and submit sequence
    #[serde(default)]
    pub submit_delay_ms: u64,

    /// Written instead of a SIGINT when set (some TUIs cancel on Escape)
    #[serde(default)]
    pub interrupt_sequence: Option<String>,

    /// Readiness is not reported before this much time has passed
    #[serde(default)]
    pub startup_delay_ms: u64,

    /// Prefix injected messages with `[from <id>]`
    #[serde(default)]
    pub announce_sender: bool,

    /// Skills advertised in the capability descriptor
    #[serde(default)]
    pub skills: Vec<String>,

    /// Whether this profile is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_submit() -> String {
    "\r".to_string()
}

impl Default for ProgramProfile {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: String::new(),
            default_args: Vec::new(),
            use_cwd: true,
            env: HashMap::new(),
            idle: IdleConfig::default(),
            submit_sequence: default_submit(),
            submit_delay_ms: 0,
            interrupt_sequence: None,
            startup_delay_ms: 0,
            announce_sender: false,
            skills: Vec::new(),
            enabled: true,
        }
    }
}

impl ProgramProfile {
    /// A profile that runs `command` with the default settings
    pub fn for_command(command: &str) -> Self {
        Self {
            name: command.to_string(),
            command: command.to_string(),
            ..Self::default()
        }
    }

    pub fn submit_delay(&self) -> Duration {
        Duration::from_millis(self.submit_delay_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
}

/// Collection of program profiles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfilesConfig {
    /// Map of profile name to configuration
    pub profiles: HashMap<String, ProgramProfile>,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            profiles: default_profiles(),
        }
    }
}

impl ProfilesConfig {
    /// Get a profile by name
    pub fn get(&self, name: &str) -> Option<&ProgramProfile> {
        self.profiles.get(name)
    }

    /// Get all enabled profiles
    pub fn enabled(&self) -> impl Iterator<Item = (&String, &ProgramProfile)> {
        self.profiles.iter().filter(|(_, p)| p.enabled)
    }

    /// Check if a profile exists and is enabled
    pub fn is_available(&self, name: &str) -> bool {
        self.profiles.get(name).map(|p| p.enabled).unwrap_or(false)
    }

    /// Fill in built-in profiles the user did not override
    pub fn merge_defaults(&mut self) {
        for (name, profile) in default_profiles() {
            self.profiles.entry(name).or_insert(profile);
        }
    }
}

/// Built-in profiles for common agent CLIs
pub fn default_profiles() -> HashMap<String, ProgramProfile> {
    let mut profiles = HashMap::new();

    profiles.insert(
        "claude".to_string(),
        ProgramProfile {
            name: "Claude Code".to_string(),
            command: "claude".to_string(),
            idle: IdleConfig::hybrid(r"(?m)^\s*[>❯]\s*$"),
            submit_delay_ms: 150,
            interrupt_sequence: Some("\x1b".to_string()),
            startup_delay_ms: 1500,
            skills: vec!["code".into(), "review".into()],
            ..ProgramProfile::default()
        },
    );

    profiles.insert(
        "codex".to_string(),
        ProgramProfile {
            name: "Codex CLI".to_string(),
            command: "codex".to_string(),
            idle: IdleConfig::hybrid(r"(?m)^\s*›\s*$"),
            submit_delay_ms: 150,
            interrupt_sequence: Some("\x1b".to_string()),
            startup_delay_ms: 1500,
            skills: vec!["code".into()],
            ..ProgramProfile::default()
        },
    );

    profiles.insert(
        "gemini".to_string(),
        ProgramProfile {
            name: "Gemini CLI".to_string(),
            command: "gemini".to_string(),
            idle: IdleConfig::default(),
            submit_delay_ms: 100,
            startup_delay_ms: 2000,
            skills: vec!["code".into(), "research".into()],
            ..ProgramProfile::default()
        },
    );

    profiles.insert(
        "aider".to_string(),
        ProgramProfile {
            name: "Aider".to_string(),
            command: "aider".to_string(),
            idle: IdleConfig::pattern(r"(?m)^[\w./-]*>\s*$"),
            submit_sequence: "\n".to_string(),
            skills: vec!["code".into()],
            ..ProgramProfile::default()
        },
    );

    profiles.insert(
        "opencode".to_string(),
        ProgramProfile {
            name: "OpenCode".to_string(),
            command: "opencode".to_string(),
            idle: IdleConfig::default(),
            startup_delay_ms: 1500,
            skills: vec!["code".into()],
            ..ProgramProfile::default()
        },
    );

    profiles.insert(
        "shell".to_string(),
        ProgramProfile {
            name: "Shell".to_string(),
            command: std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            idle: IdleConfig::hybrid(r"[$#%>]\s*$"),
            skills: vec!["shell".into()],
            ..ProgramProfile::default()
        },
    );

    profiles
}

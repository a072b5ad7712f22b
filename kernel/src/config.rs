//! Kernel configuration, loaded once at startup from a TOML file.
//!
//! Config errors are fatal: the CLI prints the message and exits
//! non-zero. Runtime flags (`--max-concurrent`, `--force-speculate`,
//! `--dry-run`, `--watch`) override the loaded values.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Per-toolchain configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolchainConfig {
    /// Model name passed through to the adapter (adapter default when unset).
    #[serde(default)]
    pub model: Option<String>,
    /// Task timeout in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Extra command-line arguments for the tool binary.
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_timeout_seconds() -> u64 {
    1800
}

/// Default code gate commands, inherited by every manifest unless tags
/// override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateCommands {
    #[serde(default = "default_test_command")]
    pub test_command: String,
    #[serde(default = "default_typecheck_command")]
    pub typecheck_command: String,
    #[serde(default = "default_lint_command")]
    pub lint_command: String,
    /// Maximum time per gate subprocess, in seconds.
    #[serde(default = "default_gate_timeout")]
    pub gate_timeout_seconds: u64,
}

fn default_test_command() -> String {
    "cargo test".into()
}

fn default_typecheck_command() -> String {
    "cargo check".into()
}

fn default_lint_command() -> String {
    "cargo clippy -- -D warnings".into()
}

fn default_gate_timeout() -> u64 {
    1800
}

impl Default for GateCommands {
    fn default() -> Self {
        Self {
            test_command: default_test_command(),
            typecheck_command: default_typecheck_command(),
            lint_command: default_lint_command(),
            gate_timeout_seconds: default_gate_timeout(),
        }
    }
}

/// Speculate+vote configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculationConfig {
    /// Minimum winning score as a fraction of the 100-point scale.
    #[serde(default = "default_vote_threshold")]
    pub vote_threshold: f64,
    /// Cap on parallel candidates per speculate issue.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

fn default_vote_threshold() -> f64 {
    0.7
}

fn default_max_parallel() -> usize {
    3
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            vote_threshold: default_vote_threshold(),
            max_parallel: default_max_parallel(),
        }
    }
}

/// Top-level kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default = "default_repo_root")]
    pub repo_root: PathBuf,
    /// Graph-store location, relative to `repo_root` unless absolute.
    #[serde(default = "default_beads_dir")]
    pub beads_dir: PathBuf,

    #[serde(default = "default_max_workcells")]
    pub max_concurrent_workcells: usize,
    #[serde(default = "default_max_tokens")]
    pub max_concurrent_tokens: u64,

    /// Adapter names in routing order; first available wins.
    #[serde(default = "default_toolchain_priority")]
    pub toolchain_priority: Vec<String>,
    #[serde(default)]
    pub toolchains: HashMap<String, ToolchainConfig>,

    #[serde(default)]
    pub gates: GateCommands,
    #[serde(default)]
    pub speculation: SpeculationConfig,

    #[serde(default)]
    pub watch_mode: bool,
    #[serde(default)]
    pub dry_run: bool,
    /// Runtime override: mark every admitted issue speculate.
    #[serde(default)]
    pub force_speculate: bool,
}

fn default_repo_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_beads_dir() -> PathBuf {
    PathBuf::from(".beads")
}

fn default_max_workcells() -> usize {
    2
}

fn default_max_tokens() -> u64 {
    200_000
}

fn default_toolchain_priority() -> Vec<String> {
    vec!["claude".into(), "codex".into(), "opencode".into()]
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            repo_root: default_repo_root(),
            beads_dir: default_beads_dir(),
            max_concurrent_workcells: default_max_workcells(),
            max_concurrent_tokens: default_max_tokens(),
            toolchain_priority: default_toolchain_priority(),
            toolchains: HashMap::new(),
            gates: GateCommands::default(),
            speculation: SpeculationConfig::default(),
            watch_mode: false,
            dry_run: false,
            force_speculate: false,
        }
    }
}

impl KernelConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: KernelConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate invariants the rest of the kernel relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_workcells == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_workcells must be at least 1".into(),
            ));
        }
        if self.max_concurrent_tokens == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_tokens must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.speculation.vote_threshold) {
            return Err(ConfigError::Invalid(format!(
                "speculation.vote_threshold must be in [0, 1], got {}",
                self.speculation.vote_threshold
            )));
        }
        if self.speculation.max_parallel == 0 {
            return Err(ConfigError::Invalid(
                "speculation.max_parallel must be at least 1".into(),
            ));
        }
        if self.toolchain_priority.is_empty() {
            return Err(ConfigError::Invalid(
                "toolchain_priority must name at least one adapter".into(),
            ));
        }
        for name in self.toolchains.keys() {
            if !self.toolchain_priority.iter().any(|p| p == name) {
                return Err(ConfigError::Invalid(format!(
                    "toolchain {name:?} configured but missing from toolchain_priority"
                )));
            }
        }
        Ok(())
    }

    /// Absolute graph-store directory.
    pub fn beads_path(&self) -> PathBuf {
        if self.beads_dir.is_absolute() {
            self.beads_dir.clone()
        } else {
            self.repo_root.join(&self.beads_dir)
        }
    }

    /// Per-toolchain config, falling back to defaults.
    pub fn toolchain(&self, name: &str) -> ToolchainConfig {
        self.toolchains.get(name).cloned().unwrap_or_default()
    }

    /// Task timeout for a toolchain.
    pub fn toolchain_timeout(&self, name: &str) -> std::time::Duration {
        std::time::Duration::from_secs(self.toolchain(name).timeout_seconds)
    }
}

//! Configuration resolution for Fleet.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/fleet/settings.json)
//! 3. Environment variables
//! 4. CLI arguments (highest priority, applied by the binary)
//!
//! Every tuning value of the orchestration core lives here: the concurrency
//! cap, timeouts, signal grace periods, the watchdog heartbeat window, the
//! registry retention ceilings, and log tail limits. None of these are
//! protocol requirements; deployments override them freely as long as the
//! cap stays positive.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete Fleet configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub tail: TailConfig,
}

/// Daemon-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path to the wrapped agent CLI binary.
    pub agent_bin: PathBuf,
    /// Registry document path. `None` resolves to `~/.fleet/tasks.json`.
    pub tasks_file: Option<PathBuf>,
    /// Directory for background task log files. `None` resolves to the
    /// system temp directory.
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            agent_bin: PathBuf::from("claude"),
            tasks_file: None,
            log_dir: None,
            log_level: "info".to_string(),
        }
    }
}

/// Concurrency, timeout, and retention limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrently running agents (admission cap).
    pub max_agents: usize,
    /// Default wall-clock timeout for foreground runs (seconds).
    pub foreground_timeout_secs: u64,
    /// Default deadline for background runs (seconds).
    pub background_timeout_secs: u64,
    /// Grace between SIGTERM and SIGKILL on timeout escalation (seconds).
    pub term_grace_secs: u64,
    /// Grace between SIGTERM and SIGKILL on an explicit kill (seconds).
    pub kill_grace_secs: u64,
    /// Bounded wait after spawn before the liveness probe (milliseconds).
    pub spawn_probe_ms: u64,
    /// Reaper sweep interval (seconds).
    pub reaper_interval_secs: u64,
    /// Terminal records older than this are hidden from listings (seconds).
    pub display_ceiling_secs: u64,
    /// Records older than this are deleted outright (seconds).
    pub storage_ceiling_secs: u64,
    /// Watchdog heartbeat interval during the initial window (seconds).
    pub heartbeat_interval_secs: u64,
    /// Number of heartbeats before the watchdog goes quiet.
    pub heartbeat_count: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_agents: 4,
            foreground_timeout_secs: 600,
            background_timeout_secs: 1200,
            term_grace_secs: 5,
            kill_grace_secs: 2,
            spawn_probe_ms: 100,
            reaper_interval_secs: 300,
            display_ceiling_secs: 2 * 60 * 60,
            storage_ceiling_secs: 24 * 60 * 60,
            heartbeat_interval_secs: 30,
            heartbeat_count: 10,
        }
    }
}

/// Log tail reader limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailConfig {
    /// Hard upper bound on requested tail lines.
    pub max_lines: usize,
    /// Files at or below this size are read whole (bytes).
    pub safe_read_bytes: u64,
    /// Average line size used to size the trailing read window (bytes).
    pub window_bytes_per_line: u64,
    /// Divisor for the estimated total-line count on partial reads (bytes).
    pub estimate_bytes_per_line: u64,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            max_lines: 1000,
            safe_read_bytes: 1024 * 1024,
            window_bytes_per_line: 200,
            estimate_bytes_per_line: 100,
        }
    }
}

impl Config {
    /// Validate cross-field constraints.
    ///
    /// The only hard requirement is a positive admission cap; everything
    /// else is deployment tuning.
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_agents == 0 {
            return Err(Error::Config("limits.max_agents must be >= 1".into()));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config() -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        config = global;
    }

    apply_env_overrides(&mut config);
    config.validate()?;

    Ok(config)
}

/// Get the global config file path (`~/.config/fleet/settings.json` on
/// Linux, the platform config dir elsewhere).
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("fleet").join("settings.json"))
}

/// Default registry document path: `~/.fleet/tasks.json`.
pub fn default_tasks_file() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".fleet").join("tasks.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("FLEET_MAX_AGENTS")
        && let Ok(n) = val.parse()
    {
        config.limits.max_agents = n;
    }
    if let Ok(val) = std::env::var("FLEET_AGENT_BIN") {
        config.daemon.agent_bin = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("FLEET_TASKS_FILE") {
        config.daemon.tasks_file = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("FLEET_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
}

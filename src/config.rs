//! Configuration for a maestro run.
//!
//! Loaded from `~/.maestro/maestro.toml` (or an explicit path). Holds the
//! gate pipeline order, hard-limit rules, feature enablement flags, and the
//! scheduling knobs. Fixed tuning values that the rest of the crate relies
//! on are named constants here rather than literals buried in logic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gates::hard_limits::HardLimitRule;
use crate::{mlog_debug, Error, Result};

/// Character budget for the previous output embedded in a gate-failure
/// retry prompt. Keeps retry prompts inside downstream context windows.
pub const RETRY_OUTPUT_BUDGET: usize = 4_000;

/// Character budget for the previous output embedded in a test-fix prompt.
pub const FIX_OUTPUT_BUDGET: usize = 6_000;

/// Maximum lines kept per captured check failure in a fix prompt. A flood
/// of compiler errors must not blow the prompt budget.
pub const FAILURE_LINE_CAP: usize = 40;

/// Wall-clock timeout for the type-check command.
pub const TYPECHECK_TIMEOUT: Duration = Duration::from_secs(60);

/// Wall-clock timeout for the test command.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Default priority for lifecycle hooks (lower runs first).
pub const DEFAULT_HOOK_PRIORITY: i32 = 100;

/// The driver runs at most `ITERATION_FACTOR * task_count` iterations.
pub const ITERATION_FACTOR: usize = 3;

fn default_true() -> bool {
    true
}

fn default_gate_order() -> Vec<String> {
    vec!["output-nonempty".to_string(), "mercury-validator".to_string()]
}

fn default_max_fix_retries() -> u32 {
    2
}

fn default_council_phase_threshold() -> u32 {
    1
}

fn default_max_workers() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Whether the configurable gate pipeline runs at all.
    #[serde(default = "default_true")]
    pub gates_enabled: bool,
    /// Ordered list of gate names to run after the hard limits.
    #[serde(default = "default_gate_order")]
    pub gate_order: Vec<String>,
    /// Non-negotiable rules checked before any configurable gate.
    #[serde(default)]
    pub hard_limits: Vec<HardLimitRule>,
    /// Feature-name -> enabled, consumed by lifecycle wiring.
    #[serde(default)]
    pub features: BTreeMap<String, bool>,
    /// Run the test-fix loop for code-producing agents.
    #[serde(default)]
    pub fix_loop_enabled: bool,
    /// Maximum fix rounds in the test-fix loop.
    #[serde(default = "default_max_fix_retries")]
    pub max_fix_retries: u32,
    /// Run the council for early-phase and retried tasks.
    #[serde(default = "default_true")]
    pub council_enabled: bool,
    /// Tasks with phase <= this threshold require council review.
    #[serde(default = "default_council_phase_threshold")]
    pub council_phase_threshold: u32,
    /// Ask the worker for a short plan before executing each task.
    #[serde(default)]
    pub plan_preview: bool,
    /// Dispatch independent ready tasks concurrently.
    #[serde(default)]
    pub parallel: bool,
    /// Concurrency limit for parallel mode.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Command line used to invoke the external worker.
    pub worker_command: Option<String>,
    /// Directory holding per-agent system prompt templates.
    pub templates_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gates_enabled: true,
            gate_order: default_gate_order(),
            hard_limits: Vec::new(),
            features: BTreeMap::new(),
            fix_loop_enabled: false,
            max_fix_retries: default_max_fix_retries(),
            council_enabled: true,
            council_phase_threshold: default_council_phase_threshold(),
            plan_preview: false,
            parallel: false,
            max_workers: default_max_workers(),
            worker_command: None,
            templates_dir: None,
        }
    }
}

impl Config {
    pub fn maestro_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".maestro"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::maestro_dir()?.join("maestro.toml"))
    }

    pub fn sessions_dir() -> Result<PathBuf> {
        Ok(Self::maestro_dir()?.join("sessions"))
    }

    pub fn outputs_dir() -> Result<PathBuf> {
        Ok(Self::maestro_dir()?.join("outputs"))
    }

    pub fn effective_worker_command(&self) -> &str {
        self.worker_command.as_deref().unwrap_or("claude")
    }

    pub fn templates_dir_path(&self) -> Result<PathBuf> {
        match &self.templates_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::maestro_dir()?.join("agents")),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        mlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            mlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        mlog_debug!(
            "Config loaded: gates_enabled={}, gate_order={:?}, parallel={}",
            config.gates_enabled,
            config.gate_order,
            config.parallel
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::maestro_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        mlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        for dir in [
            Self::maestro_dir()?,
            Self::sessions_dir()?,
            Self::outputs_dir()?,
        ] {
            if !dir.exists() {
                mlog_debug!("Creating directory: {}", dir.display());
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

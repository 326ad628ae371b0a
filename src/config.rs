//! Configuration loading and validation.
//!
//! Loads `sentinel.toml` from an explicit path, `$SENTINEL_CONFIG_PATH`, or
//! the working directory. Environment variables override file values; file
//! values override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::chamber::{BackendPreference, ChamberLimits, DEFAULT_CGROUP_ROOT};
use crate::ledger::DEFAULT_POINTER;
use crate::metrics::{StabilityCenter, StabilityEnvelope};
use crate::narrator::TraitTable;

/// Config file looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "sentinel.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Certification thresholds.
    pub sentinel: SentinelConfig,
    /// Chamber resource limits and backend selection.
    pub chamber: ChamberConfig,
    /// Ledger storage location.
    pub ledger: LedgerConfig,
    /// Default stability target for certification.
    pub stability: StabilityConfig,
    /// Trait labels for diagnostic output.
    pub traits: TraitTable,
}

/// Certification thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct SentinelConfig {
    /// VP at or above which an input fails certification, and above which
    /// a monitored operation is a violation.
    #[serde(default = "default_vp_threshold")]
    pub vp_threshold: f64,

    /// Trailing VP samples needed before the stability check applies.
    #[serde(default = "default_critical_mass_sample_size")]
    pub critical_mass_sample_size: usize,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            vp_threshold: default_vp_threshold(),
            critical_mass_sample_size: default_critical_mass_sample_size(),
        }
    }
}

/// Chamber resource limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ChamberConfig {
    /// Wall-clock timeout per run, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Memory ceiling in megabytes.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,

    /// CPU-time ceiling in seconds.
    #[serde(default = "default_cpu_time_secs")]
    pub cpu_time_secs: u64,

    /// Containment backend (`auto`, `cgroup`, `rlimit`, `direct`).
    #[serde(default)]
    pub backend: BackendPreference,

    /// Parent cgroup for per-run cgroups.
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,
}

impl ChamberConfig {
    /// Limits applied to every chamber run.
    pub fn limits(&self) -> ChamberLimits {
        ChamberLimits {
            timeout: Duration::from_secs(self.timeout_secs),
            memory_bytes: self.memory_mb.saturating_mul(1024 * 1024),
            cpu_time: Duration::from_secs(self.cpu_time_secs),
        }
    }
}

impl Default for ChamberConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            memory_mb: default_memory_mb(),
            cpu_time_secs: default_cpu_time_secs(),
            backend: BackendPreference::default(),
            cgroup_root: default_cgroup_root(),
        }
    }
}

/// Ledger storage location.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Directory holding `versions/` and the pointer file.
    #[serde(default = "default_ledger_dir")]
    pub dir: PathBuf,

    /// Pointer file name inside `dir`.
    #[serde(default = "default_pointer")]
    pub pointer: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            dir: default_ledger_dir(),
            pointer: default_pointer(),
        }
    }
}

/// Default stability target used by `certify`.
#[derive(Debug, Clone, Deserialize)]
pub struct StabilityConfig {
    /// Ideal value per trait.
    #[serde(default = "default_center")]
    pub center: StabilityCenter,

    /// Inclusive `[low, high]` tolerance per trait.
    #[serde(default = "default_envelope")]
    pub envelope: StabilityEnvelope,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            center: default_center(),
            envelope: default_envelope(),
        }
    }
}

// Default value functions for serde

fn default_vp_threshold() -> f64 {
    1.0
}
fn default_critical_mass_sample_size() -> usize {
    5
}
fn default_timeout_secs() -> u64 {
    2
}
fn default_memory_mb() -> u64 {
    64
}
fn default_cpu_time_secs() -> u64 {
    2
}
fn default_cgroup_root() -> PathBuf {
    PathBuf::from(DEFAULT_CGROUP_ROOT)
}
fn default_ledger_dir() -> PathBuf {
    PathBuf::from("data/kernel")
}
fn default_pointer() -> String {
    DEFAULT_POINTER.to_owned()
}
fn default_center() -> StabilityCenter {
    BTreeMap::from([
        ("speed_ms".to_owned(), 100.0),
        ("memory_mb".to_owned(), 50.0),
        ("reliability".to_owned(), 1.0),
    ])
}
fn default_envelope() -> StabilityEnvelope {
    let mut envelope = StabilityEnvelope::default();
    for (name, low, high) in [
        ("speed_ms", 10.0, 1000.0),
        ("memory_mb", 1.0, 500.0),
        ("reliability", 1.0, 1.0),
    ] {
        // Constant bounds above are ordered and finite.
        let _ = envelope.insert(name, low, high);
    }
    envelope
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// An explicit `path` must exist. Otherwise `$SENTINEL_CONFIG_PATH` or
    /// `./sentinel.toml` is used, and a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the
    /// resulting values fail validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::load_from_file(path, |key| std::env::var(key).ok())?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(
        explicit: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        if let Some(path) = explicit {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config at {}", path.display()))?;
            return Self::from_toml(&contents)
                .with_context(|| format!("invalid config at {}", path.display()));
        }

        let path = Self::config_path_with(env);
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("invalid config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("SENTINEL_CONFIG_PATH").map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from)
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids unsafe `set_var` in tests).
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("SENTINEL_VP_THRESHOLD") {
            match v.parse() {
                Ok(n) => self.sentinel.vp_threshold = n,
                Err(_) => warn_invalid("SENTINEL_VP_THRESHOLD", &v),
            }
        }
        if let Some(v) = env("SENTINEL_TIMEOUT_SECS") {
            match v.parse() {
                Ok(n) => self.chamber.timeout_secs = n,
                Err(_) => warn_invalid("SENTINEL_TIMEOUT_SECS", &v),
            }
        }
        if let Some(v) = env("SENTINEL_MEMORY_MB") {
            match v.parse() {
                Ok(n) => self.chamber.memory_mb = n,
                Err(_) => warn_invalid("SENTINEL_MEMORY_MB", &v),
            }
        }
        if let Some(v) = env("SENTINEL_CHAMBER_BACKEND") {
            match v.parse() {
                Ok(backend) => self.chamber.backend = backend,
                Err(_) => warn_invalid("SENTINEL_CHAMBER_BACKEND", &v),
            }
        }
        if let Some(v) = env("SENTINEL_LEDGER_DIR") {
            self.ledger.dir = PathBuf::from(v);
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or has invalid bounds.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Reject values the chamber or orchestrator cannot work with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if !self.sentinel.vp_threshold.is_finite() || self.sentinel.vp_threshold < 0.0 {
            anyhow::bail!(
                "sentinel.vp_threshold must be a non-negative number, got {}",
                self.sentinel.vp_threshold
            );
        }
        if self.chamber.timeout_secs == 0 {
            anyhow::bail!("chamber.timeout_secs must be at least 1");
        }
        if self.chamber.memory_mb == 0 {
            anyhow::bail!("chamber.memory_mb must be at least 1");
        }
        if self.chamber.cpu_time_secs == 0 {
            anyhow::bail!("chamber.cpu_time_secs must be at least 1");
        }
        if self.ledger.pointer.is_empty() || self.ledger.pointer.contains(['/', '\\']) {
            anyhow::bail!(
                "ledger.pointer must be a plain file name, got '{}'",
                self.ledger.pointer
            );
        }
        Ok(())
    }
}

fn warn_invalid(var: &str, value: &str) {
    tracing::warn!(var, value = %value, "ignoring invalid env override");
}

/// Resolve the per-user state directory (`~/.sentinel/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".sentinel"))
}
